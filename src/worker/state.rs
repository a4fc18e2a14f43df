//! Worker and supervisor state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Lifecycle of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Launched and not yet waited on.
    Running,
    /// Exited on its own.
    Joined,
    /// Killed by the supervisor.
    Terminated,
}

impl WorkerState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Joined => "joined",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Init,
    /// Enumerating jobs.
    Discovering,
    /// Filling and sealing the queue, launching workers.
    Dispatching,
    /// Workers draining the queue.
    Running,
    /// Every worker exited on its own.
    Joined,
    /// Discovery failed or the run was interrupted.
    Terminated,
}

impl SupervisorState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SupervisorState) -> bool {
        use SupervisorState::*;

        matches!(
            (self, target),
            (Init, Discovering) |
            (Discovering, Dispatching) | (Discovering, Terminated) |
            (Dispatching, Running) | (Dispatching, Terminated) |
            (Running, Joined) | (Running, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Joined | Self::Terminated)
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Discovering => "discovering",
            Self::Dispatching => "dispatching",
            Self::Running => "running",
            Self::Joined => "joined",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SupervisorState,
    pub to: SupervisorState,
    pub timestamp: DateTime<Utc>,
}

/// Current supervisor state plus the transitions that led to it.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    state: SupervisorState,
    transitions: Vec<StateTransition>,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            state: SupervisorState::Init,
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> SupervisorState {
        self.state
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Move to `target`, rejecting transitions the state machine forbids.
    pub fn transition_to(&mut self, target: SupervisorState) -> Result<(), PoolError> {
        if !self.state.can_transition_to(target) {
            return Err(PoolError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: target,
            timestamp: Utc::now(),
        });
        self.state = target;
        Ok(())
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
