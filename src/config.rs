//! Configuration types and YAML loading.
//!
//! The configuration document keeps the key names used by the analysis
//! scripts (`OMERO_user`, `smFISH_ch1_thresh`, `NA`, ...). `${VAR}` references
//! are substituted from the environment before parsing. Once loaded the
//! configuration is immutable; workers receive it by `Arc` or, for worker
//! processes, as part of their bootstrap message.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "smFISH_analysis_config.yaml";

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Where the work items come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource<'a> {
    /// Files matching a glob pattern.
    Local { pattern: &'a str },
    /// Images of the listed catalog datasets.
    Remote { user: &'a str, datasets: &'a [i64] },
}

/// How worker isolation is implemented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// One OS process per worker (default).
    #[default]
    Process,
    /// One tokio task per worker inside the supervisor process.
    InProcess,
}

/// What a worker does after a job fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the failure and keep draining the queue.
    #[default]
    Continue,
    /// Report the failure and exit the worker.
    ExitWorker,
}

/// Remote catalog connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub host: String,
    /// Port of the HTTP gateway, not the catalog's native client port.
    pub port: u16,
    pub scheme: String,
    /// Group context for queries; -1 searches across all groups.
    pub group: i64,
    pub keepalive_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            host: "omero1.bioch.ox.ac.uk".to_string(),
            port: 443,
            scheme: "https".to_string(),
            group: -1,
            keepalive_interval_secs: 60,
            request_timeout_secs: 30,
        }
    }
}

impl CatalogConfig {
    /// Base URL of the catalog gateway.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub mode: WorkerMode,
    pub on_job_failure: FailurePolicy,
    /// Analysis command run once per job (program followed by arguments).
    pub analysis_command: Vec<String>,
}

/// Parameters consumed by the analysis collaborator.
///
/// The engine only interprets the channel, threshold, and optics keys; the
/// rest are validated for type and forwarded untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub seg_ch: Option<usize>,
    #[serde(default)]
    pub channels: Vec<usize>,
    #[serde(rename = "smFISH_ch1")]
    pub smfish_ch1: Option<usize>,
    #[serde(rename = "smFISH_ch1_thresh")]
    pub smfish_ch1_thresh: Option<f64>,
    #[serde(rename = "smFISH_ch2")]
    pub smfish_ch2: Option<usize>,
    #[serde(rename = "smFISH_ch2_thresh")]
    pub smfish_ch2_thresh: Option<f64>,

    // Segmentation
    pub cp_search_string: Option<String>,
    pub cp_clip: Option<f64>,
    pub median_filter: Option<u32>,
    pub gpu: Option<bool>,
    pub diameter: Option<f64>,
    #[serde(rename = "do_3D")]
    pub do_3d: Option<bool>,
    pub flow_threshold: Option<f64>,
    pub cellprob_threshold: Option<f64>,

    // Optics
    pub voxel_size_z: Option<f64>,
    pub voxel_size_yx: Option<f64>,
    pub ex: Option<f64>,
    pub em: Option<f64>,
    #[serde(rename = "NA")]
    pub na: Option<f64>,
    #[serde(rename = "RI")]
    pub ri: Option<f64>,
    pub microscope: Option<String>,

    // Detection and cluster decomposition
    pub bg_radius: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
    pub bf_radius: Option<f64>,
    pub nb_min_spots: Option<u32>,

    /// Keys the engine does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub input_pattern: Option<String>,
    #[serde(rename = "OMERO_user", default)]
    pub omero_user: Option<String>,
    #[serde(rename = "OMERO_datasets", default)]
    pub omero_datasets: Vec<i64>,

    pub output_dir: PathBuf,
    pub output_refspot_dir: PathBuf,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    pub number_of_workers: usize,

    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(flatten)]
    pub analysis: AnalysisParams,
}

impl Config {
    /// Read, substitute, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a configuration document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(yaml)?;
        let config: Config = serde_yaml::from_str(&substituted)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "number_of_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        match (&self.input_pattern, &self.omero_user) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidValue {
                    key: "input_pattern".into(),
                    message: "cannot be combined with OMERO_user; pick one input source".into(),
                });
            }
            (None, None) => {
                return Err(ConfigError::MissingRequired {
                    key: "input_pattern".into(),
                    hint: "Set input_pattern for local files or OMERO_user and OMERO_datasets \
                           for catalog images."
                        .into(),
                });
            }
            (None, Some(_)) if self.omero_datasets.is_empty() => {
                return Err(ConfigError::MissingRequired {
                    key: "OMERO_datasets".into(),
                    hint: "List at least one dataset id to analyse.".into(),
                });
            }
            _ => {}
        }

        if self.catalog.keepalive_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "catalog.keepalive_interval_secs".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(())
    }

    /// The input source selected by the shape of the document.
    pub fn source(&self) -> InputSource<'_> {
        match (&self.input_pattern, &self.omero_user) {
            (Some(pattern), _) => InputSource::Local { pattern },
            (None, Some(user)) => InputSource::Remote {
                user,
                datasets: &self.omero_datasets,
            },
            // validate() rules this out; treat it as an empty local pattern.
            (None, None) => InputSource::Local { pattern: "" },
        }
    }

    /// Whether jobs come from the remote catalog.
    pub fn is_remote(&self) -> bool {
        matches!(self.source(), InputSource::Remote { .. })
    }

    /// Directory used to stage remote image planes.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".staging"))
    }
}

/// Substitute `${VAR_NAME}` patterns with environment variable values.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |caps: &regex::Captures<'_>| {
        match lookup(&caps[1]) {
            Some(value) => value,
            None => {
                missing.push(caps[1].to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::MissingEnvVar(missing.join(", ")));
    }

    Ok(result.into_owned())
}
