//! Processor that runs an external analysis command once per job.
//!
//! The command receives a JSON [`JobSpec`] on stdin and a few `FISHPOOL_*`
//! environment variables. Remote images are first staged to disk plane by
//! plane so the command only ever reads local files.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{JobInput, Processor};
use crate::analysis::{self, ChannelPlan, PsfSize};
use crate::catalog::CatalogSession;
use crate::config::{AnalysisParams, Config};
use crate::error::ProcessError;
use crate::job::{Job, JobDescriptor, JobSummary};

/// Lines of stderr kept in a [`ProcessError::CommandFailed`].
const STDERR_TAIL_LINES: usize = 20;

/// Token reported when the command prints nothing on stdout.
const DEFAULT_TOKEN: &str = "done";

/// Input document written to the analysis command's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: u64,
    pub image_name: String,
    /// Local image file, or the staged plane file for remote images.
    pub image_path: PathBuf,
    /// Present when `image_path` is a staged plane file.
    pub staged: Option<PlaneHeader>,
    pub seg_ch: Option<usize>,
    pub channels: Vec<ChannelPlan>,
    pub psf: Option<PsfSize>,
    pub segmentation_clip: Option<f64>,
    pub output_dir: PathBuf,
    pub output_refspot_dir: PathBuf,
    pub parameters: AnalysisParams,
}

/// Layout of a staged plane file, written next to it as `<image>.planes.json`.
///
/// Planes are stored back to back for t = 0, z-major then c.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneHeader {
    pub image_id: i64,
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
    pub size_c: u32,
    pub pixel_type: String,
}

/// Runs `worker.analysis_command` for every job.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ProcessError> {
        let (program, args) = config
            .worker
            .analysis_command
            .split_first()
            .ok_or(ProcessError::NoCommand)?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    async fn run_command(&self, spec: &JobSpec) -> Result<String, ProcessError> {
        let payload = serde_json::to_vec(spec)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("FISHPOOL_IMAGE_NAME", &spec.image_name)
            .env("FISHPOOL_IMAGE_PATH", &spec.image_path)
            .env("FISHPOOL_OUTPUT_DIR", &spec.output_dir)
            .env("FISHPOOL_REFSPOT_DIR", &spec.output_refspot_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| ProcessError::Spawn {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                // The command is free to ignore its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            debug!(image = %spec.image_name, "{line}");
        }

        if !output.status.success() {
            return Err(ProcessError::CommandFailed {
                status: output.status.to_string(),
                stderr: tail(&stderr, STDERR_TAIL_LINES),
            });
        }

        Ok(stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or(DEFAULT_TOKEN)
            .to_string())
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn process(&self, input: JobInput<'_>) -> Result<JobSummary, ProcessError> {
        let JobInput {
            job,
            config,
            session,
        } = input;
        let image_name = job.descriptor.image_name();

        let (image_path, staged) = match &job.descriptor {
            JobDescriptor::LocalPath { path } => (path.clone(), None),
            JobDescriptor::RemoteRef { image_id, .. } => {
                let session = session.ok_or(ProcessError::MissingSession {
                    image_id: *image_id,
                })?;
                let (path, header) = stage_planes(
                    session.as_ref(),
                    *image_id,
                    &image_name,
                    &config.staging_dir(),
                )
                .await?;
                (path, Some(header))
            }
        };

        let spec = build_spec(job, config, image_path, staged)?;
        let result = self.run_command(&spec).await;

        if spec.staged.is_some() {
            remove_staged(&spec.image_path).await;
        }

        let token = result?;
        let artifacts =
            analysis::collect_artifacts(&spec.output_dir, &spec.image_name, &spec.channels).await;
        info!(
            job_id = job.id,
            image = %spec.image_name,
            artifacts = artifacts.len(),
            "Analysis command finished"
        );
        Ok(JobSummary { token, artifacts })
    }
}

/// Resolve everything the analysis command needs for one image.
pub fn build_spec(
    job: &Job,
    config: &Config,
    image_path: PathBuf,
    staged: Option<PlaneHeader>,
) -> Result<JobSpec, ProcessError> {
    let params = &config.analysis;
    let image_name = job.descriptor.image_name();

    Ok(JobSpec {
        job_id: job.id,
        channels: analysis::channel_plans(params, &image_name, &config.output_refspot_dir),
        psf: analysis::psf_from_params(params)?,
        segmentation_clip: analysis::segmentation_clip(params, &image_name),
        seg_ch: params.seg_ch,
        image_name,
        image_path,
        staged,
        output_dir: config.output_dir.clone(),
        output_refspot_dir: config.output_refspot_dir.clone(),
        parameters: params.clone(),
    })
}

/// Download every (z, c) plane at t = 0 into `<staging_dir>/<image>.planes`.
pub async fn stage_planes(
    session: &dyn CatalogSession,
    image_id: i64,
    image_name: &str,
    staging_dir: &Path,
) -> Result<(PathBuf, PlaneHeader), ProcessError> {
    tokio::fs::create_dir_all(staging_dir).await?;

    let pixels = session.pixels(image_id).await?;
    let header = PlaneHeader {
        image_id,
        size_x: pixels.size_x,
        size_y: pixels.size_y,
        size_z: pixels.size_z,
        size_c: pixels.size_c,
        pixel_type: pixels.pixel_type,
    };

    let path = staging_dir.join(format!("{image_name}.planes"));
    let mut file = tokio::fs::File::create(&path).await?;
    for z in 0..header.size_z {
        for c in 0..header.size_c {
            let plane = session.fetch_plane(image_id, z, c, 0).await?;
            file.write_all(&plane).await?;
        }
    }
    file.flush().await?;

    tokio::fs::write(header_path(&path), serde_json::to_vec_pretty(&header)?).await?;
    debug!(
        image_id,
        planes = header.size_z * header.size_c,
        path = %path.display(),
        "Staged image planes"
    );
    Ok((path, header))
}

fn header_path(planes: &Path) -> PathBuf {
    let mut name = planes.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

async fn remove_staged(planes: &Path) {
    for path in [planes.to_path_buf(), header_path(planes)] {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "Could not remove staged file");
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
