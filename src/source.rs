//! Job enumeration from a local glob or the remote catalog.
//!
//! Enumeration is all-or-nothing: any failure aborts before a single job is
//! queued. Output order is deterministic for a given input.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogSession, Credentials};
use crate::config::{Config, InputSource};
use crate::error::{CatalogError, DiscoveryError};
use crate::job::{Job, JobDescriptor};
use crate::keepalive::ScopedSession;

/// Enumerate every job described by the configuration.
pub async fn enumerate(
    config: &Config,
    catalog: &dyn Catalog,
    credentials: Option<&Credentials>,
) -> Result<Vec<JobDescriptor>, DiscoveryError> {
    match config.source() {
        InputSource::Local { pattern } => enumerate_local(pattern),
        InputSource::Remote { user, datasets } => {
            let credentials = credentials.ok_or_else(|| DiscoveryError::MissingCredentials {
                user: user.to_string(),
            })?;
            enumerate_remote(
                catalog,
                credentials,
                datasets,
                config.catalog.keepalive_interval(),
            )
            .await
        }
    }
}

/// Number descriptors in enumeration order.
pub fn into_jobs(descriptors: Vec<JobDescriptor>) -> Vec<Job> {
    descriptors
        .into_iter()
        .zip(0u64..)
        .map(|(descriptor, id)| Job::new(id, descriptor))
        .collect()
}

/// Expand a glob into sorted `LocalPath` jobs. No matches is not an error.
pub fn enumerate_local(pattern: &str) -> Result<Vec<JobDescriptor>, DiscoveryError> {
    let paths = glob::glob(pattern).map_err(|e| DiscoveryError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(path) => debug!(path = %path.display(), "Skipping non-file match"),
            Err(e) => warn!(error = %e, "Skipping unreadable match"),
        }
    }
    files.sort();

    info!(pattern, count = files.len(), "Enumerated local images");
    Ok(files.into_iter().map(JobDescriptor::local).collect())
}

/// List the images of every dataset through a dedicated discovery session.
///
/// The session is closed whether or not listing succeeds.
pub async fn enumerate_remote(
    catalog: &dyn Catalog,
    credentials: &Credentials,
    datasets: &[i64],
    keepalive_interval: Duration,
) -> Result<Vec<JobDescriptor>, DiscoveryError> {
    let scoped = ScopedSession::open(catalog, credentials, keepalive_interval).await?;
    let listed = list_datasets(scoped.session().as_ref(), datasets).await;

    if let Err(e) = scoped.close().await {
        warn!(error = %e, "Failed to close discovery session");
    }

    let jobs = listed?;
    info!(
        datasets = datasets.len(),
        count = jobs.len(),
        "Enumerated catalog images"
    );
    Ok(jobs)
}

async fn list_datasets(
    session: &dyn CatalogSession,
    datasets: &[i64],
) -> Result<Vec<JobDescriptor>, CatalogError> {
    let mut jobs = Vec::new();
    for &dataset_id in datasets {
        let mut images = session.list_dataset_images(dataset_id).await?;
        images.sort_by_key(|image| image.id);
        debug!(dataset_id, images = images.len(), "Listed dataset");

        for image in images {
            let files = session.imported_files(image.id).await?;
            if files.is_empty() {
                warn!(image_id = image.id, name = %image.name, "Image has no imported files, skipping");
            }
            jobs.extend(
                files
                    .into_iter()
                    .map(|filename| JobDescriptor::remote(filename, image.id)),
            );
        }
    }
    Ok(jobs)
}
