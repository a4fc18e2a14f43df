//! In-memory catalog.
//!
//! Holds datasets in a map and counts sessions, pings and plane fetches, so
//! runs against it can be inspected afterwards. Used by the test suites and
//! for trying a configuration without a catalog server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Catalog, CatalogSession, Credentials, ImageInfo, PixelsInfo};
use crate::error::CatalogError;

type Datasets = BTreeMap<i64, Vec<(ImageInfo, Vec<String>)>>;

#[derive(Debug, Default)]
struct MemoryState {
    opened: AtomicUsize,
    closed: AtomicUsize,
    pings: AtomicUsize,
    ping_attempts: AtomicUsize,
    planes_fetched: AtomicUsize,
}

/// In-memory catalog with call counters.
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    datasets: Arc<Datasets>,
    reject_auth: bool,
    unreachable: bool,
    fail_pings: bool,
    state: Arc<MemoryState>,
}

impl MemoryCatalog {
    /// Add a dataset whose images each list the given imported files.
    pub fn with_dataset(mut self, dataset_id: i64, images: Vec<(i64, Vec<&str>)>) -> Self {
        let entries = images
            .into_iter()
            .map(|(id, files)| {
                (
                    ImageInfo {
                        id,
                        name: format!("image-{id}"),
                    },
                    files.into_iter().map(str::to_string).collect(),
                )
            })
            .collect();
        Arc::make_mut(&mut self.datasets).insert(dataset_id, entries);
        self
    }

    pub fn rejecting_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn failing_pings(mut self) -> Self {
        self.fail_pings = true;
        self
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new("tester", "hunter2")
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn ping_attempts(&self) -> usize {
        self.state.ping_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions_opened() - self.state.closed.load(Ordering::SeqCst)
    }

    pub fn planes_fetched(&self) -> usize {
        self.state.planes_fetched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn CatalogSession>, CatalogError> {
        if self.unreachable {
            return Err(CatalogError::Unreachable {
                host: "memory".into(),
                reason: "connection refused".into(),
            });
        }
        if self.reject_auth {
            return Err(CatalogError::AuthRejected {
                user: credentials.username.clone(),
            });
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySession {
            datasets: Arc::clone(&self.datasets),
            fail_pings: self.fail_pings,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    datasets: Arc<Datasets>,
    fail_pings: bool,
    state: Arc<MemoryState>,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), CatalogError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CatalogError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogSession for MemorySession {
    async fn list_dataset_images(&self, dataset_id: i64) -> Result<Vec<ImageInfo>, CatalogError> {
        self.ensure_open()?;
        self.datasets
            .get(&dataset_id)
            .map(|images| images.iter().map(|(info, _)| info.clone()).collect())
            .ok_or(CatalogError::NotFound {
                kind: "Dataset".into(),
                id: dataset_id,
            })
    }

    async fn imported_files(&self, image_id: i64) -> Result<Vec<String>, CatalogError> {
        self.ensure_open()?;
        self.datasets
            .values()
            .flatten()
            .find(|(info, _)| info.id == image_id)
            .map(|(_, files)| files.clone())
            .ok_or(CatalogError::NotFound {
                kind: "Image".into(),
                id: image_id,
            })
    }

    async fn pixels(&self, _image_id: i64) -> Result<PixelsInfo, CatalogError> {
        self.ensure_open()?;
        Ok(PixelsInfo {
            size_x: 2,
            size_y: 2,
            size_z: 2,
            size_c: 2,
            size_t: 1,
            pixel_type: "uint8".into(),
        })
    }

    async fn fetch_plane(
        &self,
        image_id: i64,
        z: u32,
        c: u32,
        t: u32,
    ) -> Result<Vec<u8>, CatalogError> {
        self.ensure_open()?;
        self.state.planes_fetched.fetch_add(1, Ordering::SeqCst);
        Ok(vec![z as u8, c as u8, t as u8, image_id as u8])
    }

    async fn keep_alive(&self) -> Result<(), CatalogError> {
        self.ensure_open()?;
        self.state.ping_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_pings {
            return Err(CatalogError::Http("503 Service Unavailable".into()));
        }
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), CatalogError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
