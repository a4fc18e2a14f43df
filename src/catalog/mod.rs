//! Remote imaging catalog abstraction.
//!
//! A [`Catalog`] opens sessions; a [`CatalogSession`] lists datasets, reads
//! image metadata and planes, and must be pinged periodically so the server
//! does not drop it for inactivity (see [`crate::keepalive`]).
//!
//! Discovery and per-job work always use independent sessions.

pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, DiscoveryError};

pub use http::HttpCatalog;
pub use memory::MemoryCatalog;

/// Environment variable consulted before prompting for the catalog password.
pub const PASSWORD_ENV: &str = "FISHPOOL_CATALOG_PASSWORD";

/// Login credentials for the catalog.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Read the password from the environment, or prompt for it on the terminal.
    pub fn resolve(username: &str) -> Result<Self, DiscoveryError> {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            return Ok(Self::new(username, password));
        }

        let password = rpassword::prompt_password(format!("Type password for user '{username}':"))
            .map_err(|e| {
                tracing::error!(user = %username, error = %e, "Could not read catalog password");
                DiscoveryError::MissingCredentials {
                    user: username.to_string(),
                }
            })?;
        Ok(Self::new(username, password))
    }
}

/// An image listed under a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: i64,
    pub name: String,
}

/// Pixel dimensions of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelsInfo {
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
    pub size_c: u32,
    pub size_t: u32,
    pub pixel_type: String,
}

/// Something that can open catalog sessions.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Open and authenticate a new session.
    async fn connect(&self, credentials: &Credentials)
    -> Result<Arc<dyn CatalogSession>, CatalogError>;
}

/// A live, authenticated catalog connection.
#[async_trait]
pub trait CatalogSession: Send + Sync {
    /// Images that are direct children of a dataset.
    async fn list_dataset_images(&self, dataset_id: i64) -> Result<Vec<ImageInfo>, CatalogError>;

    /// Names of the original files an image was imported from.
    async fn imported_files(&self, image_id: i64) -> Result<Vec<String>, CatalogError>;

    /// Pixel dimensions of an image.
    async fn pixels(&self, image_id: i64) -> Result<PixelsInfo, CatalogError>;

    /// Raw bytes of one (z, c, t) plane.
    async fn fetch_plane(
        &self,
        image_id: i64,
        z: u32,
        c: u32,
        t: u32,
    ) -> Result<Vec<u8>, CatalogError>;

    /// Reset the server-side idle timer.
    async fn keep_alive(&self) -> Result<(), CatalogError>;

    /// Log out. Further calls fail with [`CatalogError::SessionClosed`].
    async fn close(&self) -> Result<(), CatalogError>;
}
