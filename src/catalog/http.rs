//! Catalog gateway client over HTTP/JSON.
//!
//! Sessions are created by `POST /api/v0/login` and identified afterwards by
//! the `X-Session-Key` header. Listing endpoints wrap their payload in a
//! `{"data": ...}` envelope.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{Catalog, CatalogSession, Credentials, ImageInfo, PixelsInfo};
use crate::config::CatalogConfig;
use crate::error::CatalogError;

const SESSION_HEADER: &str = "X-Session-Key";

/// Catalog reached through its HTTP gateway.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    base_url: String,
    host: String,
    group: i64,
    client: reqwest::Client,
}

impl HttpCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CatalogError::Http(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url(),
            host: config.host.clone(),
            group: config.group,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    session_key: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    #[serde(rename = "@id")]
    id: i64,
    #[serde(rename = "Name", default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ImportedFileEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ImageDetail {
    #[serde(rename = "Pixels")]
    pixels: PixelsEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PixelsEntry {
    size_x: u32,
    size_y: u32,
    size_z: u32,
    size_c: u32,
    size_t: u32,
    #[serde(rename = "Type")]
    pixel_type: PixelType,
}

#[derive(Debug, Deserialize)]
struct PixelType {
    value: String,
}

impl From<PixelsEntry> for PixelsInfo {
    fn from(p: PixelsEntry) -> Self {
        Self {
            size_x: p.size_x,
            size_y: p.size_y,
            size_z: p.size_z,
            size_c: p.size_c,
            size_t: p.size_t,
            pixel_type: p.pixel_type.value,
        }
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn CatalogSession>, CatalogError> {
        let body = serde_json::json!({
            "username": credentials.username,
            "password": credentials.password.expose_secret(),
            "group": self.group,
        });

        let resp = self
            .client
            .post(self.url("/api/v0/login"))
            .json(&body)
            .send()
            .await
            .map_err(|e| CatalogError::Unreachable {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(CatalogError::AuthRejected {
                    user: credentials.username.clone(),
                });
            }
            status if !status.is_success() => {
                let text = resp.text().await.unwrap_or_default();
                return Err(CatalogError::Protocol(format!("login returned {status}: {text}")));
            }
            _ => {}
        }

        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| CatalogError::Protocol(format!("invalid login response: {e}")))?;

        tracing::info!(host = %self.host, user = %credentials.username, "Catalog session opened");

        Ok(Arc::new(HttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            host: self.host.clone(),
            key: SecretString::from(login.session_key),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One authenticated gateway session.
struct HttpSession {
    client: reqwest::Client,
    base_url: String,
    host: String,
    key: SecretString,
    closed: AtomicBool,
}

impl HttpSession {
    fn ensure_open(&self) -> Result<(), CatalogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CatalogError::SessionClosed);
        }
        Ok(())
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        kind: &str,
        id: i64,
    ) -> Result<reqwest::Response, CatalogError> {
        self.ensure_open()?;
        let resp = req
            .header(SESSION_HEADER, self.key.expose_secret())
            .send()
            .await
            .map_err(|e| CatalogError::Unreachable {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(CatalogError::NotFound {
                kind: kind.to_string(),
                id,
            }),
            StatusCode::UNAUTHORIZED => Err(CatalogError::SessionClosed),
            status if !status.is_success() => {
                let text = resp.text().await.unwrap_or_default();
                Err(CatalogError::Http(format!("{status}: {text}")))
            }
            _ => Ok(resp),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        kind: &str,
        id: i64,
    ) -> Result<T, CatalogError> {
        let req = self.client.get(format!("{}{path}", self.base_url));
        let resp = self.send(req, kind, id).await?;
        let envelope: Envelope<T> = resp
            .json()
            .await
            .map_err(|e| CatalogError::Protocol(format!("{kind} {id}: {e}")))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl CatalogSession for HttpSession {
    async fn list_dataset_images(&self, dataset_id: i64) -> Result<Vec<ImageInfo>, CatalogError> {
        let entries: Vec<ImageEntry> = self
            .get_json(
                &format!("/api/v0/m/datasets/{dataset_id}/images/"),
                "Dataset",
                dataset_id,
            )
            .await?;
        Ok(entries
            .into_iter()
            .map(|e| ImageInfo {
                id: e.id,
                name: e.name,
            })
            .collect())
    }

    async fn imported_files(&self, image_id: i64) -> Result<Vec<String>, CatalogError> {
        let entries: Vec<ImportedFileEntry> = self
            .get_json(
                &format!("/api/v0/m/images/{image_id}/importedfiles/"),
                "Image",
                image_id,
            )
            .await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    async fn pixels(&self, image_id: i64) -> Result<PixelsInfo, CatalogError> {
        let detail: ImageDetail = self
            .get_json(&format!("/api/v0/m/images/{image_id}/"), "Image", image_id)
            .await?;
        Ok(detail.pixels.into())
    }

    async fn fetch_plane(
        &self,
        image_id: i64,
        z: u32,
        c: u32,
        t: u32,
    ) -> Result<Vec<u8>, CatalogError> {
        let req = self.client.get(format!(
            "{}/api/v0/m/images/{image_id}/planes/{z}/{c}/{t}",
            self.base_url
        ));
        let resp = self.send(req, "Image", image_id).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CatalogError::Http(format!("plane ({z}, {c}, {t}) of image {image_id}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn keep_alive(&self) -> Result<(), CatalogError> {
        let req = self.client.post(format!("{}/api/v0/keepalive", self.base_url));
        self.send(req, "Session", 0).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CatalogError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let resp = self
            .client
            .post(format!("{}/api/v0/logout", self.base_url))
            .header(SESSION_HEADER, self.key.expose_secret())
            .send()
            .await
            .map_err(|e| CatalogError::Unreachable {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            tracing::warn!(status = %resp.status(), host = %self.host, "Catalog logout was not acknowledged");
        }
        tracing::debug!(host = %self.host, "Catalog session closed");
        Ok(())
    }
}
