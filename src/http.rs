//! HTTP clients for the route backend and the asset CDN.
//!
//! - [`HttpRouteService`] talks to the REST route API (`/save`, `/{id}`, list)
//! - [`CloudinaryUploader`] uploads photos and logos as base64 data URIs
//!
//! Both retry with exponential backoff on 429 and on network errors. A 401,
//! or an error body carrying the auth sentinel, becomes
//! [`CoordinatorError::AuthenticationRequired`].

use std::time::Duration;

use base64::Engine;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::assets::{AssetUploadService, UploadedAsset};
use crate::error::{CoordinatorError, Result, AUTH_REQUIRED_MESSAGE};
use crate::payload::PartialUpdate;
use crate::service::{RouteFilters, RouteService, SaveResponse, SavedRouteSummary};
use crate::{AssetFile, RouteDocument};

const CLOUDINARY_API: &str = "https://api.cloudinary.com/v1_1";

// Delivery transformations for the derived photo sizes
const THUMBNAIL_TRANSFORM: &str = "c_fill,w_200,h_200,q_70,f_auto";
const MEDIUM_TRANSFORM: &str = "c_limit,w_400,h_400,q_75,f_auto";
const LARGE_TRANSFORM: &str = "c_limit,w_1200,h_1200,q_80,f_auto";

/// Configuration for the HTTP clients.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    /// Route API root, e.g. `https://maps.example.com/api/routes`
    pub base_url: String,
    /// Bearer token sent with every route API call
    pub auth_token: Option<String>,
    /// Per-request timeout.
    /// Default: 30s
    pub timeout: Duration,
    /// Retries after a 429 or network error.
    /// Default: 3
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/routes".to_string(),
            auth_token: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

fn build_client(config: &HttpConfig) -> Result<Client> {
    Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| CoordinatorError::Internal {
            message: format!("Failed to create HTTP client: {}", e),
        })
}

/// Exponential backoff: 500ms, 1s, 2s, 4s, capped at 8s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(500 * (1u64 << attempt.min(4)))
}

/// Send a request, retrying 429s and transport errors.
async fn send_with_retry<F>(label: &str, max_retries: u32, make_request: F) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut retries = 0;
    loop {
        match make_request().send().await {
            Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                retries += 1;
                if retries > max_retries {
                    return Err(CoordinatorError::Backend {
                        message: "Max retries exceeded (429)".to_string(),
                        status_code: Some(429),
                    });
                }
                let backoff = backoff_delay(retries);
                warn!("[HttpClient] 429 for {}, retry {} after {:?}", label, retries, backoff);
                tokio::time::sleep(backoff).await;
            }
            Ok(resp) => return Ok(resp),
            Err(e) => {
                retries += 1;
                if retries > max_retries {
                    return Err(CoordinatorError::Backend {
                        message: format!("Request error: {}", e),
                        status_code: None,
                    });
                }
                let backoff = backoff_delay(retries);
                warn!(
                    "[HttpClient] Error for {}: {}, retry {} after {:?}",
                    label, e, retries, backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Map an error response to a [`CoordinatorError`].
fn error_from_response(status: u16, body: &str) -> CoordinatorError {
    if status == 401 {
        return CoordinatorError::AuthenticationRequired;
    }
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("details")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP {}", status));

    if message == AUTH_REQUIRED_MESSAGE {
        CoordinatorError::AuthenticationRequired
    } else {
        CoordinatorError::Backend {
            message,
            status_code: Some(status),
        }
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(error_from_response(status.as_u16(), &body))
}

async fn read_json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T> {
    let text = resp.text().await.map_err(|e| CoordinatorError::Backend {
        message: format!("Failed to read response: {}", e),
        status_code: None,
    })?;
    Ok(serde_json::from_str(&text)?)
}

// ============================================================================
// Route API
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    routes: Vec<SavedRouteSummary>,
}

/// The load endpoint wraps the document as `{ "route": … }`.
fn unwrap_route(value: Value) -> Result<RouteDocument> {
    let document = match value {
        Value::Object(mut map) if map.contains_key("route") => {
            map.remove("route").unwrap_or(Value::Null)
        }
        other => other,
    };
    Ok(serde_json::from_value(document)?)
}

/// REST client for the route API.
pub struct HttpRouteService {
    client: Client,
    config: HttpConfig,
}

impl HttpRouteService {
    pub fn new(config: HttpConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

impl RouteService for HttpRouteService {
    fn save_route(&self, payload: PartialUpdate) -> BoxFuture<'_, Result<SaveResponse>> {
        Box::pin(async move {
            let url = self.url("/save");
            let body = payload.into_value();
            let resp = send_with_retry("save", self.config.max_retries, || {
                self.authorize(self.client.post(&url).json(&body))
            })
            .await?;
            let saved: SaveResponse = read_json(check_status(resp).await?).await?;
            info!("[HttpRouteService] Saved route {}", saved.persistent_id);
            Ok(saved)
        })
    }

    fn load_route<'a>(&'a self, persistent_id: &'a str) -> BoxFuture<'a, Result<RouteDocument>> {
        Box::pin(async move {
            let url = self.url(&format!("/{}", persistent_id));
            let resp = send_with_retry("load", self.config.max_retries, || {
                self.authorize(self.client.get(&url))
            })
            .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(CoordinatorError::RouteNotFound {
                    route_id: persistent_id.to_string(),
                });
            }
            let value: Value = read_json(check_status(resp).await?).await?;
            debug!("[HttpRouteService] Loaded route {}", persistent_id);
            unwrap_route(value)
        })
    }

    fn list_routes(
        &self,
        filters: Option<RouteFilters>,
    ) -> BoxFuture<'_, Result<Vec<SavedRouteSummary>>> {
        Box::pin(async move {
            let url = self.url("");
            let query = filters.map(|f| f.query_pairs()).unwrap_or_default();
            let resp = send_with_retry("list", self.config.max_retries, || {
                self.authorize(self.client.get(&url).query(&query))
            })
            .await?;
            let list: ListResponse = read_json(check_status(resp).await?).await?;
            Ok(list.routes)
        })
    }

    fn delete_route<'a>(&'a self, persistent_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let url = self.url(&format!("/{}", persistent_id));
            let resp = send_with_retry("delete", self.config.max_retries, || {
                self.authorize(self.client.delete(&url))
            })
            .await?;
            check_status(resp).await?;
            info!("[HttpRouteService] Deleted route {}", persistent_id);
            Ok(())
        })
    }
}

// ============================================================================
// Asset Uploads
// ============================================================================

#[derive(Debug, Deserialize)]
struct CloudinaryResponse {
    secure_url: String,
    public_id: String,
}

/// Encode a file as a `data:` URI for form upload.
fn data_uri(file: &AssetFile) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(&file.bytes);
    format!("data:{};base64,{}", file.content_type, encoded)
}

/// Insert a delivery transformation after the `/upload/` path segment.
fn transformed_url(secure_url: &str, transformation: &str) -> String {
    if secure_url.contains("/upload/") {
        secure_url.replacen("/upload/", &format!("/upload/{}/", transformation), 1)
    } else {
        secure_url.to_string()
    }
}

fn uploaded_asset(resp: CloudinaryResponse) -> UploadedAsset {
    UploadedAsset {
        thumbnail_url: Some(transformed_url(&resp.secure_url, THUMBNAIL_TRANSFORM)),
        medium_url: Some(transformed_url(&resp.secure_url, MEDIUM_TRANSFORM)),
        large_url: Some(transformed_url(&resp.secure_url, LARGE_TRANSFORM)),
        url: resp.secure_url,
        public_id: resp.public_id,
    }
}

/// Unsigned-preset uploader for Cloudinary.
pub struct CloudinaryUploader {
    client: Client,
    upload_url: String,
    upload_preset: String,
    folder: String,
    max_retries: u32,
}

impl CloudinaryUploader {
    pub fn new(
        cloud_name: &str,
        upload_preset: impl Into<String>,
        folder: impl Into<String>,
        config: &HttpConfig,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            upload_url: format!("{}/{}/auto/upload", CLOUDINARY_API, cloud_name),
            upload_preset: upload_preset.into(),
            folder: folder.into(),
            max_retries: config.max_retries,
        })
    }
}

impl AssetUploadService for CloudinaryUploader {
    fn upload<'a>(&'a self, file: &'a AssetFile) -> BoxFuture<'a, Result<UploadedAsset>> {
        Box::pin(async move {
            let form = [
                ("file", data_uri(file)),
                ("upload_preset", self.upload_preset.clone()),
                ("folder", self.folder.clone()),
            ];
            let resp = send_with_retry(&file.name, self.max_retries, || {
                self.client.post(&self.upload_url).form(&form)
            })
            .await
            .map_err(|e| CoordinatorError::Upload {
                asset_id: file.name.clone(),
                message: e.to_string(),
            })?;

            let resp = check_status(resp).await.map_err(|e| CoordinatorError::Upload {
                asset_id: file.name.clone(),
                message: e.to_string(),
            })?;
            let parsed: CloudinaryResponse = read_json(resp).await?;
            debug!(
                "[CloudinaryUploader] Uploaded {} ({} bytes) as {}",
                file.name,
                file.len(),
                parsed.public_id
            );
            Ok(uploaded_asset(parsed))
        })
    }
}
