use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::event::AuthToken;
use crate::model::MapLayerPreferences;
use crate::viewport::ViewportBounds;

pub const MAX_URL_LENGTH: usize = 2048;
pub const PREFERENCES_PATH: &str = "preferences";
pub const HAZARD_OVERLAY_PATH: &str = "hazard-overlay";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedUrl {
    url: String,
    scheme: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(HttpError::InvalidUrl {
                url,
                reason: "URL cannot be empty".to_string(),
            });
        }

        if url.len() > MAX_URL_LENGTH {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(&url).map_err(|e| HttpError::InvalidUrl {
            url: Self::truncate_url(&url),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
            });
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "URL must have a host".to_string(),
            })?
            .to_lowercase();

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(HttpError::InvalidUrl {
                url: Self::truncate_url(&url),
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(Self {
            url: parsed.to_string(),
            scheme,
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolves `path` below the base, treating the base as a directory.
    pub fn join(&self, path: &str) -> Result<Url, HttpError> {
        let mut base = self.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base)
            .and_then(|b| b.join(path.trim_start_matches('/')))
            .map_err(|e| HttpError::InvalidUrl {
                url: Self::truncate_url(&base),
                reason: e.to_string(),
            })
    }

    fn truncate_url(url: &str) -> String {
        if url.len() <= 100 {
            url.to_string()
        } else {
            let cut = (0..=100).rev().find(|i| url.is_char_boundary(*i)).unwrap_or(0);
            format!("{}...", &url[..cut])
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("connection failed to {host}: {message}")]
    ConnectionError { host: String, message: String },

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, request_id: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus {
        status: u16,
        message: String,
        request_id: String,
        retryable: bool,
    },

    #[error("request cancelled")]
    Cancelled { request_id: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String, request_id: String },
}

#[derive(Debug, Clone, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

impl HttpError {
    pub fn from_status(status: u16, body: Option<&[u8]>, request_id: impl Into<String>) -> Self {
        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        HttpError::HttpStatus {
            status,
            message,
            request_id: request_id.into(),
            retryable: matches!(status, 408 | 429 | 500..=599),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. } | HttpError::ConnectionError { .. } => true,
            HttpError::HttpStatus { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Cancellation is an expected outcome, never a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HttpError::Cancelled { .. })
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            HttpError::Timeout { request_id, .. }
            | HttpError::HttpStatus { request_id, .. }
            | HttpError::Cancelled { request_id }
            | HttpError::InvalidResponse { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status, .. } if (400..500).contains(status))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, HttpError::HttpStatus { status, .. } if (500..600).contains(status))
    }
}

/// Remote preference store, keyed by the caller's identity token.
#[async_trait]
pub trait PreferenceApi: Send + Sync {
    /// Returns the raw document; the engine sanitizes it.
    async fn fetch_preferences(&self, token: &AuthToken) -> Result<Value, HttpError>;

    async fn store_preferences(
        &self,
        token: &AuthToken,
        preferences: &MapLayerPreferences,
    ) -> Result<(), HttpError>;
}

#[async_trait]
impl<T: PreferenceApi + ?Sized> PreferenceApi for Arc<T> {
    async fn fetch_preferences(&self, token: &AuthToken) -> Result<Value, HttpError> {
        (**self).fetch_preferences(token).await
    }

    async fn store_preferences(
        &self,
        token: &AuthToken,
        preferences: &MapLayerPreferences,
    ) -> Result<(), HttpError> {
        (**self).store_preferences(token, preferences).await
    }
}

/// Hazard monitoring points for a viewport, as a GeoJSON feature collection.
#[async_trait]
pub trait OverlayApi: Send + Sync {
    async fn fetch_hazard_overlay(
        &self,
        bounds: &ViewportBounds,
        zoom: f64,
    ) -> Result<geojson::FeatureCollection, HttpError>;
}

#[async_trait]
impl<T: OverlayApi + ?Sized> OverlayApi for Arc<T> {
    async fn fetch_hazard_overlay(
        &self,
        bounds: &ViewportBounds,
        zoom: f64,
    ) -> Result<geojson::FeatureCollection, HttpError> {
        (**self).fetch_hazard_overlay(bounds, zoom).await
    }
}

#[cfg(feature = "rest")]
pub use self::rest::RestClient;

#[cfg(feature = "rest")]
mod rest {
    use async_trait::async_trait;
    use serde_json::Value;
    use tracing::{debug, instrument};
    use uuid::Uuid;

    use super::{
        HttpError, OverlayApi, PreferenceApi, ValidatedUrl, HAZARD_OVERLAY_PATH, PREFERENCES_PATH,
    };
    use crate::config::ApiConfig;
    use crate::event::AuthToken;
    use crate::model::MapLayerPreferences;
    use crate::viewport::ViewportBounds;

    /// `reqwest` implementation of both remote contracts.
    #[derive(Debug, Clone)]
    pub struct RestClient {
        client: reqwest::Client,
        base: ValidatedUrl,
        timeout_ms: u64,
    }

    impl RestClient {
        pub fn new(config: &ApiConfig) -> Result<Self, HttpError> {
            config.validate().map_err(|e| HttpError::InvalidRequest {
                reason: e.to_string(),
            })?;
            let base = ValidatedUrl::new(config.base_url.as_str())?;
            let client = reqwest::Client::builder()
                .timeout(config.request_timeout())
                .build()
                .map_err(|e| HttpError::InvalidRequest {
                    reason: e.to_string(),
                })?;

            Ok(Self {
                client,
                base,
                timeout_ms: config.request_timeout_ms,
            })
        }

        async fn send(
            &self,
            request: reqwest::RequestBuilder,
        ) -> Result<(reqwest::Response, String), HttpError> {
            let request_id = Uuid::new_v4().to_string();
            let response = request
                .header("x-request-id", request_id.as_str())
                .send()
                .await
                .map_err(|e| self.transport_error(&e, &request_id))?;

            let status = response.status();
            if status.is_success() {
                return Ok((response, request_id));
            }

            let body = response.bytes().await.ok();
            Err(HttpError::from_status(status.as_u16(), body.as_deref(), request_id))
        }

        fn transport_error(&self, e: &reqwest::Error, request_id: &str) -> HttpError {
            if e.is_timeout() {
                HttpError::Timeout {
                    timeout_ms: self.timeout_ms,
                    request_id: request_id.to_string(),
                }
            } else if e.is_decode() || e.is_body() {
                HttpError::InvalidResponse {
                    reason: e.to_string(),
                    request_id: request_id.to_string(),
                }
            } else {
                HttpError::ConnectionError {
                    host: self.base.host().to_string(),
                    message: e.to_string(),
                }
            }
        }
    }

    #[async_trait]
    impl PreferenceApi for RestClient {
        #[instrument(skip_all)]
        async fn fetch_preferences(&self, token: &AuthToken) -> Result<Value, HttpError> {
            let url = self.base.join(PREFERENCES_PATH)?;
            let request = self.client.get(url).bearer_auth(token.expose());

            match self.send(request).await {
                Ok((response, request_id)) => response
                    .json::<Value>()
                    .await
                    .map_err(|e| HttpError::InvalidResponse {
                        reason: e.to_string(),
                        request_id,
                    }),
                // An account that never saved anything has no document yet.
                Err(HttpError::HttpStatus { status: 404, .. }) => {
                    debug!("no stored preferences for account");
                    Ok(Value::Null)
                }
                Err(e) => Err(e),
            }
        }

        #[instrument(skip_all)]
        async fn store_preferences(
            &self,
            token: &AuthToken,
            preferences: &MapLayerPreferences,
        ) -> Result<(), HttpError> {
            let url = self.base.join(PREFERENCES_PATH)?;
            let request = self
                .client
                .put(url)
                .bearer_auth(token.expose())
                .json(preferences);
            self.send(request).await.map(|_| ())
        }
    }

    #[async_trait]
    impl OverlayApi for RestClient {
        #[instrument(skip(self))]
        async fn fetch_hazard_overlay(
            &self,
            bounds: &ViewportBounds,
            zoom: f64,
        ) -> Result<geojson::FeatureCollection, HttpError> {
            let url = self.base.join(HAZARD_OVERLAY_PATH)?;
            let request = self.client.get(url).query(&[
                ("south", bounds.south()),
                ("west", bounds.west()),
                ("north", bounds.north()),
                ("east", bounds.east()),
                ("zoom", zoom),
            ]);

            let (response, request_id) = self.send(request).await?;
            response
                .json::<geojson::FeatureCollection>()
                .await
                .map_err(|e| HttpError::InvalidResponse {
                    reason: e.to_string(),
                    request_id,
                })
        }
    }

}
