use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::model::PreferencesPatch;
use crate::viewport::ViewportBounds;
use crate::{MAX_ZOOM, MIN_ZOOM};

// --- Identity token: redacted Debug, zeroized on drop by `secrecy` ---

#[derive(Clone)]
pub struct AuthToken {
    secret: Arc<SecretString>,
    account: Option<Arc<str>>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            secret: Arc::new(SecretString::new(token.into())),
            account: None,
        }
    }

    /// Ties the token to a stable account id, so a refreshed token still
    /// owns the writes made under the previous one.
    #[must_use]
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(Arc::from(account.into()));
        self
    }

    pub fn expose(&self) -> &str {
        self.secret.expose_secret().as_str()
    }

    /// Identity that local per-account data is stored under. Falls back to
    /// a blake3 digest of the token, never the token itself.
    pub fn owner_id(&self) -> String {
        match &self.account {
            Some(account) => format!("account:{account}"),
            None => format!("token:{}", blake3::hash(self.expose().as_bytes()).to_hex()),
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken([REDACTED])")
    }
}

// --- Coordinate: validated, NaN-safe ---

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Coordinate {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid coordinate: lat={0}, lng={1}")]
    InvalidCoordinate(f64, f64),
    #[error("invalid zoom: {0}")]
    InvalidZoom(f64),
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Result<Self, ValidationError> {
        if !lat.is_finite()
            || !lng.is_finite()
            || !(-90.0..=90.0).contains(&lat)
            || !(-180.0..=180.0).contains(&lng)
        {
            return Err(ValidationError::InvalidCoordinate(lat, lng));
        }
        Ok(Self { lat, lng })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }
    pub fn lng(&self) -> f64 {
        self.lng
    }
}

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.lat.to_bits() == other.lat.to_bits() && self.lng.to_bits() == other.lng.to_bits()
    }
}

impl Eq for Coordinate {}

// --- Zoom: validated ---

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Zoom(f64);

impl Zoom {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() || !(MIN_ZOOM..=MAX_ZOOM).contains(&value) {
            return Err(ValidationError::InvalidZoom(value));
        }
        Ok(Self(value))
    }
    pub fn value(&self) -> f64 {
        self.0
    }
}

// --- Events the host shell feeds into the controller ---

#[derive(Clone, Debug)]
pub enum MapEvent {
    SignedIn { token: AuthToken },
    SignedOut,

    /// A layer control changed one or more preference fields.
    PreferencesPatched(PreferencesPatch),

    /// The map moved; fetching waits until movement settles.
    ViewportChanged { bounds: ViewportBounds, zoom: Zoom },

    /// The rendering surface dropped every layer (e.g. a style swap).
    SurfaceRebuilt,

    NetworkStatusChanged { online: bool },
}

impl MapEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MapEvent::SignedIn { .. } => "signed_in",
            MapEvent::SignedOut => "signed_out",
            MapEvent::PreferencesPatched(_) => "preferences_patched",
            MapEvent::ViewportChanged { .. } => "viewport_changed",
            MapEvent::SurfaceRebuilt => "surface_rebuilt",
            MapEvent::NetworkStatusChanged { .. } => "network_status_changed",
        }
    }
}
