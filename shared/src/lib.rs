// lib.rs - map state synchronization core for the flood monitoring front end

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod controller;
pub mod event;
pub mod model;
pub mod offline_store;
pub mod overlay;
pub mod sync;
pub mod viewport;

use serde::{Deserialize, Serialize};

pub use capabilities::{
    Connectivity, FileKv, HttpError, KvError, LocalPersistence, MemoryKv,
    OverlayApi, PreferenceApi, ValidatedUrl,
};
#[cfg(feature = "rest")]
pub use capabilities::RestClient;
pub use config::{ApiConfig, ConfigError, SyncConfig};
pub use controller::{MapOverlayController, MapSurface};
pub use event::{AuthToken, Coordinate, MapEvent, ValidationError, Zoom};
pub use model::{BaseMap, MapLayerPreferences, Overlay, Percent, PreferencesPatch};
pub use offline_store::{LocalPreferenceStore, PendingWrite, StoreError};
pub use overlay::ViewportOverlayFetcher;
pub use sync::{PreferenceSyncEngine, SyncState};
pub use viewport::{HazardOverlay, HazardPoint, Severity, ViewportBounds, ViewportError, ViewportKey};

pub const DEFAULT_PREFERENCE_PUSH_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_VIEWPORT_SETTLE_MS: u64 = 400;
pub const DEFAULT_COORDINATE_PRECISION: u32 = 4;
pub const MAX_COORDINATE_PRECISION: u32 = 8;
pub const DEFAULT_OVERLAY_CACHE_CAPACITY: usize = 16;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;
pub const GUEST_PREFERENCES_KEY: &str = "guestPreferences";
pub const PENDING_WRITE_KEY: &str = "pendingPreferencesWrite";
pub const MIN_ZOOM: f64 = 0.0;
pub const MAX_ZOOM: f64 = 24.0;

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Default for UnixTimeMs {
    fn default() -> Self {
        Self::now()
    }
}
