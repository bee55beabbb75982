//! Viewport-keyed hazard overlay fetching.
//!
//! One fetch may be in flight at a time. A newer viewport key aborts the
//! older task, and every result is checked against the current generation
//! before it is applied, so a slow response can never overwrite a newer one.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::OverlayApi;
use crate::config::SyncConfig;
use crate::event::Zoom;
use crate::viewport::{HazardOverlay, ViewportBounds, ViewportKey};

struct InFlightFetch {
    key: ViewportKey,
    task: JoinHandle<()>,
}

struct FetcherState {
    enabled: bool,
    last_issued: Option<ViewportKey>,
    last_viewport: Option<(ViewportBounds, Zoom)>,
    in_flight: Option<InFlightFetch>,
    generation: u64,
    cache: Option<LruCache<ViewportKey, Arc<HazardOverlay>>>,
}

struct Inner<O> {
    api: Arc<O>,
    precision: u32,
    state: Mutex<FetcherState>,
    overlay: watch::Sender<Option<Arc<HazardOverlay>>>,
}

impl<O: OverlayApi> Inner<O> {
    fn state(&self) -> MutexGuard<'_, FetcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(&self, key: ViewportKey, generation: u64, bounds: ViewportBounds, zoom: Zoom) {
        let result = self.api.fetch_hazard_overlay(&bounds, zoom.value()).await;

        let mut state = self.state();
        if state.generation != generation {
            debug!(%key, "discarding superseded overlay response");
            return;
        }
        state.in_flight = None;

        match result {
            Ok(collection) => {
                let overlay = Arc::new(HazardOverlay::from_feature_collection(key, &collection));
                if let Some(cache) = state.cache.as_mut() {
                    cache.put(key, Arc::clone(&overlay));
                }
                info!(
                    %key,
                    points = overlay.len(),
                    skipped = overlay.skipped,
                    "hazard overlay updated"
                );
                // Published under the state lock so a newer generation
                // cannot interleave.
                self.overlay.send_replace(Some(overlay));
            }
            Err(e) if e.is_cancelled() => {
                debug!(%key, "overlay fetch cancelled");
            }
            Err(e) => {
                // Let a later settle on the same viewport try again.
                state.last_issued = None;
                warn!(
                    %key,
                    error = %e,
                    request_id = e.request_id().unwrap_or("-"),
                    "overlay fetch failed, keeping previous dataset"
                );
            }
        }
    }
}

/// Keeps the hazard dataset current for the settled map viewport.
pub struct ViewportOverlayFetcher<O> {
    inner: Arc<Inner<O>>,
}

impl<O> Clone for ViewportOverlayFetcher<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: OverlayApi + 'static> ViewportOverlayFetcher<O> {
    pub fn new(api: Arc<O>, config: &SyncConfig) -> Self {
        let (overlay, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                api,
                precision: config.coordinate_precision,
                state: Mutex::new(FetcherState {
                    enabled: true,
                    last_issued: None,
                    last_viewport: None,
                    in_flight: None,
                    generation: 0,
                    cache: NonZeroUsize::new(config.overlay_cache_capacity).map(LruCache::new),
                }),
                overlay,
            }),
        }
    }

    /// Called once the map has stopped moving. Settling on the key of the
    /// last issued request is a no-op.
    #[instrument(skip(self))]
    pub fn on_viewport_settled(&self, bounds: ViewportBounds, zoom: Zoom) {
        let key = ViewportKey::from_viewport(&bounds, zoom, self.inner.precision);
        let mut state = self.inner.state();
        state.last_viewport = Some((bounds, zoom));

        if !state.enabled {
            debug!(%key, "overlay disabled, viewport recorded only");
            return;
        }
        if state.last_issued == Some(key) {
            debug!(%key, "viewport key unchanged, skipping fetch");
            return;
        }
        self.issue(&mut state, key, bounds, zoom);
    }

    fn issue(&self, state: &mut FetcherState, key: ViewportKey, bounds: ViewportBounds, zoom: Zoom) {
        let Ok(runtime) = Handle::try_current() else {
            warn!(%key, "no async runtime, overlay fetch skipped");
            return;
        };

        if let Some(previous) = state.in_flight.take() {
            previous.task.abort();
            debug!(key = %previous.key, "cancelled superseded overlay fetch");
        }

        state.generation += 1;
        state.last_issued = Some(key);
        let generation = state.generation;

        if let Some(cached) = state.cache.as_mut().and_then(|c| c.get(&key).cloned()) {
            debug!(%key, "showing cached overlay while refreshing");
            self.inner.overlay.send_replace(Some(cached));
        }

        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            inner.fetch(key, generation, bounds, zoom).await;
        });
        state.in_flight = Some(InFlightFetch { key, task });
    }

    /// Disabling cancels any fetch and clears the rendered dataset.
    /// Re-enabling refetches the last settled viewport.
    #[instrument(skip(self))]
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.inner.state();
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;

        if enabled {
            info!("hazard overlay enabled");
            if let Some((bounds, zoom)) = state.last_viewport {
                let key = ViewportKey::from_viewport(&bounds, zoom, self.inner.precision);
                self.issue(&mut state, key, bounds, zoom);
            }
        } else {
            if let Some(in_flight) = state.in_flight.take() {
                in_flight.task.abort();
            }
            state.generation += 1;
            state.last_issued = None;
            self.inner.overlay.send_replace(None);
            info!("hazard overlay disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state().enabled
    }

    pub fn current_overlay_data(&self) -> Option<Arc<HazardOverlay>> {
        self.inner.overlay.borrow().clone()
    }

    pub fn subscribe_overlay(&self) -> watch::Receiver<Option<Arc<HazardOverlay>>> {
        self.inner.overlay.subscribe()
    }

    pub fn last_issued_key(&self) -> Option<ViewportKey> {
        self.inner.state().last_issued
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.state().in_flight.is_some()
    }
}
