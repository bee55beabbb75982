//! Composition root: routes [`MapEvent`]s to the sync engine and overlay
//! fetcher, and projects their state onto a [`MapSurface`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::capabilities::{LocalPersistence, OverlayApi, PreferenceApi};
use crate::config::SyncConfig;
use crate::event::{MapEvent, Zoom};
use crate::model::{BaseMap, Overlay, Percent};
use crate::overlay::ViewportOverlayFetcher;
use crate::sync::PreferenceSyncEngine;
use crate::viewport::{HazardOverlay, ViewportBounds};

/// The rendered map, as seen by the core. Every call must be idempotent.
pub trait MapSurface: Send + Sync {
    fn set_base_map(&self, base_map: BaseMap);
    fn set_layer_visibility(&self, overlay: Overlay, visible: bool);
    fn set_layer_opacity(&self, overlay: Overlay, opacity: Percent);
    /// `None` removes the hazard layer's data.
    fn render_hazard_overlay(&self, data: Option<&HazardOverlay>);
}

impl<T: MapSurface + ?Sized> MapSurface for Arc<T> {
    fn set_base_map(&self, base_map: BaseMap) {
        (**self).set_base_map(base_map);
    }
    fn set_layer_visibility(&self, overlay: Overlay, visible: bool) {
        (**self).set_layer_visibility(overlay, visible);
    }
    fn set_layer_opacity(&self, overlay: Overlay, opacity: Percent) {
        (**self).set_layer_opacity(overlay, opacity);
    }
    fn render_hazard_overlay(&self, data: Option<&HazardOverlay>) {
        (**self).render_hazard_overlay(data);
    }
}

pub struct MapOverlayController<S, R, O, M> {
    engine: PreferenceSyncEngine<S, R>,
    fetcher: ViewportOverlayFetcher<O>,
    surface: Arc<M>,
    settle_delay: Duration,
    settle_timer: Mutex<Option<JoinHandle<()>>>,
}

impl<S, R, O, M> MapOverlayController<S, R, O, M>
where
    S: LocalPersistence + 'static,
    R: PreferenceApi + 'static,
    O: OverlayApi + 'static,
    M: MapSurface + 'static,
{
    pub fn new(
        engine: PreferenceSyncEngine<S, R>,
        fetcher: ViewportOverlayFetcher<O>,
        surface: Arc<M>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            engine,
            fetcher,
            surface,
            settle_delay: config.settle_delay(),
            settle_timer: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &PreferenceSyncEngine<S, R> {
        &self.engine
    }

    pub fn fetcher(&self) -> &ViewportOverlayFetcher<O> {
        &self.fetcher
    }

    #[instrument(skip_all, fields(event = event.name()))]
    pub async fn handle(&self, event: MapEvent) {
        match event {
            MapEvent::SignedIn { token } => {
                self.engine.initialize(Some(token)).await;
                self.apply_preferences();
            }
            MapEvent::SignedOut => {
                self.engine.sign_out();
                self.apply_preferences();
            }
            MapEvent::PreferencesPatched(patch) => {
                self.engine.update(&patch);
                self.apply_preferences();
            }
            MapEvent::ViewportChanged { bounds, zoom } => {
                self.schedule_settle(bounds, zoom);
            }
            MapEvent::SurfaceRebuilt => {
                self.reapply_all();
            }
            MapEvent::NetworkStatusChanged { online } => {
                if self.engine.connectivity().set_online(online) {
                    self.engine.on_reconnect().await;
                }
            }
        }
    }

    /// Pushes the full current state onto the surface. Safe to call any
    /// number of times; runs on every rebuild, not just the first.
    pub fn reapply_all(&self) {
        self.apply_preferences();
        let data = self.fetcher.current_overlay_data();
        self.surface.render_hazard_overlay(data.as_deref());
    }

    fn apply_preferences(&self) {
        let preferences = self.engine.current_preferences();
        self.surface.set_base_map(preferences.base_map);
        for overlay in Overlay::ALL {
            self.surface
                .set_layer_visibility(overlay, preferences.overlays.get(overlay));
            if let Some(opacity) = preferences.opacity.get(overlay) {
                self.surface.set_layer_opacity(overlay, opacity);
            }
        }
        self.fetcher.set_enabled(preferences.overlays.hazard);
    }

    fn settle_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.settle_timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_settle(&self, bounds: ViewportBounds, zoom: Zoom) {
        let mut timer = self.settle_timer();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime, viewport settle dropped");
            return;
        };
        let fetcher = self.fetcher.clone();
        let delay = self.settle_delay;
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("viewport settled");
            fetcher.on_viewport_settled(bounds, zoom);
        }));
    }

    /// Spawns the task that renders every new overlay dataset. `None`
    /// outside a Tokio runtime.
    pub fn spawn_renderer(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime, overlay renderer not started");
            return None;
        };
        let mut rx = self.fetcher.subscribe_overlay();
        let surface = Arc::clone(&self.surface);
        Some(runtime.spawn(async move {
            while rx.changed().await.is_ok() {
                let data = rx.borrow_and_update().clone();
                surface.render_hazard_overlay(data.as_deref());
            }
        }))
    }

    /// Pushes any debounced preference change immediately.
    pub async fn flush(&self) {
        self.engine.flush().await;
    }
}

impl<S, R, O, M> Drop for MapOverlayController<S, R, O, M> {
    fn drop(&mut self) {
        let timer = self
            .settle_timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = timer.take() {
            timer.abort();
        }
    }
}
