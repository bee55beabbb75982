#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use floodmap_core::{
    AuthToken, BaseMap, Connectivity, HazardOverlay, HttpError, MapLayerPreferences, MapSurface,
    MemoryKv, Overlay, OverlayApi, Percent, PreferenceApi, PreferenceSyncEngine, SyncConfig,
    ViewportBounds, ViewportKey,
};
use geojson::FeatureCollection;
use serde_json::{json, Value};
use tokio::sync::oneshot;

// --- Preference API double: scripted remote document, recorded puts ---

pub struct ScriptedPreferenceApi {
    remote: Mutex<Value>,
    fetch_fails: AtomicBool,
    put_fails: AtomicBool,
    fetches: AtomicUsize,
    puts: Mutex<Vec<MapLayerPreferences>>,
    put_gate: Mutex<Option<oneshot::Receiver<()>>>,
    fetch_gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl ScriptedPreferenceApi {
    pub fn with_remote(remote: Value) -> Self {
        Self {
            remote: Mutex::new(remote),
            fetch_fails: AtomicBool::new(false),
            put_fails: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            puts: Mutex::new(Vec::new()),
            put_gate: Mutex::new(None),
            fetch_gate: Mutex::new(None),
        }
    }

    pub fn untouched_account() -> Self {
        Self::with_remote(Value::Null)
    }

    pub fn set_fetch_fails(&self, fails: bool) {
        self.fetch_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_put_fails(&self, fails: bool) {
        self.put_fails.store(fails, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> Vec<MapLayerPreferences> {
        self.puts.lock().unwrap().clone()
    }

    pub fn remote(&self) -> Value {
        self.remote.lock().unwrap().clone()
    }

    /// The next put waits until the returned sender fires (or is dropped).
    pub fn hold_next_put(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.put_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// The next fetch is counted, then waits until the returned sender fires.
    pub fn hold_next_fetch(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.fetch_gate.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl PreferenceApi for ScriptedPreferenceApi {
    async fn fetch_preferences(&self, _token: &AuthToken) -> Result<Value, HttpError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.fetch_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fetch_fails.load(Ordering::SeqCst) {
            return Err(HttpError::ConnectionError {
                host: "api.floodwatch.test".into(),
                message: "connection refused".into(),
            });
        }
        Ok(self.remote())
    }

    async fn store_preferences(
        &self,
        _token: &AuthToken,
        preferences: &MapLayerPreferences,
    ) -> Result<(), HttpError> {
        let gate = self.put_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.put_fails.load(Ordering::SeqCst) {
            return Err(HttpError::from_status(503, None, "req-put"));
        }
        self.puts.lock().unwrap().push(*preferences);
        *self.remote.lock().unwrap() = preferences.to_value();
        Ok(())
    }
}

// --- Overlay API double: every call waits for the test to answer it ---

pub struct GatedOverlayApi {
    calls: Mutex<Vec<(ViewportBounds, Option<oneshot::Sender<FeatureCollection>>)>>,
}

impl GatedOverlayApi {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn bounds_of(&self, call: usize) -> ViewportBounds {
        self.calls.lock().unwrap()[call].0
    }

    /// Answers call `call`. Returns false if its request was already
    /// cancelled.
    pub fn respond(&self, call: usize, collection: FeatureCollection) -> bool {
        let tx = self.calls.lock().unwrap()[call].1.take();
        tx.map_or(false, |tx| tx.send(collection).is_ok())
    }

    /// Drops the responder, which the fetch reports as a transport error.
    pub fn fail(&self, call: usize) {
        self.calls.lock().unwrap()[call].1.take();
    }
}

#[async_trait]
impl OverlayApi for GatedOverlayApi {
    async fn fetch_hazard_overlay(
        &self,
        bounds: &ViewportBounds,
        _zoom: f64,
    ) -> Result<FeatureCollection, HttpError> {
        let (tx, rx) = oneshot::channel();
        self.calls.lock().unwrap().push((*bounds, Some(tx)));
        rx.await.map_err(|_| HttpError::ConnectionError {
            host: "api.floodwatch.test".into(),
            message: "connection reset".into(),
        })
    }
}

pub fn hazard_collection(station: &str, severity: &str) -> FeatureCollection {
    serde_json::from_value(json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "id": station,
            "geometry": { "type": "Point", "coordinates": [121.03, 14.65] },
            "properties": {
                "severity": severity,
                "lastMeasured": "2024-07-24T03:15:00Z"
            }
        }]
    }))
    .unwrap()
}

pub fn station_of(overlay: &HazardOverlay) -> Option<String> {
    overlay.points.first().and_then(|p| p.id.clone())
}

// --- Map surface double: keeps the last applied state per layer ---

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SurfaceState {
    pub base_map: Option<BaseMap>,
    pub visible: HashMap<Overlay, bool>,
    pub opacity: HashMap<Overlay, Percent>,
    pub hazard_data: Option<ViewportKey>,
    pub renders: usize,
}

#[derive(Default)]
pub struct RecordingSurface {
    state: Mutex<SurfaceState>,
}

impl RecordingSurface {
    pub fn snapshot(&self) -> SurfaceState {
        self.state.lock().unwrap().clone()
    }

    /// Simulates a style swap wiping every layer.
    pub fn wipe(&self) {
        let mut state = self.state.lock().unwrap();
        let renders = state.renders;
        *state = SurfaceState {
            renders,
            ..SurfaceState::default()
        };
    }
}

impl MapSurface for RecordingSurface {
    fn set_base_map(&self, base_map: BaseMap) {
        self.state.lock().unwrap().base_map = Some(base_map);
    }

    fn set_layer_visibility(&self, overlay: Overlay, visible: bool) {
        self.state.lock().unwrap().visible.insert(overlay, visible);
    }

    fn set_layer_opacity(&self, overlay: Overlay, opacity: Percent) {
        self.state.lock().unwrap().opacity.insert(overlay, opacity);
    }

    fn render_hazard_overlay(&self, data: Option<&HazardOverlay>) {
        let mut state = self.state.lock().unwrap();
        state.hazard_data = data.map(|d| d.key);
        state.renders += 1;
    }
}

// --- Engine wiring ---

pub struct Harness {
    pub engine: PreferenceSyncEngine<MemoryKv, ScriptedPreferenceApi>,
    pub kv: Arc<MemoryKv>,
    pub api: Arc<ScriptedPreferenceApi>,
    pub connectivity: Connectivity,
}

pub fn harness(api: ScriptedPreferenceApi, online: bool) -> Harness {
    harness_with_kv(api, Arc::new(MemoryKv::new()), online)
}

pub fn harness_with_kv(api: ScriptedPreferenceApi, kv: Arc<MemoryKv>, online: bool) -> Harness {
    let api = Arc::new(api);
    let connectivity = Connectivity::new(online);
    let engine = PreferenceSyncEngine::new(
        Arc::clone(&kv),
        Arc::clone(&api),
        connectivity.clone(),
        SyncConfig::default(),
    )
    .unwrap();
    Harness {
        engine,
        kv,
        api,
        connectivity,
    }
}

pub fn token() -> AuthToken {
    AuthToken::new("test-token")
}

/// Lets spawned tasks run to their next await point.
pub async fn drain() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
