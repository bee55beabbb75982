//! Preference sync engine.
//!
//! Owns the in-memory [`MapLayerPreferences`], the advisory [`SyncState`]
//! and the single pending-write slot. Guest sessions persist to the local
//! guest slot only; authenticated sessions push to the remote store after a
//! debounce, falling back to the pending slot when the push cannot land.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Connectivity, LocalPersistence, PreferenceApi};
use crate::config::{ConfigError, SyncConfig};
use crate::event::AuthToken;
use crate::model::{MapLayerPreferences, PreferencesPatch};
use crate::offline_store::{LocalPreferenceStore, PendingWrite};

/// Outcome of the last attempt to persist preferences remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Confirmed synced, or a guest session.
    #[default]
    Idle,
    Saving,
    /// A push failed for a reason other than connectivity.
    Unsynced,
    Offline,
    /// Initial load failed; running on the local fallback.
    Error,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Saving => "saving",
            Self::Unsynced => "unsynced",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

#[derive(Default)]
struct Session {
    token: Option<AuthToken>,
    /// Bumped on every initialize/sign-out so work started for an older
    /// session can recognise it is stale.
    epoch: u64,
    runtime: Option<Handle>,
    debounce: Option<JoinHandle<()>>,
    /// Set while an authenticated initialize awaits the remote copy.
    loading: bool,
    /// Patches made during that load, replayed on top of its result.
    queued: Vec<PreferencesPatch>,
}

struct Inner<S, R> {
    config: SyncConfig,
    store: LocalPreferenceStore<Arc<S>>,
    remote: Arc<R>,
    connectivity: Connectivity,
    session: Mutex<Session>,
    preferences: watch::Sender<MapLayerPreferences>,
    sync_state: watch::Sender<SyncState>,
    push_lock: tokio::sync::Mutex<()>,
}

impl<S: LocalPersistence, R: PreferenceApi> Inner<S, R> {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn token_for(&self, epoch: u64) -> Option<AuthToken> {
        let session = self.session();
        if session.epoch == epoch {
            session.token.clone()
        } else {
            None
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session().epoch == epoch
    }

    fn publish(&self, preferences: MapLayerPreferences) {
        self.preferences.send_if_modified(|current| {
            if *current == preferences {
                return false;
            }
            *current = preferences;
            true
        });
    }

    fn set_state(&self, state: SyncState) {
        self.sync_state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = current.as_str(), to = state.as_str(), "sync state");
            *current = state;
            true
        });
    }

    fn record_pending(&self, owner: String, preferences: MapLayerPreferences) {
        if let Err(e) = self.store.save_pending(&PendingWrite::new(preferences, owner)) {
            warn!(error = %e, "could not persist pending preference write");
        }
    }

    fn clear_pending(&self) {
        if let Err(e) = self.store.clear_pending() {
            warn!(error = %e, "could not clear pending preference write");
        }
    }

    fn clear_guest(&self) {
        if let Err(e) = self.store.clear_guest() {
            warn!(error = %e, "could not clear guest preferences");
        }
    }

    /// Caller holds `push_lock`. Returns whether the snapshot reached the
    /// server.
    async fn push_locked(&self, token: &AuthToken, snapshot: MapLayerPreferences, epoch: u64) -> bool {
        if !self.connectivity.is_online() {
            debug!("offline, deferring preference push");
            self.record_pending(token.owner_id(), snapshot);
            self.set_state(SyncState::Offline);
            return false;
        }

        self.set_state(SyncState::Saving);
        let result = self.remote.store_preferences(token, &snapshot).await;

        if !self.is_current(epoch) {
            debug!("session changed during push, dropping result");
            return result.is_ok();
        }

        match result {
            Ok(()) => {
                self.clear_pending();
                self.set_state(SyncState::Idle);
                info!("preferences synced");
                true
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retryable = e.is_retryable(),
                    request_id = e.request_id().unwrap_or("-"),
                    "preference push failed"
                );
                self.record_pending(token.owner_id(), snapshot);
                self.set_state(SyncState::Unsynced);
                false
            }
        }
    }
}

/// Session-scoped owner of the user's map layer preferences.
///
/// Cheap to clone; clones share the same state.
pub struct PreferenceSyncEngine<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for PreferenceSyncEngine<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, R> PreferenceSyncEngine<S, R>
where
    S: LocalPersistence + 'static,
    R: PreferenceApi + 'static,
{
    pub fn new(
        storage: Arc<S>,
        remote: Arc<R>,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = LocalPreferenceStore::new(storage, &config)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        let (preferences, _) = watch::channel(MapLayerPreferences::default());
        let (sync_state, _) = watch::channel(SyncState::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                remote,
                connectivity,
                session: Mutex::new(Session::default()),
                preferences,
                sync_state,
                push_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Establishes the session's authoritative preferences.
    ///
    /// Never fails: a failed remote load falls back to the guest copy (or
    /// defaults) with [`SyncState::Error`].
    #[instrument(skip_all, fields(authenticated = token.is_some()))]
    pub async fn initialize(&self, token: Option<AuthToken>) -> MapLayerPreferences {
        let inner = &self.inner;
        let epoch = {
            let mut session = inner.session();
            if let Some(timer) = session.debounce.take() {
                timer.abort();
            }
            session.epoch += 1;
            session.token.clone_from(&token);
            session.runtime = Handle::try_current().ok();
            session.loading = token.is_some();
            session.queued.clear();
            session.epoch
        };

        let guest = inner.store.load_guest();

        let Some(token) = token else {
            let preferences = guest.unwrap_or_default();
            inner.publish(preferences);
            inner.set_state(SyncState::Idle);
            info!(customized = !preferences.is_default(), "guest session initialized");
            return preferences;
        };

        let mut needs_push = false;
        let mut load_failed = false;
        let mut effective = match inner.remote.fetch_preferences(&token).await {
            Ok(raw) => {
                let remote = MapLayerPreferences::sanitize(&raw);
                let adopted = match guest {
                    // Account never customized anything: keep what the guest chose.
                    Some(guest) if !guest.is_default() && remote.is_default() => {
                        info!("adopting guest preferences for untouched account");
                        needs_push = true;
                        guest
                    }
                    _ => remote,
                };
                inner.clear_guest();
                adopted
            }
            Err(e) => {
                warn!(
                    error = %e,
                    request_id = e.request_id().unwrap_or("-"),
                    "remote preference load failed, using local copy"
                );
                load_failed = true;
                guest.unwrap_or_default()
            }
        };

        if let Some(pending) = inner.store.load_pending() {
            if pending.is_owned_by(&token.owner_id()) {
                info!(recorded_at = pending.recorded_at.as_millis(), "resuming pending preference write");
                effective = pending.preferences;
                needs_push = true;
            } else {
                info!("discarding pending preference write recorded by another account");
                inner.clear_pending();
            }
        }

        {
            let mut session = inner.session();
            if session.epoch != epoch {
                debug!("superseded during initialize");
                return effective;
            }
            session.loading = false;
            let queued = std::mem::take(&mut session.queued);
            let replayed = queued.iter().fold(effective, |prefs, patch| prefs.merged(patch));
            if replayed != effective {
                debug!(patches = queued.len(), "replaying changes made during load");
                effective = replayed;
                needs_push = true;
            }
            // Under the session lock so a concurrent update sees the result.
            inner.publish(effective);
        }

        inner.set_state(if load_failed {
            SyncState::Error
        } else {
            SyncState::Idle
        });

        if needs_push {
            if inner.connectivity.is_online() {
                let _guard = inner.push_lock.lock().await;
                let pushed = inner.push_locked(&token, effective, epoch).await;
                // An unconfirmed load stays visible as the headline state.
                if load_failed && inner.is_current(epoch) {
                    inner.set_state(if pushed {
                        SyncState::Idle
                    } else {
                        SyncState::Error
                    });
                }
            } else {
                inner.record_pending(token.owner_id(), effective);
                if !load_failed {
                    inner.set_state(SyncState::Offline);
                }
            }
        }

        effective
    }

    /// Merges `patch` into the current preferences and persists the result.
    ///
    /// A patch that changes nothing is dropped without any write. While the
    /// remote copy is still loading, the patch is shown at once and replayed
    /// on top of the loaded preferences.
    #[instrument(skip_all)]
    pub fn update(&self, patch: &PreferencesPatch) {
        let inner = &self.inner;
        let mut session = inner.session();
        let current = *inner.preferences.borrow();
        let next = current.merged(patch);

        if session.loading {
            debug!("remote load in progress, change queued");
            session.queued.push(*patch);
            inner.publish(next);
            return;
        }
        if next == current {
            debug!("preference patch is a no-op");
            return;
        }
        inner.publish(next);

        if session.token.is_none() {
            if let Err(e) = inner.store.save_guest(&next) {
                warn!(error = %e, "could not persist guest preferences");
            }
            return;
        }
        self.schedule_push(&mut session);
    }

    fn schedule_push(&self, session: &mut Session) {
        if let Some(previous) = session.debounce.take() {
            previous.abort();
        }
        let Some(runtime) = session.runtime.clone() else {
            warn!("no runtime for debounced push, deferring to pending slot");
            let owner = session.token.as_ref().map(AuthToken::owner_id).unwrap_or_default();
            self.inner.record_pending(owner, *self.inner.preferences.borrow());
            self.inner.set_state(SyncState::Unsynced);
            return;
        };

        let engine = self.clone();
        let epoch = session.epoch;
        let delay = self.inner.config.push_debounce();
        // Only the sleep is abortable; once it elapses the push runs on its
        // own task and completes even if another update arrives.
        let push_runtime = runtime.clone();
        session.debounce = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            push_runtime.spawn(async move { engine.push_latest(epoch).await });
        }));
    }

    async fn push_latest(&self, epoch: u64) {
        let inner = &self.inner;
        let _guard = inner.push_lock.lock().await;
        let Some(token) = inner.token_for(epoch) else {
            debug!("session ended before debounced push");
            return;
        };
        let snapshot = *inner.preferences.borrow();
        inner.push_locked(&token, snapshot, epoch).await;
    }

    /// Retries the pending write after connectivity returns.
    ///
    /// Failure keeps the pending slot for the next reconnect.
    #[instrument(skip_all)]
    pub async fn on_reconnect(&self) {
        let inner = &self.inner;
        let _guard = inner.push_lock.lock().await;
        let Some(pending) = inner.store.load_pending() else {
            debug!("reconnected with nothing pending");
            return;
        };
        let (token, epoch) = {
            let session = inner.session();
            (session.token.clone(), session.epoch)
        };
        let Some(token) = token else {
            debug!("pending write kept until an authenticated session");
            return;
        };
        if !pending.is_owned_by(&token.owner_id()) {
            debug!("pending write belongs to another account, not pushing");
            return;
        }

        info!(recorded_at = pending.recorded_at.as_millis(), "pushing pending preference write");
        inner.push_locked(&token, pending.preferences, epoch).await;
    }

    /// Skips any remaining debounce and pushes now. Used before unload.
    #[instrument(skip_all)]
    pub async fn flush(&self) {
        let (had_timer, epoch, authenticated) = {
            let mut session = self.inner.session();
            let had_timer = match session.debounce.take() {
                Some(timer) => {
                    timer.abort();
                    true
                }
                None => false,
            };
            (had_timer, session.epoch, session.token.is_some())
        };
        if !authenticated {
            return;
        }
        if had_timer || self.inner.store.load_pending().is_some() {
            self.push_latest(epoch).await;
        }
    }

    /// Drops the identity token and returns to the guest copy.
    ///
    /// A pending write is kept. Only a later session of the same account
    /// resumes it; any other account discards it at initialize.
    #[instrument(skip_all)]
    pub fn sign_out(&self) -> MapLayerPreferences {
        let inner = &self.inner;
        {
            let mut session = inner.session();
            if let Some(timer) = session.debounce.take() {
                timer.abort();
            }
            session.token = None;
            session.epoch += 1;
            session.loading = false;
            session.queued.clear();
        }
        let preferences = inner.store.load_guest().unwrap_or_default();
        inner.publish(preferences);
        inner.set_state(SyncState::Idle);
        info!("signed out, back to guest preferences");
        preferences
    }

    pub fn current_preferences(&self) -> MapLayerPreferences {
        *self.inner.preferences.borrow()
    }

    pub fn current_sync_state(&self) -> SyncState {
        *self.inner.sync_state.borrow()
    }

    pub fn subscribe_preferences(&self) -> watch::Receiver<MapLayerPreferences> {
        self.inner.preferences.subscribe()
    }

    pub fn subscribe_sync_state(&self) -> watch::Receiver<SyncState> {
        self.inner.sync_state.subscribe()
    }

    pub fn pending_write(&self) -> Option<PendingWrite> {
        self.inner.store.load_pending()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.session().token.is_some()
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{HttpError, MemoryKv};
    use crate::model::Overlay;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingApi {
        fetches: AtomicUsize,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl PreferenceApi for CountingApi {
        async fn fetch_preferences(&self, _token: &AuthToken) -> Result<Value, HttpError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }

        async fn store_preferences(
            &self,
            _token: &AuthToken,
            _preferences: &MapLayerPreferences,
        ) -> Result<(), HttpError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine() -> (
        PreferenceSyncEngine<MemoryKv, CountingApi>,
        Arc<MemoryKv>,
        Arc<CountingApi>,
    ) {
        let kv = Arc::new(MemoryKv::new());
        let api = Arc::new(CountingApi::default());
        let engine = PreferenceSyncEngine::new(
            Arc::clone(&kv),
            Arc::clone(&api),
            Connectivity::new(true),
            SyncConfig::default(),
        )
        .unwrap();
        (engine, kv, api)
    }

    #[test]
    fn sync_state_wire_names() {
        assert_eq!(serde_json::to_string(&SyncState::Unsynced).unwrap(), "\"unsynced\"");
        assert_eq!(SyncState::Offline.as_str(), "offline");
        assert_eq!(SyncState::default(), SyncState::Idle);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = SyncConfig {
            preference_push_debounce_ms: 0,
            ..SyncConfig::default()
        };
        assert!(PreferenceSyncEngine::new(
            Arc::new(MemoryKv::new()),
            Arc::new(CountingApi::default()),
            Connectivity::default(),
            config,
        )
        .is_err());
    }

    #[tokio::test]
    async fn guest_session_never_touches_network() {
        let (engine, kv, api) = engine();
        let prefs = engine.initialize(None).await;
        assert_eq!(prefs, MapLayerPreferences::default());

        engine.update(&PreferencesPatch::new().overlay(Overlay::Traffic, true));
        assert!(engine.current_preferences().overlays.traffic);
        assert_eq!(engine.current_sync_state(), SyncState::Idle);
        assert_eq!(kv.len(), 1);
        assert_eq!(api.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(api.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn noop_patch_writes_nothing() {
        let (engine, kv, _api) = engine();
        engine.initialize(None).await;

        engine.update(&PreferencesPatch::new().overlay(Overlay::Hazard, true));
        engine.update(&PreferencesPatch::new());
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn sign_out_restores_guest_copy() {
        let (engine, _kv, _api) = engine();
        engine.initialize(None).await;
        engine.update(&PreferencesPatch::new().opacity(Overlay::Hazard, 25));
        let guest = engine.current_preferences();

        engine.initialize(Some(AuthToken::new("t"))).await;
        assert!(engine.is_authenticated());

        let restored = engine.sign_out();
        assert!(!engine.is_authenticated());
        // The guest copy was adopted by the account and cleared locally.
        assert_eq!(restored, MapLayerPreferences::default());
        assert_ne!(restored, guest);
    }

    #[tokio::test]
    async fn observers_see_published_preferences() {
        let (engine, _kv, _api) = engine();
        let mut rx = engine.subscribe_preferences();
        engine.initialize(None).await;
        engine.update(&PreferencesPatch::new().overlay(Overlay::Weather, true));
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().overlays.weather);
    }
}
