mod common;

use std::sync::Arc;

use common::{drain, hazard_collection, station_of, GatedOverlayApi};
use floodmap_core::event::Zoom;
use floodmap_core::{Severity, SyncConfig, ViewportBounds, ViewportKey, ViewportOverlayFetcher};

fn manila() -> ViewportBounds {
    ViewportBounds::new(14.5500, 120.9500, 14.7000, 121.1000).unwrap()
}

fn manila_jittered() -> ViewportBounds {
    ViewportBounds::new(14.550_04, 120.949_96, 14.700_03, 121.100_02).unwrap()
}

fn marikina() -> ViewportBounds {
    ViewportBounds::new(14.6000, 121.0500, 14.7500, 121.2000).unwrap()
}

fn zoom(z: f64) -> Zoom {
    Zoom::new(z).unwrap()
}

fn fetcher(api: &Arc<GatedOverlayApi>) -> ViewportOverlayFetcher<GatedOverlayApi> {
    ViewportOverlayFetcher::new(Arc::clone(api), &SyncConfig::default())
}

#[tokio::test]
async fn same_viewport_key_fetches_once() {
    let api = Arc::new(GatedOverlayApi::new());
    let fetcher = fetcher(&api);

    fetcher.on_viewport_settled(manila(), zoom(12.2));
    drain().await;
    fetcher.on_viewport_settled(manila_jittered(), zoom(11.9));
    drain().await;
    assert_eq!(api.call_count(), 1);

    assert!(api.respond(0, hazard_collection("stn-1", "warning")));
    drain().await;
    fetcher.on_viewport_settled(manila(), zoom(12.0));
    drain().await;
    assert_eq!(api.call_count(), 1, "still deduped after the response");
}

#[tokio::test]
async fn slow_superseded_response_never_overwrites_newer_one() {
    let api = Arc::new(GatedOverlayApi::new());
    let fetcher = fetcher(&api);

    // 1. A issued, then B before A resolves
    fetcher.on_viewport_settled(manila(), zoom(12.0));
    drain().await;
    fetcher.on_viewport_settled(marikina(), zoom(12.0));
    drain().await;
    assert_eq!(api.call_count(), 2);
    assert_eq!(api.bounds_of(1), marikina());

    // 2. B answers first
    assert!(api.respond(1, hazard_collection("stn-b", "critical")));
    drain().await;

    // 3. A's late answer has nowhere to go: its task was aborted
    assert!(!api.respond(0, hazard_collection("stn-a", "normal")));
    drain().await;

    let overlay = fetcher.current_overlay_data().unwrap();
    assert_eq!(station_of(&overlay).as_deref(), Some("stn-b"));
    assert_eq!(overlay.highest_severity(), Severity::Critical);
    assert_eq!(overlay.key, ViewportKey::from_viewport(&marikina(), zoom(12.0), 4));
    assert!(!fetcher.is_fetching());
}

#[tokio::test]
async fn failure_keeps_last_good_dataset() {
    let api = Arc::new(GatedOverlayApi::new());
    let fetcher = fetcher(&api);

    fetcher.on_viewport_settled(manila(), zoom(12.0));
    drain().await;
    api.respond(0, hazard_collection("stn-1", "advisory"));
    drain().await;

    fetcher.on_viewport_settled(marikina(), zoom(12.0));
    drain().await;
    api.fail(1);
    drain().await;

    let overlay = fetcher.current_overlay_data().unwrap();
    assert_eq!(station_of(&overlay).as_deref(), Some("stn-1"));
    assert!(!fetcher.is_fetching());
}

#[tokio::test]
async fn disabling_cancels_and_clears() {
    let api = Arc::new(GatedOverlayApi::new());
    let fetcher = fetcher(&api);
    let mut rx = fetcher.subscribe_overlay();

    fetcher.on_viewport_settled(manila(), zoom(12.0));
    drain().await;
    api.respond(0, hazard_collection("stn-1", "warning"));
    drain().await;
    assert!(rx.borrow_and_update().is_some());

    fetcher.on_viewport_settled(marikina(), zoom(12.0));
    drain().await;
    fetcher.set_enabled(false);
    drain().await;

    assert!(!api.respond(1, hazard_collection("stn-2", "warning")));
    assert!(fetcher.current_overlay_data().is_none());
    assert!(rx.borrow_and_update().is_none());
    assert!(!fetcher.is_fetching());
}

#[tokio::test]
async fn revisited_viewport_shows_cached_data_while_refreshing() {
    let api = Arc::new(GatedOverlayApi::new());
    let fetcher = fetcher(&api);

    fetcher.on_viewport_settled(manila(), zoom(12.0));
    drain().await;
    api.respond(0, hazard_collection("stn-old", "normal"));
    drain().await;

    fetcher.on_viewport_settled(marikina(), zoom(12.0));
    drain().await;
    api.respond(1, hazard_collection("stn-m", "normal"));
    drain().await;

    // 1. Back to Manila: cached data shows immediately, a fresh fetch is issued
    fetcher.on_viewport_settled(manila(), zoom(12.0));
    drain().await;
    assert_eq!(api.call_count(), 3);
    let shown = fetcher.current_overlay_data().unwrap();
    assert_eq!(station_of(&shown).as_deref(), Some("stn-old"));

    // 2. Fresh data replaces it
    api.respond(2, hazard_collection("stn-new", "critical"));
    drain().await;
    let shown = fetcher.current_overlay_data().unwrap();
    assert_eq!(station_of(&shown).as_deref(), Some("stn-new"));
}

#[tokio::test]
async fn cache_can_be_disabled() {
    let api = Arc::new(GatedOverlayApi::new());
    let config = SyncConfig {
        overlay_cache_capacity: 0,
        ..SyncConfig::default()
    };
    let fetcher = ViewportOverlayFetcher::new(Arc::clone(&api), &config);

    fetcher.on_viewport_settled(manila(), zoom(12.0));
    drain().await;
    api.respond(0, hazard_collection("stn-1", "normal"));
    drain().await;
    fetcher.on_viewport_settled(marikina(), zoom(12.0));
    drain().await;
    api.respond(1, hazard_collection("stn-2", "normal"));
    drain().await;

    fetcher.on_viewport_settled(manila(), zoom(12.0));
    drain().await;
    let shown = fetcher.current_overlay_data().unwrap();
    assert_eq!(station_of(&shown).as_deref(), Some("stn-2"), "no cached swap");
}
