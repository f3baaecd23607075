//! Realtime integration tests
//!
//! Live views and location feeds over the in-memory store:
//! - throttled location publishing through the per-user service
//! - views with no target, retargeting and store outages
//! - snapshot ordering and watch release

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use beacon::auth::{roles, PermissionCatalog, Principal};
use beacon::incident::{
    Incident, IncidentService, IncidentStatus, Location, NewIncident, Priority, TransitionRequest,
    UserProfile,
};
use beacon::location::{ChannelSource, LocationService, PositionSample};
use beacon::store::{DocPath, DocumentStore, MemoryStore, Query, INCIDENTS, USERS};
use beacon::sync::{SyncHub, ViewTarget};

const RETRY: Duration = Duration::from_millis(500);

fn catalog() -> Arc<PermissionCatalog> {
    Arc::new(PermissionCatalog::builtin())
}

// =============================================================================
// Location Feeds
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_thirty_seconds_of_fixes_publish_three_times() {
    let store = Arc::new(MemoryStore::new());
    let locations = LocationService::new(store.clone(), catalog(), Duration::from_secs(10));
    let responder = Principal::new("r-1", roles::RESPONDER);

    let (tx, source) = ChannelSource::new(64);
    let feed = locations.open_feed(&responder, "r-1", source).unwrap();
    assert!(locations.is_active("r-1"));

    let seq_before = store.seq().await;
    for i in 0..30 {
        tx.send(Ok(PositionSample::new(14.0 + i as f64 * 0.0001, 121.0, 6.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    assert_eq!(feed.stats().written(), 3);
    assert_eq!(store.seq().await - seq_before, 3);

    let profile: UserProfile = store
        .read(&DocPath::new(USERS, "r-1"))
        .await
        .unwrap()
        .document
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(profile.location_metadata.unwrap().accuracy, 6.0);

    feed.stop().await;
    assert!(!locations.is_active("r-1"));
}

#[tokio::test]
async fn test_feed_for_another_user_needs_users_manage() {
    let store = Arc::new(MemoryStore::new());
    let locations = LocationService::new(store, catalog(), Duration::from_secs(10));

    let responder = Principal::new("r-1", roles::RESPONDER);
    let (_tx, source) = ChannelSource::new(4);
    assert!(locations.open_feed(&responder, "r-2", source).is_err());

    let reporter = Principal::new("u-1", roles::REPORTER);
    let (_tx, source) = ChannelSource::new(4);
    assert!(locations.open_feed(&reporter, "u-1", source).is_err());
    assert_eq!(locations.active_feeds(), 0);
}

// =============================================================================
// Live Views
// =============================================================================

#[tokio::test]
async fn test_no_target_then_retarget() {
    let store = Arc::new(MemoryStore::new());
    let hub = SyncHub::new(store.clone(), RETRY);
    store
        .write(&DocPath::new(USERS, "r-1"), json!({"displayName": "Ana"}))
        .await
        .unwrap();

    // Profile id not known yet
    let mut view = hub.watch(ViewTarget::filtered(USERS, "id", None));
    let state = view.state();
    assert!(state.data.is_none());
    assert!(!state.loading);
    assert_eq!(hub.active_watches(), 0);

    view.retarget(Some(ViewTarget::document(USERS, "r-1")));
    let ready = view.wait_for(|s| !s.loading && s.data.is_some()).await.unwrap();
    let profile: serde_json::Value = ready.document().unwrap().unwrap();
    assert_eq!(profile["displayName"], "Ana");
    assert_eq!(hub.active_watches(), 1);

    view.retarget(None);
    let idle = view.wait_for(|s| s.data.is_none()).await.unwrap();
    assert!(!idle.loading);
}

#[tokio::test(start_paused = true)]
async fn test_outage_keeps_loading_then_recovers() {
    let store = Arc::new(MemoryStore::new());
    let hub = SyncHub::new(store.clone(), RETRY);
    store
        .write(&DocPath::new(INCIDENTS, "i-1"), json!({"status": "Reported"}))
        .await
        .unwrap();

    let mut view = hub.watch(None);
    store.set_online(false);
    view.retarget(Some(ViewTarget::document(INCIDENTS, "i-1")));

    let degraded = view.wait_for(|s| s.error.is_some()).await.unwrap();
    assert!(degraded.loading);

    store.set_online(true);
    let ready = view.wait_for(|s| !s.loading).await.unwrap();
    assert!(ready.error.is_none());
    let doc: serde_json::Value = ready.document().unwrap().unwrap();
    assert_eq!(doc["status"], "Reported");
}

#[tokio::test]
async fn test_dispatch_board_sees_monotone_snapshots() {
    let store = Arc::new(MemoryStore::new());
    let hub = SyncHub::new(store.clone(), RETRY);
    let incidents = IncidentService::new(store.clone(), catalog());
    let coordinator = Principal::new("c-1", roles::COORDINATOR);

    let mut board = hub.watch_collection(INCIDENTS, Query::order_by("assignedTo").equal_to("Team-A"));
    let mut states = board.subscribe();

    let mut ids = Vec::new();
    for n in 0..3 {
        let created = incidents
            .create(
                None,
                NewIncident {
                    title: format!("Report {}", n),
                    description: "Smoke from a warehouse roof".into(),
                    category: "fire".into(),
                    incident_type: None,
                    priority: Priority::Critical,
                    location: Location::Address("Dock 4".into()),
                    media: vec![],
                    anonymous: true,
                },
            )
            .await
            .unwrap();
        for request in [
            TransitionRequest::to(IncidentStatus::Verified),
            TransitionRequest::dispatch("Team-A"),
        ] {
            incidents
                .transition(Some(&coordinator), &created.id, &request)
                .await
                .unwrap();
        }
        ids.push(created.id);
    }

    let mut last_seq = 0;
    let final_state = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = states.borrow_and_update().clone();
            assert!(state.seq >= last_seq, "snapshot went backwards");
            last_seq = state.seq;
            if !state.loading && state.collection::<Incident>().unwrap().len() == 3 {
                return state;
            }
            states.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let on_board: Vec<Incident> = final_state.collection().unwrap();
    assert!(on_board
        .iter()
        .all(|i| i.status == IncidentStatus::TeamDispatched && ids.contains(&i.id)));

    let current = board.wait_for(|s| s.seq >= final_state.seq).await.unwrap();
    assert!(current.seq >= final_state.seq);
}

#[tokio::test]
async fn test_closing_views_releases_watches() {
    let store = Arc::new(MemoryStore::new());
    let hub = SyncHub::new(store.clone(), RETRY);
    let target = ViewTarget::document(INCIDENTS, "i-9");

    let mut first = hub.watch(Some(target.clone()));
    let mut second = hub.watch(Some(target.clone()));
    first.wait_for(|s| !s.loading).await.unwrap();
    second.wait_for(|s| !s.loading).await.unwrap();
    assert_eq!(hub.watchers(&target), 2);

    first.close().await;
    assert_eq!(hub.watchers(&target), 1);

    drop(second);
    tokio::time::timeout(Duration::from_secs(1), async {
        while hub.watchers(&target) > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(hub.active_watches(), 0);

    // A later view can start from the cached snapshot
    assert!(hub.cached(&target).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_shows_cache_until_watch_confirms() {
    let store = Arc::new(MemoryStore::new());
    let hub = SyncHub::new(store.clone(), RETRY);
    let path = DocPath::new(INCIDENTS, "i-7");
    let target = ViewTarget::document(INCIDENTS, "i-7");
    store.write(&path, json!({"status": "Reported"})).await.unwrap();

    let mut first = hub.watch(Some(target.clone()));
    let shown = first.wait_for(|s| !s.loading).await.unwrap();
    first.close().await;
    assert_eq!(hub.watchers(&target), 0);
    let cached_seq = hub.cached(&target).unwrap().seq;
    assert_eq!(cached_seq, shown.seq);

    // Changes while nobody watches, then the store drops out
    store.write(&path, json!({"status": "Verified"})).await.unwrap();
    store.set_online(false);

    let mut second = hub.watch(Some(target.clone()));
    let reused = second.wait_for(|s| s.data.is_some()).await.unwrap();
    assert!(reused.loading);
    assert_eq!(reused.seq, cached_seq);
    let doc: serde_json::Value = reused.document().unwrap().unwrap();
    assert_eq!(doc["status"], "Reported");
    assert_eq!(hub.watchers(&target), 1);

    store.set_online(true);
    let confirmed = second.wait_for(|s| !s.loading).await.unwrap();
    assert!(confirmed.error.is_none());
    assert!(confirmed.seq > cached_seq);
    let doc: serde_json::Value = confirmed.document().unwrap().unwrap();
    assert_eq!(doc["status"], "Verified");
    assert_eq!(hub.watchers(&target), 1);
}
