//! Counterpart subscriptions and whole sessions against the in-memory store.

use futures::{stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use nearby::config::{CoreConfig, SubscriptionConfig};
use nearby::database::{MemoryPresenceStore, PresenceStore, StoreOp};
use nearby::error::{PresenceError, StoreError};
use nearby::models::{
    AppLifecycleEvent, ClusterOrMarker, ConnectivityEvent, DestinationCategory, Entity, EventBus,
    GeoPoint, LifecycleState, NavigationEvent, PartitionKey, PresenceRecord, RendererEvent, Role,
};
use nearby::services::clock::SystemClock;
use nearby::services::counterpart_subscription_service::CounterpartSubscription;
use nearby::services::matching_session::MatchingSession;

const VIEWER: GeoPoint = GeoPoint {
    latitude: 37.7749,
    longitude: -122.4194,
};

fn north_of(origin: GeoPoint, km: f64) -> GeoPoint {
    GeoPoint::new(origin.latitude + km / 111.195, origin.longitude)
}

fn provider(user: &str, location: GeoPoint) -> PresenceRecord {
    PresenceRecord {
        user_id: user.to_string(),
        role: Role::Provider,
        destination_category: DestinationCategory::Town,
        location,
        updated_at: 1,
    }
}

async fn put(store: &MemoryPresenceStore, record: &PresenceRecord) {
    store.write(&record.path(), record).await.unwrap();
}

async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, mut pred: F)
where
    F: FnMut(&T) -> bool,
{
    timeout(Duration::from_secs(120), async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return;
            }
            rx.changed().await.expect("sender alive");
        }
    })
    .await
    .expect("condition reached in time");
}

fn ids(entities: &[Entity]) -> Vec<String> {
    let mut ids = entities.iter().map(|e| e.user_id.clone()).collect::<Vec<_>>();
    ids.sort();
    ids
}

fn providers_in_town() -> PartitionKey {
    PartitionKey::new(Role::Provider, DestinationCategory::Town)
}

#[tokio::test(start_paused = true)]
async fn subscription_follows_snapshot_and_deltas_without_the_viewer() {
    let store = MemoryPresenceStore::new();
    put(&store, &provider("p1", VIEWER)).await;
    put(&store, &provider("me", VIEWER)).await;

    let subscription = CounterpartSubscription::spawn(
        Arc::new(store.clone()),
        providers_in_town(),
        "me",
        SubscriptionConfig::default(),
        EventBus::default(),
    );
    let mut entities = subscription.entities();
    wait_for(&mut entities, |e| ids(e) == ["p1"]).await;

    put(&store, &provider("p2", VIEWER)).await;
    wait_for(&mut entities, |e| ids(e) == ["p1", "p2"]).await;

    store.remove(&provider("p1", VIEWER).path()).await.unwrap();
    wait_for(&mut entities, |e| ids(e) == ["p2"]).await;

    // Seekers live in another partition and never show up here.
    let mut seeker = provider("s1", VIEWER);
    seeker.role = Role::Seeker;
    put(&store, &seeker).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(ids(&subscription.current()), ["p2"]);
}

#[tokio::test(start_paused = true)]
async fn subscription_resubscribes_after_the_feed_breaks() {
    let store = MemoryPresenceStore::new();
    put(&store, &provider("p1", VIEWER)).await;

    let subscription = CounterpartSubscription::spawn(
        Arc::new(store.clone()),
        providers_in_town(),
        "me",
        SubscriptionConfig::default(),
        EventBus::default(),
    );
    let mut entities = subscription.entities();
    wait_for(&mut entities, |e| ids(e) == ["p1"]).await;

    store.drop_subscribers(StoreError::NetworkUnavailable);
    sleep(Duration::from_millis(10)).await;
    put(&store, &provider("p2", VIEWER)).await;

    wait_for(&mut entities, |e| ids(e) == ["p1", "p2"]).await;
    let subscribes = store
        .ops()
        .iter()
        .filter(|op| matches!(op, StoreOp::Subscribe(_)))
        .count();
    assert_eq!(subscribes, 2);
}

#[tokio::test(start_paused = true)]
async fn long_outage_flags_and_clears_staleness() {
    let store = MemoryPresenceStore::new();
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let subscription = CounterpartSubscription::spawn(
        Arc::new(store.clone()),
        providers_in_town(),
        "me",
        SubscriptionConfig::default(),
        events.clone(),
    );

    store.set_failure(Some(StoreError::NetworkUnavailable));
    store.drop_subscribers(StoreError::NetworkUnavailable);
    sleep(Duration::from_secs(30)).await;

    store.set_failure(None);
    put(&store, &provider("p1", VIEWER)).await;
    let mut entities = subscription.entities();
    wait_for(&mut entities, |e| ids(e) == ["p1"]).await;

    let mut stale = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RendererEvent::SubscriptionStale(flag) = event {
            stale.push(flag);
        }
    }
    assert_eq!(stale, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn paused_subscription_catches_up_on_resume() {
    let store = MemoryPresenceStore::new();
    let subscription = CounterpartSubscription::spawn(
        Arc::new(store.clone()),
        providers_in_town(),
        "me",
        SubscriptionConfig::default(),
        EventBus::default(),
    );
    sleep(Duration::from_millis(10)).await;

    subscription.pause();
    sleep(Duration::from_millis(10)).await;
    put(&store, &provider("p1", VIEWER)).await;
    sleep(Duration::from_secs(5)).await;
    assert!(subscription.current().is_empty());

    subscription.resume();
    let mut entities = subscription.entities();
    wait_for(&mut entities, |e| ids(e) == ["p1"]).await;
}

#[tokio::test(start_paused = true)]
async fn dropping_the_subscription_cancels_it() {
    let store = MemoryPresenceStore::new();
    let subscription = CounterpartSubscription::spawn(
        Arc::new(store.clone()),
        providers_in_town(),
        "me",
        SubscriptionConfig::default(),
        EventBus::default(),
    );
    let mut entities = subscription.entities();
    sleep(Duration::from_millis(10)).await;

    drop(subscription);
    let closed = timeout(Duration::from_secs(1), async {
        while entities.changed().await.is_ok() {}
    })
    .await;
    assert!(closed.is_ok());
}

fn session(store: &MemoryPresenceStore, user: &str) -> MatchingSession {
    MatchingSession::start(
        user,
        Arc::new(store.clone()),
        Arc::new(SystemClock),
        CoreConfig::default(),
        EventBus::default(),
    )
    .unwrap()
}

fn marker_ids(items: &[ClusterOrMarker]) -> Vec<String> {
    let mut ids = items
        .iter()
        .filter_map(|item| match item {
            ClusterOrMarker::Marker(entity) => Some(entity.user_id.clone()),
            ClusterOrMarker::Cluster { .. } => None,
        })
        .collect::<Vec<_>>();
    ids.sort();
    ids
}

#[tokio::test(start_paused = true)]
async fn seeker_sees_nearby_providers_only() {
    let store = MemoryPresenceStore::new();
    put(&store, &provider("near", north_of(VIEWER, 0.3))).await;
    put(&store, &provider("far", north_of(VIEWER, 12.0))).await;

    let seeker = session(&store, "seeker");
    seeker
        .enter_at(Role::Seeker, DestinationCategory::Town, VIEWER)
        .await
        .unwrap();
    assert_eq!(seeker.counterpart_partition(), Some(providers_in_town()));

    let mut results = seeker.results();
    wait_for(&mut results, |items| marker_ids(items) == ["near"]).await;

    seeker.radius_changed(20.0).unwrap();
    wait_for(&mut results, |items| marker_ids(items) == ["far", "near"]).await;
    assert!(seeker.radius_changed(0.0).is_err());
}

#[tokio::test(start_paused = true)]
async fn two_sessions_see_each_other() {
    let store = MemoryPresenceStore::new();
    let seeker = session(&store, "seeker");
    let provider_session = session(&store, "provider");

    seeker
        .enter_at(Role::Seeker, DestinationCategory::Town, VIEWER)
        .await
        .unwrap();
    provider_session
        .enter_at(Role::Provider, DestinationCategory::Town, north_of(VIEWER, 1.0))
        .await
        .unwrap();

    let mut seeker_view = seeker.results();
    wait_for(&mut seeker_view, |items| marker_ids(items) == ["provider"]).await;
    let mut provider_view = provider_session.results();
    wait_for(&mut provider_view, |items| marker_ids(items) == ["seeker"]).await;

    provider_session.navigate_away("home");
    wait_for(&mut seeker_view, |items| items.is_empty()).await;
    assert_eq!(provider_session.state(), LifecycleState::Removed);
    assert!(provider_session.counterpart_partition().is_none());
}

#[tokio::test(start_paused = true)]
async fn dense_counterparts_are_clustered() {
    let store = MemoryPresenceStore::new();
    for i in 0..40 {
        // Two tight groups of twenty, a couple of kilometres apart.
        let base = if i % 2 == 0 { 0.5 } else { 2.5 };
        let location = north_of(VIEWER, base + (i as f64) * 0.0005);
        put(&store, &provider(&format!("p{:02}", i), location)).await;
    }

    let seeker = session(&store, "seeker");
    seeker
        .enter_at(Role::Seeker, DestinationCategory::Town, VIEWER)
        .await
        .unwrap();

    let mut results = seeker.results();
    wait_for(&mut results, |items| {
        items.iter().map(ClusterOrMarker::weight).sum::<usize>() == 40
    })
    .await;
    let items = seeker.current_matches();
    assert!(items
        .iter()
        .any(|item| matches!(item, ClusterOrMarker::Cluster { .. })));
}

#[tokio::test(start_paused = true)]
async fn enter_without_a_fix_is_rejected() {
    let store = MemoryPresenceStore::new();
    let seeker = session(&store, "seeker");
    let err = seeker
        .enter(Role::Seeker, DestinationCategory::Town)
        .await
        .unwrap_err();
    assert_eq!(err, PresenceError::NoLocationFix);
    assert!(store.ops().is_empty());
}

#[tokio::test(start_paused = true)]
async fn drive_routes_source_events_until_termination() {
    let store = MemoryPresenceStore::new();
    let seeker = session(&store, "seeker");
    seeker.location_tick(VIEWER);

    let app = stream::iter(vec![AppLifecycleEvent::Background, AppLifecycleEvent::Foreground])
        .chain(stream::once(async {
            sleep(Duration::from_secs(5)).await;
            AppLifecycleEvent::Terminated
        }));
    let navigation = stream::iter(vec![NavigationEvent::EnteredMatchingContext {
        role: Role::Seeker,
        destination: DestinationCategory::Local,
    }]);
    let connectivity = stream::iter(vec![ConnectivityEvent::Lost, ConnectivityEvent::Restored]);

    seeker
        .drive(Box::pin(app), navigation, connectivity)
        .await;

    assert_eq!(seeker.state(), LifecycleState::Removed);
    assert!(store.is_empty());
    assert!(seeker.counterpart_partition().is_none());
}

#[tokio::test(start_paused = true)]
async fn grace_expiry_releases_the_subscription_and_results() {
    let store = MemoryPresenceStore::new();
    put(&store, &provider("near", north_of(VIEWER, 0.3))).await;

    let seeker = session(&store, "seeker");
    seeker
        .enter_at(Role::Seeker, DestinationCategory::Town, VIEWER)
        .await
        .unwrap();
    let mut results = seeker.results();
    wait_for(&mut results, |items| marker_ids(items) == ["near"]).await;

    seeker.connectivity_lost();
    sleep(Duration::from_secs(35)).await;

    assert_eq!(seeker.state(), LifecycleState::Removed);
    assert!(seeker.counterpart_partition().is_none());
    assert!(seeker.current_matches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn entering_while_backgrounded_keeps_the_feed_paused() {
    let store = MemoryPresenceStore::new();
    put(&store, &provider("near", north_of(VIEWER, 0.3))).await;

    let seeker = session(&store, "seeker");
    seeker.location_tick(VIEWER);
    seeker.app_background();
    seeker
        .enter(Role::Seeker, DestinationCategory::Town)
        .await
        .unwrap();
    assert_eq!(seeker.settled_state().await, LifecycleState::Maintained);

    sleep(Duration::from_secs(5)).await;
    assert!(seeker.current_matches().is_empty());

    seeker.navigate_away("home");
    assert_eq!(seeker.settled_state().await, LifecycleState::Maintained);
    assert!(seeker.counterpart_partition().is_some());

    seeker.app_foreground();
    let mut results = seeker.results();
    wait_for(&mut results, |items| marker_ids(items) == ["near"]).await;
}
