//! Integration Tests: federation discovery over an in-process relay
//!
//! These tests verify:
//! 1. Advertisements resolve into federation entries, deduplicated by id
//! 2. Incomplete advertisements are ignored
//! 3. The discovery window closes on its own and stop is idempotent
//! 4. Restarting clears previous results

use haze_nwc::mock::MockPreviewer;
use haze_nwc::nostr::kinds;
use haze_nwc::{DiscoveredFederation, DiscoveryEngine, MemoryRelay, MemoryStore, NwcConfig, NwcSession, RelayTransport};
use nostr::{Event, Keys, Kind, Tag, Timestamp, UnsignedEvent};
use std::sync::Arc;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(30);
const WAIT: Duration = Duration::from_secs(5);

fn advert(tags: &[(&str, &str)]) -> Event {
    let keys = Keys::generate();
    let tags: Vec<Tag> = tags.iter().map(|(k, v)| Tag::parse(&[*k, *v]).unwrap()).collect();
    UnsignedEvent::new(
        keys.public_key(),
        Timestamp::now(),
        Kind::from(kinds::FEDERATION_ANNOUNCEMENT),
        tags,
        "",
    )
    .sign_with_keys(&keys)
    .unwrap()
}

async fn wait_for_count(engine: &DiscoveryEngine, count: usize) -> Vec<DiscoveredFederation> {
    let mut rx = engine.subscribe();
    let found = tokio::time::timeout(WAIT, rx.wait_for(|list| list.len() >= count))
        .await
        .expect("results in time")
        .expect("engine alive")
        .clone();
    found
}

fn setup() -> (Arc<MemoryRelay>, Arc<MockPreviewer>, DiscoveryEngine) {
    let relay = Arc::new(MemoryRelay::default());
    let previewer = Arc::new(MockPreviewer::new());
    let engine = DiscoveryEngine::new(relay.clone(), previewer.clone(), WINDOW);
    (relay, previewer, engine)
}

/// Test: stored and live advertisements both resolve
#[tokio::test]
async fn discovers_stored_and_live_adverts() {
    let (relay, previewer, engine) = setup();
    previewer.add("fed11stored", "f-stored", "Stored Fed", 4);
    previewer.add("fed11live", "f-live", "Live Fed", 1);

    relay.publish(&advert(&[("d", "f-stored"), ("u", "fed11stored")])).await.unwrap();
    engine.start().await.unwrap();
    assert!(engine.is_discovering());

    relay.publish(&advert(&[("d", "f-live"), ("u", "fed11live")])).await.unwrap();
    let found = wait_for_count(&engine, 2).await;

    let stored = found.iter().find(|f| f.federation_id == "f-stored").expect("stored fed");
    assert_eq!(stored.fed_name, "Stored Fed");
    assert_eq!(stored.total_guardians, 4);
    assert_eq!(stored.invite_code, "fed11stored");
    assert_eq!(stored.on_chain_deposit, Some(true));
    assert_eq!(stored.max_balance, Some(100_000_000));
    assert!(found.iter().any(|f| f.federation_id == "f-live"));
    engine.stop().await;
}

/// Test: the same federation advertised twice is previewed and listed once
#[tokio::test]
async fn duplicate_federation_resolves_once() {
    let (relay, previewer, engine) = setup();
    previewer.add("fed11first", "F1", "Fed One", 3);
    previewer.add("fed11second", "F1", "Fed One", 3);
    previewer.set_delay(Duration::from_millis(200));

    relay.publish(&advert(&[("d", "F1"), ("u", "fed11first")])).await.unwrap();
    relay.publish(&advert(&[("d", "F1"), ("u", "fed11second")])).await.unwrap();
    engine.start().await.unwrap();

    wait_for_count(&engine, 1).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(engine.results().len(), 1);
    assert_eq!(previewer.calls(), 1);
    engine.stop().await;
}

/// Test: adverts missing the invite code or federation id are skipped
#[tokio::test]
async fn incomplete_adverts_are_ignored() {
    let (relay, previewer, engine) = setup();
    previewer.add("fed11ok", "f-ok", "Ok Fed", 2);

    relay.publish(&advert(&[("d", "f-no-invite")])).await.unwrap();
    relay.publish(&advert(&[("u", "fed11orphan")])).await.unwrap();
    relay.publish(&advert(&[("d", "f-unknown"), ("u", "fed11unknown")])).await.unwrap();
    relay.publish(&advert(&[("d", "f-ok"), ("u", "fed11ok")])).await.unwrap();
    engine.start().await.unwrap();

    let found = wait_for_count(&engine, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(found[0].federation_id, "f-ok");
    assert_eq!(engine.results().len(), 1);
    // Only complete adverts reach the previewer; the unknown invite fails there
    assert_eq!(previewer.calls(), 2);
    engine.stop().await;
}

/// Test: the window closes by itself, releasing the subscription and keeping results
#[tokio::test(start_paused = true)]
async fn discovery_window_closes() {
    let (relay, previewer, engine) = setup();
    previewer.add("fed11a", "fa", "Fed A", 1);
    relay.publish(&advert(&[("d", "fa"), ("u", "fed11a")])).await.unwrap();

    engine.start().await.unwrap();
    wait_for_count(&engine, 1).await;
    assert_eq!(relay.subscription_count(), 1);

    let mut discovering = engine.watch_discovering();
    tokio::time::timeout(WINDOW * 2, discovering.wait_for(|d| !*d))
        .await
        .expect("window closed")
        .expect("engine alive");

    assert!(!engine.is_discovering());
    assert_eq!(relay.subscription_count(), 0);
    assert_eq!(engine.results().len(), 1);
}

/// Test: stop may be called repeatedly, with or without a session
#[tokio::test]
async fn stop_is_idempotent() {
    let (relay, _previewer, engine) = setup();
    engine.stop().await;

    engine.start().await.unwrap();
    assert_eq!(relay.subscription_count(), 1);
    engine.stop().await;
    engine.stop().await;

    assert!(!engine.is_discovering());
    assert_eq!(relay.subscription_count(), 0);
}

/// Test: a new session clears results and holds a single subscription
#[tokio::test]
async fn restart_clears_results() {
    let (relay, previewer, engine) = setup();
    previewer.add("fed11a", "fa", "Fed A", 1);
    relay.publish(&advert(&[("d", "fa"), ("u", "fed11a")])).await.unwrap();

    engine.start().await.unwrap();
    wait_for_count(&engine, 1).await;

    previewer.set_delay(Duration::from_millis(100));
    engine.start().await.unwrap();
    assert!(engine.results().is_empty());
    assert_eq!(relay.subscription_count(), 1);

    let found = wait_for_count(&engine, 1).await;
    assert_eq!(found[0].federation_id, "fa");
    engine.stop().await;
}

/// Test: the session exposes discovery to the host
#[tokio::test]
async fn session_discovery() {
    let relay = Arc::new(MemoryRelay::default());
    let previewer = Arc::new(MockPreviewer::new());
    previewer.add("fed11s", "fs", "Session Fed", 2);
    relay.publish(&advert(&[("d", "fs"), ("u", "fed11s")])).await.unwrap();

    let session = NwcSession::new(NwcConfig::default(), relay.clone(), Arc::new(MemoryStore::new()), previewer);
    let mut updates = session.discovered();
    session.discover().await.unwrap();
    assert!(session.is_discovering());

    tokio::time::timeout(WAIT, updates.wait_for(|list| !list.is_empty()))
        .await
        .expect("results in time")
        .expect("engine alive");
    assert_eq!(session.discovered_federations()[0].fed_name, "Session Fed");

    session.stop_discovery().await;
    session.stop_discovery().await;
    assert!(!session.is_discovering());
    assert_eq!(relay.subscription_count(), 0);
}
