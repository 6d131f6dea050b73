mod common;

use std::time::Duration;

use mpdhub::watcher::{Event, Watcher};
use tokio::sync::mpsc;

use common::MockServer;

async fn next(events: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event in time")
        .expect("event queue closed")
}

#[tokio::test]
async fn forwards_changes() {
    let server = MockServer::start().await;
    let mut config = server.config();
    config.subsystems = vec!["player".to_owned(), "mixer".to_owned()];

    let (watcher, mut events) = Watcher::connect(&config).await.unwrap();
    server.wait_for("idle \"player\" \"mixer\"").await;

    server.change("player");
    assert_eq!(next(&mut events).await, Event::Changed("player".to_owned()));

    server.change("mixer");
    assert_eq!(next(&mut events).await, Event::Changed("mixer".to_owned()));

    watcher.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn close_interrupts_idle_with_noidle() {
    let server = MockServer::start().await;
    let (watcher, mut events) = Watcher::connect(&server.config()).await.unwrap();
    server.wait_for("idle").await;

    watcher.close(Duration::from_secs(1)).await.unwrap();
    server.wait_for("close").await;

    let received = server.received();
    let noidle = received.iter().position(|line| line == "noidle").unwrap();
    let close = received.iter().position(|line| line == "close").unwrap();
    assert!(noidle < close);

    // The loop is gone, so the queue is closed.
    assert_eq!(events.recv().await, None);
}

#[tokio::test]
async fn announces_reconnection() {
    let server = MockServer::start().await;
    let (watcher, mut events) = Watcher::connect(&server.config()).await.unwrap();
    server.wait_for("idle").await;

    server.disconnect_idle();
    let first = next(&mut events).await;
    assert_eq!(first, Event::Reconnecting);
    assert_eq!(next(&mut events).await, Event::Reconnect);
    assert!(server.connections() >= 2);

    watcher.close(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn full_queue_drops_events_without_blocking() {
    let server = MockServer::start().await;
    let mut config = server.config();
    config.watch_queue = 1;

    let (watcher, mut events) = Watcher::connect(&config).await.unwrap();
    server.wait_for("idle").await;

    server.change("player");
    // Wait until the watcher idles again, so the first event was queued.
    common::eventually(|| {
        server
            .received()
            .iter()
            .filter(|line| line.starts_with("idle"))
            .count()
            >= 2
    })
    .await;
    server.change("mixer");
    common::eventually(|| {
        server
            .received()
            .iter()
            .filter(|line| line.starts_with("idle"))
            .count()
            >= 3
    })
    .await;

    assert_eq!(next(&mut events).await, Event::Changed("player".to_owned()));
    assert!(events.try_recv().is_err());

    watcher.close(Duration::from_secs(1)).await.unwrap();
}
