//! End-to-end tests: two engines sharing one in-memory DHT, exchanging blobs
//! over real localhost TCP.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use strand_engine::{Engine, EngineConfig, EngineEvent, MemoryDht};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn test_config(dir: PathBuf) -> EngineConfig {
    EngineConfig {
        data_dir: dir,
        poll_interval_secs: 1,
        ..EngineConfig::default()
    }
}

fn test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Wait until `pred` matches an event, or panic after `secs`.
async fn wait_for<F>(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    secs: u64,
    mut pred: F,
) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for engine event");
        let event = tokio::time::timeout(remaining, events.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("engine event channel closed");
        tracing::info!(?event, "observed engine event");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn publish_subscribe_download_roundtrip() {
    init_test_tracing();
    let dht = Arc::new(MemoryDht::new());
    let publisher_dir = TempDir::new().unwrap();
    let subscriber_dir = TempDir::new().unwrap();

    let (publisher, _publisher_events) = Engine::start(
        test_config(publisher_dir.path().join("data")),
        dht.clone(),
    )
    .await
    .unwrap();

    // Author a 2.5 MiB file: three chunks.
    let data = test_data(2 * 1024 * 1024 + 512 * 1024);
    let input = publisher_dir.path().join("album.bin");
    tokio::fs::write(&input, &data).await.unwrap();

    let key = publisher.generate_key().unwrap();
    let ingested = publisher.ingest(&input).await.unwrap();
    assert_eq!(ingested.blob_count, 3);
    let report = publisher
        .publish(vec![ingested.file_entry.clone()], &key.secret_key, Some(1))
        .await
        .unwrap();
    assert_eq!(report.status, "published");
    assert_eq!(report.sequence, 1);

    // Follow the author from a second node.
    let (subscriber, mut events) = Engine::start(
        test_config(subscriber_dir.path().join("data")),
        dht.clone(),
    )
    .await
    .unwrap();
    subscriber
        .subscribe(&key.public_key, Some("album feed".into()))
        .unwrap();

    wait_for(&mut events, 30, |e| {
        matches!(e, EngineEvent::SubscriptionUpdated { seq: 1, .. })
    })
    .await;

    let complete = wait_for(&mut events, 60, |e| {
        matches!(e, EngineEvent::FileComplete { .. })
    })
    .await;
    let EngineEvent::FileComplete { name, path } = complete else {
        unreachable!();
    };
    assert_eq!(name, "album.bin");
    let downloaded = tokio::fs::read(&path).await.unwrap();
    assert_eq!(downloaded, data);

    // The subscriber now holds (and can serve) all three blobs.
    let status = subscriber.status().unwrap();
    assert_eq!(status.blob_store.blobs, 3);
    assert_eq!(subscriber.subscriptions()[0].last_sequence, 1);
    assert_eq!(subscriber.subscriptions()[0].status, "active");
}

#[tokio::test]
async fn revisions_flow_to_subscriber_in_order() {
    init_test_tracing();
    let dht = Arc::new(MemoryDht::new());
    let publisher_dir = TempDir::new().unwrap();
    let subscriber_dir = TempDir::new().unwrap();

    let (publisher, _publisher_events) = Engine::start(
        test_config(publisher_dir.path().join("data")),
        dht.clone(),
    )
    .await
    .unwrap();
    let key = publisher.generate_key().unwrap();

    let first_data = test_data(64 * 1024);
    let first = publisher_dir.path().join("first.txt");
    tokio::fs::write(&first, &first_data).await.unwrap();
    let first_entry = publisher.ingest(&first).await.unwrap().file_entry;
    publisher
        .publish(vec![first_entry.clone()], &key.secret_key, Some(1))
        .await
        .unwrap();

    let (subscriber, mut events) = Engine::start(
        test_config(subscriber_dir.path().join("data")),
        dht.clone(),
    )
    .await
    .unwrap();
    subscriber.subscribe(&key.public_key, None).unwrap();

    wait_for(&mut events, 60, |e| {
        matches!(e, EngineEvent::FileComplete { name, .. } if name == "first.txt")
    })
    .await;

    // Second revision adds a file; the subscriber picks it up by polling.
    let second_data = test_data(96 * 1024);
    let second = publisher_dir.path().join("second.txt");
    tokio::fs::write(&second, &second_data).await.unwrap();
    let second_entry = publisher.ingest(&second).await.unwrap().file_entry;
    publisher
        .publish(
            vec![first_entry, second_entry],
            &key.secret_key,
            Some(2),
        )
        .await
        .unwrap();

    wait_for(&mut events, 30, |e| {
        matches!(e, EngineEvent::SubscriptionUpdated { seq: 2, .. })
    })
    .await;
    let complete = wait_for(&mut events, 60, |e| {
        matches!(e, EngineEvent::FileComplete { name, .. } if name == "second.txt")
    })
    .await;
    let EngineEvent::FileComplete { path, .. } = complete else {
        unreachable!();
    };
    assert_eq!(tokio::fs::read(&path).await.unwrap(), second_data);
    assert_eq!(subscriber.subscriptions()[0].last_sequence, 2);
}

#[tokio::test]
async fn stale_publish_never_reaches_subscriber() {
    init_test_tracing();
    let dht = Arc::new(MemoryDht::new());
    let publisher_dir = TempDir::new().unwrap();
    let subscriber_dir = TempDir::new().unwrap();

    let (publisher, _publisher_events) = Engine::start(
        test_config(publisher_dir.path().join("data")),
        dht.clone(),
    )
    .await
    .unwrap();
    let key = publisher.generate_key().unwrap();

    let input = publisher_dir.path().join("doc.txt");
    tokio::fs::write(&input, test_data(10_000)).await.unwrap();
    let entry = publisher.ingest(&input).await.unwrap().file_entry;

    // Publishing out of order succeeds at the adapter both times.
    publisher
        .publish(vec![entry.clone()], &key.secret_key, Some(10))
        .await
        .unwrap();
    publisher
        .publish(vec![entry], &key.secret_key, Some(9))
        .await
        .unwrap();

    let (subscriber, mut events) = Engine::start(
        test_config(subscriber_dir.path().join("data")),
        dht,
    )
    .await
    .unwrap();
    subscriber.subscribe(&key.public_key, None).unwrap();

    wait_for(&mut events, 30, |e| {
        matches!(e, EngineEvent::SubscriptionUpdated { seq: 10, .. })
    })
    .await;

    // Give a few poll cycles a chance to surface the stale revision.
    tokio::time::sleep(Duration::from_secs(3)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, EngineEvent::SubscriptionUpdated { seq, .. } if seq != 10),
            "subscriber must only ever hold seq 10"
        );
    }
    assert_eq!(subscriber.subscriptions()[0].last_sequence, 10);
}

#[tokio::test]
async fn gateway_relays_presigned_manifest() {
    init_test_tracing();
    let dht = Arc::new(MemoryDht::new());
    let gateway_dir = TempDir::new().unwrap();
    let subscriber_dir = TempDir::new().unwrap();

    let (gateway, _gateway_events) = Engine::start(
        test_config(gateway_dir.path().join("data")),
        dht.clone(),
    )
    .await
    .unwrap();

    // An external author signs a manifest and relays it through the gateway's
    // wire interface; the gateway never sees the private key.
    let author = strand_engine::keys::generate();
    let signed = strand_protocol::manifest::SignedManifest::sign(
        &author,
        strand_protocol::manifest::Manifest {
            public_key: [0; 32],
            seq: 4,
            files: vec![],
        },
    );

    let mut conn = strand_net::connect(gateway.listen_addr()).await.unwrap();
    conn.send(&strand_protocol::wire::Message::Publish {
        manifest: signed.as_bytes().to_vec(),
    })
    .await
    .unwrap();
    match conn.recv().await.unwrap() {
        strand_protocol::wire::Message::Ok { .. } => {}
        other => panic!("gateway refused relay: {other:?}"),
    }

    // A subscriber on the same DHT sees the relayed revision.
    let (subscriber, mut events) = Engine::start(
        test_config(subscriber_dir.path().join("data")),
        dht,
    )
    .await
    .unwrap();
    subscriber
        .subscribe(&strand_engine::keys::public_hex(&author), None)
        .unwrap();

    wait_for(&mut events, 30, |e| {
        matches!(e, EngineEvent::SubscriptionUpdated { seq: 4, .. })
    })
    .await;
}
