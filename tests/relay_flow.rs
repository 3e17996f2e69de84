//! End-to-end flow: brook append → multiplexer → hub group → client cache

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use brookcast::brook::{BrookKey, MemoryBrookStreams, Position};
use brookcast::broadcast::MemoryHub;
use brookcast::cache::{ChangeListener, MemoryFetcher, ProjectionChanged};
use brookcast::hub::NotificationPump;
use brookcast::multiplexer::MultiplexerDeps;
use brookcast::projection::StaticProjectionRegistry;
use brookcast::{ConnectionId, LocalHubClient, MultiplexerHost, ProjectionCache, ProjectionHub};

struct Server {
    streams: MemoryBrookStreams,
    transport: Arc<MemoryHub>,
    hub: Arc<ProjectionHub>,
}

fn server() -> Server {
    let streams = MemoryBrookStreams::new();
    let transport = Arc::new(MemoryHub::new());
    let deps = MultiplexerDeps {
        registry: Arc::new(
            StaticProjectionRegistry::new()
                .with("OrderView", "orders")
                .with("OrderSummary", "orders"),
        ),
        reader: Arc::new(streams.clone()),
        streams: Arc::new(streams.clone()),
        broadcast: transport.clone(),
    };
    let host = Arc::new(MultiplexerHost::new(deps));
    let hub = Arc::new(ProjectionHub::new(host, transport.clone()));
    Server {
        streams,
        transport,
        hub,
    }
}

struct Client {
    cache: Arc<ProjectionCache<u32>>,
    changes: mpsc::UnboundedReceiver<Option<u32>>,
    listener: ChangeListener<u32>,
}

fn client(server: &Server, fetcher: &Arc<MemoryFetcher<u32>>, name: &str) -> Client {
    let conn = ConnectionId::new(name);
    let inbox = server.transport.connect(&conn);
    let hub_client = Arc::new(LocalHubClient::new(server.hub.clone(), conn));
    let cache: Arc<ProjectionCache<u32>> =
        Arc::new(ProjectionCache::new(fetcher.clone(), hub_client));
    NotificationPump::spawn(inbox, cache.clone());

    let (tx, changes) = mpsc::unbounded_channel();
    let listener: ChangeListener<u32> = Arc::new(move |changed: &ProjectionChanged<u32>| {
        let _ = tx.send(changed.value);
    });

    Client {
        cache,
        changes,
        listener,
    }
}

async fn next_change(client: &mut Client) -> Option<u32> {
    tokio::time::timeout(Duration::from_secs(1), client.changes.recv())
        .await
        .expect("change not delivered")
        .expect("listener dropped")
}

#[tokio::test]
async fn test_update_reaches_every_client_once_per_version() {
    let server = server();
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.put("OrderView", "o-1", 1);

    let mut alice = client(&server, &fetcher, "alice");
    let mut bob = client(&server, &fetcher, "bob");

    let _a = alice
        .cache
        .subscribe("OrderView", "o-1", alice.listener.clone())
        .await
        .unwrap();
    let _b = bob
        .cache
        .subscribe("OrderView", "o-1", bob.listener.clone())
        .await
        .unwrap();
    assert_eq!(next_change(&mut alice).await, Some(1));
    assert_eq!(next_change(&mut bob).await, Some(1));

    fetcher.put("OrderView", "o-1", 2);
    let key = BrookKey::new("orders", "o-1");
    let position = server.streams.append(&key);
    assert_eq!(position, Position::new(0));

    assert_eq!(next_change(&mut alice).await, Some(2));
    assert_eq!(next_change(&mut bob).await, Some(2));

    // Both multiplexers broadcast to the shared group, but each cache
    // re-fetches only once per version
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice.changes.try_recv().is_err());
    assert!(bob.changes.try_recv().is_err());
}

#[tokio::test]
async fn test_one_stream_per_brook_per_connection() {
    let server = server();
    let conn = ConnectionId::new("c1");
    let _inbox = server.transport.connect(&conn);
    let key = BrookKey::new("orders", "o-1");

    let first = server.hub.subscribe(&conn, "OrderView", "o-1").await.unwrap();
    let second = server.hub.subscribe(&conn, "OrderSummary", "o-1").await.unwrap();
    assert_eq!(server.streams.open_subscriptions(&key), 1);

    server.hub.unsubscribe(&conn, &first).await.unwrap();
    assert_eq!(server.streams.open_subscriptions(&key), 1);

    server.hub.unsubscribe(&conn, &second).await.unwrap();
    assert_eq!(server.streams.open_subscriptions(&key), 0);
}

#[tokio::test]
async fn test_stale_positions_produce_no_broadcasts() {
    let server = server();
    let conn = ConnectionId::new("c1");
    let mut inbox = server.transport.connect(&conn);
    let key = BrookKey::new("orders", "o-1");
    server.streams.set_position(&key, Position::new(0));

    server.hub.subscribe(&conn, "OrderView", "o-1").await.unwrap();
    for position in [0, 1, 1, 0, 2] {
        server.streams.deliver(&key, Position::new(position));
    }

    let mut versions = Vec::new();
    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        versions.push(message.args[2].as_u64().unwrap());
    }
    assert_eq!(versions, vec![1, 2]);

    let mux = server.hub.multiplexer(&conn).await.unwrap();
    assert_eq!(mux.stats().await.unwrap().stale_positions_dropped, 3);
    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_resubscribes() {
    let server = server();
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.put("OrderView", "o-1", 1);
    let mut alice = client(&server, &fetcher, "alice");

    let _sub = alice
        .cache
        .subscribe("OrderView", "o-1", alice.listener.clone())
        .await
        .unwrap();
    assert_eq!(next_change(&mut alice).await, Some(1));

    // Transport drops: the server forgets the connection
    let conn = ConnectionId::new("alice");
    server.hub.on_disconnected(&conn).await;
    assert!(server.hub.get_subscriptions(&conn).await.unwrap().is_empty());

    // Reconnect with a fresh inbox
    let inbox = server.transport.connect(&conn);
    NotificationPump::spawn(inbox, alice.cache.clone());
    fetcher.put("OrderView", "o-1", 5);
    let succeeded = alice.cache.resubscribe_all(&CancellationToken::new()).await;

    assert_eq!(succeeded, 1);
    assert_eq!(server.hub.get_subscriptions(&conn).await.unwrap().len(), 1);
    assert_eq!(next_change(&mut alice).await, Some(5));

    fetcher.put("OrderView", "o-1", 6);
    server.streams.append(&BrookKey::new("orders", "o-1"));
    assert_eq!(next_change(&mut alice).await, Some(6));
}

#[tokio::test]
async fn test_cache_dispose_releases_server_subscriptions() {
    let server = server();
    let fetcher = Arc::new(MemoryFetcher::new());
    let alice = client(&server, &fetcher, "alice");
    let conn = ConnectionId::new("alice");

    let sub = alice
        .cache
        .subscribe("OrderView", "o-1", alice.listener.clone())
        .await
        .unwrap();
    assert_eq!(server.hub.get_subscriptions(&conn).await.unwrap().len(), 1);

    drop(sub);
    alice.cache.dispose().await;

    assert!(server.hub.get_subscriptions(&conn).await.unwrap().is_empty());
    assert!(server.transport.members("projection:OrderView:o-1").is_empty());
}
