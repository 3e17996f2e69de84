//! End-to-end demo with in-memory collaborators
//!
//! Run with: cargo run --example relay_demo
//!
//! Two clients cache the same order projection. Appending to the order's
//! brook pushes a `ProjectionUpdated` to both, and each cache re-fetches.
//! Set `RUST_LOG=brookcast=trace` to see dropped stale positions.

use std::sync::Arc;
use std::time::Duration;

use brookcast::brook::{BrookKey, MemoryBrookStreams};
use brookcast::broadcast::MemoryHub;
use brookcast::cache::{ChangeListener, MemoryFetcher, ProjectionChanged};
use brookcast::hub::NotificationPump;
use brookcast::multiplexer::MultiplexerDeps;
use brookcast::projection::StaticProjectionRegistry;
use brookcast::{
    CacheConfig, ConnectionId, LocalHubClient, MultiplexerConfig, MultiplexerHost,
    ProjectionCache, ProjectionHub,
};

#[derive(Debug, Clone)]
struct OrderView {
    status: String,
    lines: u32,
}

fn printer(client: &'static str) -> ChangeListener<OrderView> {
    Arc::new(move |changed: &ProjectionChanged<OrderView>| {
        match &changed.value {
            Some(order) => println!(
                "[{}] {} at version {:?}: status={} lines={}",
                client, changed.key, changed.version, order.status, order.lines
            ),
            None => println!("[{}] {} has no data yet", client, changed.key),
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("brookcast=info".parse()?)
                .add_directive("relay_demo=debug".parse()?),
        )
        .init();

    // Server side
    let streams = MemoryBrookStreams::new();
    let transport = Arc::new(MemoryHub::new());
    let deps = MultiplexerDeps {
        registry: Arc::new(StaticProjectionRegistry::new().with("OrderView", "orders")),
        reader: Arc::new(streams.clone()),
        streams: Arc::new(streams.clone()),
        broadcast: transport.clone(),
    };
    let host = Arc::new(MultiplexerHost::with_config(
        deps,
        MultiplexerConfig::default().idle_timeout(Duration::from_secs(60)),
    ));
    let cleanup = host.spawn_cleanup_task();
    let hub = Arc::new(ProjectionHub::new(host.clone(), transport.clone()));

    // Projection data both clients read
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.put(
        "OrderView",
        "o-1",
        OrderView {
            status: "open".into(),
            lines: 1,
        },
    );

    // Two clients, each with its own connection, cache and pump
    let mut caches = Vec::new();
    let mut subscriptions = Vec::new();
    for name in ["alice", "bob"] {
        let conn = ConnectionId::new(name);
        let inbox = transport.connect(&conn);
        let client = Arc::new(LocalHubClient::new(hub.clone(), conn));
        let cache: Arc<ProjectionCache<OrderView>> = Arc::new(ProjectionCache::with_config(
            fetcher.clone(),
            client,
            CacheConfig::default().capacity(16),
        ));
        NotificationPump::spawn(inbox, cache.clone());

        subscriptions.push(cache.subscribe("OrderView", "o-1", printer(name)).await?);
        caches.push(cache);
    }

    // The order changes twice; a redelivered position is dropped
    let key = BrookKey::new("orders", "o-1");
    fetcher.put(
        "OrderView",
        "o-1",
        OrderView {
            status: "paid".into(),
            lines: 2,
        },
    );
    let position = streams.append(&key);
    streams.deliver(&key, position);

    tokio::time::sleep(Duration::from_millis(100)).await;

    for cache in &caches {
        println!("Cache stats: {:?}", cache.stats());
    }
    for conn in ["alice", "bob"] {
        if let Some(mux) = host.get(&ConnectionId::new(conn)).await {
            println!("Multiplexer stats: {:?}", mux.stats().await?);
        }
    }

    drop(subscriptions);
    for cache in &caches {
        cache.dispose().await;
    }
    for conn in ["alice", "bob"] {
        hub.on_disconnected(&ConnectionId::new(conn)).await;
    }
    cleanup.abort();

    Ok(())
}
