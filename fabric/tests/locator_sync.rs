mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use fabric::async_trait;
use fabric::gateway::Gateway;
use fabric::locator::ComponentConfig;
use fabric::locator::ConnectUpdate;
use fabric::locator::Locator;
use fabric::locator::LocatorConfig;
use fabric::registry::Registry;
use fabric::LocatorError;
use fixtures::info_for;
use fixtures::locator_addr;
use fixtures::recv_within;
use fixtures::serve;
use fixtures::GatewayEvent;
use fixtures::InvokeService;
use fixtures::LocatorService;
use fixtures::RecordingGateway;
use fixtures::Sink;
use maplit::btreemap;
use memstore::MemGroups;
use memstore::MemNetwork;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use serde_json::json;
use serde_json::Value;
use tokio::time::sleep;

fn static_cluster(nodes: Value) -> ComponentConfig {
    ComponentConfig::new("static", json!({ "nodes": nodes }))
}

/// Spawn a locator wired to a recording gateway and a static link to the
/// given peers.
async fn spawn_consumer(
    net: &Arc<MemNetwork>,
    groups: &Arc<MemGroups>,
    uuid: &str,
    nodes: Value,
) -> Result<(Locator, tokio::sync::mpsc::UnboundedReceiver<GatewayEvent>)> {
    let (gateway, events) = RecordingGateway::new();
    let mut registry = Registry::with_defaults();
    registry.register_gateway("recording", move |_| Ok(gateway.clone() as Arc<dyn Gateway>));
    let cfg = LocatorConfig::new("locator")
        .uuid(uuid)
        .gateway(ComponentConfig::new("recording", json!({})))
        .cluster(static_cluster(nodes));
    let locator = Locator::spawn(cfg, &registry, net.clone(), groups.clone()).await?;
    Ok((locator, events))
}

/// Node-to-node synchronization: the snapshot arrives on connect, service
/// removal propagates as an empty-endpoints announce, and shutdown tears
/// the link down.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_synchronization_flows_to_the_gateway() -> Result<()> {
    fixtures::init_tracing();

    let net = MemNetwork::new();
    let groups = Arc::new(MemGroups::new());
    let registry = Registry::with_defaults();

    let producer_cfg = LocatorConfig::new("locator")
        .uuid("u2")
        .gateway(ComponentConfig::new("round-robin", json!({})))
        .cluster(static_cluster(json!({})));
    let producer = Locator::spawn(
        producer_cfg,
        &registry,
        net.clone(),
        groups.clone(),
    )
    .await?;
    serve(net.bind(locator_addr(2)), Arc::new(LocatorService(producer.clone())));
    producer.expose("echo", info_for(4000));

    let (consumer, mut events) =
        spawn_consumer(&net, &groups, "u1", json!({ "u2": [locator_addr(2)] })).await?;

    // The current snapshot is the first thing on the stream.
    assert_eq!(
        recv_within(&mut events, Duration::from_secs(2)).await,
        Some(GatewayEvent::Consume {
            uuid: "u2".into(),
            name: "echo".into()
        })
    );
    assert_eq!(consumer.resolve("echo", "").await?, info_for(4000));
    assert_eq!(
        consumer.cluster().await?,
        btreemap! { "u2".to_string() => locator_addr(2) }
    );

    // Deactivation is announced with no endpoints and cleans the gateway.
    producer.retract("echo");
    assert_eq!(
        recv_within(&mut events, Duration::from_secs(2)).await,
        Some(GatewayEvent::Cleanup {
            uuid: "u2".into(),
            name: "echo".into()
        })
    );
    assert_eq!(consumer.resolve("echo", "").await, Err(LocatorError::ServiceNotAvailable));

    // Shutdown closes every stream; the consumer drops the dead link.
    producer.shutdown().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if consumer.cluster().await?.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("link to the stopped node was never dropped"));
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// Restricted names are never written to peers but still resolve locally.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restricted_services_are_not_announced() -> Result<()> {
    fixtures::init_tracing();

    let net = MemNetwork::new();
    let groups = Arc::new(MemGroups::new());
    let registry = Registry::with_defaults();

    let producer_cfg = LocatorConfig::new("locator")
        .uuid("u2")
        .restrict("hidden")
        .gateway(ComponentConfig::new("round-robin", json!({})))
        .cluster(static_cluster(json!({})));
    let producer = Locator::spawn(
        producer_cfg,
        &registry,
        net.clone(),
        groups.clone(),
    )
    .await?;
    serve(net.bind(locator_addr(3)), Arc::new(LocatorService(producer.clone())));

    let (_consumer, mut events) =
        spawn_consumer(&net, &groups, "u1", json!({ "u2": [locator_addr(3)] })).await?;

    producer.expose("hidden", info_for(5000));
    producer.expose("public", info_for(5001));

    assert_eq!(
        recv_within(&mut events, Duration::from_secs(2)).await,
        Some(GatewayEvent::Consume {
            uuid: "u2".into(),
            name: "public".into()
        })
    );
    assert!(recv_within(&mut events, Duration::from_millis(300)).await.is_none());

    // The restricted service still resolves on the owning node.
    assert_eq!(producer.resolve("hidden", "").await?, info_for(5000));
    Ok(())
}

/// A peer announcing under the wrong uuid is dropped without further
/// consumption.
struct ImposterLocator;

#[async_trait]
impl InvokeService for ImposterLocator {
    async fn invoke(&self, event: String, _args: Value, sink: Sink) {
        if event == "connect" {
            sink.chunk(&ConnectUpdate {
                uuid: "imposter".into(),
                services: btreemap! { "echo".to_string() => info_for(4000) },
            });
            // The stream stays open; dropping us is the consumer's call.
        } else {
            sink.error(0, format!("unexpected event: {}", event));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_announce_drops_the_node() -> Result<()> {
    fixtures::init_tracing();

    let net = MemNetwork::new();
    let groups = Arc::new(MemGroups::new());
    serve(net.bind(locator_addr(9)), Arc::new(ImposterLocator));

    let (consumer, mut events) =
        spawn_consumer(&net, &groups, "u1", json!({ "u9": [locator_addr(9)] })).await?;

    // Nothing reaches the gateway and the link goes away.
    assert!(recv_within(&mut events, Duration::from_millis(500)).await.is_none());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if consumer.cluster().await?.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("mismatched node was never dropped"));
        }
        sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// A second `connect` under the same uuid replaces the first stream.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_replaces_the_stale_stream() -> Result<()> {
    fixtures::init_tracing();

    let net = MemNetwork::new();
    let groups = Arc::new(MemGroups::new());
    let registry = Registry::with_defaults();
    let cfg = LocatorConfig::new("locator").uuid("u2").cluster(static_cluster(json!({})));
    let locator = Locator::spawn(cfg, &registry, net.clone(), groups).await?;

    let mut first = locator.connect("peer").await?;
    let mut second = locator.connect("peer").await?;

    // The replaced stream is closed.
    assert!(first.recv().await.is_none());

    locator.expose("echo", info_for(4000));
    let update = second.recv().await.expect("the live stream must see the update");
    assert_eq!(update.uuid, "u2");
    assert!(update.services.contains_key("echo"));
    Ok(())
}

/// Without a cluster there is nothing to synchronize; `connect` closes
/// right away.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_without_a_cluster_closes_immediately() -> Result<()> {
    fixtures::init_tracing();

    let net = MemNetwork::new();
    let groups = Arc::new(MemGroups::new());
    let registry = Registry::with_defaults();
    let locator = Locator::spawn(
        LocatorConfig::new("locator"),
        &registry,
        net.clone(),
        groups,
    )
    .await?;

    let mut stream = locator.connect("peer").await?;
    assert!(stream.recv().await.is_none());
    Ok(())
}
