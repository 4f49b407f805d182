//! Façade lifecycle: startup preconditions, inventory, propose validation,
//! await semantics, and graceful teardown.

use std::time::Duration;
use trisum_core::{ComputationId, ComputationRecord, NodeId, StoreConfig};
use trisum_network::{Network, NetworkError};
use trisum_store::{RegistryStore, StoreError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn more_than_three_coordinators_is_rejected() {
    init_tracing();
    let err = Network::start(4, 0).await.unwrap_err();
    assert!(matches!(err, NetworkError::PreconditionFailed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn propose_requires_three_coordinators() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::start(2, 1).await?;
    let err = network
        .propose_computation("under-provisioned", 5, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::PreconditionFailed(_)));
    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn propose_validates_its_arguments() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::start(3, 0).await?;

    let err = network.propose_computation("no time", 0, 1).await.unwrap_err();
    assert!(matches!(err, NetworkError::PreconditionFailed(_)));

    let err = network
        .propose_computation("no threshold", 5, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::PreconditionFailed(_)));

    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn computation_ids_use_the_comp_prefix() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::start(3, 0).await?;
    let comp_id = network.propose_computation("id shape", 30, 1).await?;
    assert!(comp_id.to_string().starts_with("COMP-"));
    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_of_network_counts_roles() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::start(3, 2).await?;
    let status = network.status_of_network().await?;
    assert_eq!(status.coordinator_count, 3);
    assert_eq!(status.contributor_count, 2);
    assert_eq!(status.nodes.len(), 5);
    for node in &status.nodes {
        assert_eq!(node.endpoint.ip().to_string(), "127.0.0.1");
    }
    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn await_result_timeout_leaves_the_computation_running() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::start(3, 1).await?;
    let comp_id = network.propose_computation("slow burn", 2, 1).await?;

    let err = network
        .await_result(comp_id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Timeout(_)));

    // The caller timeout did not touch the computation itself.
    let outcome = network.await_result(comp_id, Duration::from_secs(15)).await?;
    assert!(outcome.result.is_some());

    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_computation_is_an_error() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::start(3, 0).await?;
    let missing = ComputationId::new();
    let err = network.status(missing).await.unwrap_err();
    assert!(matches!(err, NetworkError::UnknownComputation(id) if id == missing));
    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reissuing_a_proposal_id_is_rejected_by_the_registry() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::start(3, 0).await?;
    let comp_id = network.propose_computation("original", 30, 1).await?;
    let record = network.status(comp_id).await?;

    let replay = ComputationRecord::new(
        comp_id,
        NodeId::new(),
        record.coordinators,
        "replayed",
        record.deadline,
        1,
    );
    let err = network.registry().insert_computation(&replay).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateComputation(id) if id == comp_id));

    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_clears_the_registry_and_closes_endpoints() -> anyhow::Result<()> {
    init_tracing();
    let scratch = tempfile::tempdir()?;
    let network = Network::builder()
        .coordinators(3)
        .contributors(2)
        .data_dir(scratch.path())
        .start()
        .await?;
    let registry_path = network.data_dir().join("registry.db");
    let endpoints: Vec<_> = network
        .status_of_network()
        .await?
        .nodes
        .iter()
        .map(|n| n.endpoint)
        .collect();

    network.shutdown().await?;

    // Registry rows are gone once every node confirmed teardown.
    let registry = RegistryStore::open(&registry_path, StoreConfig::default()).await?;
    assert!(registry.list_nodes().await?.is_empty());

    // Endpoints no longer accept connections.
    for endpoint in endpoints {
        assert!(tokio::net::TcpStream::connect(endpoint).await.is_err());
    }
    Ok(())
}
