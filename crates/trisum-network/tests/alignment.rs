//! Participant alignment under partial delivery, driven by hand-rolled
//! contributors so individual share deliveries can be withheld.

use std::time::Duration;
use trisum_core::{sharing, ComputationStatus, Message, NodeId, ReliabilityConfig, Reply};
use trisum_network::Network;
use trisum_transport::{Delivery, Messenger};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fast_retries() -> ReliabilityConfig {
    ReliabilityConfig {
        max_attempts: 2,
        base_backoff_ms: 20,
        max_backoff_ms: 100,
        attempt_timeout_ms: 2_000,
    }
}

/// A contributor that never registers a node: it only speaks the share
/// protocol, so the test controls exactly which coordinator receives what.
struct ManualContributor {
    messenger: Messenger,
}

impl ManualContributor {
    fn new(network: &Network) -> Self {
        Self {
            messenger: Messenger::new(NodeId::new(), network.registry().clone(), fast_retries()),
        }
    }

    async fn send_share(
        &self,
        target: NodeId,
        comp_id: trisum_core::ComputationId,
        share_value: u32,
        share_index: u8,
    ) -> Delivery {
        self.messenger
            .send(
                target,
                Message::Share {
                    comp_id,
                    share_value,
                    share_index,
                },
            )
            .await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partially_delivered_contributor_is_excluded() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::builder().coordinators(3).start().await?;
    let comp_id = network.propose_computation("alignment", 2, 1).await?;
    let record = network.status(comp_id).await?;
    let coordinators = record.coordinators;

    let values = [10u32, 20, 30];
    let contributors: Vec<ManualContributor> =
        (0..3).map(|_| ManualContributor::new(&network)).collect();

    for (j, (contributor, value)) in contributors.iter().zip(values).enumerate() {
        let triple = sharing::split(value);
        for (i, share) in triple.as_array().into_iter().enumerate() {
            // Contributor 2's delivery to C₃ fails permanently.
            if j == 1 && i == 2 {
                continue;
            }
            let delivery = contributor
                .send_share(coordinators[i], comp_id, share, i as u8)
                .await;
            assert_eq!(delivery, Delivery::Delivered(Reply::Accepted));
        }
    }

    let outcome = network.await_result(comp_id, Duration::from_secs(15)).await?;

    // The partially delivered contributor is silently dropped from the
    // aligned set; the other two reconstruct exactly.
    assert_eq!(outcome.status, ComputationStatus::Completed);
    assert_eq!(outcome.result, Some(10 + 30));
    assert_eq!(outcome.participants_count, Some(2));

    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resent_share_is_a_no_op_and_conflicting_share_is_rejected() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::builder().coordinators(3).start().await?;
    let comp_id = network.propose_computation("idempotent shares", 2, 1).await?;
    let record = network.status(comp_id).await?;
    let coordinators = record.coordinators;

    let contributor = ManualContributor::new(&network);
    let triple = sharing::split(42);
    let shares = triple.as_array();

    for (i, share) in shares.into_iter().enumerate() {
        let delivery = contributor
            .send_share(coordinators[i], comp_id, share, i as u8)
            .await;
        assert_eq!(delivery, Delivery::Delivered(Reply::Accepted));
    }

    // Identical re-send: accepted, nothing double counted.
    let delivery = contributor
        .send_share(coordinators[0], comp_id, shares[0], 0)
        .await;
    assert_eq!(delivery, Delivery::Delivered(Reply::Accepted));

    // A conflicting value from the same contributor is dropped.
    let delivery = contributor
        .send_share(coordinators[0], comp_id, shares[0].wrapping_add(1), 0)
        .await;
    assert!(matches!(
        delivery,
        Delivery::Failed(trisum_transport::DeliveryFailure::Rejected(
            trisum_core::RejectKind::DuplicateShare
        ))
    ));

    let outcome = network.await_result(comp_id, Duration::from_secs(15)).await?;
    assert_eq!(outcome.result, Some(42));
    assert_eq!(outcome.participants_count, Some(1));

    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_shares_at_deadline_fails_threshold() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::builder().coordinators(3).start().await?;
    let comp_id = network.propose_computation("silence", 1, 1).await?;

    let err = network
        .await_result(comp_id, Duration::from_secs(15))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        trisum_network::NetworkError::ComputationFailed {
            reason: trisum_core::FailureReason::ThresholdNotMet
        }
    ));

    network.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn share_after_deadline_is_rejected_as_late() -> anyhow::Result<()> {
    init_tracing();
    let network = Network::builder().coordinators(3).start().await?;
    let comp_id = network.propose_computation("late share", 1, 1).await?;
    let record = network.status(comp_id).await?;

    // Let the deadline pass, then attempt to contribute.
    tokio::time::sleep(Duration::from_millis(1_400)).await;
    let contributor = ManualContributor::new(&network);
    let triple = sharing::split(9);
    let delivery = contributor
        .send_share(record.coordinators[0], comp_id, triple.s1, 0)
        .await;
    assert!(matches!(
        delivery,
        Delivery::Failed(trisum_transport::DeliveryFailure::Rejected(
            trisum_core::RejectKind::LateShare
        ))
    ));

    network.shutdown().await?;
    Ok(())
}
