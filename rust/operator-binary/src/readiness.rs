//! Blocks credential changes until every Cassandra node is up and the schema has settled.
//!
//! Role changes are written to `system_auth` with quorum, so issuing them against a cluster that
//! is still starting fails spuriously.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use snafu::Snafu;
use tokio::time::Instant;

use crate::crd::FailureClass;

#[async_trait]
pub trait HealthSource: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Number of nodes the cluster is expected to have.
    async fn node_count(&self) -> Result<u32, Self::Error>;

    async fn ready_node_count(&self) -> Result<u32, Self::Error>;

    /// Whether all reachable nodes report the same schema version.
    async fn schema_agreement(&self) -> Result<bool, Self::Error>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReadinessStatus {
    pub nodes_ready: u32,
    pub nodes_expected: u32,
    pub schema_ready: bool,
}

impl ReadinessStatus {
    pub fn is_ready(&self) -> bool {
        self.nodes_expected > 0 && self.nodes_ready == self.nodes_expected && self.schema_ready
    }
}

impl fmt::Display for ReadinessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ready}/{expected} nodes ready, schema {schema}",
            ready = self.nodes_ready,
            expected = self.nodes_expected,
            schema = if self.schema_ready {
                "in agreement"
            } else {
                "not in agreement"
            }
        )
    }
}

/// Deadline offset used when a timeout does not fit into an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "cluster did not become ready within {timeout:?} (last observed: {})",
        last_status.map_or_else(|| "nothing".to_string(), |status| status.to_string())
    ))]
    Timeout {
        timeout: Duration,
        last_status: Option<ReadinessStatus>,
    },
}

impl Error {
    pub fn class(&self) -> FailureClass {
        match self {
            Error::Timeout { .. } => FailureClass::Timeout,
        }
    }
}

/// Takes one readiness sample. Schema agreement is only queried once all nodes are ready.
pub async fn check_readiness<H>(source: &H) -> Result<ReadinessStatus, H::Error>
where
    H: HealthSource + ?Sized,
{
    let nodes_expected = source.node_count().await?;
    let nodes_ready = source.ready_node_count().await?;
    let schema_ready = if nodes_expected > 0 && nodes_ready == nodes_expected {
        source.schema_agreement().await?
    } else {
        false
    };

    Ok(ReadinessStatus {
        nodes_ready,
        nodes_expected,
        schema_ready,
    })
}

/// Polls `source` every `poll_interval` until the cluster is ready, giving up after `timeout`.
///
/// Failures to query the health source count as "not ready yet".
pub async fn await_ready<H>(
    source: &H,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<ReadinessStatus, Error>
where
    H: HealthSource + ?Sized,
{
    let deadline = deadline_after(timeout);
    let mut last_status = None;

    loop {
        match tokio::time::timeout_at(deadline, check_readiness(source)).await {
            Ok(Ok(status)) if status.is_ready() => {
                tracing::debug!(%status, "Cluster is ready");
                return Ok(status);
            }
            Ok(Ok(status)) => {
                tracing::debug!(%status, "Cluster is not ready yet");
                last_status = Some(status);
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to query cluster health"
                );
            }
            Err(_elapsed) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return TimeoutSnafu {
                timeout,
                last_status,
            }
            .fail();
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}
