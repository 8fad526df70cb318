//! Cluster conditions derived from the outcome of a credentials pass.

use stackable_operator::status::condition::{
    ClusterCondition, ClusterConditionSet, ClusterConditionStatus, ClusterConditionType,
    ConditionBuilder, compute_conditions, operations::ClusterOperationsConditionBuilder,
};

use crate::crd::{CassandraClusterStatus, CredentialsStatus, FailureClass, ReconcilePhase, v1alpha1};

/// Builds the `Available`, `Progressing` and `Degraded` conditions for the credentials of a
/// cluster.
pub struct CredentialsConditionBuilder<'a> {
    credentials: &'a CredentialsStatus,
}

impl ConditionBuilder for CredentialsConditionBuilder<'_> {
    fn build_conditions(&self) -> ClusterConditionSet {
        vec![self.available(), self.progressing(), self.degraded()].into()
    }
}

impl<'a> CredentialsConditionBuilder<'a> {
    pub fn new(credentials: &'a CredentialsStatus) -> Self {
        Self { credentials }
    }

    fn available(&self) -> ClusterCondition {
        let (status, message) = match self.credentials.phase {
            ReconcilePhase::Settled => (
                ClusterConditionStatus::True,
                format!(
                    "All {count} logins are provisioned.",
                    count = self.credentials.provisioned_users.len()
                ),
            ),
            ReconcilePhase::Failed => (
                ClusterConditionStatus::False,
                self.failure_message(),
            ),
            _ => (
                ClusterConditionStatus::Unknown,
                "The logins have not been reconciled yet.".to_string(),
            ),
        };

        condition(ClusterConditionType::Available, status, message)
    }

    fn progressing(&self) -> ClusterCondition {
        let (status, message) = match self.credentials.phase {
            ReconcilePhase::Resolving | ReconcilePhase::Gating | ReconcilePhase::Applying => (
                ClusterConditionStatus::True,
                format!(
                    "The logins are being reconciled (phase {phase}).",
                    phase = self.credentials.phase
                ),
            ),
            _ => (
                ClusterConditionStatus::False,
                "No login changes are in progress.".to_string(),
            ),
        };

        condition(ClusterConditionType::Progressing, status, message)
    }

    fn degraded(&self) -> ClusterCondition {
        let (status, message) = match self.credentials.phase {
            ReconcilePhase::Failed => (ClusterConditionStatus::True, self.failure_message()),
            _ => (
                ClusterConditionStatus::False,
                "The logins are reconciled normally.".to_string(),
            ),
        };

        condition(ClusterConditionType::Degraded, status, message)
    }

    fn failure_message(&self) -> String {
        match self.credentials.last_error_class {
            Some(class) if class.is_configuration_error() => format!(
                "The logins could not be reconciled ({class}). Check the referenced credentials Secrets."
            ),
            Some(class) => format!("The logins could not be reconciled ({class})."),
            None => "The logins could not be reconciled.".to_string(),
        }
    }
}

fn condition(
    type_: ClusterConditionType,
    status: ClusterConditionStatus,
    message: String,
) -> ClusterCondition {
    ClusterCondition {
        reason: None,
        message: Some(message),
        status,
        type_,
        last_transition_time: None,
        last_update_time: None,
    }
}

/// The new status of `cassandra`, with condition timestamps carried over from its current status.
pub fn build_status(
    cassandra: &v1alpha1::CassandraCluster,
    phase: ReconcilePhase,
    last_error_class: Option<FailureClass>,
    provisioned_users: Vec<String>,
) -> CassandraClusterStatus {
    let credentials = CredentialsStatus {
        phase,
        last_error_class,
        provisioned_users,
    };
    let credentials_builder = CredentialsConditionBuilder::new(&credentials);
    let operations_builder =
        ClusterOperationsConditionBuilder::new(&cassandra.spec.cluster_operation);

    CassandraClusterStatus {
        conditions: compute_conditions(
            cassandra,
            &[
                &credentials_builder as &dyn ConditionBuilder,
                &operations_builder as &dyn ConditionBuilder,
            ],
        ),
        credentials: Some(credentials),
    }
}
