//! Provisions the superuser logins of each [`v1alpha1::CassandraCluster`]
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    kube::{
        Resource, ResourceExt,
        core::{DeserializeGuard, error_boundary},
        runtime::{
            controller::Action,
            reflector::{ObjectRef, Store},
        },
    },
    logging::controller::ReconcilerError,
};
use strum::EnumDiscriminants;

use crate::{
    OPERATOR_NAME,
    config::OperatorSettings,
    crd::{FailureClass, NoNamespaceError, ReconcilePhase, v1alpha1},
    driver::{self, CredentialsPass},
    kube_sources::{ClusterHealth, KubeSecretSource},
    management_api::ManagementApiClient,
    status::build_status,
};

pub const CASSANDRA_FULL_CONTROLLER_NAME: &str = "cassandracluster.cassandra.stackable.tech";

pub struct Ctx {
    pub client: stackable_operator::client::Client,
    pub http: reqwest::Client,
    pub settings: OperatorSettings,
    /// Clusters as seen by the controller, used to notice deletions while a pass is running.
    pub clusters: Store<DeserializeGuard<v1alpha1::CassandraCluster>>,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(strum::IntoStaticStr))]
pub enum Error {
    #[snafu(display("CassandraCluster object is invalid"))]
    InvalidCassandraCluster {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace { source: NoNamespaceError },

    #[snafu(display("failed to reconcile the superuser logins"))]
    ReconcileCredentials { source: driver::Error },

    #[snafu(display("failed to update status"))]
    ApplyStatus {
        source: stackable_operator::client::Error,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            Error::ReconcileCredentials { source } => source.class(),
            Error::ApplyStatus { .. } => Some(FailureClass::TransientConnection),
            Error::InvalidCassandraCluster { .. } | Error::ObjectHasNoNamespace { .. } => None,
        }
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_cassandra(
    cassandra: Arc<DeserializeGuard<v1alpha1::CassandraCluster>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    tracing::info!("Starting reconcile");

    let cassandra = cassandra
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidCassandraClusterSnafu)?;
    let client = &ctx.client;

    if cassandra.meta().deletion_timestamp.is_some() {
        tracing::info!("CassandraCluster is being deleted, leaving its logins in place");
        return Ok(Action::await_change());
    }

    if cassandra.is_reconciliation_suspended() {
        tracing::info!("Reconciliation is paused or the cluster is stopped, skipping credentials");
        let status = build_status(
            cassandra,
            ReconcilePhase::Idle,
            None,
            cassandra.provisioned_users(),
        );
        client
            .apply_patch_status(OPERATOR_NAME, cassandra, &status)
            .await
            .context(ApplyStatusSnafu)?;
        return Ok(Action::await_change());
    }

    let namespace = cassandra
        .namespace()
        .ok_or(NoNamespaceError)
        .context(ObjectHasNoNamespaceSnafu)?;
    let sources = cassandra
        .credential_sources()
        .context(ObjectHasNoNamespaceSnafu)?;
    let management_api = ManagementApiClient::new(
        ctx.http.clone(),
        cassandra
            .management_api_endpoint(&client.kubernetes_cluster_info.cluster_domain.to_string())
            .context(ObjectHasNoNamespaceSnafu)?,
    );
    let secrets = KubeSecretSource::new(client.as_kube_client());
    let health = ClusterHealth::new(
        client.as_kube_client(),
        &namespace,
        &cassandra.pod_selector(),
        cassandra.expected_nodes(),
        management_api.clone(),
    );

    let cluster_ref = ObjectRef::<DeserializeGuard<v1alpha1::CassandraCluster>>::new(
        &cassandra.name_any(),
    )
    .within(&namespace);
    let is_cancelled = || match ctx.clusters.get(&cluster_ref) {
        Some(cluster) => cluster.meta().deletion_timestamp.is_some(),
        None => true,
    };

    let mut pass = CredentialsPass::new(&secrets, &health, &management_api, &ctx.settings.pass);
    let result = pass.run(&sources, is_cancelled).await;

    let status = match &result {
        Ok(report) => {
            if report.changes.is_noop() {
                tracing::debug!(readiness = %report.readiness, "Credentials already settled");
            } else {
                tracing::info!(
                    readiness = %report.readiness,
                    created = ?report.changes.created,
                    password_changed = ?report.changes.password_changed,
                    "Credentials settled"
                );
            }
            tracing::debug!(
                password_reapplied = ?report.changes.password_reapplied,
                unchanged = ?report.changes.unchanged,
                unmanaged = ?report.changes.unmanaged,
                "Login changes of this pass"
            );
            build_status(cassandra, pass.phase(), None, report.usernames.clone())
        }
        Err(err) => match err.class() {
            Some(class) => build_status(
                cassandra,
                pass.phase(),
                Some(class),
                cassandra.provisioned_users(),
            ),
            None => {
                tracing::info!(
                    error = err as &dyn std::error::Error,
                    "Credentials pass cancelled"
                );
                return Ok(Action::await_change());
            }
        },
    };
    client
        .apply_patch_status(OPERATOR_NAME, cassandra, &status)
        .await
        .context(ApplyStatusSnafu)?;

    result.context(ReconcileCredentialsSnafu)?;
    Ok(Action::requeue(ctx.settings.reconcile_interval))
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<v1alpha1::CassandraCluster>>,
    error: &Error,
    ctx: Arc<Ctx>,
) -> Action {
    match error {
        // root object is invalid, will be requeued when modified anyway
        Error::InvalidCassandraCluster { .. } => Action::await_change(),

        _ => match error.class() {
            Some(class) => Action::requeue(ctx.settings.requeue_for(class)),
            None => Action::requeue(ctx.settings.config_error_requeue),
        },
    }
}
