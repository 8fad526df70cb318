use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu};
use stackable_operator::{
    commons::cluster_operation::ClusterOperation,
    kube::{CustomResource, ResourceExt},
    schemars::{self, JsonSchema},
    status::condition::{ClusterCondition, HasStatusCondition},
    versioned::versioned,
};
use strum::{Display, EnumIter};

use crate::credentials::CredentialSourceRef;

pub const DEFAULT_MANAGEMENT_API_PORT: u16 = 8080;

// Keys read from credentials Secrets
pub const SECRET_USERNAME_KEY: &str = "username";
pub const SECRET_PASSWORD_KEY: &str = "password";
pub const SECRET_SUPERUSER_KEY: &str = "superuser";

#[derive(Debug, Snafu)]
#[snafu(display("object has no namespace associated"))]
pub struct NoNamespaceError;

#[versioned(
    version(name = "v1alpha1"),
    crates(
        kube_core = "stackable_operator::kube::core",
        kube_client = "stackable_operator::kube::client",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars",
        versioned = "stackable_operator::versioned"
    )
)]
pub mod versioned {
    /// A Cassandra cluster whose superuser logins are provisioned by the Stackable operator for
    /// Apache Cassandra. The operator does not manage the Cassandra nodes themselves, it only
    /// reads the credentials Secrets listed here and creates the matching logins once the
    /// cluster is ready.
    #[versioned(crd(
        group = "cassandra.stackable.tech",
        plural = "cassandraclusters",
        shortname = "cassandra",
        status = "CassandraClusterStatus",
        namespaced
    ))]
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CassandraClusterSpec {
        /// Settings that affect the whole Cassandra cluster.
        pub cluster_config: v1alpha1::CassandraClusterConfig,

        // no doc - docs in ClusterOperation struct.
        #[serde(default)]
        pub cluster_operation: ClusterOperation,
    }

    #[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CassandraClusterConfig {
        /// Number of Cassandra nodes that must be ready before logins are changed.
        pub nodes: u16,

        /// Secrets providing the superuser logins of this cluster, in order.
        /// Every Secret needs to contain the keys `username` and `password`.
        #[serde(default)]
        pub users: Vec<UserSecretRef>,

        /// Labels selecting the Pods of the Cassandra nodes.
        /// Defaults to `app.kubernetes.io/instance: <cluster name>`.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        pub pod_selector: BTreeMap<String, String>,

        // no doc - docs in ManagementApiConfig struct.
        #[serde(default)]
        pub management_api: ManagementApiConfig,
    }
}

impl HasStatusCondition for v1alpha1::CassandraCluster {
    fn conditions(&self) -> Vec<ClusterCondition> {
        match &self.status {
            Some(status) => status.conditions.clone(),
            None => vec![],
        }
    }
}

impl v1alpha1::CassandraCluster {
    /// The credential sources of this cluster, in the order they are declared.
    ///
    /// References without an explicit namespace point into the namespace of the cluster.
    pub fn credential_sources(&self) -> Result<Vec<CredentialSourceRef>, NoNamespaceError> {
        let namespace = self.namespace().context(NoNamespaceSnafu)?;
        Ok(self
            .spec
            .cluster_config
            .users
            .iter()
            .map(|user| CredentialSourceRef {
                namespace: user.namespace.clone().unwrap_or_else(|| namespace.clone()),
                name: user.secret_name.clone(),
                superuser: user.superuser,
            })
            .collect())
    }

    /// Whether the Secret `namespace/name` is one of the credential sources of this cluster.
    pub fn references_secret(&self, namespace: &str, name: &str) -> bool {
        self.credential_sources()
            .map(|sources| {
                sources
                    .iter()
                    .any(|source| source.namespace == namespace && source.name == name)
            })
            .unwrap_or(false)
    }

    pub fn pod_selector(&self) -> BTreeMap<String, String> {
        let selector = &self.spec.cluster_config.pod_selector;
        if selector.is_empty() {
            BTreeMap::from([(
                "app.kubernetes.io/instance".to_string(),
                self.name_any(),
            )])
        } else {
            selector.clone()
        }
    }

    pub fn expected_nodes(&self) -> u32 {
        self.spec.cluster_config.nodes.into()
    }

    /// Base URL of the management API used to read and change logins.
    pub fn management_api_endpoint(&self, cluster_domain: &str) -> Result<String, NoNamespaceError> {
        let management_api = &self.spec.cluster_config.management_api;
        if let Some(endpoint) = &management_api.endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }

        let namespace = self.namespace().context(NoNamespaceSnafu)?;
        Ok(format!(
            "http://{name}.{namespace}.svc.{cluster_domain}:{port}",
            name = self.name_any(),
            port = management_api.port,
        ))
    }

    /// Credential reconciliation is skipped entirely while this returns true.
    pub fn is_reconciliation_suspended(&self) -> bool {
        let operation = &self.spec.cluster_operation;
        operation.reconciliation_paused || operation.stopped
    }

    pub fn provisioned_users(&self) -> Vec<String> {
        self.status
            .as_ref()
            .and_then(|status| status.credentials.as_ref())
            .map(|credentials| credentials.provisioned_users.clone())
            .unwrap_or_default()
    }
}

/// Reference to a Secret holding the `username` and `password` of a superuser login.
#[derive(Clone, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSecretRef {
    /// Name of the Secret.
    pub secret_name: String,

    /// Namespace of the Secret. Defaults to the namespace of the cluster.
    ///
    /// The Secret is read with the permissions of the operator, so anyone allowed to edit this
    /// cluster can have any Secret the operator can read provisioned as a login. Changes to
    /// Secrets outside the namespace watched by the operator are only picked up by the periodic
    /// reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Whether the login is created as superuser. A `superuser` key in the Secret takes
    /// precedence. Defaults to `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superuser: Option<bool>,
}

/// Connection to the Cassandra management API sidecar.
#[derive(Clone, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementApiConfig {
    /// Full base URL, e.g. `http://my-cluster.default.svc.cluster.local:8080`.
    /// Defaults to the Service named after the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Port of the management API, used when no `endpoint` is set.
    #[serde(default = "default_management_api_port")]
    pub port: u16,
}

impl Default for ManagementApiConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            port: default_management_api_port(),
        }
    }
}

fn default_management_api_port() -> u16 {
    DEFAULT_MANAGEMENT_API_PORT
}

/// Phase of the credential reconciliation of a cluster.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumIter,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum ReconcilePhase {
    #[default]
    Idle,
    Resolving,
    Gating,
    Applying,
    Settled,
    Failed,
}

/// Class of the error that made the last credential reconciliation fail.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum FailureClass {
    NotFound,
    MalformedSecret,
    AccessDenied,
    DuplicateUsername,
    Timeout,
    TransientConnection,
    PermanentError,
}

impl FailureClass {
    /// Configuration errors need a user to fix a Secret or the cluster definition, everything
    /// else is caused by the environment.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::MalformedSecret | Self::AccessDenied | Self::DuplicateUsername
        )
    }
}

#[derive(Clone, Default, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterStatus {
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsStatus>,
}

#[derive(Clone, Default, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsStatus {
    pub phase: ReconcilePhase,

    /// Set while the last pass failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_class: Option<FailureClass>,

    /// Logins known to be provisioned by the last successful pass.
    #[serde(default)]
    pub provisioned_users: Vec<String>,
}
