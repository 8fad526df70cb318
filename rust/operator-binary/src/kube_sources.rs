//! [`SecretSource`] and [`HealthSource`] backed by the Kubernetes API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::{Pod, Secret},
    kube::{self, Api, api::ListParams},
};

use crate::{
    credentials::{self, CredentialSourceRef, RetrieveSecretSnafu, SecretSource},
    management_api::{self, ManagementApiClient, schema_in_agreement},
    readiness::HealthSource,
};

/// Reads credentials Secrets with the permissions of the operator.
pub struct KubeSecretSource {
    client: kube::Client,
}

impl KubeSecretSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn get_secret(&self, secret: &CredentialSourceRef) -> Result<Secret, credentials::Error> {
        let api = Api::<Secret>::namespaced(self.client.clone(), &secret.namespace);
        match api.get(&secret.name).await {
            Ok(object) => Ok(object),
            Err(kube::Error::Api(err)) if err.code == 404 => {
                Err(credentials::Error::NotFound {
                    secret: secret.clone(),
                })
            }
            Err(kube::Error::Api(err)) if err.code == 401 || err.code == 403 => {
                Err(credentials::Error::AccessDenied {
                    secret: secret.clone(),
                })
            }
            Err(err) => Err(err).context(RetrieveSecretSnafu {
                secret: secret.clone(),
            }),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list the Pods matching {selector:?}"))]
    ListPods {
        source: kube::Error,
        selector: String,
    },

    #[snafu(display("failed to query the schema versions"))]
    QuerySchemaVersions { source: management_api::Error },
}

/// Health of one Cassandra cluster, taken from its Pods and its management API.
pub struct ClusterHealth {
    pods: Api<Pod>,
    selector: String,
    nodes_expected: u32,
    management_api: ManagementApiClient,
}

impl ClusterHealth {
    pub fn new(
        client: kube::Client,
        namespace: &str,
        pod_selector: &BTreeMap<String, String>,
        nodes_expected: u32,
        management_api: ManagementApiClient,
    ) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            selector: label_selector(pod_selector),
            nodes_expected,
            management_api,
        }
    }
}

#[async_trait]
impl HealthSource for ClusterHealth {
    type Error = Error;

    async fn node_count(&self) -> Result<u32, Error> {
        Ok(self.nodes_expected)
    }

    async fn ready_node_count(&self) -> Result<u32, Error> {
        let pods = self
            .pods
            .list(&ListParams::default().labels(&self.selector))
            .await
            .context(ListPodsSnafu {
                selector: &self.selector,
            })?;
        let ready = pods.items.iter().filter(|pod| pod_is_ready(pod)).count();
        Ok(u32::try_from(ready).unwrap_or(u32::MAX))
    }

    async fn schema_agreement(&self) -> Result<bool, Error> {
        let versions = self
            .management_api
            .schema_versions()
            .await
            .context(QuerySchemaVersionsSnafu)?;
        Ok(schema_in_agreement(&versions))
    }
}

/// A Pod counts as ready when its `Ready` condition is `True` and it is not shutting down.
pub fn pod_is_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }

    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
