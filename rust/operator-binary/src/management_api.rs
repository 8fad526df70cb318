//! Client for the Cassandra management API sidecar running next to every Cassandra node.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

use crate::{
    auth::{AuthSession, ClusterAuthState, Login, SessionError},
    credentials::Credential,
};

const ROLES_PATH: &str = "/api/v0/ops/auth/role";
const ROLE_PASSWORD_PATH: &str = "/api/v0/ops/auth/role/password";
const SCHEMA_VERSIONS_PATH: &str = "/api/v1/ops/node/schema/versions";

/// Key under which nodes that did not answer the schema version request are listed.
const UNREACHABLE_SCHEMA_VERSION: &str = "UNREACHABLE";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to send request to {url}"))]
    SendRequest { source: reqwest::Error, url: String },

    #[snafu(display("request to {url} failed with status {status}: {body}"))]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[snafu(display("failed to decode response from {url}"))]
    DecodeResponse { source: reqwest::Error, url: String },
}

impl Error {
    /// Connection problems, timeouts, overload and server side errors are transient. Anything the
    /// cluster rejected outright is not going to succeed on a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::SendRequest { .. } => true,
            Error::UnexpectedStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Error::DecodeResponse { .. } => false,
        }
    }
}

impl From<Error> for SessionError {
    fn from(err: Error) -> Self {
        if err.is_transient() {
            SessionError::transient(err)
        } else {
            SessionError::permanent(err)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RoleRecord {
    name: String,
    #[serde(rename = "super", deserialize_with = "deserialize_flag")]
    superuser: bool,
    #[serde(default = "default_login", deserialize_with = "deserialize_flag")]
    login: bool,
    #[serde(default)]
    salted_hash: Option<String>,
}

fn default_login() -> bool {
    true
}

/// The management API reports flags as `"True"`/`"False"` strings, newer releases as booleans.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(flag) => Ok(flag),
        Flag::Text(text) => match text.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(serde::de::Error::custom(format!(
                "expected \"true\" or \"false\", got {text:?}"
            ))),
        },
    }
}

#[derive(Debug, Serialize)]
struct CreateRoleRequest<'a> {
    username: &'a str,
    password: &'a str,
    is_superuser: bool,
    can_login: bool,
}

#[derive(Debug, Serialize)]
struct ChangePasswordRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Whether all reachable nodes agree on one schema version and no node is unreachable.
pub fn schema_in_agreement(versions: &BTreeMap<String, Vec<String>>) -> bool {
    let unreachable = versions
        .get(UNREACHABLE_SCHEMA_VERSION)
        .is_some_and(|nodes| !nodes.is_empty());
    let reachable_versions = versions
        .keys()
        .filter(|version| *version != UNREACHABLE_SCHEMA_VERSION)
        .count();

    !unreachable && reachable_versions == 1
}

#[derive(Clone, Debug)]
pub struct ManagementApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ManagementApiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn schema_versions(&self) -> Result<BTreeMap<String, Vec<String>>, Error> {
        self.get_json(SCHEMA_VERSIONS_PATH).await
    }

    async fn roles(&self) -> Result<Vec<RoleRecord>, Error> {
        self.get_json(ROLES_PATH).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context(SendRequestSnafu { url: &url })?;
        let response = check_status(&url, response).await?;
        response.json().await.context(DecodeResponseSnafu { url })
    }

    async fn post_json(&self, path: &str, body: &impl Serialize) -> Result<(), Error> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .context(SendRequestSnafu { url: &url })?;
        check_status(&url, response).await?;
        Ok(())
    }
}

async fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    UnexpectedStatusSnafu { url, status, body }.fail()
}

#[async_trait]
impl AuthSession for ManagementApiClient {
    async fn current_logins(&self) -> Result<ClusterAuthState, SessionError> {
        let roles = self.roles().await?;
        Ok(roles
            .into_iter()
            .map(|role| {
                (
                    role.name,
                    Login {
                        superuser: role.superuser,
                        can_login: role.login,
                        salted_hash: role.salted_hash,
                    },
                )
            })
            .collect())
    }

    async fn create_login(&self, credential: &Credential) -> Result<(), SessionError> {
        self.post_json(
            ROLES_PATH,
            &CreateRoleRequest {
                username: &credential.username,
                password: &credential.password,
                is_superuser: credential.superuser,
                can_login: true,
            },
        )
        .await?;
        Ok(())
    }

    async fn alter_login_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        self.post_json(ROLE_PASSWORD_PATH, &ChangePasswordRequest { username, password })
            .await?;
        Ok(())
    }
}
