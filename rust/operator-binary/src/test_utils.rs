//! In-memory stand-ins for the Kubernetes API and the Cassandra cluster.

use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::k8s_openapi::{ByteString, api::core::v1::Secret};

use crate::{
    auth::{AuthSession, ClusterAuthState, Login, PasswordCheck, SessionError},
    credentials::{self, Credential, CredentialSourceRef, SecretSource},
    crd::{SECRET_PASSWORD_KEY, SECRET_USERNAME_KEY},
    readiness::HealthSource,
};

pub fn secret_ref(namespace: &str, name: &str) -> CredentialSourceRef {
    CredentialSourceRef {
        namespace: namespace.to_string(),
        name: name.to_string(),
        superuser: None,
    }
}

pub fn credentials_secret(username: &str, password: &str) -> Secret {
    Secret {
        data: Some(BTreeMap::from([
            (
                SECRET_USERNAME_KEY.to_string(),
                ByteString(username.as_bytes().to_vec()),
            ),
            (
                SECRET_PASSWORD_KEY.to_string(),
                ByteString(password.as_bytes().to_vec()),
            ),
        ])),
        ..Secret::default()
    }
}

#[derive(Default)]
pub struct FakeSecrets {
    secrets: BTreeMap<(String, String), Secret>,
    denied: BTreeSet<(String, String)>,
}

impl FakeSecrets {
    pub fn with_secret(mut self, namespace: &str, name: &str, secret: Secret) -> Self {
        self.secrets
            .insert((namespace.to_string(), name.to_string()), secret);
        self
    }

    pub fn with_denied(mut self, namespace: &str, name: &str) -> Self {
        self.denied
            .insert((namespace.to_string(), name.to_string()));
        self
    }
}

#[async_trait]
impl SecretSource for FakeSecrets {
    async fn get_secret(&self, secret: &CredentialSourceRef) -> Result<Secret, credentials::Error> {
        let key = (secret.namespace.clone(), secret.name.clone());
        if self.denied.contains(&key) {
            return Err(credentials::Error::AccessDenied {
                secret: secret.clone(),
            });
        }
        self.secrets
            .get(&key)
            .cloned()
            .ok_or_else(|| credentials::Error::NotFound {
                secret: secret.clone(),
            })
    }
}

pub struct FakeHealth {
    nodes_expected: u32,
    nodes_ready: u32,
    schema_ready: bool,
    ready_after_polls: Option<usize>,
    pub polls: AtomicUsize,
    pub schema_queries: AtomicUsize,
}

impl FakeHealth {
    pub fn new(nodes_expected: u32, nodes_ready: u32, schema_ready: bool) -> Self {
        Self {
            nodes_expected,
            nodes_ready,
            schema_ready,
            ready_after_polls: None,
            polls: AtomicUsize::new(0),
            schema_queries: AtomicUsize::new(0),
        }
    }

    /// Reports every node as ready once `polls` samples have been taken.
    pub fn ready_after_polls(mut self, polls: usize) -> Self {
        self.ready_after_polls = Some(polls);
        self
    }
}

#[async_trait]
impl HealthSource for FakeHealth {
    type Error = Infallible;

    async fn node_count(&self) -> Result<u32, Self::Error> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.nodes_expected)
    }

    async fn ready_node_count(&self) -> Result<u32, Self::Error> {
        let polls = self.polls.load(Ordering::SeqCst);
        match self.ready_after_polls {
            Some(after) if polls > after => Ok(self.nodes_expected),
            _ => Ok(self.nodes_ready),
        }
    }

    async fn schema_agreement(&self) -> Result<bool, Self::Error> {
        self.schema_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.schema_ready)
    }
}

#[derive(Debug, Snafu)]
pub enum FakeClusterError {
    #[snafu(display("coordinator node unavailable"))]
    Unavailable,

    #[snafu(display("role {username:?} rejected"))]
    Rejected { username: String },

    #[snafu(display("role {username:?} does not exist"))]
    UnknownRole { username: String },

    #[snafu(display("provided username and/or password are incorrect"))]
    BadCredentials,
}

/// Authentication table of a Cassandra cluster, with hashes computed like the real thing.
#[derive(Default)]
pub struct FakeCluster {
    logins: Mutex<ClusterAuthState>,
    transient_failures: AtomicUsize,
    rejected: BTreeSet<String>,
    /// Lists logins without their hashes, like the management API does.
    hide_hashes: bool,
    /// Number of successful create and alter calls.
    pub mutations: AtomicUsize,
}

impl FakeCluster {
    pub fn login(password: &str, superuser: bool) -> Login {
        Login {
            superuser,
            can_login: true,
            salted_hash: Some(bcrypt::hash(password, 4).expect("hashing must succeed")),
        }
    }

    pub fn with_login(self, username: &str, password: &str, superuser: bool) -> Self {
        self.logins
            .lock()
            .unwrap()
            .insert(username.to_string(), Self::login(password, superuser));
        self
    }

    /// Fails the next `calls` calls, whatever they are, with a transient error.
    pub fn failing_transiently(self, calls: usize) -> Self {
        self.transient_failures.store(calls, Ordering::SeqCst);
        self
    }

    pub fn without_hashes(mut self) -> Self {
        self.hide_hashes = true;
        self
    }

    /// Permanently rejects any change to the login `username`.
    pub fn rejecting(mut self, username: &str) -> Self {
        self.rejected.insert(username.to_string());
        self
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<(), FakeClusterError> {
        let logins = self.logins.lock().unwrap();
        match logins.get(username) {
            Some(login)
                if login.can_login
                    && login.check_password(password) == PasswordCheck::Matches =>
            {
                Ok(())
            }
            _ => BadCredentialsSnafu.fail(),
        }
    }

    pub fn is_superuser(&self, username: &str) -> bool {
        self.logins
            .lock()
            .unwrap()
            .get(username)
            .is_some_and(|login| login.superuser)
    }

    pub fn snapshot(&self) -> ClusterAuthState {
        self.logins.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), SessionError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SessionError::transient(FakeClusterError::Unavailable));
        }
        Ok(())
    }

    fn check_accepted(&self, username: &str) -> Result<(), SessionError> {
        if self.rejected.contains(username) {
            return Err(SessionError::permanent(FakeClusterError::Rejected {
                username: username.to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthSession for FakeCluster {
    async fn current_logins(&self) -> Result<ClusterAuthState, SessionError> {
        self.check_available()?;
        let mut logins = self.snapshot();
        if self.hide_hashes {
            for login in logins.values_mut() {
                login.salted_hash = None;
            }
        }
        Ok(logins)
    }

    async fn create_login(&self, credential: &Credential) -> Result<(), SessionError> {
        self.check_available()?;
        self.check_accepted(&credential.username)?;
        self.logins.lock().unwrap().insert(
            credential.username.clone(),
            Self::login(&credential.password, credential.superuser),
        );
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn alter_login_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), SessionError> {
        self.check_available()?;
        self.check_accepted(username)?;
        let mut logins = self.logins.lock().unwrap();
        let login = logins.get_mut(username).ok_or_else(|| {
            SessionError::permanent(FakeClusterError::UnknownRole {
                username: username.to_string(),
            })
        })?;
        login.salted_hash = Self::login(password, login.superuser).salted_hash;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
