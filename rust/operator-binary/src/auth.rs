//! Brings the logins of a live Cassandra cluster in line with a [`CredentialSet`].
//!
//! The reconciliation is additive only: logins are created or get their password changed, but
//! logins the desired set does not mention are never dropped or demoted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};

use crate::{
    credentials::{Credential, CredentialSet},
    crd::FailureClass,
    retry::{RetryConfig, retry_transient},
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A login as currently stored in the cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Login {
    pub superuser: bool,
    pub can_login: bool,
    /// bcrypt hash of the password, if the cluster exposes it.
    pub salted_hash: Option<String>,
}

/// Result of comparing a desired password with the stored hash of a login.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PasswordCheck {
    Matches,
    Differs,
    /// The cluster does not expose the hash of this login.
    Unknown,
}

impl Login {
    /// Compares `password` against the stored hash. bcrypt is slow by design, so this should not
    /// run on the async executor.
    pub fn check_password(&self, password: &str) -> PasswordCheck {
        match &self.salted_hash {
            Some(hash) => match bcrypt::verify(password, hash) {
                Ok(true) => PasswordCheck::Matches,
                _ => PasswordCheck::Differs,
            },
            None => PasswordCheck::Unknown,
        }
    }
}

/// Logins of the cluster by username.
pub type ClusterAuthState = BTreeMap<String, Login>;

#[derive(Debug, Snafu)]
pub enum SessionError {
    /// Node unreachable, timeouts and overloaded coordinators. Worth retrying.
    #[snafu(display("transient cluster failure"))]
    Transient { source: BoxError },

    #[snafu(display("permanent cluster failure"))]
    Permanent { source: BoxError },
}

impl SessionError {
    pub fn transient(source: impl Into<BoxError>) -> Self {
        Self::Transient {
            source: source.into(),
        }
    }

    pub fn permanent(source: impl Into<BoxError>) -> Self {
        Self::Permanent {
            source: source.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Session against the authentication table of a Cassandra cluster.
#[async_trait]
pub trait AuthSession: Send + Sync {
    async fn current_logins(&self) -> Result<ClusterAuthState, SessionError>;

    async fn create_login(&self, credential: &Credential) -> Result<(), SessionError>;

    async fn alter_login_password(&self, username: &str, password: &str)
    -> Result<(), SessionError>;
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the current logins"))]
    ReadLogins { source: SessionError },

    #[snafu(display("failed to plan the login changes"))]
    PlanChanges { source: tokio::task::JoinError },

    #[snafu(display("failed to create login {username:?}"))]
    CreateLogin {
        source: SessionError,
        username: String,
    },

    #[snafu(display("failed to change the password of login {username:?}"))]
    ChangePassword {
        source: SessionError,
        username: String,
    },
}

impl Error {
    pub fn class(&self) -> FailureClass {
        let source = match self {
            Error::PlanChanges { .. } => return FailureClass::PermanentError,
            Error::ReadLogins { source }
            | Error::CreateLogin { source, .. }
            | Error::ChangePassword { source, .. } => source,
        };
        if source.is_transient() {
            FailureClass::TransientConnection
        } else {
            FailureClass::PermanentError
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum LoginChange {
    Create(Credential),
    ChangePassword(Credential),
    /// The current password cannot be read, so the desired one is written again.
    ReapplyPassword(Credential),
}

impl LoginChange {
    pub fn username(&self) -> &str {
        match self {
            LoginChange::Create(credential)
            | LoginChange::ChangePassword(credential)
            | LoginChange::ReapplyPassword(credential) => &credential.username,
        }
    }
}

/// What a call to [`reconcile_logins`] did, by username.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AppliedChanges {
    pub created: Vec<String>,
    pub password_changed: Vec<String>,
    /// Passwords written again because the cluster does not expose their hashes. Writing the same
    /// password leaves the login as it was.
    pub password_reapplied: Vec<String>,
    pub unchanged: Vec<String>,
    /// Logins that exist in the cluster without being part of the desired set. Left untouched.
    pub unmanaged: Vec<String>,
    /// Planned changes that were skipped because the pass got cancelled.
    pub skipped: Vec<String>,
}

impl AppliedChanges {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.password_changed.is_empty()
    }
}

/// Computes the changes needed to make `actual` contain every login of `desired`.
///
/// Existing logins keep their superuser and login flags, only their password is changed.
pub fn plan_login_changes(desired: &CredentialSet, actual: &ClusterAuthState) -> Vec<LoginChange> {
    desired
        .iter()
        .filter_map(|credential| {
            let Some(login) = actual.get(&credential.username) else {
                return Some(LoginChange::Create(credential.clone()));
            };
            if login.superuser != credential.superuser || !login.can_login {
                tracing::debug!(
                    username = %credential.username,
                    superuser = login.superuser,
                    can_login = login.can_login,
                    "Login flags differ from the desired credential, leaving them unchanged"
                );
            }
            match login.check_password(&credential.password) {
                PasswordCheck::Matches => None,
                PasswordCheck::Differs => Some(LoginChange::ChangePassword(credential.clone())),
                PasswordCheck::Unknown => Some(LoginChange::ReapplyPassword(credential.clone())),
            }
        })
        .collect()
}

/// Reads the logins of the cluster and applies every change needed for `desired`.
///
/// Each call to the session is retried on transient failures. A permanent failure aborts the
/// remaining changes, changes applied before it stay in place.
///
/// `is_cancelled` is checked before every change. Once it returns true the remaining changes are
/// reported as [`AppliedChanges::skipped`], a call that is already running is never interrupted.
pub async fn reconcile_logins<A>(
    session: &A,
    desired: &CredentialSet,
    retry: &RetryConfig,
    is_cancelled: impl Fn() -> bool,
) -> Result<AppliedChanges, Error>
where
    A: AuthSession + ?Sized,
{
    let actual = retry_transient(retry, "read logins", SessionError::is_transient, || {
        session.current_logins()
    })
    .await
    .context(ReadLoginsSnafu)?;

    let changes = {
        let (desired, actual) = (desired.clone(), actual.clone());
        tokio::task::spawn_blocking(move || plan_login_changes(&desired, &actual))
            .await
            .context(PlanChangesSnafu)?
    };
    let mut applied = AppliedChanges {
        unchanged: desired
            .iter()
            .map(|credential| &credential.username)
            .filter(|username| !changes.iter().any(|change| change.username() == *username))
            .cloned()
            .collect(),
        unmanaged: actual
            .keys()
            .filter(|username| !desired.contains(username))
            .cloned()
            .collect(),
        ..AppliedChanges::default()
    };

    if !applied.unmanaged.is_empty() {
        tracing::debug!(
            unmanaged = ?applied.unmanaged,
            "Leaving logins that are not managed by this cluster definition untouched"
        );
    }

    for (index, change) in changes.iter().enumerate() {
        if is_cancelled() {
            applied.skipped = changes[index..]
                .iter()
                .map(|change| change.username().to_string())
                .collect();
            tracing::info!(skipped = ?applied.skipped, "Cancelled, skipping remaining login changes");
            break;
        }

        let result = match change {
            LoginChange::Create(credential) => {
                tracing::info!(
                    username = %credential.username,
                    superuser = credential.superuser,
                    "Creating login"
                );
                retry_transient(retry, "create login", SessionError::is_transient, || {
                    session.create_login(credential)
                })
                .await
                .context(CreateLoginSnafu {
                    username: &credential.username,
                })
                .map(|()| applied.created.push(credential.username.clone()))
            }
            LoginChange::ChangePassword(credential) => {
                tracing::info!(username = %credential.username, "Changing login password");
                retry_transient(retry, "change password", SessionError::is_transient, || {
                    session.alter_login_password(&credential.username, &credential.password)
                })
                .await
                .context(ChangePasswordSnafu {
                    username: &credential.username,
                })
                .map(|()| applied.password_changed.push(credential.username.clone()))
            }
            LoginChange::ReapplyPassword(credential) => {
                tracing::debug!(
                    username = %credential.username,
                    "Writing login password again, its current hash cannot be read"
                );
                retry_transient(retry, "reapply password", SessionError::is_transient, || {
                    session.alter_login_password(&credential.username, &credential.password)
                })
                .await
                .context(ChangePasswordSnafu {
                    username: &credential.username,
                })
                .map(|()| applied.password_reapplied.push(credential.username.clone()))
            }
        };

        if let Err(err) = result {
            tracing::warn!(
                created = applied.created.len(),
                password_changed = applied.password_changed.len(),
                remaining = changes.len()
                    - applied.created.len()
                    - applied.password_changed.len()
                    - applied.password_reapplied.len(),
                "Aborting login changes"
            );
            return Err(err);
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::*;
    use crate::test_utils::FakeCluster;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn bob_and_joe() -> CredentialSet {
        CredentialSet::from_iter([
            Credential::new("bob", "bobber", true),
            Credential::new("joe", "password123", true),
        ])
    }

    #[test]
    fn login_without_hash_cannot_be_checked() {
        assert_eq!(
            Login::default().check_password("anything"),
            PasswordCheck::Unknown
        );
    }

    #[test]
    fn login_with_invalid_hash_accepts_nothing() {
        let login = Login {
            salted_hash: Some("not-a-bcrypt-hash".to_string()),
            ..Login::default()
        };

        assert_eq!(login.check_password("anything"), PasswordCheck::Differs);
    }

    #[test]
    fn login_with_hash_checks_password() {
        let login = FakeCluster::login("bobber", true);

        assert_eq!(login.check_password("bobber"), PasswordCheck::Matches);
        assert_eq!(login.check_password("other"), PasswordCheck::Differs);
    }

    #[test]
    fn plan_creates_missing_and_rotates_changed_passwords() {
        let desired = CredentialSet::from_iter([
            Credential::new("bob", "bobber", true),
            Credential::new("joe", "new-password", true),
            Credential::new("ann", "secret", false),
        ]);
        let actual = ClusterAuthState::from([
            ("bob".to_string(), FakeCluster::login("bobber", true)),
            ("joe".to_string(), FakeCluster::login("old-password", true)),
            ("cassandra".to_string(), FakeCluster::login("cassandra", true)),
            ("ann".to_string(), Login::default()),
        ]);

        let changes = plan_login_changes(&desired, &actual);

        assert_eq!(
            changes
                .iter()
                .map(|change| match change {
                    LoginChange::Create(c) => format!("create {}", c.username),
                    LoginChange::ChangePassword(c) => format!("rotate {}", c.username),
                    LoginChange::ReapplyPassword(c) => format!("reapply {}", c.username),
                })
                .collect::<Vec<_>>(),
            vec!["rotate joe", "reapply ann"]
        );
    }

    #[tokio::test]
    async fn creates_logins_that_authenticate() {
        let cluster = FakeCluster::default();

        let applied = reconcile_logins(&cluster, &bob_and_joe(), &retry(), || false)
            .await
            .unwrap();

        assert_eq!(applied.created, vec!["bob", "joe"]);
        assert!(cluster.authenticate("bob", "bobber").is_ok());
        assert!(cluster.authenticate("joe", "password123").is_ok());
        assert!(cluster.authenticate("bob", "notthepassword").is_err());
        assert!(cluster.is_superuser("bob"));
    }

    #[tokio::test]
    async fn second_pass_changes_nothing() {
        let cluster = FakeCluster::default();
        reconcile_logins(&cluster, &bob_and_joe(), &retry(), || false)
            .await
            .unwrap();
        let snapshot = cluster.snapshot();
        let calls = cluster.mutations.load(Ordering::SeqCst);

        let applied = reconcile_logins(&cluster, &bob_and_joe(), &retry(), || false)
            .await
            .unwrap();

        assert!(applied.is_noop());
        assert_eq!(applied.unchanged, vec!["bob", "joe"]);
        assert_eq!(cluster.snapshot(), snapshot);
        assert_eq!(cluster.mutations.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn rotated_password_is_applied() {
        let cluster = FakeCluster::default().with_login("bob", "old", true);

        let applied = reconcile_logins(&cluster, &bob_and_joe(), &retry(), || false)
            .await
            .unwrap();

        assert_eq!(applied.password_changed, vec!["bob"]);
        assert_eq!(applied.created, vec!["joe"]);
        assert!(cluster.authenticate("bob", "bobber").is_ok());
        assert!(cluster.authenticate("bob", "old").is_err());
    }

    #[tokio::test]
    async fn passwords_without_readable_hash_are_written_again() {
        let cluster = FakeCluster::default()
            .with_login("bob", "old", true)
            .with_login("joe", "password123", true)
            .without_hashes();

        let applied = reconcile_logins(&cluster, &bob_and_joe(), &retry(), || false)
            .await
            .unwrap();

        assert_eq!(applied.password_reapplied, vec!["bob", "joe"]);
        assert!(applied.unchanged.is_empty());
        assert!(applied.is_noop());
        assert!(cluster.authenticate("bob", "bobber").is_ok());
        assert!(cluster.authenticate("bob", "old").is_err());
        assert!(cluster.authenticate("joe", "password123").is_ok());
    }

    #[tokio::test]
    async fn unmanaged_logins_are_left_alone() {
        let cluster = FakeCluster::default()
            .with_login("cassandra", "cassandra", true)
            .with_login("reporting", "readonly", false);

        let applied = reconcile_logins(&cluster, &bob_and_joe(), &retry(), || false)
            .await
            .unwrap();

        assert_eq!(applied.unmanaged, vec!["cassandra", "reporting"]);
        assert!(cluster.authenticate("cassandra", "cassandra").is_ok());
        assert!(cluster.authenticate("reporting", "readonly").is_ok());
        assert!(!cluster.is_superuser("reporting"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let cluster = FakeCluster::default().failing_transiently(3);

        let applied = reconcile_logins(&cluster, &bob_and_joe(), &retry(), || false)
            .await
            .unwrap();

        assert_eq!(applied.created, vec!["bob", "joe"]);
        assert!(cluster.authenticate("joe", "password123").is_ok());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient() {
        let cluster = FakeCluster::default().failing_transiently(100);

        let error = reconcile_logins(&cluster, &bob_and_joe(), &retry(), || false)
            .await
            .unwrap_err();

        assert_eq!(error.class(), FailureClass::TransientConnection);
    }

    #[tokio::test]
    async fn permanent_failure_aborts_remaining_changes() {
        let desired = CredentialSet::from_iter([
            Credential::new("bob", "bobber", true),
            Credential::new("joe", "password123", true),
            Credential::new("ann", "secret", true),
        ]);
        let cluster = FakeCluster::default().rejecting("joe");

        let error = reconcile_logins(&cluster, &desired, &retry(), || false)
            .await
            .unwrap_err();

        assert_eq!(error.class(), FailureClass::PermanentError);
        assert!(matches!(&error, Error::CreateLogin { username, .. } if username == "joe"));
        // Changes before the failure stay applied, nothing after it is attempted
        assert!(cluster.authenticate("bob", "bobber").is_ok());
        assert!(cluster.authenticate("ann", "secret").is_err());
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_changes() {
        let cluster = FakeCluster::default();
        let checks = std::sync::atomic::AtomicUsize::new(0);

        // Cancelled right after the first change went through
        let applied = reconcile_logins(&cluster, &bob_and_joe(), &retry(), || {
            checks.fetch_add(1, Ordering::SeqCst) >= 1
        })
        .await
        .unwrap();

        assert_eq!(applied.created, vec!["bob"]);
        assert_eq!(applied.skipped, vec!["joe"]);
        assert!(cluster.authenticate("bob", "bobber").is_ok());
        assert!(cluster.authenticate("joe", "password123").is_err());
    }
}
