//! Superuser credentials read from user managed Secrets.
//!
//! Credentials only ever live for the duration of one reconciliation pass. They are rebuilt from
//! the referenced Secrets every time, as those Secrets can be rotated at any point.

use std::{fmt, string::FromUtf8Error};

use snafu::Snafu;
use stackable_operator::kube;

use crate::crd::FailureClass;

mod resolver;
mod set;

pub use resolver::{SecretSource, resolve_credential};
pub use set::{CredentialSet, build_credential_set};

/// Pointer to a Secret providing one superuser login.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CredentialSourceRef {
    pub namespace: String,
    pub name: String,

    /// Superuser flag declared next to the reference, used when the Secret itself has none.
    pub superuser: Option<bool>,
}

impl fmt::Display for CredentialSourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub superuser: bool,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>, superuser: bool) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            superuser,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("superuser", &self.superuser)
            .finish()
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("credentials Secret {secret} does not exist"))]
    NotFound { secret: CredentialSourceRef },

    #[snafu(display("access to credentials Secret {secret} was denied"))]
    AccessDenied { secret: CredentialSourceRef },

    #[snafu(display("failed to retrieve credentials Secret {secret}"))]
    RetrieveSecret {
        source: kube::Error,
        secret: CredentialSourceRef,
    },

    #[snafu(display("credentials Secret {secret} is malformed"))]
    MalformedSecret {
        source: MalformedSecretError,
        secret: CredentialSourceRef,
    },

    #[snafu(display(
        "credentials Secrets {first} and {second} both provide the username {username:?}"
    ))]
    DuplicateUsername {
        username: String,
        first: CredentialSourceRef,
        second: CredentialSourceRef,
    },
}

impl Error {
    pub fn class(&self) -> FailureClass {
        match self {
            Error::NotFound { .. } => FailureClass::NotFound,
            Error::AccessDenied { .. } => FailureClass::AccessDenied,
            Error::RetrieveSecret { .. } => FailureClass::TransientConnection,
            Error::MalformedSecret { .. } => FailureClass::MalformedSecret,
            Error::DuplicateUsername { .. } => FailureClass::DuplicateUsername,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MalformedSecretError {
    #[snafu(display("the key {key:?} is missing"))]
    MissingKey { key: &'static str },

    #[snafu(display("the value of {key:?} is empty"))]
    EmptyValue { key: &'static str },

    #[snafu(display("the value of {key:?} is not valid UTF-8"))]
    NotUtf8 {
        source: FromUtf8Error,
        key: &'static str,
    },

    #[snafu(display("the value of {key:?} must be \"true\" or \"false\", but is {value:?}"))]
    InvalidFlag { key: &'static str, value: String },
}
