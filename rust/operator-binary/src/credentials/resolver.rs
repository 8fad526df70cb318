use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, ensure};
use stackable_operator::k8s_openapi::api::core::v1::Secret;

use super::{
    Credential, CredentialSourceRef, EmptyValueSnafu, Error, InvalidFlagSnafu,
    MalformedSecretError, MalformedSecretSnafu, MissingKeySnafu, NotUtf8Snafu,
};
use crate::crd::{SECRET_PASSWORD_KEY, SECRET_SUPERUSER_KEY, SECRET_USERNAME_KEY};

/// Read access to the Secrets referenced by a cluster.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetches the referenced Secret, failing with [`Error::NotFound`] if it does not exist and
    /// [`Error::AccessDenied`] if the operator may not read it.
    async fn get_secret(&self, secret: &CredentialSourceRef) -> Result<Secret, Error>;
}

/// Resolves a single credential source to the credential it holds.
///
/// The Secret is untrusted input: a missing or empty `username` or `password` is reported as
/// [`Error::MalformedSecret`] and never defaulted.
pub async fn resolve_credential<S>(
    source: &S,
    secret_ref: &CredentialSourceRef,
) -> Result<Credential, Error>
where
    S: SecretSource + ?Sized,
{
    let secret = source.get_secret(secret_ref).await?;
    parse_credential(secret_ref, &secret).context(MalformedSecretSnafu {
        secret: secret_ref.clone(),
    })
}

fn parse_credential(
    secret_ref: &CredentialSourceRef,
    secret: &Secret,
) -> Result<Credential, MalformedSecretError> {
    let username = required_value(secret, SECRET_USERNAME_KEY)?;
    let password = required_value(secret, SECRET_PASSWORD_KEY)?;
    let superuser = match secret_value(secret, SECRET_SUPERUSER_KEY)? {
        Some(flag) => parse_flag(SECRET_SUPERUSER_KEY, &flag)?,
        None => secret_ref.superuser.unwrap_or(true),
    };

    Ok(Credential {
        username,
        password,
        superuser,
    })
}

fn required_value(secret: &Secret, key: &'static str) -> Result<String, MalformedSecretError> {
    let value = secret_value(secret, key)?.context(MissingKeySnafu { key })?;
    ensure!(!value.is_empty(), EmptyValueSnafu { key });
    Ok(value)
}

// `data` is what the API server returns, `stringData` only shows up on objects that were
// never round-tripped through it.
fn secret_value(secret: &Secret, key: &'static str) -> Result<Option<String>, MalformedSecretError> {
    if let Some(value) = secret.data.as_ref().and_then(|data| data.get(key)) {
        return String::from_utf8(value.0.clone())
            .map(Some)
            .context(NotUtf8Snafu { key });
    }

    Ok(secret
        .string_data
        .as_ref()
        .and_then(|string_data| string_data.get(key))
        .cloned())
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, MalformedSecretError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => InvalidFlagSnafu { key, value }.fail(),
    }
}
