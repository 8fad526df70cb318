use std::collections::BTreeMap;

use super::{
    Credential, CredentialSourceRef, DuplicateUsernameSnafu, Error, SecretSource,
    resolve_credential,
};

/// The credentials a cluster should have, in the order their sources are declared.
///
/// Usernames are unique within a set.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CredentialSet(Vec<Credential>);

impl CredentialSet {
    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.0.iter()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.0.iter().any(|credential| credential.username == username)
    }

    pub fn usernames(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|credential| credential.username.clone())
            .collect()
    }
}

#[cfg(test)]
impl FromIterator<Credential> for CredentialSet {
    fn from_iter<I: IntoIterator<Item = Credential>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CredentialSet {
    type IntoIter = std::slice::Iter<'a, Credential>;
    type Item = &'a Credential;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Resolves all credential sources of a cluster into one [`CredentialSet`].
///
/// Either every source resolves or the whole build fails, a partially resolved set is never
/// returned. Two sources providing the same username fail with [`Error::DuplicateUsername`].
pub async fn build_credential_set<S>(
    source: &S,
    secret_refs: &[CredentialSourceRef],
) -> Result<CredentialSet, Error>
where
    S: SecretSource + ?Sized,
{
    let mut credentials = Vec::with_capacity(secret_refs.len());
    let mut origins = BTreeMap::<String, &CredentialSourceRef>::new();

    for secret_ref in secret_refs {
        let credential = resolve_credential(source, secret_ref).await?;
        if let Some(first) = origins.insert(credential.username.clone(), secret_ref) {
            return DuplicateUsernameSnafu {
                username: credential.username,
                first: first.clone(),
                second: secret_ref.clone(),
            }
            .fail();
        }
        credentials.push(credential);
    }

    tracing::debug!(
        credentials = credentials.len(),
        "Built desired credential set"
    );
    Ok(CredentialSet(credentials))
}
