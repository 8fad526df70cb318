//! One credential reconciliation pass: resolve the desired logins, wait for the cluster, apply.
//!
//! A pass keeps no state between runs. Everything it needs is derived from the cluster definition
//! and the referenced Secrets, so a pass that failed or got interrupted is simply run again.

use std::time::Duration;

use snafu::{ResultExt, Snafu, ensure};

use crate::{
    auth::{self, AppliedChanges, AuthSession, reconcile_logins},
    credentials::{self, CredentialSourceRef, SecretSource, build_credential_set},
    crd::{FailureClass, ReconcilePhase},
    readiness::{self, HealthSource, ReadinessStatus, await_ready},
    retry::RetryConfig,
};

#[derive(Clone, Debug, PartialEq)]
pub struct PassSettings {
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub login_retry: RetryConfig,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(120),
            readiness_poll_interval: Duration::from_secs(5),
            login_retry: RetryConfig::default(),
        }
    }
}

impl ReconcilePhase {
    /// Neither `Settled` nor `Failed` is final, the next trigger starts over with `Resolving`.
    pub fn can_transition_to(self, next: ReconcilePhase) -> bool {
        use ReconcilePhase::*;

        matches!(
            (self, next),
            (Idle | Settled | Failed, Resolving)
                | (Resolving, Gating)
                | (Gating, Applying)
                | (Applying, Settled)
                | (Resolving | Gating | Applying, Failed)
        )
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve the desired credentials"))]
    ResolveCredentials { source: credentials::Error },

    #[snafu(display("cluster is not ready for login changes"))]
    AwaitReadiness { source: readiness::Error },

    #[snafu(display("failed to apply login changes"))]
    ApplyLogins { source: auth::Error },

    #[snafu(display("pass was cancelled while {phase}"))]
    Cancelled { phase: ReconcilePhase },

    #[snafu(display("invalid phase transition from {from} to {to}"))]
    InvalidTransition {
        from: ReconcilePhase,
        to: ReconcilePhase,
    },
}

impl Error {
    /// The class reported in the cluster status. Cancellation is not a failure and has no class.
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            Error::ResolveCredentials { source } => Some(source.class()),
            Error::AwaitReadiness { source } => Some(source.class()),
            Error::ApplyLogins { source } => Some(source.class()),
            Error::Cancelled { .. } => None,
            Error::InvalidTransition { .. } => Some(FailureClass::PermanentError),
        }
    }
}

/// Outcome of a pass that reached [`ReconcilePhase::Settled`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PassReport {
    /// Usernames of the desired credential set, in declaration order.
    pub usernames: Vec<String>,
    pub readiness: ReadinessStatus,
    pub changes: AppliedChanges,
}

pub struct CredentialsPass<'a, S: ?Sized, H: ?Sized, A: ?Sized> {
    secrets: &'a S,
    health: &'a H,
    session: &'a A,
    settings: &'a PassSettings,
    phase: ReconcilePhase,
}

impl<'a, S, H, A> CredentialsPass<'a, S, H, A>
where
    S: SecretSource + ?Sized,
    H: HealthSource + ?Sized,
    A: AuthSession + ?Sized,
{
    pub fn new(secrets: &'a S, health: &'a H, session: &'a A, settings: &'a PassSettings) -> Self {
        Self {
            secrets,
            health,
            session,
            settings,
            phase: ReconcilePhase::Idle,
        }
    }

    pub fn phase(&self) -> ReconcilePhase {
        self.phase
    }

    /// Runs the pass to completion. On error the pass ends in [`ReconcilePhase::Failed`], or stays
    /// in the phase it was in when it got cancelled.
    ///
    /// `is_cancelled` is checked between phases and between login changes.
    pub async fn run(
        &mut self,
        sources: &[CredentialSourceRef],
        is_cancelled: impl Fn() -> bool,
    ) -> Result<PassReport, Error> {
        let result = self.run_phases(sources, &is_cancelled).await;
        if let Err(err) = &result {
            if err.class().is_some() && self.phase != ReconcilePhase::Failed {
                self.transition(ReconcilePhase::Failed)?;
            }
        }
        result
    }

    async fn run_phases(
        &mut self,
        sources: &[CredentialSourceRef],
        is_cancelled: &impl Fn() -> bool,
    ) -> Result<PassReport, Error> {
        self.transition(ReconcilePhase::Resolving)?;
        let desired = build_credential_set(self.secrets, sources)
            .await
            .context(ResolveCredentialsSnafu)?;
        self.check_cancelled(is_cancelled)?;

        self.transition(ReconcilePhase::Gating)?;
        let readiness = await_ready(
            self.health,
            self.settings.readiness_timeout,
            self.settings.readiness_poll_interval,
        )
        .await
        .context(AwaitReadinessSnafu)?;
        self.check_cancelled(is_cancelled)?;

        self.transition(ReconcilePhase::Applying)?;
        let changes = reconcile_logins(
            self.session,
            &desired,
            &self.settings.login_retry,
            is_cancelled,
        )
        .await
        .context(ApplyLoginsSnafu)?;
        ensure!(
            changes.skipped.is_empty(),
            CancelledSnafu { phase: self.phase }
        );

        self.transition(ReconcilePhase::Settled)?;

        Ok(PassReport {
            usernames: desired.usernames(),
            readiness,
            changes,
        })
    }

    fn check_cancelled(&self, is_cancelled: &impl Fn() -> bool) -> Result<(), Error> {
        ensure!(!is_cancelled(), CancelledSnafu { phase: self.phase });
        Ok(())
    }

    fn transition(&mut self, next: ReconcilePhase) -> Result<(), Error> {
        ensure!(
            self.phase.can_transition_to(next),
            InvalidTransitionSnafu {
                from: self.phase,
                to: next,
            }
        );
        tracing::debug!(from = %self.phase, to = %next, "Entering phase");
        self.phase = next;
        Ok(())
    }
}
