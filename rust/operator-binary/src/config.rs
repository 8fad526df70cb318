//! Command line options of the `run` subcommand.

use clap::Args;
use stackable_operator::{cli::RunArguments, shared::time::Duration};

use crate::{crd::FailureClass, driver::PassSettings, retry::RetryConfig};

#[derive(Debug, PartialEq, Eq, clap::Parser)]
pub struct RunArgs {
    #[command(flatten)]
    pub credentials: CredentialsOptions,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub common: RunArguments,
}

/// Timing of the credential reconciliation.
#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Credentials Options")]
pub struct CredentialsOptions {
    /// Interval after which a settled cluster is checked again, so that rotated Secrets are
    /// picked up even without a watch event.
    #[arg(long, env, default_value = "60s")]
    pub reconcile_interval: Duration,

    /// How long a pass waits for all Cassandra nodes to become ready.
    #[arg(long, env, default_value = "120s")]
    pub readiness_timeout: Duration,

    #[arg(long, env, default_value = "5s")]
    pub readiness_poll_interval: Duration,

    /// Attempts per login change, including the first one.
    #[arg(long, env, default_value_t = 5)]
    pub login_max_attempts: u32,

    #[arg(long, env, default_value = "500ms")]
    pub login_initial_backoff: Duration,

    /// Upper bound for the delay between two attempts of a login change.
    #[arg(long, env, default_value = "30s")]
    pub login_max_backoff: Duration,

    /// Timeout of a single request to the Cassandra management API.
    #[arg(long, env, default_value = "10s")]
    pub management_api_timeout: Duration,

    /// Requeue interval after a pass failed because of a missing or invalid Secret.
    #[arg(long, env, default_value = "60s")]
    pub config_error_requeue: Duration,

    /// Requeue interval after a pass failed because the cluster was unreachable or not ready.
    #[arg(long, env, default_value = "10s")]
    pub backoff_requeue: Duration,
}

/// Settings shared by all reconciliations, derived from [`CredentialsOptions`].
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorSettings {
    pub reconcile_interval: std::time::Duration,
    pub pass: PassSettings,
    pub management_api_timeout: std::time::Duration,
    pub config_error_requeue: std::time::Duration,
    pub backoff_requeue: std::time::Duration,
}

impl OperatorSettings {
    /// Interval after which a failed pass is retried.
    pub fn requeue_for(&self, class: FailureClass) -> std::time::Duration {
        if class.is_configuration_error() {
            self.config_error_requeue
        } else {
            self.backoff_requeue
        }
    }
}

impl From<&CredentialsOptions> for OperatorSettings {
    fn from(options: &CredentialsOptions) -> Self {
        Self {
            reconcile_interval: *options.reconcile_interval,
            pass: PassSettings {
                readiness_timeout: *options.readiness_timeout,
                readiness_poll_interval: *options.readiness_poll_interval,
                login_retry: RetryConfig {
                    max_attempts: options.login_max_attempts.max(1),
                    initial_delay: *options.login_initial_backoff,
                    max_delay: *options.login_max_backoff,
                    ..RetryConfig::default()
                },
            },
            management_api_timeout: *options.management_api_timeout,
            config_error_requeue: *options.config_error_requeue,
            backoff_requeue: *options.backoff_requeue,
        }
    }
}
