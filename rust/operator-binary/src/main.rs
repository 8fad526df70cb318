// TODO: Look into how to properly resolve `clippy::large_enum_variant`.
// This will need changes in our and upstream error types.
#![allow(clippy::result_large_err)]

mod auth;
mod config;
mod controller;
mod crd;
mod credentials;
mod driver;
mod kube_sources;
mod management_api;
mod readiness;
mod retry;
mod status;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use clap::Parser;
use futures::{FutureExt, StreamExt};
use stackable_operator::{
    YamlSchema,
    cli::{Command, RunArguments},
    eos::EndOfSupportChecker,
    k8s_openapi::api::core::v1::Secret,
    kube::{
        ResourceExt,
        core::DeserializeGuard,
        runtime::{
            Controller,
            events::{Recorder, Reporter},
            reflector::ObjectRef,
            watcher,
        },
    },
    logging::controller::report_controller_reconciled,
    shared::yaml::SerializeOptions,
    telemetry::Tracing,
    utils::signal::SignalWatcher,
};

use crate::{
    config::{OperatorSettings, RunArgs},
    controller::CASSANDRA_FULL_CONTROLLER_NAME,
    crd::{CassandraCluster, CassandraClusterVersion, v1alpha1},
};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const OPERATOR_NAME: &str = "cassandra.stackable.tech";

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<RunArgs>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => CassandraCluster::merged_crd(CassandraClusterVersion::V1Alpha1)?
            .print_yaml_schema(built_info::PKG_VERSION, SerializeOptions::default())?,
        Command::Run(RunArgs {
            credentials,
            common:
                RunArguments {
                    operator_environment: _,
                    product_config: _,
                    watch_namespace,
                    maintenance,
                    common,
                },
        }) => {
            // Log levels are set via `CONSOLE_LOG` and `FILE_LOG`, the file log directory via
            // `ROLLING_LOGS_DIR` (or `--rolling-logs <DIRECTORY>`).
            let _tracing_guard =
                Tracing::pre_configured(built_info::PKG_NAME, common.telemetry).init()?;

            tracing::info!(
                built_info.pkg_version = built_info::PKG_VERSION,
                built_info.git_version = built_info::GIT_VERSION,
                built_info.target = built_info::TARGET,
                built_info.built_time_utc = built_info::BUILT_TIME_UTC,
                built_info.rustc_version = built_info::RUSTC_VERSION,
                "Starting {description}",
                description = built_info::PKG_DESCRIPTION
            );

            let settings = OperatorSettings::from(&credentials);
            tracing::info!(?settings, "Using credentials settings");

            // Watches for the SIGTERM signal and sends a signal to all receivers, which gracefully
            // shuts down all concurrent tasks below (EoS checker, controller).
            let sigterm_watcher = SignalWatcher::sigterm()?;

            let eos_checker =
                EndOfSupportChecker::new(built_info::BUILT_TIME_UTC, maintenance.end_of_support)?
                    .run(sigterm_watcher.handle())
                    .map(anyhow::Ok);

            let client = stackable_operator::client::initialize_operator(
                Some(OPERATOR_NAME.to_string()),
                &common.cluster_info,
            )
            .await?;
            let http = reqwest::Client::builder()
                .timeout(settings.management_api_timeout)
                .build()?;
            let event_recorder = Arc::new(Recorder::new(
                client.as_kube_client(),
                Reporter {
                    controller: CASSANDRA_FULL_CONTROLLER_NAME.to_string(),
                    instance: None,
                },
            ));

            let cassandra_controller = Controller::new(
                watch_namespace.get_api::<DeserializeGuard<v1alpha1::CassandraCluster>>(&client),
                watcher::Config::default(),
            );
            let cassandra_store = cassandra_controller.store();
            let secret_store = cassandra_store.clone();
            // Referenced Secrets outside of the watched namespace are only re-read on requeue
            let cassandra_controller = cassandra_controller
                .watches(
                    watch_namespace.get_api::<DeserializeGuard<Secret>>(&client),
                    watcher::Config::default(),
                    move |secret| {
                        secret_store
                            .state()
                            .into_iter()
                            .filter(move |cassandra| references_secret(cassandra, &secret))
                            .map(|cassandra| ObjectRef::from_obj(&*cassandra))
                    },
                )
                .graceful_shutdown_on(sigterm_watcher.handle())
                .run(
                    controller::reconcile_cassandra,
                    controller::error_policy,
                    Arc::new(controller::Ctx {
                        client: client.clone(),
                        http,
                        settings,
                        clusters: cassandra_store,
                    }),
                )
                // We can let the reporting happen in the background
                .for_each_concurrent(
                    16, // concurrency limit
                    |result| {
                        // The event_recorder needs to be shared across all invocations, so that
                        // events are correctly aggregated
                        let event_recorder = event_recorder.clone();
                        async move {
                            report_controller_reconciled(
                                &event_recorder,
                                CASSANDRA_FULL_CONTROLLER_NAME,
                                &result,
                            )
                            .await;
                        }
                    },
                )
                .map(anyhow::Ok);

            futures::try_join!(cassandra_controller, eos_checker)?;
        }
    }

    Ok(())
}

fn references_secret(
    cassandra: &DeserializeGuard<v1alpha1::CassandraCluster>,
    secret: &DeserializeGuard<Secret>,
) -> bool {
    let Ok(cassandra) = &cassandra.0 else {
        return false;
    };

    match secret.namespace() {
        Some(namespace) => cassandra.references_secret(&namespace, &secret.name_any()),
        None => false,
    }
}
