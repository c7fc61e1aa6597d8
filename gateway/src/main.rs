mod config;

use clap::{Args, Parser};
use config::{CommonConfig, Config, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::describe_metrics;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
enum CliCommand {
    /// Run the routing gateway
    Proxy(ConfigArgs),
    /// Load and validate a config file, then exit
    CheckConfig(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(long)]
    config_file: PathBuf,
}

fn main() {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::Proxy(args) => {
            let config = load_config(&args.config_file);
            let _sentry = init_logging(config.common.logging.as_ref());
            init_metrics(&config.common);
            tracing::info!(config_file = %args.config_file.display(), "starting proxy");

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "could not start runtime");
                    process::exit(1);
                }
            };
            if let Err(e) = runtime.block_on(proxy::run(config.proxy)) {
                tracing::error!(error = %e, "proxy exited");
                process::exit(1);
            }
        }
        CliCommand::CheckConfig(args) => {
            load_config(&args.config_file);
            println!("{}: ok", args.config_file.display());
        }
    }
}

fn load_config(path: &std::path::Path) -> Config {
    match Config::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            process::exit(1);
        }
    }
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = logging.map_or("info", |l| l.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let guard = logging
        .and_then(|l| l.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(common: &CommonConfig) {
    let Some(MetricsConfig {
        statsd_host,
        statsd_port,
        prefix,
    }) = &common.metrics
    else {
        return;
    };

    let recorder = match StatsdBuilder::from(statsd_host.as_str(), *statsd_port)
        .build(Some(prefix.as_str()))
    {
        Ok(recorder) => recorder,
        Err(e) => {
            tracing::error!(error = %e, "could not create statsd recorder, metrics disabled");
            return;
        }
    };
    if metrics::set_global_recorder(recorder).is_err() {
        tracing::error!("metrics recorder already installed");
        return;
    }

    describe_metrics!(proxy::metrics_defs::ALL_METRICS);
    describe_metrics!(query_cache::metrics_defs::ALL_METRICS);
}
