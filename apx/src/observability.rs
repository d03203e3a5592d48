use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("could not install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
    #[error("could not build statsd recorder: {0}")]
    Statsd(String),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}

/// Installs the tracing subscriber, plus the Sentry client when a DSN is
/// configured. The returned guard must outlive the runtime so pending events
/// are flushed on exit.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<Option<sentry::ClientInitGuard>, ObservabilityError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                environment: config.environment.clone().map(Into::into),
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
        .try_init()?;

    Ok(guard)
}

pub fn init_metrics(config: &MetricsConfig) -> Result<(), ObservabilityError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(&config.prefix))
        .map_err(|e| ObservabilityError::Statsd(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|_| ObservabilityError::RecorderInstalled)?;

    for defs in [
        signing::metrics_defs::ALL_METRICS,
        policy_store::metrics_defs::ALL_METRICS,
        executor::metrics_defs::ALL_METRICS,
    ] {
        shared::metrics_defs::describe_all(defs);
    }
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        prefix = %config.prefix,
        "statsd metrics enabled"
    );
    Ok(())
}
