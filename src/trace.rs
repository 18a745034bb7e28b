use std::sync::{Mutex, Once};

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

const SERVICE_NAME: &str = "runq";

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber once.
///
/// `RUNQ_PERFETTO=<file>` adds a Perfetto layer at debug level. Otherwise
/// `OTEL_EXPORTER_OTLP_ENDPOINT` adds an OTLP span exporter. Log lines are
/// compact text or JSON depending on `log_format`.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let result = match log_format {
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .compact()
                    .with_filter(env_filter);
                init_with_fmt_layer(fmt_layer)
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(env_filter);
                init_with_fmt_layer(fmt_layer)
            }
        };
        init_result = Some(result);
    });
    init_result.unwrap_or(Ok(()))
}

fn init_with_fmt_layer<L>(fmt_layer: L) -> anyhow::Result<()>
where
    L: tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync + 'static,
{
    let base = tracing_subscriber::registry().with(fmt_layer);

    if let Some(path) = std::env::var_os("RUNQ_PERFETTO") {
        let file = std::fs::File::create(path)?;
        let perfetto_layer =
            tracing_perfetto::PerfettoLayer::new(Mutex::new(file)).with_filter(LevelFilter::DEBUG);
        base.with(perfetto_layer).try_init()?;
    } else if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        match opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .http()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                sdktrace::Config::default()
                    .with_resource(Resource::new(vec![KeyValue::new("service.name", SERVICE_NAME)])),
            )
            .install_batch(runtime::Tokio)
        {
            Ok(provider) => {
                let tracer = provider.tracer(SERVICE_NAME);
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                base.with(otel_layer).try_init()?;
            }
            Err(err) => {
                eprintln!("otlp init failed, falling back to fmt: {err}");
                base.try_init()?;
            }
        }
    } else {
        base.try_init()?;
    }
    Ok(())
}

/// Flush the OTLP exporter if one was installed.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Run an async test body with the text subscriber installed.
pub async fn with_test_tracing<F, Fut, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    // another harness may already own the global subscriber
    let _ = init(LogFormat::Text);
    f().await
}

/// Sync counterpart of [`with_test_tracing`].
pub fn with_test_tracing_sync<F, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let _ = init(LogFormat::Text);
    f()
}
