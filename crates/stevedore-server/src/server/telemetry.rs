//! Console logs are always on; `RUST_LOG` filters them (default `info`).
//!
//! With `tracing` and/or `metrics` the service also installs OpenTelemetry
//! providers for job spans and per-route request metrics. The providers only
//! export when `stdout` is enabled, which prints them to standard output.

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("'stdout' has nothing to export without 'tracing' or 'metrics'.");

use core::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{KeyValue, global};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics::SdkMeterProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace::SdkTracerProvider;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
const SERVICE_NAME: &str = "stevedore-server";

/// Providers that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    tracer: SdkTracerProvider,
    #[cfg(feature = "metrics")]
    meter: SdkMeterProvider,
}

impl TelemetryProviders {
    /// Errors go to stderr; the subscriber may already be torn down.
    pub fn shutdown(&self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer.shutdown() {
                eprintln!("Failed to shut down tracer provider: {err}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter.shutdown() {
                eprintln!("Failed to shut down meter provider: {err}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    let console = tracing_subscriber::fmt::layer()
        .with_thread_names(true)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339());

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(console);

    #[cfg(feature = "tracing")]
    let (registry, tracer) = {
        use opentelemetry::trace::TracerProvider as _;

        let provider = tracer_provider();
        global::set_tracer_provider(provider.clone());
        let layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME));
        (registry.with(layer), provider)
    };

    // Pools publish observable gauges on the global meter provider, so it
    // has to be installed before the pool manager opens.
    #[cfg(feature = "metrics")]
    let meter = {
        let provider = meter_provider();
        global::set_meter_provider(provider.clone());
        RequestMetrics::install();
        provider
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer,
        #[cfg(feature = "metrics")]
        meter,
    })
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build()
}

#[cfg(feature = "tracing")]
fn tracer_provider() -> SdkTracerProvider {
    let builder = SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_simple_exporter(opentelemetry_stdout::SpanExporter::default());

    builder.build()
}

#[cfg(feature = "metrics")]
fn meter_provider() -> SdkMeterProvider {
    let builder = SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_periodic_exporter(opentelemetry_stdout::MetricExporter::default());

    builder.build()
}

/// Instruments for job submissions received over HTTP, tagged by route and
/// outcome.
#[cfg(feature = "metrics")]
struct RequestMetrics {
    requests: Counter<u64>,
    duration_ms: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static REQUEST_METRICS: OnceLock<RequestMetrics> = OnceLock::new();

#[cfg(feature = "metrics")]
impl RequestMetrics {
    fn install() {
        let meter = global::meter(SERVICE_NAME);
        let _ = REQUEST_METRICS.set(Self {
            requests: meter
                .u64_counter("stevedore.http.requests")
                .with_description("Job submissions received over HTTP")
                .build(),
            duration_ms: meter
                .f64_histogram("stevedore.http.duration")
                .with_unit("ms")
                .with_description("Time from receiving a submission to answering it")
                .build(),
        });
    }
}

/// Counts one submission on `route` and how long it took to answer.
#[cfg(feature = "metrics")]
pub fn record_request(route: &'static str, elapsed: Duration, ok: bool) {
    let Some(metrics) = REQUEST_METRICS.get() else {
        return;
    };
    let attrs = [
        KeyValue::new("route", route),
        KeyValue::new("outcome", if ok { "ok" } else { "error" }),
    ];
    metrics.requests.add(1, &attrs);
    metrics
        .duration_ms
        .record(elapsed.as_secs_f64() * 1_000.0, &attrs);
}

#[cfg(not(feature = "metrics"))]
pub fn record_request(_route: &'static str, _elapsed: Duration, _ok: bool) {}
