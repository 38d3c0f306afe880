use std::fs;
use std::time::Instant;

use anyhow::{Context as _, Result};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::{TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::config::LoggerSettings;

const SERVICE_NAME: &str = "slackmux";

fn resource(role: &str) -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attribute(KeyValue::new("slackmux.role", role.to_string()))
        .build()
}

/// OTLP-HTTP providers for logs, traces and metrics.
struct OtelProviders {
    logs: SdkLoggerProvider,
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
}

impl OtelProviders {
    fn init(role: &str, endpoint: &str) -> Result<Self> {
        let base = endpoint.trim_end_matches('/');
        let logs = LogExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{base}/v1/logs"))
            .build()
            .context("building the OTLP log exporter")?;
        let spans = SpanExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{base}/v1/traces"))
            .build()
            .context("building the OTLP span exporter")?;
        let metrics = MetricExporter::builder()
            .with_http()
            .with_protocol(Protocol::HttpBinary)
            .with_endpoint(format!("{base}/v1/metrics"))
            .build()
            .context("building the OTLP metric exporter")?;

        Ok(Self {
            logs: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource(role))
                .build(),
            traces: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource(role))
                .build(),
            metrics: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource(role))
                .build(),
        })
    }
}

fn filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("invalid log level `{level}`"))
}

/// Logging plus request metrics for one process.
pub struct Telemetry {
    otel: Option<OtelProviders>,
    requests_started: Counter<u64>,
    requests_succeeded: Counter<u64>,
    requests_failed: Counter<u64>,
    request_latency_ms: Histogram<f64>,
}

impl Telemetry {
    /// Install the global subscriber: stderr, a daily rolling file named
    /// `{role}-{file}`, the optional JSON request log and, with an endpoint,
    /// an OTLP bridge. Stdout stays untouched; workers talk on it.
    pub fn init(role: &str, settings: &LoggerSettings) -> Result<Self> {
        fs::create_dir_all(&settings.dir)
            .with_context(|| format!("creating log directory {}", settings.dir.display()))?;

        let txt_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(format!("{role}-{}", settings.file))
            .build(&settings.dir)
            .context("opening the log file")?;
        let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

        let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_thread_names(true);

        let json_layer = if settings.json {
            let json_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(format!("{role}-requests.json"))
                .build(&settings.dir)
                .context("opening the request log")?;
            Some(
                fmt::layer()
                    .json()
                    .with_writer(json_appender)
                    .with_target(true)
                    .with_filter(EnvFilter::new("request=info")),
            )
        } else {
            None
        };

        let otel = match settings.otel_endpoint.as_deref() {
            Some(endpoint) => Some(OtelProviders::init(role, endpoint)?),
            None => None,
        };
        let otel_layer = match &otel {
            Some(providers) => {
                let quiet = filter(&settings.level)?
                    .add_directive("hyper=off".parse()?)
                    .add_directive("tonic=off".parse()?)
                    .add_directive("h2=off".parse()?)
                    .add_directive("reqwest=off".parse()?);
                Some(OpenTelemetryTracingBridge::new(&providers.logs).with_filter(quiet))
            }
            None => None,
        };

        Registry::default()
            .with(filter(&settings.level)?)
            .with(stderr_layer)
            .with(txt_layer)
            .with(json_layer)
            .with(otel_layer)
            .try_init()
            .context("installing the tracing subscriber")?;

        if let Some(providers) = &otel {
            global::set_tracer_provider(providers.traces.clone());
            global::set_meter_provider(providers.metrics.clone());
        }
        Ok(Self::with_providers(otel))
    }

    /// Metrics against whatever global meter is installed; no subscriber.
    pub fn noop() -> Self {
        Self::with_providers(None)
    }

    fn with_providers(otel: Option<OtelProviders>) -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            otel,
            requests_started: meter
                .u64_counter("requests_started")
                .with_description("Total requests started")
                .build(),
            requests_succeeded: meter.u64_counter("requests_succeeded").build(),
            requests_failed: meter.u64_counter("requests_failed").build(),
            request_latency_ms: meter
                .f64_histogram("request_latency_ms")
                .with_description("Latency per request in ms")
                .with_unit("ms")
                .build(),
        }
    }

    /// Run `handler` inside a span, counting and timing it. Emits one
    /// `target: "request"` event with the outcome.
    pub async fn instrument_request<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attrs = [KeyValue::new("request", name.to_string())];
        self.requests_started.add(1, &attrs);
        let start = Instant::now();

        use opentelemetry::trace::FutureExt as _;

        let span = global::tracer(SERVICE_NAME).start(name.to_string());
        let cx = Context::current_with_span(span);
        let result = handler().with_context(cx).await;

        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
        self.request_latency_ms.record(elapsed, &attrs);
        match &result {
            Ok(_) => {
                self.requests_succeeded.add(1, &attrs);
                info!("request `{name}` succeeded in {elapsed:.1} ms");
            }
            Err(err) => {
                self.requests_failed.add(1, &attrs);
                error!(error = %err, "request `{name}` failed in {elapsed:.1} ms");
            }
        }
        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request = name,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );
        result
    }

    /// Flush exporters. Call once before exit.
    pub fn shutdown(&self) {
        let Some(otel) = &self.otel else {
            return;
        };
        if let Err(e) = otel.traces.shutdown() {
            warn!(error = %e, "tracer provider shutdown failed");
        }
        if let Err(e) = otel.metrics.shutdown() {
            warn!(error = %e, "meter provider shutdown failed");
        }
        if let Err(e) = otel.logs.shutdown() {
            warn!(error = %e, "logger provider shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instrument_request_passes_results_through() {
        let telemetry = Telemetry::noop();
        let ok: Result<u32, String> = telemetry.instrument_request("ok", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let failed: Result<u32, String> = telemetry
            .instrument_request("failed", || async { Err("boom".to_string()) })
            .await;
        assert_eq!(failed, Err("boom".to_string()));
    }

    #[test]
    fn bad_level_is_rejected() {
        assert!(filter("slackmux=loud").is_err());
        assert!(filter("debug").is_ok());
    }
}
