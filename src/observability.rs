//! Facilities for observing runtime behavior
#![warn(missing_docs, clippy::missing_docs_in_private_items)]

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use once_cell::sync::Lazy;
use opentelemetry::{
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use strum::AsRefStr;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::{
    config::{Config, LogFormat},
    error,
};

/// Globally accessible metrics state
pub(crate) static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Initialize observability
pub(crate) fn init(config: &Config) -> Result<(), error::Observability> {
    let config = &config.observability.logs;

    let fmt_layer = tracing_subscriber::fmt::Layer::new()
        .with_ansi(config.colors);
    let fmt_layer = match config.format {
        LogFormat::Pretty => fmt_layer.pretty().boxed(),
        LogFormat::Full => {
            if config.timestamp {
                fmt_layer.boxed()
            } else {
                fmt_layer.without_time().boxed()
            }
        }
        LogFormat::Compact => {
            if config.timestamp {
                fmt_layer.compact().boxed()
            } else {
                fmt_layer.compact().without_time().boxed()
            }
        }
        LogFormat::Json => fmt_layer.json().boxed(),
    };

    let subscriber = Registry::default()
        .with(fmt_layer.with_filter(EnvFilter::try_new(&config.filter)?));
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// Construct the standard [`Resource`] value to use for this service
fn standard_resource() -> Resource {
    Resource::default().merge(&Resource::new([KeyValue::new(
        "service.name",
        env!("CARGO_PKG_NAME"),
    )]))
}

/// Whether a coalesced call did the work itself or waited for another
#[derive(Clone, Copy, Debug, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum CoordinatorRole {
    /// First caller for a key, runs the operation
    Leader,
    /// Later caller for a key, waits for the leader's outcome
    Follower,
}

/// Holds state relating to metrics
pub(crate) struct Metrics {
    /// Internal state for OpenTelemetry metrics
    ///
    /// We never directly read from [`SdkMeterProvider`], but it needs to
    /// outlive all calls to `self.otel_state.0.gather()`, otherwise
    /// metrics collection will fail.
    otel_state: (prometheus::Registry, SdkMeterProvider),

    /// Histogram of HTTP request durations
    http_requests_histogram: Histogram<f64>,

    /// Counts calls into each request coordinator by role
    coordinator_calls: Counter<u64>,
}

impl Metrics {
    /// Initializes metric-collecting and exporting facilities
    fn new() -> Self {
        // Set up OpenTelemetry state
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .expect("exporter configuration should be valid");
        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .with_resource(standard_resource())
            .build();
        let meter = provider.meter(env!("CARGO_PKG_NAME"));

        let http_requests_histogram = meter
            .f64_histogram("http.requests")
            .with_description("Duration of HTTP requests in seconds")
            .init();

        let coordinator_calls = meter
            .u64_counter("coordinator.calls")
            .with_description("Calls into request coordinators")
            .init();

        Metrics {
            otel_state: (registry, provider),
            http_requests_histogram,
            coordinator_calls,
        }
    }

    /// Export metrics to a string suitable for consumption by e.g. Prometheus
    pub(crate) fn export(&self) -> String {
        prometheus::TextEncoder::new()
            .encode_to_string(&self.otel_state.0.gather())
            .expect("should be able to encode metrics")
    }

    /// Record a call into the coordinator called `name`
    pub(crate) fn record_coordinator_call(
        &self,
        name: &'static str,
        role: CoordinatorRole,
    ) {
        self.coordinator_calls.add(
            1,
            &[
                KeyValue::new("name", name),
                KeyValue::new("role", role.as_ref().to_owned()),
            ],
        );
    }
}

/// Track HTTP metrics by converting this into an [`axum`] layer
pub(crate) async fn http_metrics_layer(req: Request, next: Next) -> Response {
    /// Routes that should not be included in the metrics
    const IGNORED_ROUTES: &[&str] = &["/metrics"];

    let matched_path =
        req.extensions().get::<MatchedPath>().map(|x| x.as_str().to_owned());

    let method = req.method().to_string();

    match matched_path {
        // Run the next layer if the route should be ignored
        Some(matched_path)
            if IGNORED_ROUTES.contains(&matched_path.as_str()) =>
        {
            next.run(req).await
        }

        // Run the next layer if the route is unknown
        None => next.run(req).await,

        // Otherwise, run the next layer and record metrics
        Some(matched_path) => {
            let start = Instant::now();
            let resp = next.run(req).await;
            let elapsed = start.elapsed();

            let status_code = resp.status().as_str().to_owned();

            let attrs = &[
                KeyValue::new("method", method),
                KeyValue::new("path", matched_path),
                KeyValue::new("status_code", status_code),
            ];

            METRICS
                .http_requests_histogram
                .record(elapsed.as_secs_f64(), attrs);

            resp
        }
    }
}
