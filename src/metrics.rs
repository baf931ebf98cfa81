//! Observability hooks
//!
//! - feature `metrics`: a lazily initialised global [`METRICS`] registry with
//!   OpenTelemetry instruments exported through Prometheus.
//! - feature `tracing`: span constructors in [`tracing_helpers`].

#[cfg(feature = "metrics")]
pub use self::prometheus_metrics::{DriftguardMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram, MeterProvider},
    };
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<DriftguardMetrics> = Lazy::new(DriftguardMetrics::init);

    pub struct DriftguardMetrics {
        pub registry: Registry,
        _provider: Option<SdkMeterProvider>,
        pub migrations_applied: Counter<u64>,
        pub migrations_failed: Counter<u64>,
        pub migrations_rolled_back: Counter<u64>,
        pub deployments_total: Counter<u64>,
        pub deployment_duration: Histogram<f64>,
    }

    impl DriftguardMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let (provider, meter) = match opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
            {
                Ok(exporter) => {
                    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
                    let meter = provider.meter("driftguard");
                    (Some(provider), meter)
                }
                Err(e) => {
                    log::warn!("Prometheus exporter unavailable, metrics will not be exported: {e}");
                    (None, global::meter("driftguard"))
                }
            };

            let migrations_applied = meter
                .u64_counter("driftguard_migrations_applied_total")
                .with_description("Migrations applied successfully")
                .build();
            let migrations_failed = meter
                .u64_counter("driftguard_migrations_failed_total")
                .with_description("Migration apply attempts that failed")
                .build();
            let migrations_rolled_back = meter
                .u64_counter("driftguard_migrations_rolled_back_total")
                .with_description("Migrations reverted")
                .build();
            let deployments_total = meter
                .u64_counter("driftguard_deployments_total")
                .with_description("Deployment pipeline runs")
                .build();
            let deployment_duration = meter
                .f64_histogram("driftguard_deployment_duration_seconds")
                .with_description("Wall-clock duration of deployment runs")
                .build();

            Self {
                registry,
                _provider: provider,
                migrations_applied,
                migrations_failed,
                migrations_rolled_back,
                deployments_total,
                deployment_duration,
            }
        }

        pub fn record_migration_applied(&self) {
            self.migrations_applied.add(1, &[]);
        }

        pub fn record_migration_failed(&self) {
            self.migrations_failed.add(1, &[]);
        }

        pub fn record_migration_rolled_back(&self) {
            self.migrations_rolled_back.add(1, &[]);
        }

        pub fn record_deployment(&self, duration: Duration) {
            self.deployments_total.add(1, &[]);
            self.deployment_duration.record(duration.as_secs_f64(), &[]);
        }

        /// Prometheus text exposition of everything recorded so far
        ///
        /// # Errors
        ///
        /// Returns the encoder error if the gathered families cannot be encoded.
        pub fn render(&self) -> Result<String, prometheus::Error> {
            TextEncoder::new().encode_to_string(&self.registry.gather())
        }
    }
}

/// Span constructors used across the crate when `tracing` is enabled
#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{debug_span, info_span, Span};

    /// One deployment pipeline run
    pub fn deployment_span(deployment_id: &str) -> Span {
        info_span!("driftguard.deployment", deployment_id = %deployment_id)
    }

    /// One pipeline stage (`validate`, `backup`, `apply`, ...)
    pub fn stage_span(stage: &str) -> Span {
        info_span!("driftguard.stage", stage = %stage)
    }

    /// Apply or rollback of a single migration
    pub fn migration_span(migration_id: &str, operation: &str) -> Span {
        info_span!("driftguard.migration", migration_id = %migration_id, operation = %operation)
    }

    /// Transaction demarcation (`begin`, `commit`, `rollback`)
    pub fn transaction_span(operation: &str) -> Span {
        debug_span!("driftguard.transaction", operation = %operation)
    }

    /// A single statement sent to the backend
    pub fn statement_span(sql: &str) -> Span {
        let summary: String = sql.split_whitespace().take(4).collect::<Vec<_>>().join(" ");
        debug_span!("driftguard.statement", sql = %summary)
    }

    /// Connection establishment
    pub fn connection_span() -> Span {
        debug_span!("driftguard.connect")
    }
}
