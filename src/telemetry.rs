//! Telemetry plane
//!
//! Process-wide Prometheus registry, the `/metrics` scrape endpoint, and
//! the background samplers for system and user gauges. Engines record
//! through the `track_*` helpers; label sets are fixed here.

use axum::{Router, routing::get};
use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::store::UserStore;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SWAP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("swap_duration_seconds", "Swap execution time"),
        &["venue", "network"],
    )
    .expect("metric created")
});

pub static SWAP_VOLUME: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        Opts::new("swap_volume_total", "Total swap input volume"),
        &["venue", "network", "pair"],
    )
    .expect("metric created")
});

pub static SWAP_SUCCESS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("swap_success_total", "Successful swaps"),
        &["venue", "network"],
    )
    .expect("metric created")
});

pub static SWAP_FAILURE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("swap_failure_total", "Failed swaps"),
        &["venue", "network", "error_type"],
    )
    .expect("metric created")
});

pub static API_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("api_latency_seconds", "API request latency"),
        &["endpoint", "method"],
    )
    .expect("metric created")
});

pub static API_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("api_errors_total", "API request errors"),
        &["endpoint", "error_type"],
    )
    .expect("metric created")
});

pub static ACTIVE_USERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("active_users", "Users active within the last hour").expect("metric created")
});

pub static USER_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("user_operations_total", "User-initiated operations"),
        &["type"],
    )
    .expect("metric created")
});

pub static CPU_USAGE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("cpu_usage_percent", "CPU utilization").expect("metric created"));

pub static MEMORY_USAGE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("memory_usage_percent", "Memory utilization").expect("metric created"));

pub static DISK_USAGE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("disk_usage_percent", "Disk utilization").expect("metric created"));

/// Register every metric with the scrape registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SWAP_DURATION.clone()),
        Box::new(SWAP_VOLUME.clone()),
        Box::new(SWAP_SUCCESS.clone()),
        Box::new(SWAP_FAILURE.clone()),
        Box::new(API_LATENCY.clone()),
        Box::new(API_ERRORS.clone()),
        Box::new(ACTIVE_USERS.clone()),
        Box::new(USER_OPERATIONS.clone()),
        Box::new(CPU_USAGE.clone()),
        Box::new(MEMORY_USAGE.clone()),
        Box::new(DISK_USAGE.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            // double registration is harmless (tests re-enter)
            warn!("metric registration skipped: {}", e);
        }
    }
}

/// Record one terminal swap outcome.
pub fn track_swap(
    venue: &str,
    network: &str,
    pair: &str,
    duration_secs: f64,
    volume: f64,
    success: bool,
    error_type: Option<&str>,
) {
    SWAP_DURATION
        .with_label_values(&[venue, network])
        .observe(duration_secs);
    SWAP_VOLUME
        .with_label_values(&[venue, network, pair])
        .inc_by(volume);
    if success {
        SWAP_SUCCESS.with_label_values(&[venue, network]).inc();
    } else {
        SWAP_FAILURE
            .with_label_values(&[venue, network, error_type.unwrap_or("unknown")])
            .inc();
    }
}

pub fn track_api_request(endpoint: &str, method: &str, duration_secs: f64, error_type: Option<&str>) {
    API_LATENCY
        .with_label_values(&[endpoint, method])
        .observe(duration_secs);
    if let Some(kind) = error_type {
        API_ERRORS.with_label_values(&[endpoint, kind]).inc();
    }
}

pub fn track_user_operation(kind: &str) {
    USER_OPERATIONS.with_label_values(&[kind]).inc();
}

/// Render the registry in Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn metrics_handler() -> String {
    render()
}

/// Serve `GET /metrics` until shutdown.
pub async fn serve(addr: &str, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics endpoint on http://{}/metrics", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

/// Sample CPU / memory / disk gauges every 60 s.
pub fn spawn_system_sampler(mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut sys = System::new();
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    sys.refresh_cpu_usage();
                    sys.refresh_memory();
                    CPU_USAGE.set(sys.global_cpu_info().cpu_usage() as f64);
                    if sys.total_memory() > 0 {
                        MEMORY_USAGE
                            .set(sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0);
                    }
                    let disks = Disks::new_with_refreshed_list();
                    let (total, avail) = disks
                        .iter()
                        .fold((0u64, 0u64), |(t, a), d| {
                            (t + d.total_space(), a + d.available_space())
                        });
                    if total > 0 {
                        DISK_USAGE.set((total - avail) as f64 / total as f64 * 100.0);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

/// Sample the active-users gauge every 300 s.
pub fn spawn_user_sampler(users: Arc<dyn UserStore>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let since = chrono::Utc::now() - chrono::Duration::hours(1);
                    match users.count_active_since(since).await {
                        Ok(n) => ACTIVE_USERS.set(n as i64),
                        Err(e) => warn!("active-user sampling failed: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_swap_appears_in_scrape() {
        register_metrics();
        track_swap("ston.fi", "TON", "TON/USDT", 0.25, 100.0, true, None);
        track_swap("ston.fi", "TON", "TON/USDT", 0.5, 50.0, false, Some("timeout"));
        let text = render();
        assert!(text.contains("swap_duration_seconds"));
        assert!(text.contains("swap_success_total"));
        assert!(text.contains(r#"error_type="timeout""#));
    }

    #[test]
    fn test_user_operations_counter() {
        register_metrics();
        track_user_operation("create_order");
        assert!(render().contains("user_operations_total"));
    }
}
