//! # klangraum-observability
//!
//! Observability-Crate fuer Klangraum:
//! - Prometheus-kompatible Metriken (`/metrics`)
//! - Health-Check-Endpunkt (`/health`)
//! - Structured Logging via tracing-subscriber

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{health_router, HealthResponse, HealthState, HealthStatus};
pub use logging::logging_initialisieren;
pub use metrics::{metrics_router, KlangraumMetriken};

use anyhow::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Baut den Router mit `/metrics` und `/health`
pub fn router(metriken: KlangraumMetriken, health: HealthState) -> axum::Router {
    axum::Router::new()
        .merge(metrics_router(metriken))
        .merge(health_router(health))
}

/// Startet den Observability-HTTP-Server (Metriken + Health)
///
/// Endpunkte:
/// - `GET /metrics` – Prometheus scrape format
/// - `GET /health`  – Health-Check JSON
pub async fn observability_server_starten(
    bind_addr: SocketAddr,
    metriken: KlangraumMetriken,
    health: HealthState,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Observability-Server gestartet");
    observability_server_mit_listener(listener, metriken, health).await
}

/// Wie [`observability_server_starten`], aber auf einem bereits gebundenen Listener
pub async fn observability_server_mit_listener(
    listener: TcpListener,
    metriken: KlangraumMetriken,
    health: HealthState,
) -> Result<()> {
    axum::serve(listener, router(metriken, health)).await?;
    Ok(())
}
