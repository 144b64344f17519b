//! Health-Check-Endpunkt fuer Klangraum
//!
//! Endpoint: `GET /health`
//! Response: JSON mit Status, Version, Uptime, Signaling- und Mixer-Zustand

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Status des Health-Checks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Antwort des Health-Check-Endpunkts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub gestartet: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub signaling_verbunden: bool,
    pub mixer_laeuft: bool,
}

/// Geteilter Zustand fuer den Health-Check-Handler
#[derive(Clone)]
pub struct HealthState {
    start_time: Arc<Instant>,
    gestartet: DateTime<Utc>,
    signaling_verbunden: Arc<AtomicBool>,
    mixer_laeuft: Arc<AtomicBool>,
}

impl HealthState {
    pub fn neu() -> Self {
        Self {
            start_time: Arc::new(Instant::now()),
            gestartet: Utc::now(),
            signaling_verbunden: Arc::new(AtomicBool::new(false)),
            mixer_laeuft: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn signaling_setzen(&self, verbunden: bool) {
        self.signaling_verbunden.store(verbunden, Ordering::Relaxed);
    }

    pub fn mixer_setzen(&self, laeuft: bool) {
        self.mixer_laeuft.store(laeuft, Ordering::Relaxed);
    }

    /// Ohne Mixer ist der Client nutzlos; ohne Signaling nur eingeschraenkt
    pub fn status(&self) -> HealthStatus {
        let mixer = self.mixer_laeuft.load(Ordering::Relaxed);
        let signaling = self.signaling_verbunden.load(Ordering::Relaxed);
        match (mixer, signaling) {
            (false, _) => HealthStatus::Unhealthy,
            (true, false) => HealthStatus::Degraded,
            (true, true) => HealthStatus::Healthy,
        }
    }

    pub fn antwort(&self) -> HealthResponse {
        HealthResponse {
            status: self.status(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            gestartet: self.gestartet,
            uptime_seconds: self.uptime_seconds(),
            signaling_verbunden: self.signaling_verbunden.load(Ordering::Relaxed),
            mixer_laeuft: self.mixer_laeuft.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::neu()
    }
}

/// Axum-Router fuer den `/health`-Endpunkt
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// `GET /health` – gibt den Client-Status zurueck
async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let response = state.antwort();
    let http_status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, Json(response))
}
