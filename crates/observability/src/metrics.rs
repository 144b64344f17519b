//! Prometheus-kompatible Metriken fuer Klangraum
//!
//! Registrierte Metriken:
//! - `klangraum_verbindungen{zustand}` – Gauge: PeerConnections pro Zustand
//! - `klangraum_relay_frames_gesendet_total` – Counter: Ueber den Relay gesendete Frames
//! - `klangraum_relay_frames_empfangen_total` – Counter: Vom Relay empfangene Frames
//! - `klangraum_relay_frames_verspaetet_total` – Counter: Verspaetet verworfene Relay-Frames
//! - `klangraum_mixer_zyklen_total` – Counter: Mix-Zyklen
//! - `klangraum_mixer_ueberlaeufe_total` – Counter: Zyklen nach ihrer Deadline
//! - `klangraum_mixer_frames_fehlend_total` – Counter: Durch Stille ersetzte Frames
//! - `klangraum_bus_schreibfehler_total` – Counter: Fehlgeschlagene Senken-Schreibvorgaenge
//! - `klangraum_busse_aktiv` – Gauge: Definierte Ausgabe-Busse
//!
//! Die Quellen (Supervisor, Mixer) fuehren eigene monotone Zaehler. Der
//! Client uebertraegt deren Stand periodisch mit [`KlangraumMetriken::nachziehen`].

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Alle Klangraum-Prometheus-Metriken
#[derive(Clone)]
pub struct KlangraumMetriken {
    pub registry: Arc<Registry>,

    // Verbindungen
    pub verbindungen: IntGaugeVec,

    // Relay
    pub relay_gesendet: IntCounter,
    pub relay_empfangen: IntCounter,
    pub relay_verspaetet: IntCounter,

    // Mixer
    pub mixer_zyklen: IntCounter,
    pub mixer_ueberlaeufe: IntCounter,
    pub mixer_frames_fehlend: IntCounter,
    pub bus_schreibfehler: IntCounter,
    pub busse_aktiv: IntGauge,
}

impl KlangraumMetriken {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        let verbindungen = IntGaugeVec::new(
            Opts::new("klangraum_verbindungen", "PeerConnections pro Zustand"),
            &["zustand"],
        )?;
        registry.register(Box::new(verbindungen.clone()))?;

        let relay_gesendet = zaehler(
            &registry,
            "klangraum_relay_frames_gesendet_total",
            "Ueber den Relay gesendete Frames",
        )?;
        let relay_empfangen = zaehler(
            &registry,
            "klangraum_relay_frames_empfangen_total",
            "Vom Relay empfangene Frames",
        )?;
        let relay_verspaetet = zaehler(
            &registry,
            "klangraum_relay_frames_verspaetet_total",
            "Verspaetet verworfene Relay-Frames",
        )?;

        let mixer_zyklen = zaehler(&registry, "klangraum_mixer_zyklen_total", "Mix-Zyklen")?;
        let mixer_ueberlaeufe = zaehler(
            &registry,
            "klangraum_mixer_ueberlaeufe_total",
            "Mix-Zyklen, die ihre Deadline verpasst haben",
        )?;
        let mixer_frames_fehlend = zaehler(
            &registry,
            "klangraum_mixer_frames_fehlend_total",
            "Teilnehmer-Frames, die durch Stille ersetzt wurden",
        )?;
        let bus_schreibfehler = zaehler(
            &registry,
            "klangraum_bus_schreibfehler_total",
            "Fehlgeschlagene Schreibvorgaenge an Bus-Senken",
        )?;

        let busse_aktiv = IntGauge::with_opts(Opts::new(
            "klangraum_busse_aktiv",
            "Anzahl definierter Ausgabe-Busse",
        ))?;
        registry.register(Box::new(busse_aktiv.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry: Arc::new(registry),
            verbindungen,
            relay_gesendet,
            relay_empfangen,
            relay_verspaetet,
            mixer_zyklen,
            mixer_ueberlaeufe,
            mixer_frames_fehlend,
            bus_schreibfehler,
            busse_aktiv,
        })
    }

    /// Hebt einen Counter auf den Stand einer externen monotonen Quelle
    ///
    /// Ein kleinerer Stand (z.B. nach Neustart der Quelle) wird ignoriert.
    pub fn nachziehen(counter: &IntCounter, stand: u64) {
        let aktuell = counter.get();
        if stand > aktuell {
            counter.inc_by(stand - aktuell);
        }
    }

    /// Setzt die Verbindungs-Gauges; nicht genannte Zustaende werden 0
    pub fn verbindungen_setzen<'a>(&self, pro_zustand: impl IntoIterator<Item = (&'a str, usize)>) {
        self.verbindungen.reset();
        for (zustand, anzahl) in pro_zustand {
            self.verbindungen
                .with_label_values(&[zustand])
                .set(anzahl as i64);
        }
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn zaehler(registry: &Registry, name: &str, hilfe: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, hilfe))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: KlangraumMetriken) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(State(metriken): State<KlangraumMetriken>) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Metriken-Export fehlgeschlagen: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metriken_erstellen_erfolgreich() {
        let metriken = KlangraumMetriken::neu().unwrap();
        assert!(!metriken.registry.gather().is_empty());
    }

    #[test]
    fn nachziehen_folgt_dem_quellstand() {
        let metriken = KlangraumMetriken::neu().unwrap();
        KlangraumMetriken::nachziehen(&metriken.mixer_zyklen, 10);
        KlangraumMetriken::nachziehen(&metriken.mixer_zyklen, 25);
        assert_eq!(metriken.mixer_zyklen.get(), 25);
        // Rueckschritt wird ignoriert
        KlangraumMetriken::nachziehen(&metriken.mixer_zyklen, 3);
        assert_eq!(metriken.mixer_zyklen.get(), 25);
    }

    #[test]
    fn verbindungen_pro_zustand() {
        let metriken = KlangraumMetriken::neu().unwrap();
        metriken.verbindungen_setzen([("direkt_verbunden", 2), ("relay_verbunden", 1)]);
        assert_eq!(
            metriken
                .verbindungen
                .with_label_values(&["direkt_verbunden"])
                .get(),
            2
        );

        metriken.verbindungen_setzen([("relay_verbunden", 3)]);
        assert_eq!(
            metriken
                .verbindungen
                .with_label_values(&["direkt_verbunden"])
                .get(),
            0
        );
        assert_eq!(
            metriken
                .verbindungen
                .with_label_values(&["relay_verbunden"])
                .get(),
            3
        );
    }

    #[test]
    fn metriken_export_prometheus_format() {
        let metriken = KlangraumMetriken::neu().unwrap();
        metriken.busse_aktiv.set(2);
        metriken.relay_verspaetet.inc();
        metriken.verbindungen_setzen([("verhandlung", 1)]);

        let output = metriken.exportieren().unwrap();
        assert!(output.contains("klangraum_busse_aktiv 2"));
        assert!(output.contains("klangraum_relay_frames_verspaetet_total 1"));
        assert!(output.contains("klangraum_verbindungen{zustand=\"verhandlung\"} 1"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[tokio::test]
    async fn metrics_endpunkt_liefert_text() {
        let metriken = KlangraumMetriken::neu().unwrap();
        metriken.bus_schreibfehler.inc_by(4);
        let antwort = metrics_handler(State(metriken)).await.into_response();
        assert_eq!(antwort.status(), StatusCode::OK);

        let body = axum::body::to_bytes(antwort.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("klangraum_bus_schreibfehler_total 4"));
    }
}
