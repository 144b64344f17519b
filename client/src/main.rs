//! Klangraum Client – Einstiegspunkt
//!
//! Laedt die Konfiguration, initialisiert das Logging und startet den Client.
//! Auf Unix laedt SIGHUP Busse und Zuweisungen aus derselben Datei neu.

use anyhow::Result;
use klangraum_client::{config::ClientConfig, Client};

#[tokio::main]
async fn main() -> Result<()> {
    // Pfad: erstes Argument, sonst Umgebungsvariable, sonst Standard
    let config_pfad = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KLANGRAUM_CONFIG").ok())
        .unwrap_or_else(|| "klangraum.toml".into());

    // Konfiguration laden (Standardwerte falls Datei fehlt)
    let config = ClientConfig::laden(&config_pfad)?;

    klangraum_observability::logging_initialisieren(&config.logging.level, &config.logging.format)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        "Klangraum wird initialisiert"
    );

    let mut client = Client::starten(config).await?;
    let mut neu_laden = NeuLadenSignal::neu()?;

    tracing::info!("Warte auf Shutdown-Signal (Ctrl-C)...");
    loop {
        tokio::select! {
            ergebnis = tokio::signal::ctrl_c() => {
                ergebnis?;
                tracing::info!("Shutdown-Signal empfangen, Client wird beendet");
                break;
            }
            _ = neu_laden.empfangen() => {
                match ClientConfig::laden(&config_pfad) {
                    Ok(neue) => {
                        if let Err(e) = client.neu_laden(neue) {
                            tracing::error!(fehler = %e, "Neuladen abgelehnt, alte Konfiguration bleibt aktiv");
                        }
                    }
                    Err(e) => tracing::error!(fehler = %e, "Konfiguration nicht lesbar"),
                }
            }
        }
    }

    client.beenden().await;
    Ok(())
}

#[cfg(unix)]
struct NeuLadenSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl NeuLadenSignal {
    fn neu() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self(signal(SignalKind::hangup())?))
    }

    async fn empfangen(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct NeuLadenSignal;

#[cfg(not(unix))]
impl NeuLadenSignal {
    fn neu() -> Result<Self> {
        Ok(Self)
    }

    async fn empfangen(&mut self) {
        std::future::pending::<()>().await
    }
}
