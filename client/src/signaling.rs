//! TCP-Verbindung zum Koordinationsserver
//!
//! Nutzt den FrameCodec aus klangraum-protocol fuer das Wire-Format
//! (u32 BE length + JSON payload). Lesen und Schreiben laufen in eigenen
//! Tasks; der Supervisor sieht davon nur [`TcpSignalKanal`] (ausgehend) und
//! die `KanalNachricht`-Queue (eingehend).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use klangraum_observability::HealthState;
use klangraum_protocol::{FrameCodec, KanalNachricht};
use klangraum_voice::SignalKanal;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

// ---------------------------------------------------------------------------
// Ausgehende Richtung
// ---------------------------------------------------------------------------

/// [`SignalKanal`] ueber die Sende-Queue der TCP-Verbindung
///
/// `senden` blockiert nie; bei voller Queue oder getrennter Verbindung wird
/// die Nachricht verworfen.
pub struct TcpSignalKanal {
    tx: mpsc::Sender<KanalNachricht>,
}

impl SignalKanal for TcpSignalKanal {
    fn senden(&self, nachricht: KanalNachricht) {
        match self.tx.try_send(nachricht) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(n)) => {
                tracing::warn!(art = nachricht_art(&n), "Signaling-Queue voll, Nachricht verworfen");
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                tracing::debug!(art = nachricht_art(&n), "Signaling getrennt, Nachricht verworfen");
            }
        }
    }
}

fn nachricht_art(n: &KanalNachricht) -> &'static str {
    match n {
        KanalNachricht::Signal(_) => "signal",
        KanalNachricht::Raum(_) => "raum",
        KanalNachricht::RelayAktivieren => "relay_aktivieren",
        KanalNachricht::RelayAudio { .. } => "relay_audio",
    }
}

// ---------------------------------------------------------------------------
// SignalingVerbindung
// ---------------------------------------------------------------------------

/// Laufende Verbindung; beim Drop werden beide Tasks beendet
pub struct SignalingVerbindung {
    kanal: Arc<TcpSignalKanal>,
    lese_task: JoinHandle<()>,
    schreib_task: JoinHandle<()>,
}

impl SignalingVerbindung {
    /// Verbindet sich und leitet eingehende Nachrichten an `eingang` weiter
    pub async fn verbinden(
        adresse: &str,
        sende_queue: usize,
        eingang: mpsc::Sender<KanalNachricht>,
        health: HealthState,
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(adresse)
            .await
            .map_err(|e| anyhow::anyhow!("Signaling-Server '{adresse}' nicht erreichbar: {e}"))?;
        stream.set_nodelay(true)?;
        let lokal = stream.local_addr()?;
        let (mut schreiber, mut leser) =
            Framed::new(stream, FrameCodec::<KanalNachricht>::new()).split();

        let (tx, mut rx) = mpsc::channel::<KanalNachricht>(sende_queue.max(1));
        health.signaling_setzen(true);
        tracing::info!(adresse = %adresse, lokal = %lokal, "Mit Signaling-Server verbunden");

        let schreib_task = tokio::spawn(async move {
            while let Some(nachricht) = rx.recv().await {
                if let Err(e) = schreiber.send(nachricht).await {
                    tracing::warn!(fehler = %e, "Senden an Signaling-Server fehlgeschlagen");
                    break;
                }
            }
            tracing::debug!("Signaling-Schreiber beendet");
        });

        let lese_task = tokio::spawn(async move {
            while let Some(ergebnis) = leser.next().await {
                match ergebnis {
                    Ok(nachricht) => {
                        if eingang.send(nachricht).await.is_err() {
                            tracing::debug!("Supervisor-Task beendet, Signaling-Leser stoppt");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(fehler = %e, "Ungueltige Nachricht vom Signaling-Server");
                        break;
                    }
                }
            }
            health.signaling_setzen(false);
            tracing::warn!("Verbindung zum Signaling-Server beendet");
        });

        Ok(Self {
            kanal: Arc::new(TcpSignalKanal { tx }),
            lese_task,
            schreib_task,
        })
    }

    /// Ausgehender Kanal fuer den Supervisor
    pub fn kanal(&self) -> Arc<TcpSignalKanal> {
        Arc::clone(&self.kanal)
    }

    /// Ist die Leserichtung noch aktiv?
    pub fn ist_verbunden(&self) -> bool {
        !self.lese_task.is_finished()
    }
}

impl Drop for SignalingVerbindung {
    fn drop(&mut self) {
        self.lese_task.abort();
        self.schreib_task.abort();
    }
}
