//! Supervisor-Task – Async-Huelle um den synchronen PeerSupervisor
//!
//! Ein einziger Task besitzt den Supervisor und serialisiert alle Eingaenge:
//! Befehle der Anwendung, Transport-Ereignisse, eingehende Kanal-Nachrichten
//! und den periodischen Takt fuer die Zeitlimits.
//!
//! ```text
//! SupervisorHandle --Befehl--+
//! UdpDirektTransport --------+--> select! --> PeerSupervisor
//! Signaling-Kanal -----------+
//! Intervall (tick) ----------+
//! ```

use crate::supervisor::{PeerSupervisor, SupervisorStatistik};
use crate::transport::TransportEreignis;
use klangraum_core::error::{KlangraumError, Result};
use klangraum_core::frame::AudioFrame;
use klangraum_core::types::ParticipantId;
use klangraum_core::zustand::PeerZustand;
use klangraum_protocol::signal::{KanalNachricht, RaumEreignis};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

/// Kapazitaet der Befehls-Queue
pub const BEFEHL_KAPAZITAET: usize = 256;

/// Standard-Takt fuer Zeitlimits und Reorder-Fenster
pub const STANDARD_TAKT: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Befehle
// ---------------------------------------------------------------------------

pub enum SupervisorBefehl {
    VerbindungErstellen {
        participant_id: ParticipantId,
        initiator: bool,
        antwort: oneshot::Sender<Result<()>>,
    },
    Schliessen {
        participant_id: ParticipantId,
        grund: String,
    },
    ErneutVersuchen {
        participant_id: ParticipantId,
        antwort: oneshot::Sender<Result<()>>,
    },
    LokalerFrame(AudioFrame),
    Zustand {
        participant_id: ParticipantId,
        antwort: oneshot::Sender<Option<PeerZustand>>,
    },
    Statistik(oneshot::Sender<SupervisorStatistik>),
    Shutdown,
}

// ---------------------------------------------------------------------------
// SupervisorHandle
// ---------------------------------------------------------------------------

/// Klonbarer Zugriff auf den laufenden Supervisor-Task
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorBefehl>,
}

impl SupervisorHandle {
    pub async fn verbindung_erstellen(&self, participant_id: ParticipantId, initiator: bool) -> Result<()> {
        let (antwort, rx) = oneshot::channel();
        self.befehl(SupervisorBefehl::VerbindungErstellen {
            participant_id,
            initiator,
            antwort,
        })
        .await?;
        rx.await.map_err(|_| task_beendet())?
    }

    pub async fn verbindung_schliessen(&self, participant_id: ParticipantId, grund: impl Into<String>) -> Result<()> {
        self.befehl(SupervisorBefehl::Schliessen {
            participant_id,
            grund: grund.into(),
        })
        .await
    }

    pub async fn erneut_versuchen(&self, participant_id: ParticipantId) -> Result<()> {
        let (antwort, rx) = oneshot::channel();
        self.befehl(SupervisorBefehl::ErneutVersuchen {
            participant_id,
            antwort,
        })
        .await?;
        rx.await.map_err(|_| task_beendet())?
    }

    /// Reicht einen lokalen Frame weiter; bei voller Queue wird er verworfen
    pub fn lokaler_frame(&self, frame: AudioFrame) -> bool {
        match self.tx.try_send(SupervisorBefehl::LokalerFrame(frame)) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(fehler = %e, "Lokaler Frame verworfen");
                false
            }
        }
    }

    pub async fn zustand(&self, participant_id: ParticipantId) -> Result<Option<PeerZustand>> {
        let (antwort, rx) = oneshot::channel();
        self.befehl(SupervisorBefehl::Zustand {
            participant_id,
            antwort,
        })
        .await?;
        rx.await.map_err(|_| task_beendet())
    }

    pub async fn statistik(&self) -> Result<SupervisorStatistik> {
        let (antwort, rx) = oneshot::channel();
        self.befehl(SupervisorBefehl::Statistik(antwort)).await?;
        rx.await.map_err(|_| task_beendet())
    }

    /// Schliesst alle Verbindungen und beendet den Task
    pub async fn beenden(&self) {
        let _ = self.tx.send(SupervisorBefehl::Shutdown).await;
    }

    async fn befehl(&self, befehl: SupervisorBefehl) -> Result<()> {
        self.tx.send(befehl).await.map_err(|_| task_beendet())
    }
}

fn task_beendet() -> KlangraumError {
    KlangraumError::intern("Supervisor-Task beendet")
}

// ---------------------------------------------------------------------------
// SupervisorTask
// ---------------------------------------------------------------------------

pub struct SupervisorTask {
    supervisor: PeerSupervisor,
    befehle: mpsc::Receiver<SupervisorBefehl>,
    transport_rx: mpsc::Receiver<TransportEreignis>,
    kanal_rx: mpsc::Receiver<KanalNachricht>,
    takt: Duration,
}

impl SupervisorTask {
    pub fn neu(
        supervisor: PeerSupervisor,
        transport_rx: mpsc::Receiver<TransportEreignis>,
        kanal_rx: mpsc::Receiver<KanalNachricht>,
        takt: Duration,
    ) -> (Self, SupervisorHandle) {
        let (tx, befehle) = mpsc::channel(BEFEHL_KAPAZITAET);
        let task = Self {
            supervisor,
            befehle,
            transport_rx,
            kanal_rx,
            takt,
        };
        (task, SupervisorHandle { tx })
    }

    /// Laeuft bis `Shutdown` oder bis alle Handles gedroppt sind
    pub async fn run(mut self) {
        let mut takt = tokio::time::interval(self.takt);
        takt.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut transport_offen = true;
        let mut kanal_offen = true;

        tracing::info!(modus = ?self.supervisor.modus(), "Supervisor-Task gestartet");

        loop {
            tokio::select! {
                befehl = self.befehle.recv() => match befehl {
                    Some(SupervisorBefehl::Shutdown) | None => break,
                    Some(befehl) => self.befehl(befehl),
                },

                ereignis = self.transport_rx.recv(), if transport_offen => match ereignis {
                    Some(e) => self.supervisor.transport_ereignis(e, Instant::now()),
                    None => {
                        tracing::warn!("Direkter Transport beendet");
                        transport_offen = false;
                    }
                },

                nachricht = self.kanal_rx.recv(), if kanal_offen => match nachricht {
                    Some(n) => self.kanal_nachricht(n),
                    None => {
                        tracing::warn!("Signaling-Kanal geschlossen");
                        kanal_offen = false;
                    }
                },

                _ = takt.tick() => self.supervisor.tick(Instant::now()),
            }
        }

        self.supervisor.alle_schliessen("Client beendet", Instant::now());
        tracing::info!("Supervisor-Task beendet");
    }

    fn befehl(&mut self, befehl: SupervisorBefehl) {
        let jetzt = Instant::now();
        match befehl {
            SupervisorBefehl::VerbindungErstellen {
                participant_id,
                initiator,
                antwort,
            } => {
                let ergebnis = self
                    .supervisor
                    .verbindung_erstellen(participant_id, initiator, jetzt)
                    .map(|_| ());
                let _ = antwort.send(ergebnis);
            }
            SupervisorBefehl::Schliessen {
                participant_id,
                grund,
            } => self
                .supervisor
                .verbindung_schliessen(participant_id, &grund, jetzt),
            SupervisorBefehl::ErneutVersuchen {
                participant_id,
                antwort,
            } => {
                let _ = antwort.send(self.supervisor.erneut_versuchen(participant_id, jetzt));
            }
            SupervisorBefehl::LokalerFrame(frame) => self.supervisor.lokaler_frame(&frame),
            SupervisorBefehl::Zustand {
                participant_id,
                antwort,
            } => {
                let _ = antwort.send(self.supervisor.zustand(&participant_id));
            }
            SupervisorBefehl::Statistik(antwort) => {
                let _ = antwort.send(self.supervisor.statistik());
            }
            SupervisorBefehl::Shutdown => {}
        }
    }

    fn kanal_nachricht(&mut self, nachricht: KanalNachricht) {
        let jetzt = Instant::now();
        match nachricht {
            KanalNachricht::Signal(umschlag) => {
                self.supervisor
                    .signal_verarbeiten(umschlag.participant_id, umschlag.nachricht, jetzt)
            }
            KanalNachricht::Raum(RaumEreignis::Beigetreten {
                teilnehmer,
                initiator,
            }) => {
                let participant_id = teilnehmer.id;
                if let Err(e) = self
                    .supervisor
                    .teilnehmer_beigetreten(teilnehmer, initiator, jetzt)
                {
                    tracing::warn!(participant_id = %participant_id, fehler = %e, "Beitritt nicht verarbeitet");
                }
            }
            KanalNachricht::Raum(RaumEreignis::Verlassen { participant_id }) => {
                self.supervisor.teilnehmer_verlassen(participant_id, jetzt)
            }
            KanalNachricht::RelayAudio {
                von: Some(participant_id),
                daten,
            } => self
                .supervisor
                .relay_frame_empfangen(participant_id, &daten, jetzt),
            KanalNachricht::RelayAudio { von: None, .. } => {
                tracing::debug!("Relay-Audio ohne Absender verworfen");
            }
            KanalNachricht::RelayAktivieren => {
                tracing::trace!("RelayAktivieren ist nur ausgehend");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::transport::{DirektTransport, SignalKanal};
    use klangraum_core::event::EreignisKanal;
    use klangraum_core::quelle::{FrameEingabe, QuellenRegister};
    use klangraum_core::types::Participant;
    use std::net::SocketAddr;
    use std::sync::Arc;

    struct StummerTransport;

    impl DirektTransport for StummerTransport {
        fn lokale_kandidaten(&self) -> Vec<SocketAddr> {
            Vec::new()
        }
        fn verhandlung_starten(&mut self, _: ParticipantId, _: u32) {}
        fn kandidaten_hinzufuegen(&mut self, _: ParticipantId, _: u32, _: &[SocketAddr]) {}
        fn frame_senden(&mut self, _: ParticipantId, _: u32, _: &AudioFrame) {}
        fn schliessen(&mut self, _: ParticipantId) {}
    }

    struct StummerKanal;

    impl SignalKanal for StummerKanal {
        fn senden(&self, _: KanalNachricht) {}
    }

    struct Verwerfen;

    impl FrameEingabe for Verwerfen {
        fn on_frame(&mut self, _: AudioFrame) {}
    }

    struct LeeresRegister;

    impl QuellenRegister for LeeresRegister {
        fn quelle_registrieren(&self, _: ParticipantId) -> Box<dyn FrameEingabe> {
            Box::new(Verwerfen)
        }
        fn quelle_entfernen(&self, _: ParticipantId) {}
    }

    fn starten() -> (SupervisorHandle, mpsc::Sender<KanalNachricht>, mpsc::Sender<TransportEreignis>) {
        let supervisor = PeerSupervisor::neu(
            SupervisorConfig::default(),
            Box::new(StummerTransport),
            Arc::new(StummerKanal),
            Arc::new(LeeresRegister),
            EreignisKanal::neu(),
        );
        let (transport_tx, transport_rx) = mpsc::channel(16);
        let (kanal_tx, kanal_rx) = mpsc::channel(16);
        let (task, handle) = SupervisorTask::neu(supervisor, transport_rx, kanal_rx, STANDARD_TAKT);
        tokio::spawn(task.run());
        (handle, kanal_tx, transport_tx)
    }

    /// Kanal und Befehle laufen ueber getrennte Queues; kurz warten bis verarbeitet
    async fn zustand_abwarten(handle: &SupervisorHandle, pid: ParticipantId) -> Option<PeerZustand> {
        for _ in 0..10 {
            if let Some(z) = handle.zustand(pid).await.unwrap() {
                return Some(z);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        None
    }

    #[tokio::test(start_paused = true)]
    async fn beitritt_und_rueckfall_nach_timeout() {
        let (handle, kanal_tx, _transport_tx) = starten();
        let pid = ParticipantId::new();
        kanal_tx
            .send(KanalNachricht::Raum(RaumEreignis::Beigetreten {
                teilnehmer: Participant::neu(pid, "Anna"),
                initiator: true,
            }))
            .await
            .unwrap();

        assert_eq!(zustand_abwarten(&handle, pid).await, Some(PeerZustand::Verhandlung));

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(handle.zustand(pid).await.unwrap(), Some(PeerZustand::Rueckfall));
    }

    #[tokio::test(start_paused = true)]
    async fn doppelte_verbindung_liefert_fehler() {
        let (handle, kanal_tx, _transport_tx) = starten();
        let pid = ParticipantId::new();
        kanal_tx
            .send(KanalNachricht::Raum(RaumEreignis::Beigetreten {
                teilnehmer: Participant::neu(pid, "Ben"),
                initiator: false,
            }))
            .await
            .unwrap();
        assert!(zustand_abwarten(&handle, pid).await.is_some());
        assert!(handle.verbindung_erstellen(pid, true).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn beenden_schliesst_alles() {
        let (handle, kanal_tx, _transport_tx) = starten();
        kanal_tx
            .send(KanalNachricht::Raum(RaumEreignis::Beigetreten {
                teilnehmer: Participant::neu(ParticipantId::new(), "Cem"),
                initiator: true,
            }))
            .await
            .unwrap();
        handle.beenden().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.statistik().await.is_err());
    }
}
