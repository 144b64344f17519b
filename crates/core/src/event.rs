//! Ereignisse des Kerns
//!
//! Jeder Zustandswechsel einer PeerConnection, jede Unerreichbarkeit und
//! jeder Schreibfehler eines Busses wird als `KlangraumEvent` veroeffentlicht.
//! Konsumenten sind UI, Monitoring und der Mitgliedschafts-Kollaborator,
//! nie die Komponente, die das Ereignis erzeugt.

use crate::types::{BusId, ParticipantId};
use crate::zustand::{PeerZustand, PfadModus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kapazitaet des Ereignis-Kanals (langsame Abonnenten verlieren Ereignisse)
pub const EREIGNIS_KAPAZITAET: usize = 256;

/// Alle Ereignisse, die der Kern nach aussen meldet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KlangraumEvent {
    /// Zustandswechsel einer PeerConnection
    StatusGeaendert {
        participant_id: ParticipantId,
        alt: PeerZustand,
        neu: PeerZustand,
    },
    /// Wiederholungslimit erreicht – Teilnehmer wird stumm geschaltet
    TeilnehmerUnerreichbar { participant_id: ParticipantId },
    /// Die gemeinsame Relay-Sitzung wurde aktiviert (einmalig)
    RelayAktiviert,
    /// Frame-Quelle eines Teilnehmers wurde umgeschaltet
    QuelleGewechselt {
        participant_id: ParticipantId,
        pfad: PfadModus,
    },
    /// Ein Bus konnte seinen Mix nicht an die Senke schreiben
    BusSchreibfehler { bus_id: BusId, fehler: String },
}

/// Veroeffentlicht `KlangraumEvent`s an beliebig viele Abonnenten
///
/// `Clone` teilt den inneren broadcast-Sender. Senden blockiert nie und ist
/// auch ohne Abonnenten kein Fehler.
#[derive(Clone, Debug)]
pub struct EreignisKanal {
    tx: broadcast::Sender<KlangraumEvent>,
}

impl EreignisKanal {
    pub fn neu() -> Self {
        let (tx, _) = broadcast::channel(EREIGNIS_KAPAZITAET);
        Self { tx }
    }

    /// Sendet ein Ereignis an alle aktuellen Abonnenten
    pub fn senden(&self, ereignis: KlangraumEvent) {
        tracing::trace!(?ereignis, "Ereignis veroeffentlicht");
        // Kein Abonnent ist kein Fehler
        let _ = self.tx.send(ereignis);
    }

    /// Abonniert alle zukuenftigen Ereignisse
    pub fn abonnieren(&self) -> broadcast::Receiver<KlangraumEvent> {
        self.tx.subscribe()
    }
}

impl Default for EreignisKanal {
    fn default() -> Self {
        Self::neu()
    }
}
