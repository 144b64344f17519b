//! PeerConnection – Zustand einer Transport-Sitzung zu genau einem Teilnehmer
//!
//! Enthaelt die Uebergangstabelle der Zustandsmaschine. Wer einen Uebergang
//! ausloest und welche Nebenwirkungen folgen, entscheidet der Supervisor.

use klangraum_core::types::ParticipantId;
use klangraum_core::zustand::{PeerZustand, PfadModus};
use tokio::time::Instant;

/// Ist der Uebergang `alt -> neu` in der Zustandsmaschine vorgesehen?
pub fn uebergang_erlaubt(alt: PeerZustand, neu: PeerZustand) -> bool {
    use PeerZustand::*;

    if alt == Geschlossen {
        return false;
    }
    if neu == Geschlossen {
        return true;
    }

    matches!(
        (alt, neu),
        (Leerlauf, Verhandlung)
            | (Leerlauf, Rueckfall)
            | (Verhandlung, DirektVerbunden)
            | (Verhandlung, Rueckfall)
            | (Verhandlung, Fehlgeschlagen)
            | (DirektVerbunden, Rueckfall)
            | (DirektVerbunden, Fehlgeschlagen)
            | (Rueckfall, RelayVerbunden)
            | (Rueckfall, Fehlgeschlagen)
            | (Rueckfall, DirektVerbunden)
            | (RelayVerbunden, DirektVerbunden)
            | (RelayVerbunden, Fehlgeschlagen)
            | (Fehlgeschlagen, Verhandlung)
            | (Fehlgeschlagen, Rueckfall)
            | (Fehlgeschlagen, Unerreichbar)
            | (Unerreichbar, Verhandlung)
            | (Unerreichbar, Rueckfall)
    )
}

/// Eine Transport-Sitzung zu einem entfernten Teilnehmer
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub participant_id: ParticipantId,
    pub zustand: PeerZustand,
    /// Lokale Seite startet die Verhandlung (sendet das Angebot)
    pub initiator: bool,
    /// Zeitpunkt des letzten erfolgreichen Verbindungsaufbaus
    pub eingerichtet_am: Option<Instant>,
    /// Letztes eingehendes Audio oder Lebenszeichen (oder Zustandseintritt)
    pub letzte_aktivitaet: Instant,
    /// Seit wann der aktuelle Zustand gilt
    pub zustand_seit: Instant,
    /// Aktive Frame-Quelle
    pub pfad: PfadModus,
    /// Bisherige automatische Wiederholungen
    pub versuche: u32,
    /// Sitzungs-Tag der laufenden Direktpfad-Verhandlung
    pub sitzung: Option<u32>,
    /// Hoechste an die Routing-Matrix gelieferte Sequenznummer
    pub letzte_sequenz: Option<u32>,
    /// Letzte Probe des Direktpfads waehrend Relay-Betrieb
    pub letzte_probe: Option<Instant>,
}

impl PeerConnection {
    pub fn neu(participant_id: ParticipantId, initiator: bool, jetzt: Instant) -> Self {
        Self {
            participant_id,
            zustand: PeerZustand::Leerlauf,
            initiator,
            eingerichtet_am: None,
            letzte_aktivitaet: jetzt,
            zustand_seit: jetzt,
            pfad: PfadModus::Direkt,
            versuche: 0,
            sitzung: None,
            letzte_sequenz: None,
            letzte_probe: None,
        }
    }

    /// Fuehrt einen Uebergang aus und gibt den alten Zustand zurueck
    ///
    /// Nicht vorgesehene Uebergaenge werden verworfen (`None`).
    pub fn uebergang(&mut self, neu: PeerZustand, jetzt: Instant) -> Option<PeerZustand> {
        let alt = self.zustand;
        if !uebergang_erlaubt(alt, neu) {
            tracing::debug!(
                participant_id = %self.participant_id,
                alt = %alt,
                neu = %neu,
                "Zustandsuebergang verworfen"
            );
            return None;
        }

        self.zustand = neu;
        self.zustand_seit = jetzt;
        self.letzte_aktivitaet = jetzt;
        if neu.ist_verbunden() {
            self.eingerichtet_am = Some(jetzt);
            self.versuche = 0;
        }
        Some(alt)
    }

    /// Vermerkt eingehendes Audio
    pub fn aktivitaet(&mut self, jetzt: Instant) {
        self.letzte_aktivitaet = jetzt;
    }

    /// Darf ein Frame mit `sequenz` noch geliefert werden?
    pub fn ist_neuer(&self, sequenz: u32) -> bool {
        self.letzte_sequenz.map_or(true, |letzte| sequenz > letzte)
    }

    /// Vergisst die gelieferte Sequenz; nur ohne lebenden Audiopfad
    pub fn sequenz_zuruecksetzen(&mut self) {
        self.letzte_sequenz = None;
    }

    /// Vermerkt eine gelieferte Sequenznummer
    pub fn geliefert(&mut self, sequenz: u32) {
        if self.ist_neuer(sequenz) {
            self.letzte_sequenz = Some(sequenz);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
