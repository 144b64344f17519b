//! Fehlertypen fuer Klangraum
//!
//! Zentraler Fehler-Enum mit der Fehler-Taxonomie des Kerns.
//! Konfigurationsfehler (Teilnehmer, Bus, Format) werden synchron an den
//! Aufrufer zurueckgegeben. Transportfehler erscheinen nie als `Err`, sondern
//! nur als Zustandswechsel.

use crate::types::{BusId, ParticipantId};
use thiserror::Error;

/// Globaler Result-Alias fuer Klangraum
pub type Result<T> = std::result::Result<T, KlangraumError>;

/// Alle moeglichen Fehler im Klangraum-Kern
#[derive(Debug, Error)]
pub enum KlangraumError {
    // --- Konfigurations-Missbrauch (synchron an den Aufrufer) ---
    #[error("Ungueltiger Teilnehmer {participant_id}: {grund}")]
    UngueltigerTeilnehmer {
        participant_id: ParticipantId,
        grund: String,
    },

    #[error("Unbekannter Bus: {0}")]
    UnbekannterBus(BusId),

    #[error("Format nicht unterstuetzt fuer {bus_id}: {sample_rate} Hz, {kanaele} Kanaele")]
    NichtUnterstuetztesFormat {
        bus_id: BusId,
        sample_rate: u32,
        kanaele: u16,
    },

    // --- Transport (intern, nur als Zustandswechsel sichtbar) ---
    #[error("Verhandlung mit {0} hat das Zeitlimit ueberschritten")]
    VerhandlungsTimeout(ParticipantId),

    #[error("Relay nicht verfuegbar fuer {0}")]
    RelayNichtVerfuegbar(ParticipantId),

    // --- Allgemein ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("Protokollfehler: {0}")]
    Protokoll(String),

    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl KlangraumError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Erstellt einen `UngueltigerTeilnehmer`-Fehler
    pub fn ungueltiger_teilnehmer(participant_id: ParticipantId, grund: impl Into<String>) -> Self {
        Self::UngueltigerTeilnehmer {
            participant_id,
            grund: grund.into(),
        }
    }

    /// Gibt true zurueck wenn der Fehler vom Transport stammt und lokal
    /// von der Zustandsmaschine behandelt wird
    pub fn ist_transportfehler(&self) -> bool {
        matches!(
            self,
            Self::VerhandlungsTimeout(_) | Self::RelayNichtVerfuegbar(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = KlangraumError::UnbekannterBus(BusId::new("buehne"));
        assert_eq!(e.to_string(), "Unbekannter Bus: bus:buehne");
    }

    #[test]
    fn transportfehler_erkennung() {
        let pid = ParticipantId::new();
        assert!(KlangraumError::VerhandlungsTimeout(pid).ist_transportfehler());
        assert!(KlangraumError::RelayNichtVerfuegbar(pid).ist_transportfehler());
        assert!(!KlangraumError::ungueltiger_teilnehmer(pid, "doppelt").ist_transportfehler());
    }

    #[test]
    fn format_fehler_enthaelt_details() {
        let e = KlangraumError::NichtUnterstuetztesFormat {
            bus_id: BusId::new("mono"),
            sample_rate: 96000,
            kanaele: 8,
        };
        assert!(e.to_string().contains("96000"));
        assert!(e.to_string().contains("8 Kanaele"));
    }
}
