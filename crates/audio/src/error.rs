//! Fehlertypen fuer Senken und Audio-Geraete

use klangraum_core::{AudioFormat, BusId, KlangraumError};
use thiserror::Error;

/// Alle moeglichen Fehler der Audio-Ausgabe
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Audio-Geraet nicht gefunden: {0}")]
    GeraetNichtGefunden(String),

    #[error("Kein Standard-Ausgabegeraet verfuegbar")]
    KeinStandardAusgabegeraet,

    #[error("Kein Standard-Eingabegeraet verfuegbar")]
    KeinStandardEingabegeraet,

    #[error("Stream-Fehler: {0}")]
    StreamFehler(String),

    #[error("Senke konnte nicht schreiben: {0}")]
    SinkFehler(String),

    #[error("Mix-Thread konnte nicht gestartet werden: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unerwarteter Fehler: {0}")]
    Anyhow(#[from] anyhow::Error),
}

pub type AudioResult<T> = Result<T, AudioError>;

impl From<AudioError> for KlangraumError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::Anyhow(inner) => KlangraumError::Anyhow(inner),
            andere => KlangraumError::Konfiguration(andere.to_string()),
        }
    }
}

impl AudioError {
    /// Fehler beim Oeffnen der Senke eines Busses
    ///
    /// Fehlt das Geraet oder bietet es keine Konfiguration fuer das Format,
    /// kann der Bus dieses Format nicht bedienen.
    pub fn fuer_bus(self, bus_id: &BusId, format: AudioFormat) -> KlangraumError {
        match self {
            AudioError::GeraetNichtGefunden(_)
            | AudioError::KeinStandardAusgabegeraet
            | AudioError::StreamFehler(_) => KlangraumError::NichtUnterstuetztesFormat {
                bus_id: bus_id.clone(),
                sample_rate: format.sample_rate,
                kanaele: format.kanaele,
            },
            andere => andere.into(),
        }
    }
}
