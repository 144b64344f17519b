//! Effekt-Ketten fuer Zuweisungen und Busse
//!
//! Eine `EffektKette` wendet eine geordnete Liste von `AudioProcessor`en
//! in-place an. Beschrieben wird sie ueber `EffektStufe`n aus der
//! Konfiguration, gebaut wird sie ausserhalb des Mix-Pfads.

use klangraum_core::AudioFormat;
use serde::{Deserialize, Serialize};

use crate::dsp::{AudioProcessor, Gain, Hochpass, Kompressor, NoiseGate, Tiefpass};

/// Eine konfigurierbare Effekt-Stufe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typ", rename_all = "snake_case")]
pub enum EffektStufe {
    Gain { db: f32 },
    Tiefpass { grenzfrequenz_hz: f32 },
    Hochpass { grenzfrequenz_hz: f32 },
    NoiseGate { schwelle_db: f32 },
    Kompressor { schwelle_db: f32, ratio: f32 },
}

impl EffektStufe {
    /// Baut den passenden Prozessor fuer ein Sample-Format
    pub fn bauen(&self, format: AudioFormat) -> Box<dyn AudioProcessor> {
        let AudioFormat {
            sample_rate,
            kanaele,
        } = format;
        match *self {
            EffektStufe::Gain { db } => Box::new(Gain::neu(db)),
            EffektStufe::Tiefpass { grenzfrequenz_hz } => {
                Box::new(Tiefpass::neu(grenzfrequenz_hz, sample_rate, kanaele))
            }
            EffektStufe::Hochpass { grenzfrequenz_hz } => {
                Box::new(Hochpass::neu(grenzfrequenz_hz, sample_rate, kanaele))
            }
            EffektStufe::NoiseGate { schwelle_db } => {
                Box::new(NoiseGate::mit_schwelle(schwelle_db, sample_rate, kanaele))
            }
            EffektStufe::Kompressor { schwelle_db, ratio } => {
                Box::new(Kompressor::neu(schwelle_db, ratio, sample_rate, kanaele))
            }
        }
    }
}

/// Geordnete Kette von Prozessoren
///
/// Wendet eine Kette von `AudioProcessor`-Implementierungen sequenziell auf
/// jeden Block an.
pub struct EffektKette {
    processors: Vec<Box<dyn AudioProcessor>>,
}

impl EffektKette {
    pub fn new(processors: Vec<Box<dyn AudioProcessor>>) -> Self {
        Self { processors }
    }

    /// Leere Kette ohne Prozessoren
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Baut eine Kette aus Konfigurations-Stufen
    pub fn aus_stufen(stufen: &[EffektStufe], format: AudioFormat) -> Self {
        Self::new(stufen.iter().map(|s| s.bauen(format)).collect())
    }

    /// Verarbeitet einen Block in-place durch alle Prozessoren
    pub fn verarbeiten(&mut self, samples: &mut [f32]) {
        for processor in self.processors.iter_mut() {
            processor.process(samples);
        }
    }

    pub fn push(&mut self, processor: Box<dyn AudioProcessor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Setzt alle Prozessoren zurueck
    pub fn reset_all(&mut self) {
        for p in self.processors.iter_mut() {
            p.reset();
        }
    }

    pub fn set_all_enabled(&mut self, enabled: bool) {
        for p in self.processors.iter_mut() {
            p.set_enabled(enabled);
        }
    }
}

impl std::fmt::Debug for EffektKette {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffektKette")
            .field("stufen", &self.processors.len())
            .finish()
    }
}
