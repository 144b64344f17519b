//! AudioFrame – ein transienter, zeitgestempelter Block Samples
//!
//! Frames werden nie persistiert. Sie fliessen von einer PeerConnection
//! (direkt oder ueber den Relay) in die Routing-Matrix und werden nach dem
//! Mischen verworfen. Der Inhalt ist fuer den Kern opak, nur Format und
//! Laenge sind bekannt.

use crate::types::ParticipantId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample-Format eines Frames oder Busses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Abtastrate in Hz
    pub sample_rate: u32,
    /// Kanalanzahl (1 = Mono, 2 = Stereo)
    pub kanaele: u16,
}

impl AudioFormat {
    pub const fn neu(sample_rate: u32, kanaele: u16) -> Self {
        Self {
            sample_rate,
            kanaele,
        }
    }

    /// Dauer von `frames` Sample-Frames in diesem Format
    pub fn dauer(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::neu(48000, 1)
    }
}

/// Ein Block interleavter f32-Samples eines Teilnehmers
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub participant_id: ParticipantId,
    pub format: AudioFormat,
    /// Aufnahmezeitpunkt beim Sender in Mikrosekunden
    pub aufgenommen_us: u64,
    /// Interleavte Samples, Laenge = frames * kanaele
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn neu(
        participant_id: ParticipantId,
        format: AudioFormat,
        aufgenommen_us: u64,
        samples: Vec<f32>,
    ) -> Self {
        Self {
            participant_id,
            format,
            aufgenommen_us,
            samples,
        }
    }

    /// Stille-Frame mit `frames` Sample-Frames
    pub fn stille(participant_id: ParticipantId, format: AudioFormat, frames: usize) -> Self {
        Self::neu(
            participant_id,
            format,
            0,
            vec![0.0; frames * format.kanaele.max(1) as usize],
        )
    }

    /// Anzahl Sample-Frames (Samples pro Kanal)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.kanaele.max(1) as usize
    }

    /// Abspieldauer dieses Frames
    pub fn dauer(&self) -> Duration {
        self.format.dauer(self.frames())
    }

    /// Spitzenpegel (Betrag) aller Samples
    pub fn spitze(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }
}
