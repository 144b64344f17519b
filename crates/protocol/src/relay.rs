//! Relay-Frame – Audio-Frame fuer den Relay-Pfad
//!
//! Wird binaer kodiert und als Base64 in [`KanalNachricht::RelayAudio`]
//! ueber den Signaling-Kanal getunnelt.
//!
//! ## Format (Header = 24 Bytes, big-endian)
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       1   Version
//!  1       1   Flags (reserviert)
//!  2       2   Kanalanzahl
//!  4       4   Sequenznummer (monoton steigend pro Sender)
//!  8       8   Aufnahmezeitpunkt in Mikrosekunden
//! 16       4   Abtastrate in Hz
//! 20       4   Anzahl Samples (interleaved)
//! 24+    4*N   Samples als f32 little-endian
//! ```
//!
//! [`KanalNachricht::RelayAudio`]: crate::signal::KanalNachricht::RelayAudio

use klangraum_core::frame::{AudioFormat, AudioFrame};
use klangraum_core::types::ParticipantId;
use std::io;

/// Aktuelle Version des Relay-Formats
pub const RELAY_VERSION: u8 = 1;

/// Obergrenze fuer Samples pro Frame (1 Sekunde Stereo bei 48 kHz)
pub const MAX_SAMPLES: usize = 96_000;

/// Ein Audio-Frame mit Sequenznummer fuer den Relay-Pfad
#[derive(Debug, Clone, PartialEq)]
pub struct RelayFrame {
    pub sequenz: u32,
    pub aufgenommen_us: u64,
    pub format: AudioFormat,
    pub samples: Vec<f32>,
}

impl RelayFrame {
    /// Header-Groesse in Bytes
    pub const HEADER_SIZE: usize = 24;

    /// Verpackt einen lokalen Frame mit der naechsten Sequenznummer
    pub fn aus_frame(sequenz: u32, frame: &AudioFrame) -> Self {
        Self {
            sequenz,
            aufgenommen_us: frame.aufgenommen_us,
            format: frame.format,
            samples: frame.samples.clone(),
        }
    }

    /// Entpackt den Frame fuer die Routing-Matrix
    pub fn in_frame(self, participant_id: ParticipantId) -> AudioFrame {
        AudioFrame::neu(participant_id, self.format, self.aufgenommen_us, self.samples)
    }

    /// Serialisiert Header und Samples
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.samples.len() * 4);
        buf.push(RELAY_VERSION);
        buf.push(0);
        buf.extend_from_slice(&self.format.kanaele.to_be_bytes());
        buf.extend_from_slice(&self.sequenz.to_be_bytes());
        buf.extend_from_slice(&self.aufgenommen_us.to_be_bytes());
        buf.extend_from_slice(&self.format.sample_rate.to_be_bytes());
        buf.extend_from_slice(&(self.samples.len() as u32).to_be_bytes());
        for s in &self.samples {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf
    }

    /// Deserialisiert und validiert einen Relay-Frame
    ///
    /// # Fehler
    /// - `InvalidData` bei zu kurzem Puffer, falscher Version,
    ///   unplausibler Sample-Anzahl oder Laengen-Mismatch
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(ungueltig(format!(
                "Relay-Frame zu kurz: {} Bytes (erwartet mindestens {})",
                buf.len(),
                Self::HEADER_SIZE
            )));
        }
        if buf[0] != RELAY_VERSION {
            return Err(ungueltig(format!(
                "Ungueltige Relay-Version: {} (erwartet {})",
                buf[0], RELAY_VERSION
            )));
        }

        let kanaele = u16::from_be_bytes([buf[2], buf[3]]);
        let sequenz = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[8..16]);
        let aufgenommen_us = u64::from_be_bytes(ts);
        let sample_rate = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let anzahl = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]) as usize;

        if anzahl > MAX_SAMPLES {
            return Err(ungueltig(format!(
                "Zu viele Samples: {} (Maximum {})",
                anzahl, MAX_SAMPLES
            )));
        }
        let nutzdaten = &buf[Self::HEADER_SIZE..];
        if nutzdaten.len() != anzahl * 4 {
            return Err(ungueltig(format!(
                "Laengen-Mismatch: {} Bytes fuer {} Samples",
                nutzdaten.len(),
                anzahl
            )));
        }

        let samples = nutzdaten
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            sequenz,
            aufgenommen_us,
            format: AudioFormat::neu(sample_rate, kanaele),
            samples,
        })
    }
}

fn ungueltig(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame(seq: u32) -> RelayFrame {
        RelayFrame {
            sequenz: seq,
            aufgenommen_us: 1_700_000_000_123_456,
            format: AudioFormat::neu(48000, 2),
            samples: vec![0.25, -0.5, 1.0, 0.0],
        }
    }

    #[test]
    fn encode_decode_erhaelt_alle_felder() {
        let frame = test_frame(42);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), RelayFrame::HEADER_SIZE + 16);
        assert_eq!(RelayFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn header_big_endian() {
        let bytes = test_frame(0x01020304).encode();
        assert_eq!(bytes[0], RELAY_VERSION);
        assert_eq!(&bytes[2..4], &[0, 2]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn decode_falsche_version() {
        let mut bytes = test_frame(1).encode();
        bytes[0] = 9;
        assert!(RelayFrame::decode(&bytes).is_err());
    }

    #[test]
    fn decode_abgeschnittene_samples() {
        let bytes = test_frame(1).encode();
        assert!(RelayFrame::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn decode_zu_kurz() {
        assert!(RelayFrame::decode(&[RELAY_VERSION; 10]).is_err());
    }

    #[test]
    fn frame_konvertierung_setzt_absender() {
        let pid = ParticipantId::new();
        let frame = test_frame(5).in_frame(pid);
        assert_eq!(frame.participant_id, pid);
        assert_eq!(frame.frames(), 2);
    }
}
