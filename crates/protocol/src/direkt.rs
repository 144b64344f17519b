//! Direktpfad-Protokoll (UDP)
//!
//! Binaere Paketstruktur fuer den direkten Transport zwischen zwei
//! Teilnehmern. Handshake und Audio laufen ueber denselben Socket.
//!
//! ## Paketformat (Header = 20 Bytes, big-endian, kein serde)
//!
//! ```text
//! Offset  Len  Beschreibung
//! ------  ---  -----------
//!  0       1   Version
//!  1       1   DirektPaketTyp (0 = Hallo, 1 = HalloAck, 2 = Audio, 3 = Tschuess)
//!  2       2   Flags
//!  4       4   Sequenznummer
//!  8       4   Sitzungs-Tag (aus der Verhandlung)
//! 12       8   Aufnahmezeitpunkt in Mikrosekunden
//! 20+      N   Nutzdaten
//! ```
//!
//! Audio-Nutzdaten: Abtastrate (u32 BE), Kanalanzahl (u16 BE), danach
//! Samples als i16 little-endian.

use klangraum_core::frame::{AudioFormat, AudioFrame};
use klangraum_core::types::ParticipantId;
use std::io;

/// Aktuelle Protokollversion
pub const PROTOKOLL_VERSION: u8 = 1;

/// Maximale Nutzdaten-Laenge (passt in ein Jumbo-Datagramm im LAN)
pub const MAX_NUTZDATEN_LAENGE: usize = 8192;

/// Laenge des Audio-Praefixes (Abtastrate + Kanalanzahl)
const AUDIO_PRAEFIX: usize = 6;

/// Art des Direktpfad-Paketes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DirektPaketTyp {
    /// Handshake-Anfrage
    Hallo = 0,
    /// Handshake-Bestaetigung
    HalloAck = 1,
    /// PCM-Audio
    Audio = 2,
    /// Gegenseite beendet den direkten Pfad
    Tschuess = 3,
}

impl DirektPaketTyp {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Hallo),
            1 => Some(Self::HalloAck),
            2 => Some(Self::Audio),
            3 => Some(Self::Tschuess),
            _ => None,
        }
    }
}

/// Ein Paket des direkten Pfads (Header + Nutzdaten)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirektPaket {
    pub typ: DirektPaketTyp,
    pub flags: u16,
    pub sequenz: u32,
    pub sitzung: u32,
    pub zeitstempel_us: u64,
    pub nutzdaten: Vec<u8>,
}

impl DirektPaket {
    /// Header-Groesse in Bytes
    pub const HEADER_SIZE: usize = 20;

    /// Steuerpaket ohne Nutzdaten (Hallo, HalloAck, Tschuess)
    pub fn steuerung(typ: DirektPaketTyp, sitzung: u32) -> Self {
        Self {
            typ,
            flags: 0,
            sequenz: 0,
            sitzung,
            zeitstempel_us: 0,
            nutzdaten: Vec::new(),
        }
    }

    /// Audio-Paket aus einem Frame; Samples werden auf i16 quantisiert
    pub fn audio(sequenz: u32, sitzung: u32, frame: &AudioFrame) -> Self {
        let mut nutzdaten = Vec::with_capacity(AUDIO_PRAEFIX + frame.samples.len() * 2);
        nutzdaten.extend_from_slice(&frame.format.sample_rate.to_be_bytes());
        nutzdaten.extend_from_slice(&frame.format.kanaele.to_be_bytes());
        for s in &frame.samples {
            let q = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            nutzdaten.extend_from_slice(&q.to_le_bytes());
        }
        Self {
            typ: DirektPaketTyp::Audio,
            flags: 0,
            sequenz,
            sitzung,
            zeitstempel_us: frame.aufgenommen_us,
            nutzdaten,
        }
    }

    /// Dekodiert die Audio-Nutzdaten in einen Frame des Absenders
    pub fn in_frame(&self, participant_id: ParticipantId) -> io::Result<AudioFrame> {
        if self.typ != DirektPaketTyp::Audio {
            return Err(ungueltig(format!("Kein Audio-Paket: {:?}", self.typ)));
        }
        if self.nutzdaten.len() < AUDIO_PRAEFIX || (self.nutzdaten.len() - AUDIO_PRAEFIX) % 2 != 0
        {
            return Err(ungueltig(format!(
                "Ungueltige Audio-Nutzdaten: {} Bytes",
                self.nutzdaten.len()
            )));
        }
        let d = &self.nutzdaten;
        let sample_rate = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
        let kanaele = u16::from_be_bytes([d[4], d[5]]);
        let samples = d[AUDIO_PRAEFIX..]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
            .collect();
        Ok(AudioFrame::neu(
            participant_id,
            AudioFormat::neu(sample_rate, kanaele),
            self.zeitstempel_us,
            samples,
        ))
    }

    /// Serialisiert das gesamte Paket
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.nutzdaten.len());
        buf.push(PROTOKOLL_VERSION);
        buf.push(self.typ as u8);
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.sequenz.to_be_bytes());
        buf.extend_from_slice(&self.sitzung.to_be_bytes());
        buf.extend_from_slice(&self.zeitstempel_us.to_be_bytes());
        buf.extend_from_slice(&self.nutzdaten);
        buf
    }

    /// Deserialisiert und validiert ein Paket
    ///
    /// # Fehler
    /// - `InvalidData` bei zu kurzem Puffer, falscher Version, unbekanntem
    ///   Typ oder zu langen Nutzdaten
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(ungueltig(format!(
                "Header zu kurz: {} Bytes (erwartet {})",
                buf.len(),
                Self::HEADER_SIZE
            )));
        }
        if buf[0] != PROTOKOLL_VERSION {
            return Err(ungueltig(format!(
                "Ungueltige Protokollversion: {} (erwartet {})",
                buf[0], PROTOKOLL_VERSION
            )));
        }
        let typ = DirektPaketTyp::from_u8(buf[1])
            .ok_or_else(|| ungueltig(format!("Unbekannter Pakettyp: {}", buf[1])))?;
        let nutzdaten = &buf[Self::HEADER_SIZE..];
        if nutzdaten.len() > MAX_NUTZDATEN_LAENGE {
            return Err(ungueltig(format!(
                "Nutzdaten zu lang: {} Bytes (Maximum {})",
                nutzdaten.len(),
                MAX_NUTZDATEN_LAENGE
            )));
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[12..20]);

        Ok(Self {
            typ,
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            sequenz: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            sitzung: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            zeitstempel_us: u64::from_be_bytes(ts),
            nutzdaten: nutzdaten.to_vec(),
        })
    }
}

fn ungueltig(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_groesse_ist_20_bytes() {
        let p = DirektPaket::steuerung(DirektPaketTyp::Hallo, 0xCAFE);
        assert_eq!(p.encode().len(), DirektPaket::HEADER_SIZE);
    }

    #[test]
    fn steuerpaket_round_trip() {
        let p = DirektPaket::steuerung(DirektPaketTyp::HalloAck, 0xDEAD_BEEF);
        assert_eq!(DirektPaket::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn audio_quantisierung_bleibt_nah_am_original() {
        let pid = ParticipantId::new();
        let frame = AudioFrame::neu(pid, AudioFormat::neu(48000, 2), 99, vec![0.5, -0.5, 0.0, 1.0]);
        let paket = DirektPaket::audio(3, 1, &frame);
        let zurueck = DirektPaket::decode(&paket.encode())
            .unwrap()
            .in_frame(pid)
            .unwrap();
        assert_eq!(zurueck.format, frame.format);
        assert_eq!(zurueck.aufgenommen_us, 99);
        for (a, b) in zurueck.samples.iter().zip(frame.samples.iter()) {
            assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn audio_werte_ausserhalb_werden_begrenzt() {
        let frame = AudioFrame::neu(ParticipantId::new(), AudioFormat::default(), 0, vec![3.0]);
        let zurueck = DirektPaket::audio(0, 0, &frame)
            .in_frame(frame.participant_id)
            .unwrap();
        assert!((zurueck.samples[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn decode_unbekannter_typ() {
        let mut bytes = DirektPaket::steuerung(DirektPaketTyp::Tschuess, 1).encode();
        bytes[1] = 200;
        assert!(DirektPaket::decode(&bytes).is_err());
    }

    #[test]
    fn decode_zu_grosse_nutzdaten() {
        let mut bytes = DirektPaket::steuerung(DirektPaketTyp::Audio, 1).encode();
        bytes.extend(vec![0u8; MAX_NUTZDATEN_LAENGE + 1]);
        assert!(DirektPaket::decode(&bytes).is_err());
    }

    #[test]
    fn steuerpaket_ist_kein_audio() {
        let p = DirektPaket::steuerung(DirektPaketTyp::Hallo, 1);
        assert!(p.in_frame(ParticipantId::new()).is_err());
    }
}
