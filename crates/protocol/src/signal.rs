//! Signaling-Nachrichten
//!
//! Alles was ueber den Signaling-Kanal laeuft: Verhandlungsnachrichten pro
//! Teilnehmer, Raum-Mitgliedschaft und Relay-Audio.
//!
//! ## Design
//! - Getaggte Enums statt String-Dispatch; `match` ist erschoepfend
//! - JSON-Serialisierung via serde (der Kanal ist nicht zeitkritisch)
//! - Relay-Audio wird als Base64 des binaeren [`RelayFrame`](crate::relay::RelayFrame)
//!   transportiert

use klangraum_core::types::{Participant, ParticipantId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

// ---------------------------------------------------------------------------
// Verhandlung (pro Teilnehmer)
// ---------------------------------------------------------------------------

/// Nachricht zwischen zwei Teilnehmern, vom Koordinationsserver weitergereicht
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typ", rename_all = "snake_case")]
pub enum SignalNachricht {
    /// Initiator bietet seine UDP-Kandidaten an
    Angebot {
        sitzung: u32,
        kandidaten: Vec<SocketAddr>,
    },
    /// Antwort des Responders mit dessen Kandidaten
    Antwort {
        sitzung: u32,
        kandidaten: Vec<SocketAddr>,
    },
    /// Nachgereichter Kandidat (trickle)
    Kandidat { sitzung: u32, adresse: SocketAddr },
    /// Relay-Dienst bestaetigt, dass Audio dieses Teilnehmers fliesst
    RelayBestaetigt,
    /// Relay-Dienst kann diesen Teilnehmer nicht bedienen
    RelayAbgelehnt { grund: String },
    /// Gegenseite schliesst die Verbindung
    Schliessen { grund: String },
}

impl SignalNachricht {
    /// Sitzungs-Tag einer Verhandlungsnachricht
    pub fn sitzung(&self) -> Option<u32> {
        match self {
            Self::Angebot { sitzung, .. }
            | Self::Antwort { sitzung, .. }
            | Self::Kandidat { sitzung, .. } => Some(*sitzung),
            Self::RelayBestaetigt | Self::RelayAbgelehnt { .. } | Self::Schliessen { .. } => None,
        }
    }
}

/// Verhandlungsnachricht mit Gegenstelle
///
/// Ausgehend ist `participant_id` der Empfaenger, eingehend der Absender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalUmschlag {
    pub participant_id: ParticipantId,
    pub nachricht: SignalNachricht,
}

// ---------------------------------------------------------------------------
// Raum-Mitgliedschaft
// ---------------------------------------------------------------------------

/// Meldungen des Mitgliedschafts-Kollaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typ", rename_all = "snake_case")]
pub enum RaumEreignis {
    Beigetreten {
        teilnehmer: Participant,
        /// Lokale Seite startet die Verhandlung
        initiator: bool,
    },
    Verlassen { participant_id: ParticipantId },
}

// ---------------------------------------------------------------------------
// Kanal-Nachricht (alles was ueber die TCP-Verbindung laeuft)
// ---------------------------------------------------------------------------

/// Oberste Nachrichtenebene des Signaling-Kanals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "art", content = "inhalt", rename_all = "snake_case")]
pub enum KanalNachricht {
    Signal(SignalUmschlag),
    Raum(RaumEreignis),
    /// Einmalige Aktivierung der gemeinsamen Relay-Sitzung
    RelayAktivieren,
    /// Relay-Audio; ausgehend ohne Absender (der Server stempelt ihn)
    RelayAudio {
        von: Option<ParticipantId>,
        #[serde(with = "base64_bytes")]
        daten: Vec<u8>,
    },
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(daten: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(daten))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
