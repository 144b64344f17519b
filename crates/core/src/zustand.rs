//! Verbindungszustaende einer PeerConnection
//!
//! Die Zustandsmaschine selbst lebt in `klangraum-voice`; hier liegen nur
//! die Typen, damit Ereignisse sie transportieren koennen.

use serde::{Deserialize, Serialize};

/// Zustand einer PeerConnection
///
/// ```text
/// Leerlauf -> Verhandlung -> DirektVerbunden -> Geschlossen
///                 |               |
///                 v               v
///              Rueckfall <--------+
///               |     |
///               v     v
///   RelayVerbunden   Fehlgeschlagen -> (Wiederholung) -> Verhandlung
///                          |
///                          v
///                     Unerreichbar (ruhend, keine automatische Wiederholung)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerZustand {
    /// Angelegt, Verhandlung noch nicht gestartet (Idle)
    Leerlauf,
    /// Direkter Handshake laeuft (Negotiating)
    Verhandlung,
    /// Direkter Transport steht (DirectConnected)
    DirektVerbunden,
    /// Wechsel auf den Relay-Pfad laeuft (FallingBack)
    Rueckfall,
    /// Audio fliesst ueber den Relay (RelayConnected)
    RelayVerbunden,
    /// Direkt und Relay gescheitert (Failed)
    Fehlgeschlagen,
    /// Wiederholungslimit erreicht, ruhend (dormant)
    Unerreichbar,
    /// Endzustand (Closed)
    Geschlossen,
}

impl PeerZustand {
    /// Nur `Geschlossen` ist terminal
    pub fn ist_terminal(self) -> bool {
        matches!(self, Self::Geschlossen)
    }

    /// Fliesst in diesem Zustand Audio?
    pub fn ist_verbunden(self) -> bool {
        matches!(self, Self::DirektVerbunden | Self::RelayVerbunden)
    }

    /// Transportiert der Relay-Pfad in diesem Zustand die Frames?
    pub fn nutzt_relay(self) -> bool {
        matches!(self, Self::Rueckfall | Self::RelayVerbunden)
    }
}

impl std::fmt::Display for PeerZustand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Leerlauf => "leerlauf",
            Self::Verhandlung => "verhandlung",
            Self::DirektVerbunden => "direkt_verbunden",
            Self::Rueckfall => "rueckfall",
            Self::RelayVerbunden => "relay_verbunden",
            Self::Fehlgeschlagen => "fehlgeschlagen",
            Self::Unerreichbar => "unerreichbar",
            Self::Geschlossen => "geschlossen",
        };
        f.write_str(name)
    }
}

/// Ueber welchen Pfad die Frames eines Teilnehmers laufen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PfadModus {
    Direkt,
    Relay,
}

/// Betriebsmodus fuer die Pfadwahl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetriebsModus {
    /// Direkt versuchen, bei Bedarf auf Relay zurueckfallen
    #[default]
    Auto,
    /// Nur direkt; Scheitern fuehrt zu `Fehlgeschlagen`, nie zum Relay
    ForceDirect,
    /// Verhandlung ueberspringen, sofort `Rueckfall`
    ForceRelay,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nur_geschlossen_ist_terminal() {
        assert!(PeerZustand::Geschlossen.ist_terminal());
        assert!(!PeerZustand::Fehlgeschlagen.ist_terminal());
        assert!(!PeerZustand::Unerreichbar.ist_terminal());
    }

    #[test]
    fn modus_aus_konfigurationstext() {
        let m: BetriebsModus = serde_json::from_str("\"force_relay\"").unwrap();
        assert_eq!(m, BetriebsModus::ForceRelay);
        assert_eq!(BetriebsModus::default(), BetriebsModus::Auto);
    }
}
