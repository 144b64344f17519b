//! Gemeinsame Identifikationstypen fuer Klangraum
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! Teilnehmer- und Bus-Kennungen zur Compilezeit auszuschliessen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stabile Kennung eines entfernten Teilnehmers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    /// Erstellt eine neue zufaellige ParticipantId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "teilnehmer:{}", self.0)
    }
}

impl std::str::FromStr for ParticipantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let roh = s.strip_prefix("teilnehmer:").unwrap_or(s);
        Ok(Self(Uuid::parse_str(roh)?))
    }
}

/// Name eines Ausgabe-Busses (aus der Konfiguration)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(pub String);

impl BusId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus:{}", self.0)
    }
}

impl From<&str> for BusId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ein entfernter Teilnehmer, wie ihn die Raum-Mitgliedschaft meldet
///
/// Gehoert dem Mitgliedschafts-Kollaborator; der Kern reagiert nur auf
/// Beitritt und Austritt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub anzeigename: String,
    pub beigetreten_am: DateTime<Utc>,
}

impl Participant {
    pub fn neu(id: ParticipantId, anzeigename: impl Into<String>) -> Self {
        Self {
            id,
            anzeigename: anzeigename.into(),
            beigetreten_am: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_id_eindeutig() {
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        assert_ne!(a, b, "Zwei neue ParticipantIds muessen verschieden sein");
    }

    #[test]
    fn participant_id_parsen_mit_und_ohne_praefix() {
        let id = ParticipantId(Uuid::nil());
        let mit: ParticipantId = id.to_string().parse().unwrap();
        let ohne: ParticipantId = Uuid::nil().to_string().parse().unwrap();
        assert_eq!(mit, id);
        assert_eq!(ohne, id);
    }

    #[test]
    fn bus_id_display() {
        assert_eq!(BusId::new("kopfhoerer").to_string(), "bus:kopfhoerer");
    }

    #[test]
    fn ids_sind_serde_transparent() {
        let id = ParticipantId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.inner()));

        let bus: BusId = serde_json::from_str("\"stream\"").unwrap();
        assert_eq!(bus.as_str(), "stream");
    }
}
