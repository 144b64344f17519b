//! Output-Busse und ihre stabile Konfiguration

use std::fmt;
use std::str::FromStr;

use klangraum_core::{BusId, KlangraumError};
use serde::{Deserialize, Serialize};

use crate::pipeline::EffektStufe;
use crate::raum::Position;

/// Ziel, an das ein Bus seinen Mix schreibt
///
/// Textform in der Konfiguration: `null`, `speicher`, `standard` oder
/// `geraet:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SinkRef {
    /// Verwirft den Mix
    #[default]
    Null,
    /// Haelt die Bloecke im Speicher (Tests, Aufzeichnung)
    Speicher,
    /// Standard-Ausgabegeraet des Hosts
    Standard,
    /// Benanntes Ausgabegeraet
    Geraet(String),
}

impl fmt::Display for SinkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkRef::Null => write!(f, "null"),
            SinkRef::Speicher => write!(f, "speicher"),
            SinkRef::Standard => write!(f, "standard"),
            SinkRef::Geraet(name) => write!(f, "geraet:{}", name),
        }
    }
}

impl FromStr for SinkRef {
    type Err = KlangraumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" => Ok(SinkRef::Null),
            "speicher" => Ok(SinkRef::Speicher),
            "standard" => Ok(SinkRef::Standard),
            andere => match andere.strip_prefix("geraet:") {
                Some(name) if !name.is_empty() => Ok(SinkRef::Geraet(name.to_string())),
                _ => Err(KlangraumError::Konfiguration(format!(
                    "Unbekannte Senke '{}'",
                    andere
                ))),
            },
        }
    }
}

impl TryFrom<String> for SinkRef {
    type Error = KlangraumError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SinkRef> for String {
    fn from(s: SinkRef) -> Self {
        s.to_string()
    }
}

/// Veraenderliche Einstellungen eines Busses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusKonfig {
    /// Linearer Faktor auf den fertigen Mix, vor dem Limiter
    pub master_gain: f32,
    /// Bus-Effekte, nach allen Zuweisungs-Effekten
    pub effekte: Vec<EffektStufe>,
    /// Position des Hoerers fuer die Raeumlichkeit
    pub hoerer_position: Position,
}

impl Default for BusKonfig {
    fn default() -> Self {
        Self {
            master_gain: 1.0,
            effekte: Vec::new(),
            hoerer_position: Position::URSPRUNG,
        }
    }
}

/// Ein Bus wie er erstellt wird
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusDefinition {
    pub id: BusId,
    #[serde(default)]
    pub sink: SinkRef,
    #[serde(flatten)]
    pub konfig: BusKonfig,
}

impl BusDefinition {
    pub fn neu(id: impl Into<BusId>, sink: SinkRef) -> Self {
        Self {
            id: id.into(),
            sink,
            konfig: BusKonfig::default(),
        }
    }

    pub fn mit_konfig(mut self, konfig: BusKonfig) -> Self {
        self.konfig = konfig;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_ref_textform() {
        assert_eq!("null".parse::<SinkRef>().unwrap(), SinkRef::Null);
        assert_eq!(
            "geraet:USB Headset".parse::<SinkRef>().unwrap(),
            SinkRef::Geraet("USB Headset".into())
        );
        assert_eq!(SinkRef::Geraet("x".into()).to_string(), "geraet:x");
        assert!("geraet:".parse::<SinkRef>().is_err());
        assert!("lautsprecher".parse::<SinkRef>().is_err());
    }

    #[test]
    fn bus_aus_toml_mit_defaults() {
        let def: BusDefinition = toml::from_str(
            r#"
            id = "buehne"
            sink = "speicher"
            master_gain = 0.5
            hoerer_position = [0.0, 1.0, 0.0]
            "#,
        )
        .unwrap();
        assert_eq!(def.id, BusId::new("buehne"));
        assert_eq!(def.sink, SinkRef::Speicher);
        assert_eq!(def.konfig.master_gain, 0.5);
        assert!(def.konfig.effekte.is_empty());
        assert_eq!(def.konfig.hoerer_position, Position::neu(0.0, 1.0, 0.0));

        let minimal: BusDefinition = toml::from_str(r#"id = "leer""#).unwrap();
        assert_eq!(minimal.sink, SinkRef::Null);
        assert_eq!(minimal.konfig, BusKonfig::default());
    }
}
