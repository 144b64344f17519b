//! Client-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Client ohne Konfigurationsdatei
//! lauffaehig ist. Dieselbe Datei dient beim Neuladen als Quelle fuer Busse
//! und Zuweisungen.

use std::net::SocketAddr;
use std::time::Duration;

use klangraum_audio::{BusDefinition, MatrixConfig, Vorgaben, ZuweisungsOptionen};
use klangraum_core::{AudioFormat, BetriebsModus, BusId, ParticipantId};
use klangraum_voice::SupervisorConfig;
use serde::{Deserialize, Serialize};

/// Vollstaendige Client-Konfiguration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Verbindungsaufbau und Zeitlimits
    pub verbindung: VerbindungsEinstellungen,
    /// Relay-Pfad
    pub relay: RelayEinstellungen,
    /// Mix-Engine und Routing-Matrix
    pub audio: AudioEinstellungen,
    /// Ausgabe-Busse
    pub busse: Vec<BusDefinition>,
    /// Vorgegebene Routing-Zuweisungen
    pub zuweisungen: Vec<ZuweisungsEintrag>,
    /// Koordinationsserver
    pub signaling: SignalingEinstellungen,
    /// Logging-Einstellungen
    pub logging: LoggingEinstellungen,
    /// Observability-Einstellungen (Metriken, Health)
    pub observability: ObservabilityEinstellungen,
}

/// Verbindungsaufbau zu anderen Teilnehmern
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerbindungsEinstellungen {
    /// `auto`, `force_direct` oder `force_relay`
    pub modus: BetriebsModus,
    pub verhandlungs_timeout_ms: u64,
    /// DirektVerbunden ohne eingehendes Audio -> Rueckfall
    pub aktivitaets_timeout_ms: u64,
    /// Rueckfall ohne Relay-Bestaetigung -> Fehlgeschlagen
    pub relay_timeout_ms: u64,
    pub max_versuche: u32,
    pub wiederholung_intervall_ms: u64,
    /// Lokale Adresse des UDP-Direktpfads
    pub udp_bind: SocketAddr,
}

impl Default for VerbindungsEinstellungen {
    fn default() -> Self {
        Self {
            modus: BetriebsModus::Auto,
            verhandlungs_timeout_ms: 5000,
            aktivitaets_timeout_ms: 3000,
            relay_timeout_ms: 5000,
            max_versuche: 3,
            wiederholung_intervall_ms: 10_000,
            udp_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

/// Relay-Pfad
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayEinstellungen {
    /// Reorder-Fenster in Millisekunden
    pub reorder_fenster_ms: u64,
    /// Maximal gepufferte Frames pro Teilnehmer
    pub max_gepuffert: usize,
}

impl Default for RelayEinstellungen {
    fn default() -> Self {
        Self {
            reorder_fenster_ms: 200,
            max_gepuffert: 64,
        }
    }
}

/// Mix-Engine und Routing-Matrix
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEinstellungen {
    pub sample_rate: u32,
    pub kanaele: u16,
    /// Sample-Frames pro Mix-Zyklus (256 bei 48kHz = 5.33ms)
    pub zyklus_frames: usize,
    /// Kapazitaet der Frame-Queue pro Teilnehmer
    pub queue_frames: usize,
    pub limiter_decke: f32,
    pub limiter_knie: f32,
    /// Bus fuer Teilnehmer ohne Zuweisung (leer = stumm)
    pub standard_bus: Option<String>,
    /// Lokales Mikrofon aufnehmen und an die Peers senden
    pub aufnahme: bool,
    /// Eingabegeraet (leer = Standard)
    pub eingabegeraet: Option<String>,
    /// Sample-Frames pro aufgenommenem Frame
    pub aufnahme_frames: usize,
}

impl Default for AudioEinstellungen {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            kanaele: 2,
            zyklus_frames: 256,
            queue_frames: 32,
            limiter_decke: 1.0,
            limiter_knie: 0.8,
            standard_bus: None,
            aufnahme: false,
            eingabegeraet: None,
            aufnahme_frames: 480,
        }
    }
}

/// Eine vorgegebene Zuweisung `teilnehmer -> bus`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZuweisungsEintrag {
    pub teilnehmer: ParticipantId,
    pub bus: BusId,
    #[serde(flatten)]
    pub optionen: ZuweisungsOptionen,
}

/// Koordinationsserver (Signaling und Relay)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingEinstellungen {
    /// `host:port`
    pub adresse: String,
    /// Kapazitaet der Sende-Queue
    pub sende_queue: usize,
}

impl Default for SignalingEinstellungen {
    fn default() -> Self {
        Self {
            adresse: "127.0.0.1:9870".into(),
            sende_queue: 1024,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Observability-Einstellungen (Metriken + Health-Check)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityEinstellungen {
    /// Aktiviert den Observability-Server
    pub aktiviert: bool,
    pub bind_adresse: SocketAddr,
    /// Abstand, in dem Metriken aus Supervisor und Mixer uebernommen werden
    pub intervall_ms: u64,
}

impl Default for ObservabilityEinstellungen {
    fn default() -> Self {
        Self {
            aktiviert: true,
            bind_adresse: SocketAddr::from(([127, 0, 0, 1], 9300)),
            intervall_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => Self::aus_toml(&inhalt)
                .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Parst und prueft eine Konfiguration aus TOML-Text
    pub fn aus_toml(inhalt: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(inhalt)?;
        config.pruefen()?;
        Ok(config)
    }

    /// Prueft Werte, die serde allein nicht abfangen kann
    pub fn pruefen(&self) -> anyhow::Result<()> {
        let a = &self.audio;
        if a.zyklus_frames == 0 {
            anyhow::bail!("audio.zyklus_frames muss groesser als 0 sein");
        }
        if a.queue_frames == 0 {
            anyhow::bail!("audio.queue_frames muss groesser als 0 sein");
        }
        if !(a.limiter_decke > 0.0) || !(0.0..=a.limiter_decke).contains(&a.limiter_knie) {
            anyhow::bail!(
                "audio.limiter_knie ({}) muss zwischen 0 und limiter_decke ({}) liegen",
                a.limiter_knie,
                a.limiter_decke
            );
        }
        if let Some(bus) = &a.standard_bus {
            if !self.busse.iter().any(|b| b.id.as_str() == bus) {
                anyhow::bail!("audio.standard_bus '{bus}' ist kein definierter Bus");
            }
        }
        Ok(())
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::neu(self.audio.sample_rate, self.audio.kanaele)
    }

    pub fn standard_bus(&self) -> Option<BusId> {
        self.audio.standard_bus.as_deref().map(BusId::from)
    }

    pub fn matrix_config(&self) -> MatrixConfig {
        MatrixConfig {
            format: self.format(),
            zyklus_frames: self.audio.zyklus_frames,
            queue_frames: self.audio.queue_frames,
            limiter_decke: self.audio.limiter_decke,
            limiter_knie: self.audio.limiter_knie,
            standard_bus: self.standard_bus(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let v = &self.verbindung;
        SupervisorConfig {
            modus: v.modus,
            verhandlungs_timeout: Duration::from_millis(v.verhandlungs_timeout_ms),
            aktivitaets_timeout: Duration::from_millis(v.aktivitaets_timeout_ms),
            relay_timeout: Duration::from_millis(v.relay_timeout_ms),
            max_versuche: v.max_versuche,
            wiederholung_intervall: Duration::from_millis(v.wiederholung_intervall_ms),
            reorder_fenster: Duration::from_millis(self.relay.reorder_fenster_ms),
            max_gepuffert: self.relay.max_gepuffert,
        }
    }

    /// Gruppiert die Zuweisungen nach Teilnehmer (Reihenfolge bleibt erhalten)
    pub fn vorgaben(&self) -> Vorgaben {
        let mut vorgaben = Vorgaben::new();
        for eintrag in &self.zuweisungen {
            vorgaben
                .entry(eintrag.teilnehmer)
                .or_default()
                .push((eintrag.bus.clone(), eintrag.optionen.clone()));
        }
        vorgaben
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use klangraum_audio::{EffektStufe, Position, SinkRef};

    #[test]
    fn standard_config_ist_valide() {
        let cfg = ClientConfig::default();
        assert!(cfg.pruefen().is_ok());
        assert_eq!(cfg.verbindung.modus, BetriebsModus::Auto);
        assert_eq!(cfg.relay.reorder_fenster_ms, 200);
        assert_eq!(cfg.audio.zyklus_frames, 256);
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.busse.is_empty());
    }

    #[test]
    fn supervisor_zeitlimits_aus_millisekunden() {
        let cfg = ClientConfig::default();
        let sv = cfg.supervisor_config();
        assert_eq!(sv.verhandlungs_timeout, Duration::from_secs(5));
        assert_eq!(sv.aktivitaets_timeout, Duration::from_secs(3));
        assert_eq!(sv.reorder_fenster, Duration::from_millis(200));
        assert_eq!(sv.max_gepuffert, 64);
    }

    #[test]
    fn config_aus_toml_string() {
        let pid = ParticipantId::new();
        let toml = format!(
            r#"
            [verbindung]
            modus = "force_relay"
            verhandlungs_timeout_ms = 2500

            [audio]
            kanaele = 1
            standard_bus = "haupt"

            [[busse]]
            id = "haupt"
            sink = "speicher"
            master_gain = 0.5

            [[busse]]
            id = "stream"
            sink = "geraet:Loopback"
            hoerer_position = [0.0, 1.0, 0.0]
            effekte = [
                {{ typ = "hochpass", grenzfrequenz_hz = 80.0 }},
                {{ typ = "kompressor", schwelle_db = -18.0, ratio = 3.0 }},
            ]

            [[zuweisungen]]
            teilnehmer = "{}"
            bus = "stream"
            gain = 0.7
            position = [2.0, 0.0, 0.0]

            [[zuweisungen]]
            teilnehmer = "{}"
            bus = "haupt"
            "#,
            pid.inner(),
            pid.inner()
        );
        let cfg = ClientConfig::aus_toml(&toml).unwrap();
        assert_eq!(cfg.verbindung.modus, BetriebsModus::ForceRelay);
        assert_eq!(cfg.verbindung.verhandlungs_timeout_ms, 2500);
        // Nicht angegebene Felder behalten Standardwerte
        assert_eq!(cfg.verbindung.relay_timeout_ms, 5000);
        assert_eq!(cfg.audio.sample_rate, 48000);

        assert_eq!(cfg.busse.len(), 2);
        assert_eq!(cfg.busse[0].sink, SinkRef::Speicher);
        assert_eq!(cfg.busse[0].konfig.master_gain, 0.5);
        assert_eq!(cfg.busse[1].sink, SinkRef::Geraet("Loopback".into()));
        assert_eq!(cfg.busse[1].konfig.effekte.len(), 2);
        assert_eq!(
            cfg.busse[1].konfig.effekte[0],
            EffektStufe::Hochpass {
                grenzfrequenz_hz: 80.0
            }
        );

        let vorgaben = cfg.vorgaben();
        let liste = &vorgaben[&pid];
        assert_eq!(liste.len(), 2);
        assert_eq!(liste[0].0, BusId::new("stream"));
        assert_eq!(liste[0].1.gain, 0.7);
        assert_eq!(liste[0].1.position, Position::neu(2.0, 0.0, 0.0));
        assert_eq!(liste[1].1, ZuweisungsOptionen::default());

        let matrix = cfg.matrix_config();
        assert_eq!(matrix.format, AudioFormat::neu(48000, 1));
        assert_eq!(matrix.standard_bus, Some(BusId::new("haupt")));
    }

    #[test]
    fn unbekannter_standard_bus_wird_abgelehnt() {
        let toml = r#"
            [audio]
            standard_bus = "fehlt"
        "#;
        assert!(ClientConfig::aus_toml(toml).is_err());
    }

    #[test]
    fn knie_ueber_decke_wird_abgelehnt() {
        let toml = r#"
            [audio]
            limiter_decke = 0.9
            limiter_knie = 0.95
        "#;
        assert!(ClientConfig::aus_toml(toml).is_err());
    }

    #[test]
    fn fehlende_datei_liefert_standardwerte() {
        let cfg = ClientConfig::laden("/nicht/vorhanden/klangraum.toml").unwrap();
        assert_eq!(cfg.signaling.adresse, "127.0.0.1:9870");
    }
}
