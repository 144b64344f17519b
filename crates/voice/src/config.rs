//! Konfiguration des Peer-Supervisors
//!
//! Alle Zeitkonstanten sind einstellbare Standardwerte, keine festen
//! Verhaltensgarantien.

use klangraum_core::zustand::BetriebsModus;
use std::time::Duration;

/// Laufzeit-Konfiguration fuer [`PeerSupervisor`](crate::supervisor::PeerSupervisor)
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Pfadwahl (auto, force_direct, force_relay)
    pub modus: BetriebsModus,
    /// Verhandlung ohne Handshake -> Rueckfall (bzw. Fehlgeschlagen bei force_direct)
    pub verhandlungs_timeout: Duration,
    /// DirektVerbunden ohne eingehendes Audio -> Rueckfall
    pub aktivitaets_timeout: Duration,
    /// Rueckfall ohne Relay-Bestaetigung -> Fehlgeschlagen
    pub relay_timeout: Duration,
    /// Wiederholungen bevor ein Teilnehmer als unerreichbar gilt
    pub max_versuche: u32,
    /// Abstand der automatischen Wiederholungen und der Direktpfad-Proben
    pub wiederholung_intervall: Duration,
    /// Reorder-Fenster des Relay-Pfads
    pub reorder_fenster: Duration,
    /// Obergrenze gepufferter Relay-Frames pro Teilnehmer
    pub max_gepuffert: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            modus: BetriebsModus::Auto,
            verhandlungs_timeout: Duration::from_millis(5000),
            aktivitaets_timeout: Duration::from_millis(3000),
            relay_timeout: Duration::from_millis(5000),
            max_versuche: 3,
            wiederholung_intervall: Duration::from_millis(10_000),
            reorder_fenster: Duration::from_millis(200),
            max_gepuffert: 64,
        }
    }
}
