//! klangraum-voice – Peer-Verbindungen mit Relay-Rueckfall
//!
//! Haelt pro entferntem Teilnehmer genau einen lebenden Audiopfad. Direkt
//! (UDP) wenn moeglich, sonst ueber den Relay des Signaling-Kanals.
//!
//! ## Module
//! - [`supervisor`] – Zustandsmaschine aller PeerConnections
//! - [`state`] – PeerConnection und Uebergangstabelle
//! - [`relay`] – Gemeinsame Relay-Sitzung
//! - [`reorder`] – Reorder-Fenster fuer Relay-Frames
//! - [`transport`] – Schnittstellen zu Signaling-Kanal und Direktpfad
//! - [`udp`] – UDP-Implementierung des Direktpfads
//! - [`task`] – Async-Task und Handle um den Supervisor
//! - [`config`] – Zeitlimits und Betriebsmodus

pub mod config;
pub mod relay;
pub mod reorder;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod transport;
pub mod udp;

pub use config::SupervisorConfig;
pub use relay::{RelaySitzung, RelayStatistik};
pub use state::PeerConnection;
pub use supervisor::{PeerSupervisor, SupervisorStatistik};
pub use task::{SupervisorHandle, SupervisorTask};
pub use transport::{DirektTransport, SignalKanal, TransportEreignis};
pub use udp::UdpDirektTransport;
