//! klangraum-core – Gemeinsame Typen, Fehler und Ereignisse
//!
//! Dieses Crate stellt die Bausteine bereit, die Transport (`klangraum-voice`)
//! und Routing (`klangraum-audio`) gemeinsam nutzen.

pub mod error;
pub mod event;
pub mod frame;
pub mod quelle;
pub mod types;
pub mod zustand;

// Re-Exporte fuer bequemen Zugriff
pub use error::{KlangraumError, Result};
pub use event::{EreignisKanal, KlangraumEvent};
pub use frame::{AudioFormat, AudioFrame};
pub use quelle::{FrameEingabe, QuellenRegister};
pub use types::{BusId, Participant, ParticipantId};
pub use zustand::{BetriebsModus, PeerZustand, PfadModus};
