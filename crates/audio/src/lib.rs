//! klangraum-audio – Routing-Matrix und Bus-Mixer
//!
//! Verteilt die Frames aller Teilnehmer auf Output-Busse:
//! - Routing-Matrix mit Copy-on-Write-Schnappschuessen
//! - SPSC-Queue pro Teilnehmer in den Mix-Thread
//! - Raeumliche Platzierung, Effekt-Ketten, Soft-Limiter
//! - Mix-Thread mit festem Takt
//! - Senken: Null, Speicher, cpal-Ausgabegeraet
//! - Mikrofon-Aufnahme via cpal

pub mod aufnahme;
pub mod bus;
pub mod device;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod matrix;
pub mod mixer;
pub mod pipeline;
pub mod raum;
pub mod sink;

// Bequeme Re-Exporte der wichtigsten Typen
pub use aufnahme::{Aufnahme, AufnahmeConfig, FrameSammler};
pub use bus::{BusDefinition, BusKonfig, SinkRef};
pub use device::{ausgabegeraete_auflisten, GeraetInfo};
pub use dsp::AudioProcessor;
pub use engine::MixEngine;
pub use error::{AudioError, AudioResult};
pub use matrix::{
    FrameEingang, MatrixConfig, MatrixSchnappschuss, ReloadBericht, RoutingAssignment,
    RoutingMatrix, Vorgaben, ZuweisungsOptionen,
};
pub use mixer::{BusMixer, MixStatistik, SoftLimiter};
pub use pipeline::{EffektKette, EffektStufe};
pub use raum::Position;
pub use sink::{AudioSink, GeraeteSink, NullSink, SinkFabrik, SpeicherAbzug, SpeicherSink, StandardSinkFabrik};
