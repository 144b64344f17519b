//! klangraum-protocol – Nachrichten- und Paketformate
//!
//! - [`signal`] – Nachrichten ueber den Signaling-Kanal (JSON, getaggte Enums)
//! - [`wire`] – Laengen-praefixiertes Framing fuer die TCP-Verbindung
//! - [`relay`] – Binaerformat der Audio-Frames auf dem Relay-Pfad
//! - [`direkt`] – Binaerformat der UDP-Pakete auf dem direkten Pfad

pub mod direkt;
pub mod relay;
pub mod signal;
pub mod wire;

pub use direkt::{DirektPaket, DirektPaketTyp};
pub use relay::RelayFrame;
pub use signal::{KanalNachricht, RaumEreignis, SignalNachricht, SignalUmschlag};
pub use wire::FrameCodec;
