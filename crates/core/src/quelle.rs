//! Schnittstelle zwischen Transport und Routing-Matrix
//!
//! Die PeerConnection ist Produzent, die Routing-Matrix Konsument. Der
//! Supervisor kennt nur diese Traits, nicht die Matrix selbst.

use crate::frame::AudioFrame;
use crate::types::ParticipantId;

/// Produzenten-Seite der Frame-Queue eines Teilnehmers
///
/// Gehoert exklusiv der PeerConnection. Wird sie gedroppt, koennen keine
/// weiteren Frames fuer diesen Teilnehmer eingereiht werden.
pub trait FrameEingabe: Send {
    /// Einziger Einspeisepunkt fuer Frames (direkt und Relay)
    fn on_frame(&mut self, frame: AudioFrame);
}

/// Registriert und entfernt Teilnehmer-Quellen
pub trait QuellenRegister: Send + Sync + 'static {
    /// Legt die Queue fuer `participant_id` an und liefert deren Produzenten
    fn quelle_registrieren(&self, participant_id: ParticipantId) -> Box<dyn FrameEingabe>;

    /// Entfernt die Queue; fehlende Quellen sind kein Fehler
    fn quelle_entfernen(&self, participant_id: ParticipantId);
}
