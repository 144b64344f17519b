//! Transport-Schnittstellen des Supervisors
//!
//! Der Supervisor ist synchron und besitzt keine I/O. Er spricht mit dem
//! Signaling-Kanal und dem direkten Transport nur ueber diese Traits; die
//! Rueckrichtung laeuft ueber [`TransportEreignis`] und begrenzte Queues.

use klangraum_core::frame::AudioFrame;
use klangraum_core::types::ParticipantId;
use klangraum_protocol::signal::KanalNachricht;
use std::net::SocketAddr;

/// Ausgehende Richtung des Signaling-Kanals
///
/// `senden` blockiert nie. Ist die Queue voll oder die Verbindung weg,
/// wird die Nachricht verworfen und geloggt.
pub trait SignalKanal: Send + Sync {
    fn senden(&self, nachricht: KanalNachricht);
}

/// Direkter Punkt-zu-Punkt-Transport (Kommandoseite)
pub trait DirektTransport: Send {
    /// Eigene Adressen fuer Angebot/Antwort
    fn lokale_kandidaten(&self) -> Vec<SocketAddr>;

    /// Beginnt eine Verhandlung unter dem Sitzungs-Tag `sitzung`
    ///
    /// Eine vorherige Verhandlung desselben Teilnehmers wird ersetzt.
    fn verhandlung_starten(&mut self, participant_id: ParticipantId, sitzung: u32);

    /// Kandidaten der Gegenseite; der Handshake laeuft gegen alle
    fn kandidaten_hinzufuegen(
        &mut self,
        participant_id: ParticipantId,
        sitzung: u32,
        kandidaten: &[SocketAddr],
    );

    /// Sendet einen lokalen Frame, falls der Pfad steht; sonst verworfen
    fn frame_senden(&mut self, participant_id: ParticipantId, sequenz: u32, frame: &AudioFrame);

    /// Gibt alle Ressourcen des Teilnehmers frei
    fn schliessen(&mut self, participant_id: ParticipantId);
}

/// Meldungen des direkten Transports an den Supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEreignis {
    /// Hallo/HalloAck fuer diese Sitzung ausgetauscht
    HandshakeOk {
        participant_id: ParticipantId,
        sitzung: u32,
    },
    /// Transportfehler (Gegenseite beendet, Socket-Fehler)
    Fehler {
        participant_id: ParticipantId,
        grund: String,
    },
    /// Keepalive der Gegenstelle auf einer bestaetigten Sitzung
    Lebenszeichen {
        participant_id: ParticipantId,
        sitzung: u32,
    },
    /// Eingehendes Audio auf dem direkten Pfad
    Audio {
        participant_id: ParticipantId,
        sequenz: u32,
        frame: AudioFrame,
    },
}
