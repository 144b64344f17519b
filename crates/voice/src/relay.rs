//! Relay-Rueckfallpfad
//!
//! Traegt Audio ueber den Signaling-Kanal, solange eine PeerConnection in
//! `Rueckfall` oder `RelayVerbunden` ist. Es gibt genau eine gemeinsame
//! Relay-Sitzung; die erste Aktivierung schickt `RelayAktivieren`, alle
//! weiteren Teilnehmer nutzen sie mit.
//!
//! ```text
//! lokal:    AudioFrame -> RelayFrame(sequenz) -> base64 -> KanalNachricht::RelayAudio
//! entfernt: KanalNachricht::RelayAudio{von} -> RelayFrame -> ReorderPuffer[von] -> Matrix
//! ```

use crate::reorder::{ReorderPuffer, ReorderStatistik};
use crate::transport::SignalKanal;
use klangraum_core::event::{EreignisKanal, KlangraumEvent};
use klangraum_core::frame::AudioFrame;
use klangraum_core::types::ParticipantId;
use klangraum_protocol::relay::RelayFrame;
use klangraum_protocol::signal::KanalNachricht;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::time::Instant;

/// Zaehler der Relay-Sitzung
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatistik {
    pub gesendet: u64,
    pub empfangen: u64,
    pub verspaetet_verworfen: u64,
    pub ungueltig: u64,
}

/// Gemeinsame Relay-Sitzung aller Teilnehmer
#[derive(Debug)]
pub struct RelaySitzung {
    aktiviert: bool,
    fenster: Duration,
    max_gepuffert: usize,
    puffer: HashMap<ParticipantId, ReorderPuffer>,
    gesendet: u64,
    ungueltig: u64,
    /// Zaehler bereits entfernter Puffer
    abgeschlossen: ReorderStatistik,
}

impl RelaySitzung {
    pub fn neu(fenster: Duration, max_gepuffert: usize) -> Self {
        Self {
            aktiviert: false,
            fenster,
            max_gepuffert,
            puffer: HashMap::new(),
            gesendet: 0,
            ungueltig: 0,
            abgeschlossen: ReorderStatistik::default(),
        }
    }

    pub fn ist_aktiv(&self) -> bool {
        self.aktiviert
    }

    /// Aktiviert die Relay-Sitzung (nur beim ersten Aufruf wirksam)
    ///
    /// Gibt `true` zurueck, wenn dieser Aufruf die Sitzung aktiviert hat.
    pub fn aktivieren(&mut self, kanal: &dyn SignalKanal, ereignisse: &EreignisKanal) -> bool {
        if self.aktiviert {
            return false;
        }
        self.aktiviert = true;
        kanal.senden(KanalNachricht::RelayAktivieren);
        ereignisse.senden(KlangraumEvent::RelayAktiviert);
        tracing::warn!("Relay-Sitzung aktiviert");
        true
    }

    /// Nimmt einen Teilnehmer in den Relay-Empfang auf
    ///
    /// Frames bis einschliesslich `letzte` gelten als bereits geliefert.
    pub fn teilnehmer_aufnehmen(&mut self, participant_id: ParticipantId, letzte: Option<u32>) {
        let puffer = ReorderPuffer::neu(self.fenster, self.max_gepuffert).fortsetzen_nach(letzte);
        if let Some(alt) = self.puffer.insert(participant_id, puffer) {
            self.statistik_uebernehmen(alt.statistik());
        }
    }

    /// Entfernt den Teilnehmer und liefert noch gepufferte Frames sortiert
    pub fn teilnehmer_entfernen(&mut self, participant_id: ParticipantId) -> Vec<(u32, AudioFrame)> {
        match self.puffer.remove(&participant_id) {
            Some(mut puffer) => {
                let rest = puffer.leeren();
                self.statistik_uebernehmen(puffer.statistik());
                rest
            }
            None => Vec::new(),
        }
    }

    /// Verpackt und sendet einen lokalen Frame
    pub fn frame_senden(&mut self, kanal: &dyn SignalKanal, sequenz: u32, frame: &AudioFrame) {
        let daten = RelayFrame::aus_frame(sequenz, frame).encode();
        kanal.senden(KanalNachricht::RelayAudio { von: None, daten });
        self.gesendet += 1;
    }

    /// Dekodiert einen Relay-Frame und reiht ihn in das Reorder-Fenster ein
    ///
    /// Teilnehmer ohne aktiven Relay-Empfang werden verworfen (`Ok(None)`).
    pub fn frame_empfangen(
        &mut self,
        participant_id: ParticipantId,
        daten: &[u8],
        jetzt: Instant,
    ) -> io::Result<Option<Vec<(u32, AudioFrame)>>> {
        let relay_frame = match RelayFrame::decode(daten) {
            Ok(f) => f,
            Err(e) => {
                self.ungueltig += 1;
                return Err(e);
            }
        };

        let Some(puffer) = self.puffer.get_mut(&participant_id) else {
            return Ok(None);
        };

        let sequenz = relay_frame.sequenz;
        let frame = relay_frame.in_frame(participant_id);
        Ok(Some(puffer.einfuegen(sequenz, frame, jetzt)))
    }

    /// Frames aller Teilnehmer, deren Luecken-Wartezeit abgelaufen ist
    pub fn faellige(&mut self, jetzt: Instant) -> Vec<(ParticipantId, Vec<(u32, AudioFrame)>)> {
        self.puffer
            .iter_mut()
            .filter_map(|(pid, puffer)| {
                let frames = puffer.faellige(jetzt);
                (!frames.is_empty()).then_some((*pid, frames))
            })
            .collect()
    }

    pub fn empfaengt_von(&self, participant_id: &ParticipantId) -> bool {
        self.puffer.contains_key(participant_id)
    }

    pub fn statistik(&self) -> RelayStatistik {
        let mut gesamt = self.abgeschlossen.clone();
        for puffer in self.puffer.values() {
            let s = puffer.statistik();
            gesamt.empfangen += s.empfangen;
            gesamt.verspaetet += s.verspaetet;
        }
        RelayStatistik {
            gesendet: self.gesendet,
            empfangen: gesamt.empfangen,
            verspaetet_verworfen: gesamt.verspaetet,
            ungueltig: self.ungueltig,
        }
    }

    fn statistik_uebernehmen(&mut self, s: &ReorderStatistik) {
        self.abgeschlossen.empfangen += s.empfangen;
        self.abgeschlossen.geliefert += s.geliefert;
        self.abgeschlossen.verspaetet += s.verspaetet;
        self.abgeschlossen.duplikate += s.duplikate;
        self.abgeschlossen.luecken += s.luecken;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
