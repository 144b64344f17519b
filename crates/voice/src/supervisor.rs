//! Peer-Supervisor – genau ein lebender Audiopfad pro Teilnehmer
//!
//! Besitzt alle PeerConnections, treibt deren Zustandsmaschine und
//! entscheidet, ob die Frames eines Teilnehmers ueber den direkten Pfad oder
//! ueber den Relay in die Routing-Matrix fliessen.
//!
//! ## Nebenlaeufigkeit
//! Der Supervisor ist synchron (`&mut self`) und wird ausschliesslich vom
//! nicht-echtzeitkritischen [`SupervisorTask`](crate::task::SupervisorTask)
//! benutzt. Zeit kommt immer als Parameter herein; `tick(jetzt)` prueft alle
//! Zeitlimits. Dadurch ist jeder Quellenwechsel ein einzelner Methodenaufruf
//! und fuer die Matrix atomar.
//!
//! ## Fehler
//! Nur Konfigurations-Missbrauch (unbekannter Teilnehmer, doppelte
//! Verbindung) kommt als `Err` zurueck. Transportfehler sind Zustandswechsel
//! und `StatusGeaendert`-Ereignisse.

use crate::config::SupervisorConfig;
use crate::relay::{RelaySitzung, RelayStatistik};
use crate::state::PeerConnection;
use crate::transport::{DirektTransport, SignalKanal, TransportEreignis};
use klangraum_core::error::{KlangraumError, Result};
use klangraum_core::event::{EreignisKanal, KlangraumEvent};
use klangraum_core::frame::AudioFrame;
use klangraum_core::quelle::{FrameEingabe, QuellenRegister};
use klangraum_core::types::{Participant, ParticipantId};
use klangraum_core::zustand::{BetriebsModus, PeerZustand, PfadModus};
use klangraum_protocol::signal::{KanalNachricht, SignalNachricht, SignalUmschlag};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Statistik
// ---------------------------------------------------------------------------

/// Momentaufnahme fuer Monitoring
#[derive(Debug, Clone, Default)]
pub struct SupervisorStatistik {
    pub pro_zustand: HashMap<PeerZustand, usize>,
    pub relay: RelayStatistik,
    /// Direkte Frames, die nicht (mehr) geliefert werden durften
    pub direkt_verworfen: u64,
}

// ---------------------------------------------------------------------------
// Interne Typen
// ---------------------------------------------------------------------------

struct Verbindung {
    peer: PeerConnection,
    /// Produzent der Frame-Queue; `None` sobald geschlossen
    eingabe: Option<Box<dyn FrameEingabe>>,
}

enum Zeitaktion {
    DirektAufgeben,
    RelayAufgeben,
    Wiederholen,
    Proben,
}

// ---------------------------------------------------------------------------
// PeerSupervisor
// ---------------------------------------------------------------------------

pub struct PeerSupervisor {
    config: SupervisorConfig,
    transport: Box<dyn DirektTransport>,
    signal: Arc<dyn SignalKanal>,
    register: Arc<dyn QuellenRegister>,
    ereignisse: EreignisKanal,
    relay: RelaySitzung,
    teilnehmer: HashMap<ParticipantId, Participant>,
    verbindungen: HashMap<ParticipantId, Verbindung>,
    ausgehende_sequenz: u32,
    direkt_verworfen: u64,
    rng: StdRng,
}

impl PeerSupervisor {
    pub fn neu(
        config: SupervisorConfig,
        transport: Box<dyn DirektTransport>,
        signal: Arc<dyn SignalKanal>,
        register: Arc<dyn QuellenRegister>,
        ereignisse: EreignisKanal,
    ) -> Self {
        let relay = RelaySitzung::neu(config.reorder_fenster, config.max_gepuffert);
        Self {
            config,
            transport,
            signal,
            register,
            ereignisse,
            relay,
            teilnehmer: HashMap::new(),
            verbindungen: HashMap::new(),
            ausgehende_sequenz: 0,
            direkt_verworfen: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn modus(&self) -> BetriebsModus {
        self.config.modus
    }

    // -----------------------------------------------------------------------
    // Raum-Mitgliedschaft
    // -----------------------------------------------------------------------

    /// Macht einen Teilnehmer bekannt, ohne eine Verbindung aufzubauen
    pub fn teilnehmer_bekannt_machen(&mut self, teilnehmer: Participant) {
        self.teilnehmer.insert(teilnehmer.id, teilnehmer);
    }

    /// Teilnehmer ist dem Raum beigetreten: bekannt machen und verbinden
    pub fn teilnehmer_beigetreten(
        &mut self,
        teilnehmer: Participant,
        initiator: bool,
        jetzt: Instant,
    ) -> Result<()> {
        let participant_id = teilnehmer.id;
        tracing::info!(
            participant_id = %participant_id,
            name = %teilnehmer.anzeigename,
            initiator,
            "Teilnehmer beigetreten"
        );
        self.teilnehmer_bekannt_machen(teilnehmer);
        self.verbindung_erstellen(participant_id, initiator, jetzt)
            .map(|_| ())
    }

    /// Teilnehmer hat den Raum verlassen: Verbindung schliessen und vergessen
    pub fn teilnehmer_verlassen(&mut self, participant_id: ParticipantId, jetzt: Instant) {
        self.schliessen_intern(participant_id, "Teilnehmer hat den Raum verlassen", false, jetzt);
        self.teilnehmer.remove(&participant_id);
        self.verbindungen.remove(&participant_id);
        tracing::info!(participant_id = %participant_id, "Teilnehmer entfernt");
    }

    // -----------------------------------------------------------------------
    // Verbindungs-Lebenszyklus
    // -----------------------------------------------------------------------

    /// Legt eine PeerConnection an und startet die Verhandlung
    ///
    /// # Fehler
    /// `UngueltigerTeilnehmer` wenn der Teilnehmer unbekannt ist oder bereits
    /// eine nicht-terminale Verbindung besitzt.
    pub fn verbindung_erstellen(
        &mut self,
        participant_id: ParticipantId,
        initiator: bool,
        jetzt: Instant,
    ) -> Result<&PeerConnection> {
        if !self.teilnehmer.contains_key(&participant_id) {
            return Err(KlangraumError::ungueltiger_teilnehmer(
                participant_id,
                "Teilnehmer ist nicht bekannt",
            ));
        }
        if let Some(v) = self.verbindungen.get(&participant_id) {
            if !v.peer.zustand.ist_terminal() {
                return Err(KlangraumError::ungueltiger_teilnehmer(
                    participant_id,
                    format!("Verbindung existiert bereits ({})", v.peer.zustand),
                ));
            }
        }

        let eingabe = self.register.quelle_registrieren(participant_id);
        self.verbindungen.insert(
            participant_id,
            Verbindung {
                peer: PeerConnection::neu(participant_id, initiator, jetzt),
                eingabe: Some(eingabe),
            },
        );
        tracing::debug!(participant_id = %participant_id, initiator, "PeerConnection angelegt");

        self.starten(participant_id, jetzt);
        self.verbindungen
            .get(&participant_id)
            .map(|v| &v.peer)
            .ok_or_else(|| KlangraumError::intern("Verbindung nach dem Anlegen verschwunden"))
    }

    /// Schliesst die Verbindung und benachrichtigt die Gegenseite
    pub fn verbindung_schliessen(&mut self, participant_id: ParticipantId, grund: &str, jetzt: Instant) {
        self.schliessen_intern(participant_id, grund, true, jetzt);
    }

    /// Schliesst alle Verbindungen (Shutdown)
    pub fn alle_schliessen(&mut self, grund: &str, jetzt: Instant) {
        let ids: Vec<ParticipantId> = self.verbindungen.keys().copied().collect();
        for pid in ids {
            self.schliessen_intern(pid, grund, true, jetzt);
        }
    }

    /// Manuelle Wiederholung fuer `Fehlgeschlagen` und `Unerreichbar`
    ///
    /// Bei `Unerreichbar` beginnt die Zaehlung der Versuche von vorn.
    pub fn erneut_versuchen(&mut self, participant_id: ParticipantId, jetzt: Instant) -> Result<()> {
        let v = self.verbindungen.get_mut(&participant_id).ok_or_else(|| {
            KlangraumError::ungueltiger_teilnehmer(participant_id, "keine Verbindung vorhanden")
        })?;

        match v.peer.zustand {
            PeerZustand::Fehlgeschlagen => {}
            PeerZustand::Unerreichbar => v.peer.versuche = 0,
            anderer => {
                return Err(KlangraumError::ungueltiger_teilnehmer(
                    participant_id,
                    format!("Wiederholung im Zustand {} nicht moeglich", anderer),
                ))
            }
        }

        tracing::info!(participant_id = %participant_id, "Manuelle Wiederholung");
        self.starten(participant_id, jetzt);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Eingaenge
    // -----------------------------------------------------------------------

    /// Verhandlungsnachricht vom Signaling-Kanal
    ///
    /// Einziger Mutationspfad, den der Signaling-Kanal ausloest. Terminale
    /// Verbindungen ignorieren alles.
    pub fn signal_verarbeiten(
        &mut self,
        participant_id: ParticipantId,
        nachricht: SignalNachricht,
        jetzt: Instant,
    ) {
        let Some(v) = self.verbindungen.get(&participant_id) else {
            tracing::debug!(participant_id = %participant_id, "Signal fuer unbekannte Verbindung");
            return;
        };
        if v.peer.zustand.ist_terminal() {
            tracing::trace!(participant_id = %participant_id, "Signal fuer geschlossene Verbindung");
            return;
        }
        let zustand = v.peer.zustand;
        let aktuelle_sitzung = v.peer.sitzung;

        match nachricht {
            SignalNachricht::Angebot { sitzung, kandidaten } => {
                self.angebot_annehmen(participant_id, sitzung, &kandidaten, jetzt);
            }
            SignalNachricht::Antwort { sitzung, kandidaten } => {
                if aktuelle_sitzung == Some(sitzung) {
                    self.transport
                        .kandidaten_hinzufuegen(participant_id, sitzung, &kandidaten);
                } else {
                    tracing::debug!(participant_id = %participant_id, sitzung, "Antwort fuer veraltete Sitzung");
                }
            }
            SignalNachricht::Kandidat { sitzung, adresse } => {
                if aktuelle_sitzung == Some(sitzung) {
                    self.transport
                        .kandidaten_hinzufuegen(participant_id, sitzung, &[adresse]);
                }
            }
            SignalNachricht::RelayBestaetigt => {
                if zustand == PeerZustand::Rueckfall {
                    self.uebergang(participant_id, PeerZustand::RelayVerbunden, jetzt);
                }
            }
            SignalNachricht::RelayAbgelehnt { grund } => {
                if zustand.nutzt_relay() {
                    tracing::warn!(
                        participant_id = %participant_id,
                        fehler = %KlangraumError::RelayNichtVerfuegbar(participant_id),
                        grund = %grund,
                        "Relay abgelehnt"
                    );
                    self.fehlschlag(participant_id, jetzt);
                }
            }
            SignalNachricht::Schliessen { grund } => {
                self.schliessen_intern(participant_id, &grund, false, jetzt);
            }
        }
    }

    /// Meldung des direkten Transports
    pub fn transport_ereignis(&mut self, ereignis: TransportEreignis, jetzt: Instant) {
        match ereignis {
            TransportEreignis::HandshakeOk {
                participant_id,
                sitzung,
            } => self.handshake_ok(participant_id, sitzung, jetzt),
            TransportEreignis::Fehler {
                participant_id,
                grund,
            } => {
                let Some(v) = self.verbindungen.get(&participant_id) else {
                    return;
                };
                if matches!(
                    v.peer.zustand,
                    PeerZustand::Verhandlung | PeerZustand::DirektVerbunden
                ) {
                    tracing::warn!(participant_id = %participant_id, grund = %grund, "Direktpfad-Fehler");
                    self.direktpfad_verloren(participant_id, jetzt);
                }
            }
            TransportEreignis::Lebenszeichen {
                participant_id,
                sitzung,
            } => {
                if let Some(v) = self.verbindungen.get_mut(&participant_id) {
                    if v.peer.zustand == PeerZustand::DirektVerbunden
                        && v.peer.sitzung == Some(sitzung)
                    {
                        v.peer.aktivitaet(jetzt);
                    }
                }
            }
            TransportEreignis::Audio {
                participant_id,
                sequenz,
                frame,
            } => self.direkt_frame(participant_id, sequenz, frame, jetzt),
        }
    }

    /// Relay-Audio eines Teilnehmers vom Signaling-Kanal
    pub fn relay_frame_empfangen(&mut self, participant_id: ParticipantId, daten: &[u8], jetzt: Instant) {
        let Some(v) = self.verbindungen.get(&participant_id) else {
            return;
        };
        let zustand = v.peer.zustand;
        if !zustand.nutzt_relay() || v.peer.pfad != PfadModus::Relay {
            tracing::trace!(participant_id = %participant_id, zustand = %zustand, "Relay-Frame der inaktiven Quelle verworfen");
            return;
        }

        let frames = match self.relay.frame_empfangen(participant_id, daten, jetzt) {
            Ok(Some(frames)) => frames,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(participant_id = %participant_id, fehler = %e, "Ungueltiger Relay-Frame");
                return;
            }
        };

        // Erster eingehender Relay-Frame bestaetigt den Audiofluss
        if zustand == PeerZustand::Rueckfall {
            self.uebergang(participant_id, PeerZustand::RelayVerbunden, jetzt);
        }
        if let Some(v) = self.verbindungen.get_mut(&participant_id) {
            v.peer.aktivitaet(jetzt);
        }
        self.liefern(participant_id, frames);
    }

    /// Lokaler Frame fuer alle verbundenen Teilnehmer
    ///
    /// Direkt verbundene bekommen ihn einzeln, alle Relay-Teilnehmer teilen
    /// sich eine Relay-Nachricht. Beide Pfade tragen dieselbe Sequenznummer.
    pub fn lokaler_frame(&mut self, frame: &AudioFrame) {
        let sequenz = self.ausgehende_sequenz;
        self.ausgehende_sequenz = self.ausgehende_sequenz.wrapping_add(1);

        let mut ueber_relay = false;
        for v in self.verbindungen.values() {
            match v.peer.zustand {
                PeerZustand::DirektVerbunden => {
                    self.transport
                        .frame_senden(v.peer.participant_id, sequenz, frame)
                }
                PeerZustand::Rueckfall | PeerZustand::RelayVerbunden => ueber_relay = true,
                _ => {}
            }
        }
        if ueber_relay {
            self.relay.frame_senden(self.signal.as_ref(), sequenz, frame);
        }
    }

    /// Prueft alle Zeitlimits und liefert faellige Relay-Frames
    pub fn tick(&mut self, jetzt: Instant) {
        let cfg = &self.config;
        let mut aktionen = Vec::new();

        for (pid, v) in &self.verbindungen {
            let p = &v.peer;
            let im_zustand = jetzt.duration_since(p.zustand_seit);
            let aktion = match p.zustand {
                PeerZustand::Verhandlung if im_zustand >= cfg.verhandlungs_timeout => {
                    Some(Zeitaktion::DirektAufgeben)
                }
                PeerZustand::DirektVerbunden
                    if jetzt.duration_since(p.letzte_aktivitaet) >= cfg.aktivitaets_timeout =>
                {
                    Some(Zeitaktion::DirektAufgeben)
                }
                PeerZustand::Rueckfall if im_zustand >= cfg.relay_timeout => {
                    Some(Zeitaktion::RelayAufgeben)
                }
                PeerZustand::Fehlgeschlagen if im_zustand >= cfg.wiederholung_intervall => {
                    Some(Zeitaktion::Wiederholen)
                }
                PeerZustand::RelayVerbunden
                    if cfg.modus == BetriebsModus::Auto
                        && p.initiator
                        && jetzt.duration_since(p.letzte_probe.unwrap_or(p.zustand_seit))
                            >= cfg.wiederholung_intervall =>
                {
                    Some(Zeitaktion::Proben)
                }
                _ => None,
            };
            if let Some(a) = aktion {
                aktionen.push((*pid, a));
            }
        }

        for (pid, aktion) in aktionen {
            match aktion {
                Zeitaktion::DirektAufgeben => {
                    tracing::warn!(
                        participant_id = %pid,
                        fehler = %KlangraumError::VerhandlungsTimeout(pid),
                        "Direktpfad ohne Erfolg"
                    );
                    self.direktpfad_verloren(pid, jetzt);
                }
                Zeitaktion::RelayAufgeben => {
                    tracing::warn!(
                        participant_id = %pid,
                        fehler = %KlangraumError::RelayNichtVerfuegbar(pid),
                        "Relay ohne Bestaetigung"
                    );
                    self.fehlschlag(pid, jetzt);
                }
                Zeitaktion::Wiederholen => self.wiederholen(pid, jetzt),
                Zeitaktion::Proben => self.direktpfad_proben(pid, jetzt),
            }
        }

        for (pid, frames) in self.relay.faellige(jetzt) {
            self.liefern(pid, frames);
        }
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    pub fn verbindung(&self, participant_id: &ParticipantId) -> Option<&PeerConnection> {
        self.verbindungen.get(participant_id).map(|v| &v.peer)
    }

    pub fn zustand(&self, participant_id: &ParticipantId) -> Option<PeerZustand> {
        self.verbindung(participant_id).map(|p| p.zustand)
    }

    /// Anzahl nicht-terminaler Verbindungen fuer `participant_id` (0 oder 1)
    pub fn nicht_terminale(&self, participant_id: &ParticipantId) -> usize {
        self.verbindungen
            .get(participant_id)
            .filter(|v| !v.peer.zustand.ist_terminal())
            .map_or(0, |_| 1)
    }

    pub fn statistik(&self) -> SupervisorStatistik {
        let mut pro_zustand = HashMap::new();
        for v in self.verbindungen.values() {
            *pro_zustand.entry(v.peer.zustand).or_insert(0) += 1;
        }
        SupervisorStatistik {
            pro_zustand,
            relay: self.relay.statistik(),
            direkt_verworfen: self.direkt_verworfen,
        }
    }

    // -----------------------------------------------------------------------
    // Interne Uebergaenge
    // -----------------------------------------------------------------------

    fn uebergang(&mut self, participant_id: ParticipantId, neu: PeerZustand, jetzt: Instant) -> bool {
        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return false;
        };
        let Some(alt) = v.peer.uebergang(neu, jetzt) else {
            return false;
        };
        tracing::info!(
            participant_id = %participant_id,
            alt = %alt,
            neu = %neu,
            "Verbindungszustand geaendert"
        );
        self.ereignisse.senden(KlangraumEvent::StatusGeaendert {
            participant_id,
            alt,
            neu,
        });
        true
    }

    /// Erster Versuch oder Wiederholung, je nach Betriebsmodus
    ///
    /// Kein Pfad liefert mehr Audio; die Gegenseite darf ihre Sequenz neu beginnen.
    fn starten(&mut self, participant_id: ParticipantId, jetzt: Instant) {
        if let Some(v) = self.verbindungen.get_mut(&participant_id) {
            v.peer.sequenz_zuruecksetzen();
        }
        match self.config.modus {
            BetriebsModus::ForceRelay => self.rueckfall(participant_id, jetzt),
            BetriebsModus::Auto | BetriebsModus::ForceDirect => {
                self.verhandlung(participant_id, jetzt)
            }
        }
    }

    fn verhandlung(&mut self, participant_id: ParticipantId, jetzt: Instant) {
        if !self.uebergang(participant_id, PeerZustand::Verhandlung, jetzt) {
            return;
        }
        self.direkt_empfang(participant_id);

        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return;
        };
        v.peer.sitzung = None;
        if v.peer.initiator {
            let sitzung: u32 = self.rng.gen();
            v.peer.sitzung = Some(sitzung);
            self.angebot_senden(participant_id, sitzung);
        }
    }

    fn rueckfall(&mut self, participant_id: ParticipantId, jetzt: Instant) {
        if !self.uebergang(participant_id, PeerZustand::Rueckfall, jetzt) {
            return;
        }
        self.transport.schliessen(participant_id);
        if let Some(v) = self.verbindungen.get_mut(&participant_id) {
            v.peer.sitzung = None;
            v.peer.letzte_probe = None;
        }
        self.relay.aktivieren(self.signal.as_ref(), &self.ereignisse);
        self.relay_empfang(participant_id);
        tracing::warn!(participant_id = %participant_id, "Rueckfall auf Relay");
    }

    fn fehlschlag(&mut self, participant_id: ParticipantId, jetzt: Instant) {
        if !self.uebergang(participant_id, PeerZustand::Fehlgeschlagen, jetzt) {
            return;
        }
        self.transport.schliessen(participant_id);
        self.relay.teilnehmer_entfernen(participant_id);
        if let Some(v) = self.verbindungen.get_mut(&participant_id) {
            v.peer.sitzung = None;
        }
    }

    fn direktpfad_verloren(&mut self, participant_id: ParticipantId, jetzt: Instant) {
        match self.config.modus {
            BetriebsModus::ForceDirect => self.fehlschlag(participant_id, jetzt),
            BetriebsModus::Auto | BetriebsModus::ForceRelay => self.rueckfall(participant_id, jetzt),
        }
    }

    fn wiederholen(&mut self, participant_id: ParticipantId, jetzt: Instant) {
        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return;
        };
        if v.peer.versuche >= self.config.max_versuche {
            if self.uebergang(participant_id, PeerZustand::Unerreichbar, jetzt) {
                tracing::warn!(participant_id = %participant_id, "Teilnehmer unerreichbar");
                self.ereignisse
                    .senden(KlangraumEvent::TeilnehmerUnerreichbar { participant_id });
            }
            return;
        }
        v.peer.versuche += 1;
        tracing::info!(
            participant_id = %participant_id,
            versuch = v.peer.versuche,
            "Automatische Wiederholung"
        );
        self.starten(participant_id, jetzt);
    }

    fn direktpfad_proben(&mut self, participant_id: ParticipantId, jetzt: Instant) {
        let sitzung: u32 = self.rng.gen();
        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return;
        };
        v.peer.sitzung = Some(sitzung);
        v.peer.letzte_probe = Some(jetzt);
        tracing::debug!(participant_id = %participant_id, sitzung, "Direktpfad-Probe");
        self.angebot_senden(participant_id, sitzung);
    }

    fn angebot_senden(&mut self, participant_id: ParticipantId, sitzung: u32) {
        self.transport.verhandlung_starten(participant_id, sitzung);
        let kandidaten = self.transport.lokale_kandidaten();
        self.signal_senden(participant_id, SignalNachricht::Angebot { sitzung, kandidaten });
    }

    fn angebot_annehmen(
        &mut self,
        participant_id: ParticipantId,
        sitzung: u32,
        kandidaten: &[SocketAddr],
        jetzt: Instant,
    ) {
        if self.config.modus == BetriebsModus::ForceRelay {
            tracing::debug!(participant_id = %participant_id, "Angebot im Relay-Modus ignoriert");
            return;
        }
        let Some(zustand) = self.zustand(&participant_id) else {
            return;
        };
        match zustand {
            // Gegenseite wiederholt: gilt als Versuch von unserer Seite
            PeerZustand::Leerlauf | PeerZustand::Fehlgeschlagen | PeerZustand::Unerreichbar => {
                if !self.uebergang(participant_id, PeerZustand::Verhandlung, jetzt) {
                    return;
                }
                if let Some(v) = self.verbindungen.get_mut(&participant_id) {
                    v.peer.sequenz_zuruecksetzen();
                }
                self.direkt_empfang(participant_id);
            }
            PeerZustand::Verhandlung
            | PeerZustand::DirektVerbunden
            | PeerZustand::Rueckfall
            | PeerZustand::RelayVerbunden => {}
            PeerZustand::Geschlossen => return,
        }

        if let Some(v) = self.verbindungen.get_mut(&participant_id) {
            v.peer.sitzung = Some(sitzung);
        }
        self.transport.verhandlung_starten(participant_id, sitzung);
        self.transport
            .kandidaten_hinzufuegen(participant_id, sitzung, kandidaten);
        let eigene = self.transport.lokale_kandidaten();
        self.signal_senden(
            participant_id,
            SignalNachricht::Antwort {
                sitzung,
                kandidaten: eigene,
            },
        );
    }

    fn handshake_ok(&mut self, participant_id: ParticipantId, sitzung: u32, jetzt: Instant) {
        let Some(v) = self.verbindungen.get(&participant_id) else {
            return;
        };
        if v.peer.sitzung != Some(sitzung) || self.config.modus == BetriebsModus::ForceRelay {
            tracing::debug!(participant_id = %participant_id, sitzung, "Handshake fuer veraltete Sitzung");
            return;
        }

        let zustand = v.peer.zustand;
        match zustand {
            PeerZustand::Verhandlung => {
                self.direkt_empfang(participant_id);
                self.uebergang(participant_id, PeerZustand::DirektVerbunden, jetzt);
            }
            PeerZustand::Rueckfall | PeerZustand::RelayVerbunden
                if self.config.modus == BetriebsModus::Auto =>
            {
                // Relay-Rest liefern, dann Quelle umschalten; ein Aufruf, kein Zwischenzustand
                self.direkt_empfang(participant_id);
                self.uebergang(participant_id, PeerZustand::DirektVerbunden, jetzt);
                tracing::info!(participant_id = %participant_id, "Direktpfad wiederhergestellt");
            }
            _ => {}
        }
    }

    fn direkt_frame(
        &mut self,
        participant_id: ParticipantId,
        sequenz: u32,
        frame: AudioFrame,
        jetzt: Instant,
    ) {
        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return;
        };
        let aktiv = v.peer.zustand == PeerZustand::DirektVerbunden && v.peer.pfad == PfadModus::Direkt;
        if !aktiv || !v.peer.ist_neuer(sequenz) {
            self.direkt_verworfen += 1;
            return;
        }

        v.peer.aktivitaet(jetzt);
        v.peer.geliefert(sequenz);
        if let Some(eingabe) = v.eingabe.as_mut() {
            eingabe.on_frame(frame);
        }
    }

    /// Quelle auf Relay umstellen; Lieferung setzt nach der letzten Sequenz fort
    fn relay_empfang(&mut self, participant_id: ParticipantId) {
        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return;
        };
        self.relay
            .teilnehmer_aufnehmen(participant_id, v.peer.letzte_sequenz);
        if v.peer.pfad != PfadModus::Relay {
            v.peer.pfad = PfadModus::Relay;
            self.ereignisse.senden(KlangraumEvent::QuelleGewechselt {
                participant_id,
                pfad: PfadModus::Relay,
            });
        }
    }

    /// Quelle auf direkt umstellen; gepufferte Relay-Frames werden vorher geliefert
    fn direkt_empfang(&mut self, participant_id: ParticipantId) {
        let rest = self.relay.teilnehmer_entfernen(participant_id);
        self.liefern(participant_id, rest);

        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return;
        };
        if v.peer.pfad != PfadModus::Direkt {
            v.peer.pfad = PfadModus::Direkt;
            self.ereignisse.senden(KlangraumEvent::QuelleGewechselt {
                participant_id,
                pfad: PfadModus::Direkt,
            });
        }
    }

    fn liefern(&mut self, participant_id: ParticipantId, frames: Vec<(u32, AudioFrame)>) {
        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return;
        };
        for (sequenz, frame) in frames {
            if !v.peer.ist_neuer(sequenz) {
                continue;
            }
            v.peer.geliefert(sequenz);
            if let Some(eingabe) = v.eingabe.as_mut() {
                eingabe.on_frame(frame);
            }
        }
    }

    fn schliessen_intern(
        &mut self,
        participant_id: ParticipantId,
        grund: &str,
        benachrichtigen: bool,
        jetzt: Instant,
    ) {
        let Some(v) = self.verbindungen.get_mut(&participant_id) else {
            return;
        };
        if v.peer.zustand.ist_terminal() {
            return;
        }

        // Produzent zuerst: danach wird nichts mehr eingereiht
        v.eingabe = None;
        self.transport.schliessen(participant_id);
        self.relay.teilnehmer_entfernen(participant_id);
        self.register.quelle_entfernen(participant_id);

        if benachrichtigen {
            self.signal_senden(
                participant_id,
                SignalNachricht::Schliessen {
                    grund: grund.to_string(),
                },
            );
        }
        self.uebergang(participant_id, PeerZustand::Geschlossen, jetzt);
        tracing::info!(participant_id = %participant_id, grund, "Verbindung geschlossen");
    }

    fn signal_senden(&self, participant_id: ParticipantId, nachricht: SignalNachricht) {
        self.signal.senden(KanalNachricht::Signal(SignalUmschlag {
            participant_id,
            nachricht,
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
