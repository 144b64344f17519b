//! UDP-Direktpfad – Handshake und Audio ueber einen Socket
//!
//! Implementiert [`DirektTransport`] fuer den Supervisor. Ein Hintergrund-Task
//! empfaengt Pakete und wiederholt unbestaetigte `Hallo`s; Ergebnisse gehen
//! als [`TransportEreignis`] ueber eine begrenzte mpsc-Queue zurueck.
//!
//! ## Ablauf
//!
//! ```text
//! verhandlung_starten(sitzung) + kandidaten_hinzufuegen
//!     |
//!     v
//! Hallo(sitzung) an alle Kandidaten, alle 200 ms
//!     |
//!     +--> Gegenseite: HalloAck(sitzung) --> HandshakeOk
//!     |
//!     v
//! Audio(sequenz, sitzung) nur an die bestaetigte Gegenstelle
//! Hallo(sitzung) als Keepalive, jede Sekunde --> Lebenszeichen
//! ```
//!
//! ## Performance
//! - Empfangspuffer wird wiederverwendet
//! - Senden via `try_send_to`: blockiert nie, volle Socket-Puffer verwerfen
//! - Sitzungen in DashMap, kein globaler Lock im Hot Path

use crate::transport::{DirektTransport, TransportEreignis};
use dashmap::DashMap;
use klangraum_core::frame::AudioFrame;
use klangraum_core::types::ParticipantId;
use klangraum_protocol::direkt::{DirektPaket, DirektPaketTyp, MAX_NUTZDATEN_LAENGE};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

/// Maximale UDP-Paketgroesse (Header + Max-Nutzdaten + Puffer)
const UDP_BUFFER_SIZE: usize = DirektPaket::HEADER_SIZE + MAX_NUTZDATEN_LAENGE + 64;

/// Wiederholungsintervall fuer unbestaetigte Hallo-Pakete
const HALLO_INTERVALL: Duration = Duration::from_millis(200);

/// Keepalive auf bestaetigten Sitzungen; muss unter dem Aktivitaets-Timeout liegen
const KEEPALIVE_INTERVALL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Sitzungen
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SitzungsEintrag {
    participant_id: ParticipantId,
    kandidaten: Vec<SocketAddr>,
    /// Adresse, von der der Handshake kam
    gegenstelle: Option<SocketAddr>,
    bestaetigt: bool,
}

/// Zwischen Kommandoseite und Empfangs-Task geteilter Zustand
struct Geteilt {
    socket: UdpSocket,
    sitzungen: DashMap<u32, SitzungsEintrag>,
    /// participant_id -> aktuelles Sitzungs-Tag
    index: DashMap<ParticipantId, u32>,
    ereignis_tx: mpsc::Sender<TransportEreignis>,
}

impl Geteilt {
    fn senden(&self, paket: &DirektPaket, ziel: SocketAddr) {
        match self.socket.try_send_to(&paket.encode(), ziel) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::trace!(ziel = %ziel, "UDP-Socket voll, Paket verworfen");
            }
            Err(e) => {
                tracing::debug!(fehler = %e, ziel = %ziel, "UDP-Sendefehler");
            }
        }
    }

    fn melden(&self, ereignis: TransportEreignis) {
        if let Err(e) = self.ereignis_tx.try_send(ereignis) {
            tracing::warn!(fehler = %e, "Transport-Ereignis verworfen");
        }
    }

    fn hallo_wiederholen(&self) {
        let mut ziele = Vec::new();
        for eintrag in self.sitzungen.iter() {
            if !eintrag.bestaetigt {
                for adresse in &eintrag.kandidaten {
                    ziele.push((*eintrag.key(), *adresse));
                }
            }
        }
        for (sitzung, ziel) in ziele {
            self.senden(&DirektPaket::steuerung(DirektPaketTyp::Hallo, sitzung), ziel);
        }
    }

    /// Hallo an alle bestaetigten Gegenstellen
    fn keepalive_senden(&self) {
        let ziele: Vec<(u32, SocketAddr)> = self
            .sitzungen
            .iter()
            .filter(|e| e.bestaetigt)
            .filter_map(|e| e.gegenstelle.map(|g| (*e.key(), g)))
            .collect();
        for (sitzung, ziel) in ziele {
            self.senden(&DirektPaket::steuerung(DirektPaketTyp::Hallo, sitzung), ziel);
        }
    }

    fn paket_verarbeiten(&self, daten: &[u8], absender: SocketAddr) {
        let paket = match DirektPaket::decode(daten) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(fehler = %e, absender = %absender, "Ungueltiges Direktpaket");
                return;
            }
        };

        match paket.typ {
            DirektPaketTyp::Hallo | DirektPaketTyp::HalloAck => {
                if paket.typ == DirektPaketTyp::Hallo {
                    if !self.sitzungen.contains_key(&paket.sitzung) {
                        tracing::trace!(sitzung = paket.sitzung, "Hallo fuer unbekannte Sitzung");
                        return;
                    }
                    self.senden(
                        &DirektPaket::steuerung(DirektPaketTyp::HalloAck, paket.sitzung),
                        absender,
                    );
                }
                if !self.bestaetigen(paket.sitzung, absender) {
                    self.lebenszeichen(paket.sitzung, absender);
                }
            }
            DirektPaketTyp::Audio => {
                let Some(eintrag) = self.sitzungen.get(&paket.sitzung) else {
                    return;
                };
                if !eintrag.bestaetigt || eintrag.gegenstelle != Some(absender) {
                    return;
                }
                let participant_id = eintrag.participant_id;
                drop(eintrag);

                match paket.in_frame(participant_id) {
                    Ok(frame) => self.melden(TransportEreignis::Audio {
                        participant_id,
                        sequenz: paket.sequenz,
                        frame,
                    }),
                    Err(e) => {
                        tracing::debug!(participant_id = %participant_id, fehler = %e, "Ungueltige Audio-Nutzdaten");
                    }
                }
            }
            DirektPaketTyp::Tschuess => {
                let Some((_, eintrag)) = self.sitzungen.remove(&paket.sitzung) else {
                    return;
                };
                self.index
                    .remove_if(&eintrag.participant_id, |_, s| *s == paket.sitzung);
                tracing::info!(participant_id = %eintrag.participant_id, "Gegenseite hat den Direktpfad beendet");
                self.melden(TransportEreignis::Fehler {
                    participant_id: eintrag.participant_id,
                    grund: "Gegenseite hat den Direktpfad beendet".into(),
                });
            }
        }
    }

    /// Liefert `true`, wenn die Sitzung mit diesem Paket bestaetigt wurde
    fn bestaetigen(&self, sitzung: u32, absender: SocketAddr) -> bool {
        let Some(mut eintrag) = self.sitzungen.get_mut(&sitzung) else {
            return false;
        };
        if eintrag.bestaetigt {
            return false;
        }
        eintrag.bestaetigt = true;
        eintrag.gegenstelle = Some(absender);
        let participant_id = eintrag.participant_id;
        drop(eintrag);

        tracing::info!(participant_id = %participant_id, gegenstelle = %absender, sitzung, "Direktpfad bestaetigt");
        self.melden(TransportEreignis::HandshakeOk {
            participant_id,
            sitzung,
        });
        true
    }

    fn lebenszeichen(&self, sitzung: u32, absender: SocketAddr) {
        let participant_id = match self.sitzungen.get(&sitzung) {
            Some(e) if e.bestaetigt && e.gegenstelle == Some(absender) => e.participant_id,
            _ => return,
        };
        self.melden(TransportEreignis::Lebenszeichen {
            participant_id,
            sitzung,
        });
    }

    fn sitzung_entfernen(&self, participant_id: &ParticipantId) -> Option<(u32, SitzungsEintrag)> {
        let (_, sitzung) = self.index.remove(participant_id)?;
        self.sitzungen.remove(&sitzung)
    }
}

// ---------------------------------------------------------------------------
// UdpDirektTransport
// ---------------------------------------------------------------------------

/// UDP-Implementierung des direkten Pfads
///
/// Beim Drop wird der Empfangs-Task beendet.
pub struct UdpDirektTransport {
    geteilt: Arc<Geteilt>,
    lokale: Vec<SocketAddr>,
    _shutdown_tx: oneshot::Sender<()>,
}

impl UdpDirektTransport {
    /// Bindet den UDP-Socket und startet den Empfangs-Task
    pub async fn binden(
        bind_addr: SocketAddr,
        ereignis_tx: mpsc::Sender<TransportEreignis>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let lokal = socket.local_addr()?;
        let lokale = kandidaten_ermitteln(lokal);
        tracing::info!(addr = %lokal, kandidaten = ?lokale, "UDP-Direktpfad gebunden");

        let geteilt = Arc::new(Geteilt {
            socket,
            sitzungen: DashMap::new(),
            index: DashMap::new(),
            ereignis_tx,
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(empfangs_loop(Arc::clone(&geteilt), shutdown_rx));

        Ok(Self {
            geteilt,
            lokale,
            _shutdown_tx: shutdown_tx,
        })
    }

    pub fn lokale_adresse(&self) -> std::io::Result<SocketAddr> {
        self.geteilt.socket.local_addr()
    }

    /// Anzahl laufender (auch unbestaetigter) Sitzungen
    pub fn sitzungen(&self) -> usize {
        self.geteilt.sitzungen.len()
    }
}

impl DirektTransport for UdpDirektTransport {
    fn lokale_kandidaten(&self) -> Vec<SocketAddr> {
        self.lokale.clone()
    }

    fn verhandlung_starten(&mut self, participant_id: ParticipantId, sitzung: u32) {
        self.geteilt.sitzung_entfernen(&participant_id);
        self.geteilt.sitzungen.insert(
            sitzung,
            SitzungsEintrag {
                participant_id,
                kandidaten: Vec::new(),
                gegenstelle: None,
                bestaetigt: false,
            },
        );
        self.geteilt.index.insert(participant_id, sitzung);
        tracing::debug!(participant_id = %participant_id, sitzung, "Direktpfad-Verhandlung gestartet");
    }

    fn kandidaten_hinzufuegen(
        &mut self,
        participant_id: ParticipantId,
        sitzung: u32,
        kandidaten: &[SocketAddr],
    ) {
        let Some(mut eintrag) = self.geteilt.sitzungen.get_mut(&sitzung) else {
            return;
        };
        if eintrag.participant_id != participant_id {
            return;
        }
        for adresse in kandidaten {
            if !eintrag.kandidaten.contains(adresse) {
                eintrag.kandidaten.push(*adresse);
            }
        }
        drop(eintrag);

        // Sofort ein erstes Hallo, nicht erst beim naechsten Intervall
        for adresse in kandidaten {
            self.geteilt
                .senden(&DirektPaket::steuerung(DirektPaketTyp::Hallo, sitzung), *adresse);
        }
    }

    fn frame_senden(&mut self, participant_id: ParticipantId, sequenz: u32, frame: &AudioFrame) {
        let Some(sitzung) = self.geteilt.index.get(&participant_id).map(|s| *s) else {
            return;
        };
        let ziel = match self.geteilt.sitzungen.get(&sitzung) {
            Some(e) if e.bestaetigt => e.gegenstelle,
            _ => None,
        };
        if let Some(ziel) = ziel {
            self.geteilt
                .senden(&DirektPaket::audio(sequenz, sitzung, frame), ziel);
        }
    }

    fn schliessen(&mut self, participant_id: ParticipantId) {
        let Some((sitzung, eintrag)) = self.geteilt.sitzung_entfernen(&participant_id) else {
            return;
        };
        if let (true, Some(ziel)) = (eintrag.bestaetigt, eintrag.gegenstelle) {
            self.geteilt
                .senden(&DirektPaket::steuerung(DirektPaketTyp::Tschuess, sitzung), ziel);
        }
        tracing::debug!(participant_id = %participant_id, sitzung, "Direktpfad geschlossen");
    }
}

// ---------------------------------------------------------------------------
// Empfangs-Loop
// ---------------------------------------------------------------------------

async fn empfangs_loop(geteilt: Arc<Geteilt>, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let mut wiederholung = tokio::time::interval(HALLO_INTERVALL);
    wiederholung.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVALL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::debug!("Direktpfad-Empfangs-Loop gestartet");

    loop {
        tokio::select! {
            result = geteilt.socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, absender)) => geteilt.paket_verarbeiten(&buf[..len], absender),
                    Err(e) => {
                        tracing::debug!(fehler = %e, "UDP-Empfangsfehler");
                        // Kurze Pause gegen Busy-Loop bei persistentem Fehler
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            }

            _ = wiederholung.tick() => geteilt.hallo_wiederholen(),

            _ = keepalive.tick() => geteilt.keepalive_senden(),

            // Explizites Signal oder Drop des Transports
            _ = &mut shutdown_rx => break,
        }
    }

    tracing::debug!("Direktpfad-Empfangs-Loop beendet");
}

/// Eigene Adressen fuer die Gegenseite
///
/// Bei einer Wildcard-Bindung wird die Adresse der Default-Route ermittelt
/// (verbundener UDP-Socket, es wird nichts gesendet) plus Loopback.
fn kandidaten_ermitteln(lokal: SocketAddr) -> Vec<SocketAddr> {
    if !lokal.ip().is_unspecified() {
        return vec![lokal];
    }

    let mut kandidaten = Vec::new();
    let route = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| s.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).map(|_| s))
        .and_then(|s| s.local_addr());
    if let Ok(adresse) = route {
        if !adresse.ip().is_unspecified() && !adresse.ip().is_loopback() {
            kandidaten.push(SocketAddr::new(adresse.ip(), lokal.port()));
        }
    }
    kandidaten.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), lokal.port()));
    kandidaten
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
