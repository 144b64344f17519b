//! Szenario-Tests fuer den PeerSupervisor (ohne Netzwerk)
//!
//! Transport, Signaling-Kanal und Routing-Matrix sind protokollierende
//! Attrappen; Zeit wird explizit uebergeben.

use klangraum_core::event::{EreignisKanal, KlangraumEvent};
use klangraum_core::frame::{AudioFormat, AudioFrame};
use klangraum_core::quelle::{FrameEingabe, QuellenRegister};
use klangraum_core::types::{Participant, ParticipantId};
use klangraum_core::zustand::{BetriebsModus, PeerZustand, PfadModus};
use klangraum_protocol::relay::RelayFrame;
use klangraum_protocol::signal::{KanalNachricht, SignalNachricht, SignalUmschlag};
use klangraum_voice::{DirektTransport, PeerSupervisor, SignalKanal, SupervisorConfig, TransportEreignis};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Attrappen
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Protokoll {
    gesendet: Vec<KanalNachricht>,
    sitzungen: Vec<(ParticipantId, u32)>,
    /// Gelieferte Frames: Aufnahmezeitpunkt dient als Marker der Sequenz
    geliefert: HashMap<ParticipantId, Vec<u64>>,
    aktive_quellen: HashMap<ParticipantId, i64>,
}

#[derive(Clone, Default)]
struct Attrappe(Arc<Mutex<Protokoll>>);

impl Attrappe {
    fn geliefert(&self, pid: &ParticipantId) -> Vec<u64> {
        self.0.lock().geliefert.get(pid).cloned().unwrap_or_default()
    }

    fn letzte_sitzung(&self, pid: &ParticipantId) -> Option<u32> {
        self.0
            .lock()
            .sitzungen
            .iter()
            .rev()
            .find(|(p, _)| p == pid)
            .map(|(_, s)| *s)
    }

    fn aktive_quellen(&self, pid: &ParticipantId) -> i64 {
        self.0.lock().aktive_quellen.get(pid).copied().unwrap_or(0)
    }
}

impl SignalKanal for Attrappe {
    fn senden(&self, nachricht: KanalNachricht) {
        self.0.lock().gesendet.push(nachricht);
    }
}

impl DirektTransport for Attrappe {
    fn lokale_kandidaten(&self) -> Vec<SocketAddr> {
        vec![SocketAddr::from(([127, 0, 0, 1], 40000))]
    }
    fn verhandlung_starten(&mut self, pid: ParticipantId, sitzung: u32) {
        self.0.lock().sitzungen.push((pid, sitzung));
    }
    fn kandidaten_hinzufuegen(&mut self, _: ParticipantId, _: u32, _: &[SocketAddr]) {}
    fn frame_senden(&mut self, _: ParticipantId, _: u32, _: &AudioFrame) {}
    fn schliessen(&mut self, _: ParticipantId) {}
}

struct Eingabe(Arc<Mutex<Protokoll>>, ParticipantId);

impl FrameEingabe for Eingabe {
    fn on_frame(&mut self, frame: AudioFrame) {
        self.0
            .lock()
            .geliefert
            .entry(self.1)
            .or_default()
            .push(frame.aufgenommen_us);
    }
}

impl QuellenRegister for Attrappe {
    fn quelle_registrieren(&self, pid: ParticipantId) -> Box<dyn FrameEingabe> {
        *self.0.lock().aktive_quellen.entry(pid).or_default() += 1;
        Box::new(Eingabe(self.0.clone(), pid))
    }
    fn quelle_entfernen(&self, pid: ParticipantId) {
        *self.0.lock().aktive_quellen.entry(pid).or_default() -= 1;
    }
}

fn supervisor(modus: BetriebsModus) -> (PeerSupervisor, Attrappe, EreignisKanal) {
    let attrappe = Attrappe::default();
    let ereignisse = EreignisKanal::neu();
    let sup = PeerSupervisor::neu(
        SupervisorConfig {
            modus,
            ..SupervisorConfig::default()
        },
        Box::new(attrappe.clone()),
        Arc::new(attrappe.clone()),
        Arc::new(attrappe.clone()),
        ereignisse.clone(),
    );
    (sup, attrappe, ereignisse)
}

fn frame(marker: u64) -> AudioFrame {
    AudioFrame::neu(ParticipantId::new(), AudioFormat::default(), marker, vec![0.1; 8])
}

fn relay(seq: u32) -> Vec<u8> {
    RelayFrame::aus_frame(seq, &frame(seq as u64)).encode()
}

fn direkt(pid: ParticipantId, seq: u32) -> TransportEreignis {
    TransportEreignis::Audio {
        participant_id: pid,
        sequenz: seq,
        frame: frame(seq as u64),
    }
}

fn statuswechsel(rx: &mut tokio::sync::broadcast::Receiver<KlangraumEvent>, pid: ParticipantId) -> Vec<PeerZustand> {
    let mut folge = Vec::new();
    while let Ok(e) = rx.try_recv() {
        if let KlangraumEvent::StatusGeaendert { participant_id, neu, .. } = e {
            if participant_id == pid {
                folge.push(neu);
            }
        }
    }
    folge
}

// ---------------------------------------------------------------------------
// Szenarien
// ---------------------------------------------------------------------------

#[test]
fn auto_rueckfall_bis_relay_verbunden() {
    let (mut sup, attrappe, ereignisse) = supervisor(BetriebsModus::Auto);
    let mut rx = ereignisse.abonnieren();
    let t0 = Instant::now();
    let pid = ParticipantId::new();
    sup.teilnehmer_beigetreten(Participant::neu(pid, "P"), true, t0)
        .unwrap();

    // Verhandlung kommt nie zustande
    let mut t = t0;
    while t < t0 + Duration::from_millis(5100) {
        t += Duration::from_millis(20);
        sup.tick(t);
    }
    for seq in 0..3 {
        sup.relay_frame_empfangen(pid, &relay(seq), t);
    }

    assert_eq!(
        statuswechsel(&mut rx, pid),
        vec![
            PeerZustand::Verhandlung,
            PeerZustand::Rueckfall,
            PeerZustand::RelayVerbunden
        ]
    );
    assert_eq!(attrappe.geliefert(&pid), vec![0, 1, 2]);
    assert!(attrappe
        .0
        .lock()
        .gesendet
        .contains(&KanalNachricht::RelayAktivieren));
}

#[test]
fn force_direct_endet_in_fehlgeschlagen() {
    let (mut sup, attrappe, ereignisse) = supervisor(BetriebsModus::ForceDirect);
    let mut rx = ereignisse.abonnieren();
    let t0 = Instant::now();
    let pid = ParticipantId::new();
    sup.teilnehmer_beigetreten(Participant::neu(pid, "P"), true, t0)
        .unwrap();

    sup.transport_ereignis(
        TransportEreignis::Fehler {
            participant_id: pid,
            grund: "ICMP unreachable".into(),
        },
        t0 + Duration::from_millis(300),
    );
    // Relay-Bestaetigung und Relay-Audio duerfen nichts bewirken
    sup.signal_verarbeiten(pid, SignalNachricht::RelayBestaetigt, t0 + Duration::from_millis(400));
    sup.relay_frame_empfangen(pid, &relay(0), t0 + Duration::from_millis(400));

    assert_eq!(sup.zustand(&pid), Some(PeerZustand::Fehlgeschlagen));
    let folge = statuswechsel(&mut rx, pid);
    assert_eq!(folge, vec![PeerZustand::Verhandlung, PeerZustand::Fehlgeschlagen]);
    assert!(!attrappe
        .0
        .lock()
        .gesendet
        .contains(&KanalNachricht::RelayAktivieren));
    assert!(attrappe.geliefert(&pid).is_empty());
}

#[test]
fn wechsel_relay_zu_direkt_ohne_duplikate() {
    let (mut sup, attrappe, ereignisse) = supervisor(BetriebsModus::Auto);
    let mut rx = ereignisse.abonnieren();
    let t0 = Instant::now();
    let pid = ParticipantId::new();
    sup.teilnehmer_beigetreten(Participant::neu(pid, "P"), true, t0)
        .unwrap();

    // Rueckfall und Relay-Betrieb
    let t1 = t0 + Duration::from_secs(5);
    sup.tick(t1);
    for seq in 0..10 {
        sup.relay_frame_empfangen(pid, &relay(seq), t1);
    }
    assert_eq!(sup.zustand(&pid), Some(PeerZustand::RelayVerbunden));

    // Direktpfad-Probe nach dem Wiederholungsintervall
    let t2 = t1 + Duration::from_secs(10);
    sup.relay_frame_empfangen(pid, &relay(10), t2);
    sup.tick(t2);
    let sitzung = attrappe.letzte_sitzung(&pid).unwrap();
    assert_eq!(sup.verbindung(&pid).unwrap().sitzung, Some(sitzung));

    // Relay-Frame 12 liegt noch im Reorder-Fenster, 11 fehlt
    sup.relay_frame_empfangen(pid, &relay(12), t2);
    sup.transport_ereignis(
        TransportEreignis::HandshakeOk {
            participant_id: pid,
            sitzung,
        },
        t2,
    );
    assert_eq!(sup.zustand(&pid), Some(PeerZustand::DirektVerbunden));

    // Direktpfad ueberlappt mit dem Relay, spaetes Relay-Audio kommt noch an
    for seq in 9..16 {
        sup.transport_ereignis(direkt(pid, seq), t2);
    }
    sup.relay_frame_empfangen(pid, &relay(13), t2);
    sup.tick(t2 + Duration::from_secs(1));

    let geliefert = attrappe.geliefert(&pid);
    let mut erwartet: Vec<u64> = (0..=10).collect();
    erwartet.extend(12..16);
    assert_eq!(geliefert, erwartet, "streng monoton, ohne Duplikate");

    let wechsel: Vec<PfadModus> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            KlangraumEvent::QuelleGewechselt { participant_id, pfad } if participant_id == pid => Some(pfad),
            _ => None,
        })
        .collect();
    assert_eq!(wechsel, vec![PfadModus::Relay, PfadModus::Direkt]);
    assert_eq!(attrappe.aktive_quellen(&pid), 1);
}

#[test]
fn gegenseite_probt_direktpfad_waehrend_relay() {
    let (mut sup, attrappe, _) = supervisor(BetriebsModus::Auto);
    let t0 = Instant::now();
    let pid = ParticipantId::new();
    sup.teilnehmer_beigetreten(Participant::neu(pid, "P"), false, t0)
        .unwrap();
    sup.tick(t0 + Duration::from_secs(5));
    sup.relay_frame_empfangen(pid, &relay(0), t0 + Duration::from_secs(5));
    assert_eq!(sup.zustand(&pid), Some(PeerZustand::RelayVerbunden));

    // Angebot der Gegenseite wird beantwortet, Zustand bleibt bis zum Handshake
    let t1 = t0 + Duration::from_secs(15);
    sup.signal_verarbeiten(
        pid,
        SignalNachricht::Angebot {
            sitzung: 4242,
            kandidaten: vec![SocketAddr::from(([10, 0, 0, 7], 5000))],
        },
        t1,
    );
    assert_eq!(sup.zustand(&pid), Some(PeerZustand::RelayVerbunden));
    assert!(attrappe.0.lock().gesendet.iter().any(|n| matches!(
        n,
        KanalNachricht::Signal(SignalUmschlag {
            nachricht: SignalNachricht::Antwort { sitzung: 4242, .. },
            ..
        })
    )));

    sup.transport_ereignis(
        TransportEreignis::HandshakeOk {
            participant_id: pid,
            sitzung: 4242,
        },
        t1,
    );
    assert_eq!(sup.zustand(&pid), Some(PeerZustand::DirektVerbunden));
}

// ---------------------------------------------------------------------------
// Invariante ueber zufaellige Ablaeufe
// ---------------------------------------------------------------------------

#[test]
fn hoechstens_eine_aktive_verbindung_pro_teilnehmer() {
    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let modus = match seed % 3 {
            0 => BetriebsModus::Auto,
            1 => BetriebsModus::ForceDirect,
            _ => BetriebsModus::ForceRelay,
        };
        let (mut sup, attrappe, _) = supervisor(modus);
        let pids: Vec<ParticipantId> = (0..4).map(|_| ParticipantId::new()).collect();
        let mut t = Instant::now();
        let mut seq = 0u32;

        for _ in 0..400 {
            let pid = pids[rng.gen_range(0..pids.len())];
            match rng.gen_range(0..11) {
                0 => {
                    let _ = sup.teilnehmer_beigetreten(Participant::neu(pid, "x"), rng.gen(), t);
                }
                1 => sup.teilnehmer_verlassen(pid, t),
                2 => {
                    let _ = sup.verbindung_erstellen(pid, rng.gen(), t);
                }
                3 => sup.verbindung_schliessen(pid, "zufall", t),
                4 => {
                    t += Duration::from_millis(rng.gen_range(0..12_000));
                    sup.tick(t);
                }
                5 => {
                    if let Some(sitzung) = attrappe.letzte_sitzung(&pid) {
                        sup.transport_ereignis(
                            TransportEreignis::HandshakeOk {
                                participant_id: pid,
                                sitzung,
                            },
                            t,
                        );
                    }
                }
                6 => sup.transport_ereignis(
                    TransportEreignis::Fehler {
                        participant_id: pid,
                        grund: "zufall".into(),
                    },
                    t,
                ),
                7 => {
                    seq += 1;
                    sup.relay_frame_empfangen(pid, &relay(seq), t);
                }
                8 => {
                    seq += 1;
                    sup.transport_ereignis(direkt(pid, seq), t);
                }
                9 => sup.signal_verarbeiten(
                    pid,
                    SignalNachricht::Angebot {
                        sitzung: rng.gen(),
                        kandidaten: Vec::new(),
                    },
                    t,
                ),
                _ => {
                    let _ = sup.erneut_versuchen(pid, t);
                }
            }

            for p in &pids {
                let nicht_terminal = sup.nicht_terminale(p);
                assert!(nicht_terminal <= 1, "seed {seed}");
                assert_eq!(
                    attrappe.aktive_quellen(p),
                    nicht_terminal as i64,
                    "seed {seed}: registrierte Quellen passen nicht zu den Verbindungen"
                );
                let geliefert = attrappe.geliefert(p);
                assert!(
                    geliefert.windows(2).all(|w| w[0] < w[1]),
                    "seed {seed}: Lieferung nicht monoton"
                );
            }
        }
    }
}
