//! Bus-Mixer – laeuft einmal pro Audio-Zyklus
//!
//! Pro Zyklus wird fuer jede Quelle genau ein Block aus ihrer Queue
//! entnommen, pro Zuweisung raeumlich platziert, verstaerkt und durch die
//! Effekt-Kette der Zuweisung geschickt und additiv in den Bus gemischt.
//! Danach folgen Master-Gain, Bus-Effekte und der Soft-Limiter, bevor der
//! Block in die Senke geschrieben wird.
//!
//! Der Mixer blockiert nie. Eine leere Queue liefert Stille fuer diesen
//! Zyklus, eine verschwundene Quelle gilt als leer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use klangraum_core::{AudioFormat, AudioFrame, BusId, EreignisKanal, KlangraumEvent, ParticipantId};
use ringbuf::traits::Consumer;
use ringbuf::HeapCons;
use serde::Serialize;
use tracing::{info, trace, warn};

use crate::matrix::GeteilterSchnappschuss;
use crate::pipeline::{EffektKette, EffektStufe};
use crate::raum;
use crate::sink::AudioSink;

/// Befehle von der Matrix an den Mix-Thread
pub enum MixerBefehl {
    QuelleNeu {
        participant_id: ParticipantId,
        queue: HeapCons<AudioFrame>,
    },
    QuelleEntfernt(ParticipantId),
    SinkSetzen {
        bus_id: BusId,
        sink: Box<dyn AudioSink>,
    },
    SinkEntfernen(BusId),
}

impl MixerBefehl {
    pub fn art(&self) -> &'static str {
        match self {
            Self::QuelleNeu { .. } => "quelle_neu",
            Self::QuelleEntfernt(_) => "quelle_entfernt",
            Self::SinkSetzen { .. } => "sink_setzen",
            Self::SinkEntfernen(_) => "sink_entfernen",
        }
    }
}

// ---------------------------------------------------------------------------
// Statistik
// ---------------------------------------------------------------------------

/// Zaehler, die Mix-Thread und Matrix gemeinsam fortschreiben
#[derive(Debug, Default)]
pub struct MixZaehler {
    pub(crate) zyklen: AtomicU64,
    pub(crate) ueberlaeufe: AtomicU64,
    pub(crate) frames_gemischt: AtomicU64,
    pub(crate) frames_fehlend: AtomicU64,
    pub(crate) schreibfehler: AtomicU64,
    pub(crate) queue_verworfen: AtomicU64,
    pub(crate) format_verworfen: AtomicU64,
}

impl MixZaehler {
    pub fn statistik(&self) -> MixStatistik {
        MixStatistik {
            zyklen: self.zyklen.load(Ordering::Relaxed),
            ueberlaeufe: self.ueberlaeufe.load(Ordering::Relaxed),
            frames_gemischt: self.frames_gemischt.load(Ordering::Relaxed),
            frames_fehlend: self.frames_fehlend.load(Ordering::Relaxed),
            schreibfehler: self.schreibfehler.load(Ordering::Relaxed),
            queue_verworfen: self.queue_verworfen.load(Ordering::Relaxed),
            format_verworfen: self.format_verworfen.load(Ordering::Relaxed),
        }
    }
}

/// Momentaufnahme der Mixer-Zaehler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MixStatistik {
    /// Abgeschlossene Mix-Zyklen
    pub zyklen: u64,
    /// Zyklen, die ihre Periode ueberschritten haben
    pub ueberlaeufe: u64,
    /// In den Mix uebernommene Frames
    pub frames_gemischt: u64,
    /// Zyklen, in denen eine Quelle Stille liefern musste
    pub frames_fehlend: u64,
    /// Fehlgeschlagene Schreibvorgaenge in Senken
    pub schreibfehler: u64,
    /// Wegen voller Queue verworfene Frames
    pub queue_verworfen: u64,
    /// Wegen abweichender Abtastrate verworfene Frames
    pub format_verworfen: u64,
}

// ---------------------------------------------------------------------------
// Soft-Limiter
// ---------------------------------------------------------------------------

/// Begrenzt Pegel weich oberhalb des Knies auf die Decke
#[derive(Debug, Clone, Copy)]
pub struct SoftLimiter {
    decke: f32,
    knie: f32,
}

impl SoftLimiter {
    pub fn neu(decke: f32, knie: f32) -> Self {
        let decke = if decke.is_finite() && decke > 0.0 {
            decke
        } else {
            1.0
        };
        Self {
            decke,
            knie: knie.clamp(0.0, decke),
        }
    }

    pub fn decke(&self) -> f32 {
        self.decke
    }

    #[inline]
    fn sample(&self, x: f32) -> f32 {
        if !x.is_finite() {
            return 0.0;
        }
        let betrag = x.abs();
        if betrag <= self.knie {
            return x;
        }
        let bereich = self.decke - self.knie;
        let begrenzt = if bereich <= f32::EPSILON {
            self.decke
        } else {
            self.knie + bereich * ((betrag - self.knie) / bereich).tanh()
        };
        begrenzt.copysign(x)
    }

    pub fn anwenden(&self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.sample(*s);
        }
    }
}

// ---------------------------------------------------------------------------
// Quellen und Busse im Mix-Thread
// ---------------------------------------------------------------------------

struct Quelle {
    queue: HeapCons<AudioFrame>,
    /// Samples im Bus-Format, die noch nicht gemischt wurden
    ausstehend: VecDeque<f32>,
    /// Block dieses Zyklus
    block: Vec<f32>,
    hat_daten: bool,
}

impl Quelle {
    fn neu(queue: HeapCons<AudioFrame>, block_laenge: usize) -> Self {
        Self {
            queue,
            ausstehend: VecDeque::with_capacity(block_laenge * 4),
            block: Vec::with_capacity(block_laenge),
            hat_daten: false,
        }
    }

    fn fuellen(&mut self, n: usize, format: AudioFormat, zaehler: &MixZaehler) {
        while self.ausstehend.len() < n {
            let Some(frame) = self.queue.try_pop() else {
                break;
            };
            if frame.format.sample_rate != format.sample_rate {
                zaehler.format_verworfen.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            kanaele_anpassen(
                &frame.samples,
                frame.format.kanaele,
                format.kanaele,
                &mut self.ausstehend,
            );
            zaehler.frames_gemischt.fetch_add(1, Ordering::Relaxed);
        }

        self.block.clear();
        if self.ausstehend.is_empty() {
            self.hat_daten = false;
            zaehler.frames_fehlend.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let k = n.min(self.ausstehend.len());
        self.block.extend(self.ausstehend.drain(..k));
        self.block.resize(n, 0.0);
        self.hat_daten = true;
    }
}

/// Passt interleavte Samples an die Kanalzahl des Busses an
fn kanaele_anpassen(samples: &[f32], von: u16, nach: u16, ziel: &mut VecDeque<f32>) {
    let von = von.max(1) as usize;
    let nach = nach.max(1) as usize;
    for frame in samples.chunks_exact(von) {
        if von == nach {
            ziel.extend(frame.iter().copied());
        } else if nach == 1 {
            ziel.push_back(frame.iter().sum::<f32>() / von as f32);
        } else {
            for k in 0..nach {
                ziel.push_back(frame[k % von]);
            }
        }
    }
}

#[derive(Default)]
struct BusLauf {
    sink: Option<Box<dyn AudioSink>>,
    mix: Vec<f32>,
    vor_limiter: Vec<f32>,
    kette: Option<(u64, EffektKette)>,
    zuweisungs_ketten: HashMap<ParticipantId, (u64, EffektKette)>,
    fehlerhaft: bool,
}

fn kette_aktuell<'a>(
    ketten: &'a mut HashMap<ParticipantId, (u64, EffektKette)>,
    participant_id: ParticipantId,
    version: u64,
    stufen: &[EffektStufe],
    format: AudioFormat,
) -> &'a mut EffektKette {
    let eintrag = ketten
        .entry(participant_id)
        .or_insert_with(|| (version, EffektKette::aus_stufen(stufen, format)));
    if eintrag.0 != version {
        *eintrag = (version, EffektKette::aus_stufen(stufen, format));
    }
    &mut eintrag.1
}

// ---------------------------------------------------------------------------
// BusMixer
// ---------------------------------------------------------------------------

/// Mischt alle Busse; gehoert exklusiv dem Mix-Thread
pub struct BusMixer {
    format: AudioFormat,
    zyklus_frames: usize,
    limiter: SoftLimiter,
    befehle: Receiver<MixerBefehl>,
    schnappschuss: GeteilterSchnappschuss,
    quellen: HashMap<ParticipantId, Quelle>,
    busse: HashMap<BusId, BusLauf>,
    kratz: Vec<f32>,
    zaehler: Arc<MixZaehler>,
    ereignisse: EreignisKanal,
}

impl BusMixer {
    pub(crate) fn neu(
        format: AudioFormat,
        zyklus_frames: usize,
        limiter: SoftLimiter,
        befehle: Receiver<MixerBefehl>,
        schnappschuss: GeteilterSchnappschuss,
        zaehler: Arc<MixZaehler>,
        ereignisse: EreignisKanal,
    ) -> Self {
        let zyklus_frames = zyklus_frames.max(1);
        Self {
            format,
            zyklus_frames,
            limiter,
            befehle,
            schnappschuss,
            quellen: HashMap::new(),
            busse: HashMap::new(),
            kratz: Vec::with_capacity(zyklus_frames * format.kanaele.max(1) as usize),
            zaehler,
            ereignisse,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Dauer eines Zyklus bei der konfigurierten Abtastrate
    pub fn zyklus_dauer(&self) -> Duration {
        let rate = u64::from(self.format.sample_rate.max(1));
        Duration::from_nanos(self.zyklus_frames as u64 * 1_000_000_000 / rate)
    }

    pub fn statistik(&self) -> MixStatistik {
        self.zaehler.statistik()
    }

    pub(crate) fn zaehler(&self) -> Arc<MixZaehler> {
        Arc::clone(&self.zaehler)
    }

    pub fn quellen_anzahl(&self) -> usize {
        self.quellen.len()
    }

    /// Mix des letzten Zyklus vor dem Limiter
    pub fn vor_limiter(&self, bus_id: &BusId) -> Option<&[f32]> {
        self.busse.get(bus_id).map(|l| l.vor_limiter.as_slice())
    }

    /// Mix des letzten Zyklus nach dem Limiter, so wie er geschrieben wurde
    pub fn letzter_mix(&self, bus_id: &BusId) -> Option<&[f32]> {
        self.busse.get(bus_id).map(|l| l.mix.as_slice())
    }

    fn befehle_verarbeiten(&mut self) {
        let block_laenge = self.zyklus_frames * self.format.kanaele.max(1) as usize;
        while let Ok(befehl) = self.befehle.try_recv() {
            match befehl {
                MixerBefehl::QuelleNeu {
                    participant_id,
                    queue,
                } => {
                    self.quellen
                        .insert(participant_id, Quelle::neu(queue, block_laenge));
                }
                MixerBefehl::QuelleEntfernt(participant_id) => {
                    self.quellen.remove(&participant_id);
                    for lauf in self.busse.values_mut() {
                        lauf.zuweisungs_ketten.remove(&participant_id);
                    }
                }
                MixerBefehl::SinkSetzen { bus_id, sink } => {
                    let lauf = self.busse.entry(bus_id).or_default();
                    lauf.sink = Some(sink);
                    lauf.fehlerhaft = false;
                }
                MixerBefehl::SinkEntfernen(bus_id) => {
                    if let Some(lauf) = self.busse.get_mut(&bus_id) {
                        lauf.sink = None;
                    }
                }
            }
        }
    }

    /// Fuehrt genau einen Mix-Zyklus aus
    pub fn zyklus(&mut self) {
        self.befehle_verarbeiten();
        let schnappschuss = Arc::clone(&self.schnappschuss.read());
        let kanaele = self.format.kanaele.max(1);
        let n = self.zyklus_frames * kanaele as usize;

        for quelle in self.quellen.values_mut() {
            quelle.fuellen(n, self.format, &self.zaehler);
        }

        self.busse
            .retain(|id, lauf| lauf.sink.is_some() || schnappschuss.busse.contains_key(id));
        for id in schnappschuss.busse.keys() {
            if !self.busse.contains_key(id) {
                self.busse.insert(id.clone(), BusLauf::default());
            }
        }
        for lauf in self.busse.values_mut() {
            lauf.mix.clear();
            lauf.mix.resize(n, 0.0);
        }

        // Zuweisungen additiv in die Busse mischen
        for (participant_id, zuweisungen) in &schnappschuss.zuweisungen {
            let Some(quelle) = self.quellen.get(participant_id) else {
                continue;
            };
            if !quelle.hat_daten {
                continue;
            }
            for z in zuweisungen {
                let (Some(bus), Some(lauf)) = (
                    schnappschuss.busse.get(&z.bus_id),
                    self.busse.get_mut(&z.bus_id),
                ) else {
                    continue;
                };

                self.kratz.clear();
                self.kratz.extend_from_slice(&quelle.block);
                raum::anwenden(&mut self.kratz, kanaele, &z.position, &bus.hoerer_position);
                if z.gain != 1.0 {
                    for s in self.kratz.iter_mut() {
                        *s *= z.gain;
                    }
                }
                if !z.effekte.is_empty() {
                    kette_aktuell(
                        &mut lauf.zuweisungs_ketten,
                        *participant_id,
                        z.ketten_version,
                        &z.effekte,
                        self.format,
                    )
                    .verarbeiten(&mut self.kratz);
                }
                for (m, s) in lauf.mix.iter_mut().zip(self.kratz.iter()) {
                    *m += *s;
                }
            }
        }

        // Bus-Stufe: Master-Gain, Bus-Effekte, Limiter, Senke
        for (id, bus) in &schnappschuss.busse {
            let Some(lauf) = self.busse.get_mut(id) else {
                continue;
            };
            if bus.master_gain != 1.0 {
                for m in lauf.mix.iter_mut() {
                    *m *= bus.master_gain;
                }
            }
            if !bus.effekte.is_empty() {
                let veraltet = !matches!(&lauf.kette, Some((v, _)) if *v == bus.ketten_version);
                if veraltet {
                    lauf.kette = Some((
                        bus.ketten_version,
                        EffektKette::aus_stufen(&bus.effekte, self.format),
                    ));
                }
                if let Some((_, kette)) = lauf.kette.as_mut() {
                    kette.verarbeiten(&mut lauf.mix);
                }
            }
            lauf.vor_limiter.clear();
            lauf.vor_limiter.extend_from_slice(&lauf.mix);
            self.limiter.anwenden(&mut lauf.mix);

            let Some(sink) = lauf.sink.as_mut() else {
                trace!(bus_id = %id, "Bus ohne Senke");
                continue;
            };
            match sink.schreiben(id, &lauf.mix) {
                Ok(()) => {
                    if lauf.fehlerhaft {
                        lauf.fehlerhaft = false;
                        info!(bus_id = %id, "Bus schreibt wieder");
                    }
                }
                Err(e) => {
                    self.zaehler.schreibfehler.fetch_add(1, Ordering::Relaxed);
                    if !lauf.fehlerhaft {
                        lauf.fehlerhaft = true;
                        warn!(bus_id = %id, "Schreibfehler: {}", e);
                        self.ereignisse.senden(KlangraumEvent::BusSchreibfehler {
                            bus_id: id.clone(),
                            fehler: e.to_string(),
                        });
                    }
                }
            }
        }

        self.zaehler.zyklen.fetch_add(1, Ordering::Relaxed);
    }
}
