//! Audio-Routing-Matrix
//!
//! Besitzt alle Busse und RoutingAssignments. Schreibende Operationen
//! laufen ausschliesslich ausserhalb des Mix-Threads: sie klonen den
//! aktuellen Schnappschuss, aendern die Kopie und tauschen sie danach
//! komplett aus. Der Mix-Thread liest pro Zyklus genau einen Schnappschuss
//! und sieht so nie eine halb geaenderte Zuweisungsliste.
//!
//! Frames gelangen ueber eine SPSC-Queue pro Teilnehmer in den Mix-Thread.
//! Die Produzenten-Seite (`FrameEingang`) gehoert der PeerConnection, die
//! Konsumenten-Seite dem `BusMixer`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender, TrySendError};
use klangraum_core::{
    AudioFormat, AudioFrame, BusId, EreignisKanal, FrameEingabe, KlangraumError, ParticipantId,
    QuellenRegister, Result,
};
use parking_lot::{Mutex, RwLock};
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::bus::{BusDefinition, SinkRef};
use crate::mixer::{BusMixer, MixStatistik, MixZaehler, MixerBefehl, SoftLimiter};
use crate::pipeline::EffektStufe;
use crate::raum::Position;
use crate::sink::{AudioSink, SinkFabrik};

/// Kapazitaet des Befehlskanals zum Mix-Thread
pub const BEFEHL_KAPAZITAET: usize = 1024;

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Format und Takt des Mixers
#[derive(Debug, Clone)]
pub struct MatrixConfig {
    /// Gemeinsames Format aller Busse
    pub format: AudioFormat,
    /// Sample-Frames pro Mix-Zyklus
    pub zyklus_frames: usize,
    /// Kapazitaet der Frame-Queue pro Teilnehmer
    pub queue_frames: usize,
    pub limiter_decke: f32,
    pub limiter_knie: f32,
    /// Bus fuer Teilnehmer ohne jeden Routing-Eintrag
    pub standard_bus: Option<BusId>,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::neu(48000, 2),
            zyklus_frames: 256,
            queue_frames: 32,
            limiter_decke: 1.0,
            limiter_knie: 0.8,
            standard_bus: None,
        }
    }
}

/// Einstellungen einer Zuweisung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZuweisungsOptionen {
    /// Linearer Faktor, wird auf 0.0..=1.0 begrenzt
    pub gain: f32,
    pub position: Position,
    pub effekte: Vec<EffektStufe>,
}

impl Default for ZuweisungsOptionen {
    fn default() -> Self {
        Self {
            gain: 1.0,
            position: Position::URSPRUNG,
            effekte: Vec::new(),
        }
    }
}

/// Vorgegebene Zuweisungen pro Teilnehmer aus der Konfiguration
pub type Vorgaben = HashMap<ParticipantId, Vec<(BusId, ZuweisungsOptionen)>>;

// ---------------------------------------------------------------------------
// Schnappschuss
// ---------------------------------------------------------------------------

/// Route eines Teilnehmers auf einen Bus
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingAssignment {
    pub participant_id: ParticipantId,
    pub bus_id: BusId,
    pub gain: f32,
    pub position: Position,
    pub effekte: Arc<[EffektStufe]>,
    /// Aendert sich nur, wenn die Effektliste ersetzt wird
    pub ketten_version: u64,
}

/// Ein Bus wie ihn der Mix-Thread sieht
#[derive(Debug, Clone, PartialEq)]
pub struct BusEintrag {
    pub id: BusId,
    pub sink: SinkRef,
    pub master_gain: f32,
    pub effekte: Arc<[EffektStufe]>,
    pub hoerer_position: Position,
    pub ketten_version: u64,
}

impl BusEintrag {
    fn aus_definition(def: &BusDefinition, ketten_version: u64) -> Self {
        Self {
            id: def.id.clone(),
            sink: def.sink.clone(),
            master_gain: def.konfig.master_gain.max(0.0),
            effekte: Arc::from(def.konfig.effekte.clone()),
            hoerer_position: def.konfig.hoerer_position,
            ketten_version,
        }
    }
}

/// Unveraenderlicher Stand aller Busse und Zuweisungen
#[derive(Debug, Clone, Default)]
pub struct MatrixSchnappschuss {
    pub busse: BTreeMap<BusId, BusEintrag>,
    pub zuweisungen: BTreeMap<ParticipantId, Vec<RoutingAssignment>>,
}

impl MatrixSchnappschuss {
    pub fn zuweisungen_von(&self, participant_id: &ParticipantId) -> &[RoutingAssignment] {
        self.zuweisungen
            .get(participant_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn anzahl_zuweisungen(&self) -> usize {
        self.zuweisungen.values().map(Vec::len).sum()
    }

    /// Alle Zuweisungen auf einen Bus
    pub fn zuweisungen_auf(&self, bus_id: &BusId) -> Vec<&RoutingAssignment> {
        self.zuweisungen
            .values()
            .flatten()
            .filter(|z| &z.bus_id == bus_id)
            .collect()
    }
}

pub(crate) type GeteilterSchnappschuss = Arc<RwLock<Arc<MatrixSchnappschuss>>>;

/// Ergebnis eines `neu_laden`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadBericht {
    pub erstellt: Vec<BusId>,
    pub entfernt: Vec<BusId>,
    pub aktualisiert: Vec<BusId>,
    pub zuweisungen_geaendert: usize,
}

// ---------------------------------------------------------------------------
// RoutingMatrix
// ---------------------------------------------------------------------------

/// Verwaltungsdaten, die nur schreibende Operationen brauchen
#[derive(Default)]
struct Verwaltung {
    naechste_version: u64,
    registriert: HashSet<ParticipantId>,
    /// Teilnehmer mit Routing-Eintrag, auch wenn alle Zuweisungen entfernt wurden
    bekannt: HashSet<ParticipantId>,
    vorgaben: Vorgaben,
    standard_bus: Option<BusId>,
}

impl Verwaltung {
    fn version(&mut self) -> u64 {
        self.naechste_version += 1;
        self.naechste_version
    }
}

struct MatrixInner {
    format: AudioFormat,
    queue_frames: usize,
    schnappschuss: GeteilterSchnappschuss,
    verwaltung: Mutex<Verwaltung>,
    fabrik: Arc<dyn SinkFabrik>,
    befehle: Sender<MixerBefehl>,
    zaehler: Arc<MixZaehler>,
}

/// Besitzt Busse und Zuweisungen und nimmt Teilnehmer-Quellen an
///
/// `Clone` teilt den inneren Zustand.
#[derive(Clone)]
pub struct RoutingMatrix {
    inner: Arc<MatrixInner>,
}

impl RoutingMatrix {
    /// Erstellt die Matrix und den zugehoerigen Mixer
    ///
    /// Der Mixer wird an die `MixEngine` uebergeben oder in Tests direkt
    /// zyklisch aufgerufen.
    pub fn neu(
        config: MatrixConfig,
        fabrik: Arc<dyn SinkFabrik>,
        ereignisse: EreignisKanal,
    ) -> (Self, BusMixer) {
        let (befehle_tx, befehle_rx) = bounded(BEFEHL_KAPAZITAET);
        let schnappschuss: GeteilterSchnappschuss = Arc::default();
        let zaehler = Arc::new(MixZaehler::default());

        let mixer = BusMixer::neu(
            config.format,
            config.zyklus_frames,
            SoftLimiter::neu(config.limiter_decke, config.limiter_knie),
            befehle_rx,
            Arc::clone(&schnappschuss),
            Arc::clone(&zaehler),
            ereignisse,
        );

        let matrix = Self {
            inner: Arc::new(MatrixInner {
                format: config.format,
                queue_frames: config.queue_frames.max(1),
                schnappschuss,
                verwaltung: Mutex::new(Verwaltung {
                    standard_bus: config.standard_bus,
                    ..Verwaltung::default()
                }),
                fabrik,
                befehle: befehle_tx,
                zaehler,
            }),
        };
        (matrix, mixer)
    }

    pub fn format(&self) -> AudioFormat {
        self.inner.format
    }

    /// Aktueller Schnappschuss aller Busse und Zuweisungen
    pub fn schnappschuss(&self) -> Arc<MatrixSchnappschuss> {
        Arc::clone(&self.inner.schnappschuss.read())
    }

    pub fn statistik(&self) -> MixStatistik {
        self.inner.zaehler.statistik()
    }

    /// Anzahl der aktuell registrierten Teilnehmer-Quellen
    pub fn aktive_quellen(&self) -> usize {
        self.inner.verwaltung.lock().registriert.len()
    }

    pub fn busse(&self) -> Vec<BusId> {
        self.schnappschuss().busse.keys().cloned().collect()
    }

    pub fn zuweisungen(&self, participant_id: &ParticipantId) -> Vec<RoutingAssignment> {
        self.schnappschuss().zuweisungen_von(participant_id).to_vec()
    }

    pub fn standard_bus(&self) -> Option<BusId> {
        self.inner.verwaltung.lock().standard_bus.clone()
    }

    /// Setzt den Standard-Bus und weist registrierte Teilnehmer ohne
    /// Routing-Eintrag sofort zu
    pub fn standard_bus_setzen(&self, bus_id: Option<BusId>) {
        let ergebnis = self.veroeffentlichen(|s, v| {
            v.standard_bus = bus_id;
            Ok(offene_standard_zuweisungen(s, v))
        });
        if let Ok(anzahl) = ergebnis {
            debug!(zugewiesen = anzahl, "Standard-Bus gesetzt");
        }
    }

    /// Setzt die Zuweisungen, die neue Teilnehmer beim Registrieren erhalten
    pub fn vorgaben_setzen(&self, vorgaben: Vorgaben) {
        let ergebnis = self.veroeffentlichen(|s, v| {
            v.vorgaben = vorgaben;
            Ok(offene_standard_zuweisungen(s, v))
        });
        if let Ok(anzahl) = ergebnis {
            debug!(zugewiesen = anzahl, "Vorgaben gesetzt");
        }
    }

    // --- Busse ---

    /// Legt einen Bus an und oeffnet seine Senke
    pub fn bus_erstellen(&self, def: &BusDefinition) -> Result<()> {
        if self.schnappschuss().busse.contains_key(&def.id) {
            return Err(bus_existiert(&def.id));
        }
        let sink = self
            .inner
            .fabrik
            .erstellen(&def.id, &def.sink, self.inner.format)?;

        self.veroeffentlichen(|s, v| {
            if s.busse.contains_key(&def.id) {
                return Err(bus_existiert(&def.id));
            }
            let version = v.version();
            s.busse
                .insert(def.id.clone(), BusEintrag::aus_definition(def, version));
            offene_standard_zuweisungen(s, v);
            Ok(())
        })?;
        self.sink_setzen(def.id.clone(), sink);

        info!(bus_id = %def.id, sink = %def.sink, "Bus erstellt");
        Ok(())
    }

    /// Entfernt einen Bus samt aller Zuweisungen darauf
    ///
    /// Gibt die Anzahl der mitentfernten Zuweisungen zurueck.
    pub fn bus_entfernen(&self, bus_id: &BusId) -> Result<usize> {
        let kaskade = self.veroeffentlichen(|s, _| {
            if s.busse.remove(bus_id).is_none() {
                return Err(KlangraumError::UnbekannterBus(bus_id.clone()));
            }
            Ok(zuweisungen_auf_bus_entfernen(s, bus_id))
        })?;
        self.mixer_befehl(MixerBefehl::SinkEntfernen(bus_id.clone()));

        info!(bus_id = %bus_id, zuweisungen = kaskade, "Bus entfernt");
        Ok(kaskade)
    }

    /// Uebernimmt Gain, Effekte und Hoerer-Position eines bestehenden Busses
    ///
    /// Eine geaenderte Senke wird neu geoeffnet, alles andere wird ohne
    /// Unterbrechung getauscht.
    pub fn bus_aktualisieren(&self, def: &BusDefinition) -> Result<()> {
        let alt = self
            .schnappschuss()
            .busse
            .get(&def.id)
            .cloned()
            .ok_or_else(|| KlangraumError::UnbekannterBus(def.id.clone()))?;

        let neue_sink = if alt.sink != def.sink {
            Some(
                self.inner
                    .fabrik
                    .erstellen(&def.id, &def.sink, self.inner.format)?,
            )
        } else {
            None
        };

        self.veroeffentlichen(|s, v| {
            let eintrag = s
                .busse
                .get_mut(&def.id)
                .ok_or_else(|| KlangraumError::UnbekannterBus(def.id.clone()))?;
            bus_uebernehmen(eintrag, def, v);
            Ok(())
        })?;
        if let Some(sink) = neue_sink {
            self.sink_setzen(def.id.clone(), sink);
        }

        debug!(bus_id = %def.id, "Bus aktualisiert");
        Ok(())
    }

    // --- Zuweisungen ---

    /// Erstellt oder aendert die Zuweisung eines Teilnehmers auf einen Bus
    pub fn zuweisen(
        &self,
        participant_id: ParticipantId,
        bus_id: &BusId,
        optionen: &ZuweisungsOptionen,
    ) -> Result<()> {
        self.veroeffentlichen(|s, v| {
            if !s.busse.contains_key(bus_id) {
                return Err(KlangraumError::UnbekannterBus(bus_id.clone()));
            }
            zuweisung_setzen(s, v, participant_id, bus_id, optionen);
            Ok(())
        })?;
        debug!(participant_id = %participant_id, bus_id = %bus_id, "Zuweisung gesetzt");
        Ok(())
    }

    /// Entfernt eine Zuweisung
    ///
    /// Die Quelle des Teilnehmers bleibt bestehen, ihre Frames werden bis
    /// zur naechsten Zuweisung nur nicht mehr gemischt.
    pub fn zuweisung_aufheben(&self, participant_id: ParticipantId, bus_id: &BusId) -> Result<bool> {
        let entfernt = self.veroeffentlichen(|s, _| {
            if !s.busse.contains_key(bus_id) {
                return Err(KlangraumError::UnbekannterBus(bus_id.clone()));
            }
            Ok(zuweisung_entfernen(s, participant_id, bus_id))
        })?;
        if entfernt {
            debug!(participant_id = %participant_id, bus_id = %bus_id, "Zuweisung aufgehoben");
        }
        Ok(entfernt)
    }

    /// Verschiebt einen Teilnehmer im Raum eines Busses
    ///
    /// Die Effekt-Kette der Zuweisung bleibt dabei erhalten.
    pub fn position_aktualisieren(
        &self,
        participant_id: ParticipantId,
        bus_id: &BusId,
        position: Position,
    ) -> Result<()> {
        self.veroeffentlichen(|s, _| {
            if !s.busse.contains_key(bus_id) {
                return Err(KlangraumError::UnbekannterBus(bus_id.clone()));
            }
            let zuweisung = s
                .zuweisungen
                .get_mut(&participant_id)
                .and_then(|liste| liste.iter_mut().find(|z| &z.bus_id == bus_id))
                .ok_or_else(|| {
                    KlangraumError::ungueltiger_teilnehmer(
                        participant_id,
                        format!("keine Zuweisung auf {}", bus_id),
                    )
                })?;
            zuweisung.position = position;
            Ok(())
        })?;
        trace!(participant_id = %participant_id, bus_id = %bus_id, "Position aktualisiert");
        Ok(())
    }

    // --- Reload ---

    /// Gleicht Busse und Vorgaben mit einer neuen Konfiguration ab
    ///
    /// Alle neuen Senken werden vor der ersten Aenderung geoeffnet. Schlaegt
    /// eine davon fehl oder verweist eine Vorgabe auf einen unbekannten Bus,
    /// bleibt die Matrix unveraendert. Unveraenderte Busse werden nicht
    /// angefasst.
    pub fn neu_laden(
        &self,
        busse: &[BusDefinition],
        vorgaben: Vorgaben,
        standard_bus: Option<BusId>,
    ) -> Result<ReloadBericht> {
        let mut ids = HashSet::new();
        for def in busse {
            if !ids.insert(&def.id) {
                return Err(KlangraumError::Konfiguration(format!(
                    "Bus {} ist doppelt definiert",
                    def.id
                )));
            }
        }
        for (pid, liste) in &vorgaben {
            if let Some((bus_id, _)) = liste.iter().find(|(b, _)| !ids.contains(b)) {
                warn!(participant_id = %pid, bus_id = %bus_id, "Vorgabe verweist auf unbekannten Bus");
                return Err(KlangraumError::UnbekannterBus(bus_id.clone()));
            }
        }

        // Phase 1: Senken oeffnen
        let aktuell = self.schnappschuss();
        let mut neue_sinks: Vec<(BusId, Box<dyn AudioSink>)> = Vec::new();
        for def in busse {
            let braucht_sink = match aktuell.busse.get(&def.id) {
                Some(alt) => alt.sink != def.sink,
                None => true,
            };
            if braucht_sink {
                let sink = self
                    .inner
                    .fabrik
                    .erstellen(&def.id, &def.sink, self.inner.format)?;
                neue_sinks.push((def.id.clone(), sink));
            }
        }

        // Phase 2: Schnappschuss tauschen
        let bericht = self.veroeffentlichen(|s, v| {
            let mut bericht = ReloadBericht::default();

            let entfernt: Vec<BusId> = s
                .busse
                .keys()
                .filter(|id| !ids.contains(id))
                .cloned()
                .collect();
            for id in &entfernt {
                s.busse.remove(id);
                bericht.zuweisungen_geaendert += zuweisungen_auf_bus_entfernen(s, id);
            }
            bericht.entfernt = entfernt;

            for def in busse {
                match s.busse.get_mut(&def.id) {
                    Some(eintrag) => {
                        if bus_unveraendert(eintrag, def) {
                            continue;
                        }
                        bus_uebernehmen(eintrag, def, v);
                        bericht.aktualisiert.push(def.id.clone());
                    }
                    None => {
                        let version = v.version();
                        s.busse
                            .insert(def.id.clone(), BusEintrag::aus_definition(def, version));
                        bericht.erstellt.push(def.id.clone());
                    }
                }
            }

            let registriert: Vec<ParticipantId> = v.registriert.iter().copied().collect();
            for pid in registriert {
                let alt = v.vorgaben.get(&pid).cloned().unwrap_or_default();
                let neu = vorgaben.get(&pid).cloned().unwrap_or_default();
                for (bus_id, _) in alt.iter().filter(|(b, _)| !neu.iter().any(|(n, _)| n == b)) {
                    if zuweisung_entfernen(s, pid, bus_id) {
                        bericht.zuweisungen_geaendert += 1;
                    }
                }
                for (bus_id, optionen) in &neu {
                    if !alt.contains(&(bus_id.clone(), optionen.clone())) {
                        zuweisung_setzen(s, v, pid, bus_id, optionen);
                        bericht.zuweisungen_geaendert += 1;
                    }
                }
            }
            v.vorgaben = vorgaben;
            v.standard_bus = standard_bus;
            bericht.zuweisungen_geaendert += offene_standard_zuweisungen(s, v);
            Ok(bericht)
        })?;

        // Phase 3: Mixer nachziehen
        for id in &bericht.entfernt {
            self.mixer_befehl(MixerBefehl::SinkEntfernen(id.clone()));
        }
        for (id, sink) in neue_sinks {
            self.sink_setzen(id, sink);
        }

        info!(
            erstellt = bericht.erstellt.len(),
            entfernt = bericht.entfernt.len(),
            aktualisiert = bericht.aktualisiert.len(),
            zuweisungen = bericht.zuweisungen_geaendert,
            "Routing neu geladen"
        );
        Ok(bericht)
    }

    // --- Intern ---

    /// Aendert eine Kopie des Schnappschusses und veroeffentlicht sie
    ///
    /// Liefert `f` einen Fehler, bleibt der alte Schnappschuss gueltig.
    fn veroeffentlichen<R>(
        &self,
        f: impl FnOnce(&mut MatrixSchnappschuss, &mut Verwaltung) -> Result<R>,
    ) -> Result<R> {
        let mut verwaltung = self.inner.verwaltung.lock();
        let mut kopie = MatrixSchnappschuss::clone(&self.inner.schnappschuss.read());
        let ergebnis = f(&mut kopie, &mut verwaltung)?;
        *self.inner.schnappschuss.write() = Arc::new(kopie);
        Ok(ergebnis)
    }

    fn sink_setzen(&self, bus_id: BusId, sink: Box<dyn AudioSink>) {
        self.mixer_befehl(MixerBefehl::SinkSetzen { bus_id, sink });
    }

    /// Blockiert nie; bei voller Queue geht der Befehl verloren
    fn mixer_befehl(&self, befehl: MixerBefehl) {
        match self.inner.befehle.try_send(befehl) {
            Ok(()) => {}
            Err(TrySendError::Full(befehl)) => {
                warn!(befehl = befehl.art(), "Befehlsqueue des Mixers voll, Befehl verworfen");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Mixer beendet, Befehl verworfen");
            }
        }
    }
}

fn bus_existiert(bus_id: &BusId) -> KlangraumError {
    KlangraumError::Konfiguration(format!("Bus {} existiert bereits", bus_id))
}

fn bus_unveraendert(eintrag: &BusEintrag, def: &BusDefinition) -> bool {
    eintrag.sink == def.sink
        && eintrag.master_gain == def.konfig.master_gain.max(0.0)
        && *eintrag.effekte == def.konfig.effekte[..]
        && eintrag.hoerer_position == def.konfig.hoerer_position
}

fn bus_uebernehmen(eintrag: &mut BusEintrag, def: &BusDefinition, v: &mut Verwaltung) {
    eintrag.sink = def.sink.clone();
    eintrag.master_gain = def.konfig.master_gain.max(0.0);
    eintrag.hoerer_position = def.konfig.hoerer_position;
    if *eintrag.effekte != def.konfig.effekte[..] {
        eintrag.effekte = Arc::from(def.konfig.effekte.clone());
        eintrag.ketten_version = v.version();
    }
}

fn gain_begrenzen(gain: f32) -> f32 {
    if gain.is_nan() {
        return 0.0;
    }
    gain.clamp(0.0, 1.0)
}

fn zuweisung_setzen(
    s: &mut MatrixSchnappschuss,
    v: &mut Verwaltung,
    participant_id: ParticipantId,
    bus_id: &BusId,
    optionen: &ZuweisungsOptionen,
) {
    let gain = gain_begrenzen(optionen.gain);
    let liste = s.zuweisungen.entry(participant_id).or_default();
    match liste.iter_mut().find(|z| &z.bus_id == bus_id) {
        Some(z) => {
            z.gain = gain;
            z.position = optionen.position;
            if *z.effekte != optionen.effekte[..] {
                z.effekte = Arc::from(optionen.effekte.clone());
                z.ketten_version = v.version();
            }
        }
        None => {
            let ketten_version = v.version();
            liste.push(RoutingAssignment {
                participant_id,
                bus_id: bus_id.clone(),
                gain,
                position: optionen.position,
                effekte: Arc::from(optionen.effekte.clone()),
                ketten_version,
            });
        }
    }
    v.bekannt.insert(participant_id);
}

fn zuweisung_entfernen(
    s: &mut MatrixSchnappschuss,
    participant_id: ParticipantId,
    bus_id: &BusId,
) -> bool {
    let Some(liste) = s.zuweisungen.get_mut(&participant_id) else {
        return false;
    };
    let vorher = liste.len();
    liste.retain(|z| &z.bus_id != bus_id);
    let entfernt = liste.len() != vorher;
    if liste.is_empty() {
        s.zuweisungen.remove(&participant_id);
    }
    entfernt
}

fn zuweisungen_auf_bus_entfernen(s: &mut MatrixSchnappschuss, bus_id: &BusId) -> usize {
    let mut anzahl = 0;
    for liste in s.zuweisungen.values_mut() {
        let vorher = liste.len();
        liste.retain(|z| &z.bus_id != bus_id);
        anzahl += vorher - liste.len();
    }
    s.zuweisungen.retain(|_, liste| !liste.is_empty());
    anzahl
}

/// Vorgaben oder Standard-Bus fuer einen Teilnehmer ohne Routing-Eintrag
fn standard_zuweisung(s: &mut MatrixSchnappschuss, v: &mut Verwaltung, participant_id: ParticipantId) {
    if v.bekannt.contains(&participant_id) || s.zuweisungen.contains_key(&participant_id) {
        return;
    }

    let vorgaben: Vec<(BusId, ZuweisungsOptionen)> = v
        .vorgaben
        .get(&participant_id)
        .map(|liste| {
            liste
                .iter()
                .filter(|(b, _)| s.busse.contains_key(b))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    if !vorgaben.is_empty() {
        for (bus_id, optionen) in &vorgaben {
            zuweisung_setzen(s, v, participant_id, bus_id, optionen);
        }
        debug!(participant_id = %participant_id, anzahl = vorgaben.len(), "Vorgaben angewendet");
        return;
    }

    match v.standard_bus.clone() {
        Some(bus_id) if s.busse.contains_key(&bus_id) => {
            zuweisung_setzen(s, v, participant_id, &bus_id, &ZuweisungsOptionen::default());
            info!(participant_id = %participant_id, bus_id = %bus_id, "Standard-Zuweisung");
        }
        Some(bus_id) => {
            warn!(participant_id = %participant_id, bus_id = %bus_id, "Standard-Bus existiert nicht");
        }
        None => {
            debug!(participant_id = %participant_id, "Kein Standard-Bus konfiguriert");
        }
    }
}

/// Wendet die Standard-Regel auf alle registrierten Teilnehmer ohne
/// Routing-Eintrag an und liefert die Anzahl neuer Zuweisungen
fn offene_standard_zuweisungen(s: &mut MatrixSchnappschuss, v: &mut Verwaltung) -> usize {
    let offen: Vec<ParticipantId> = v
        .registriert
        .iter()
        .filter(|pid| !v.bekannt.contains(pid) && !s.zuweisungen.contains_key(pid))
        .copied()
        .collect();
    let vorher = s.anzahl_zuweisungen();
    for pid in offen {
        standard_zuweisung(s, v, pid);
    }
    s.anzahl_zuweisungen() - vorher
}

// ---------------------------------------------------------------------------
// Quellen
// ---------------------------------------------------------------------------

impl QuellenRegister for RoutingMatrix {
    fn quelle_registrieren(&self, participant_id: ParticipantId) -> Box<dyn FrameEingabe> {
        let rb = HeapRb::<AudioFrame>::new(self.inner.queue_frames);
        let (producer, consumer) = rb.split();
        self.mixer_befehl(MixerBefehl::QuelleNeu {
            participant_id,
            queue: consumer,
        });

        let ergebnis = self.veroeffentlichen(|s, v| {
            v.registriert.insert(participant_id);
            standard_zuweisung(s, v, participant_id);
            Ok(())
        });
        if let Err(e) = ergebnis {
            warn!(participant_id = %participant_id, "Standard-Zuweisung fehlgeschlagen: {}", e);
        }
        debug!(participant_id = %participant_id, "Quelle registriert");

        Box::new(FrameEingang {
            participant_id,
            producer,
            zaehler: Arc::clone(&self.inner.zaehler),
        })
    }

    fn quelle_entfernen(&self, participant_id: ParticipantId) {
        self.mixer_befehl(MixerBefehl::QuelleEntfernt(participant_id));
        let ergebnis = self.veroeffentlichen(|s, v| {
            v.registriert.remove(&participant_id);
            v.bekannt.remove(&participant_id);
            Ok(s.zuweisungen.remove(&participant_id).map_or(0, |l| l.len()))
        });
        if let Ok(anzahl) = ergebnis {
            debug!(participant_id = %participant_id, zuweisungen = anzahl, "Quelle entfernt");
        }
    }
}

/// Produzenten-Seite der Frame-Queue eines Teilnehmers
///
/// Ist die Queue voll, wird der neue Frame verworfen und gezaehlt.
pub struct FrameEingang {
    participant_id: ParticipantId,
    producer: HeapProd<AudioFrame>,
    zaehler: Arc<MixZaehler>,
}

impl FrameEingabe for FrameEingang {
    fn on_frame(&mut self, frame: AudioFrame) {
        if self.producer.try_push(frame).is_err() {
            self.zaehler.queue_verworfen.fetch_add(1, Ordering::Relaxed);
            trace!(participant_id = %self.participant_id, "Frame-Queue voll, Frame verworfen");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusKonfig;
    use crate::sink::StandardSinkFabrik;

    fn matrix() -> (RoutingMatrix, BusMixer) {
        RoutingMatrix::neu(
            MatrixConfig {
                standard_bus: Some(BusId::new("haupt")),
                ..MatrixConfig::default()
            },
            Arc::new(StandardSinkFabrik::neu()),
            EreignisKanal::neu(),
        )
    }

    fn bus(id: &str) -> BusDefinition {
        BusDefinition::neu(id, SinkRef::Null)
    }

    #[test]
    fn zuweisen_auf_unbekannten_bus_ist_fehler() {
        let (m, _mixer) = matrix();
        let pid = ParticipantId::new();
        let ergebnis = m.zuweisen(pid, &BusId::new("fehlt"), &ZuweisungsOptionen::default());
        assert!(matches!(ergebnis, Err(KlangraumError::UnbekannterBus(_))));
        assert_eq!(m.schnappschuss().anzahl_zuweisungen(), 0);
    }

    #[test]
    fn gain_wird_begrenzt() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("a")).unwrap();
        let pid = ParticipantId::new();
        let optionen = ZuweisungsOptionen {
            gain: 3.0,
            ..ZuweisungsOptionen::default()
        };
        m.zuweisen(pid, &BusId::new("a"), &optionen).unwrap();
        assert_eq!(m.zuweisungen(&pid)[0].gain, 1.0);

        let optionen = ZuweisungsOptionen {
            gain: -1.0,
            ..ZuweisungsOptionen::default()
        };
        m.zuweisen(pid, &BusId::new("a"), &optionen).unwrap();
        assert_eq!(m.zuweisungen(&pid).len(), 1);
        assert_eq!(m.zuweisungen(&pid)[0].gain, 0.0);
    }

    #[test]
    fn bus_doppelt_erstellen_ist_fehler() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("a")).unwrap();
        assert!(matches!(
            m.bus_erstellen(&bus("a")),
            Err(KlangraumError::Konfiguration(_))
        ));
    }

    #[test]
    fn bus_entfernen_kaskadiert_zuweisungen() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("a")).unwrap();
        m.bus_erstellen(&bus("b")).unwrap();
        let p1 = ParticipantId::new();
        let p2 = ParticipantId::new();
        let opt = ZuweisungsOptionen::default();
        m.zuweisen(p1, &BusId::new("a"), &opt).unwrap();
        m.zuweisen(p1, &BusId::new("b"), &opt).unwrap();
        m.zuweisen(p2, &BusId::new("a"), &opt).unwrap();

        assert_eq!(m.bus_entfernen(&BusId::new("a")).unwrap(), 2);

        let s = m.schnappschuss();
        assert!(s.zuweisungen_auf(&BusId::new("a")).is_empty());
        assert_eq!(s.anzahl_zuweisungen(), 1);
        assert!(m.zuweisungen(&p2).is_empty());
        assert!(matches!(
            m.bus_entfernen(&BusId::new("a")),
            Err(KlangraumError::UnbekannterBus(_))
        ));
    }

    #[test]
    fn position_ohne_zuweisung_ist_ungueltiger_teilnehmer() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("a")).unwrap();
        let ergebnis =
            m.position_aktualisieren(ParticipantId::new(), &BusId::new("a"), Position::URSPRUNG);
        assert!(matches!(
            ergebnis,
            Err(KlangraumError::UngueltigerTeilnehmer { .. })
        ));
    }

    #[test]
    fn position_aendert_keine_kettenversion() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("a")).unwrap();
        let pid = ParticipantId::new();
        let opt = ZuweisungsOptionen {
            effekte: vec![EffektStufe::Gain { db: -3.0 }],
            ..ZuweisungsOptionen::default()
        };
        m.zuweisen(pid, &BusId::new("a"), &opt).unwrap();
        let vorher = m.zuweisungen(&pid)[0].ketten_version;

        m.position_aktualisieren(pid, &BusId::new("a"), Position::neu(3.0, 0.0, 0.0))
            .unwrap();
        let z = &m.zuweisungen(&pid)[0];
        assert_eq!(z.position, Position::neu(3.0, 0.0, 0.0));
        assert_eq!(z.ketten_version, vorher);
    }

    #[test]
    fn neue_quelle_landet_auf_standard_bus() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("haupt")).unwrap();
        let pid = ParticipantId::new();
        let _eingang = m.quelle_registrieren(pid);

        let z = m.zuweisungen(&pid);
        assert_eq!(z.len(), 1);
        assert_eq!(z[0].bus_id, BusId::new("haupt"));
        assert_eq!(z[0].gain, 1.0);
        assert_eq!(z[0].position, Position::URSPRUNG);
        assert_eq!(m.aktive_quellen(), 1);
    }

    #[test]
    fn aufgehobene_zuweisung_bleibt_stumm() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("haupt")).unwrap();
        let pid = ParticipantId::new();
        let _eingang = m.quelle_registrieren(pid);
        assert!(m.zuweisung_aufheben(pid, &BusId::new("haupt")).unwrap());
        assert!(!m.zuweisung_aufheben(pid, &BusId::new("haupt")).unwrap());

        // Erneute Registrierung ohne Austritt weist nicht automatisch zu
        let _zweiter = m.quelle_registrieren(pid);
        assert!(m.zuweisungen(&pid).is_empty());
    }

    #[test]
    fn vorgaben_haben_vorrang_vor_standard_bus() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("haupt")).unwrap();
        m.bus_erstellen(&bus("monitor")).unwrap();
        let pid = ParticipantId::new();
        let mut vorgaben = Vorgaben::new();
        vorgaben.insert(
            pid,
            vec![(
                BusId::new("monitor"),
                ZuweisungsOptionen {
                    gain: 0.5,
                    ..ZuweisungsOptionen::default()
                },
            )],
        );
        m.vorgaben_setzen(vorgaben);
        let _eingang = m.quelle_registrieren(pid);

        let z = m.zuweisungen(&pid);
        assert_eq!(z.len(), 1);
        assert_eq!(z[0].bus_id, BusId::new("monitor"));
        assert_eq!(z[0].gain, 0.5);
    }

    #[test]
    fn quelle_entfernen_loescht_alle_zuweisungen() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("haupt")).unwrap();
        m.bus_erstellen(&bus("b")).unwrap();
        let pid = ParticipantId::new();
        let _eingang = m.quelle_registrieren(pid);
        m.zuweisen(pid, &BusId::new("b"), &ZuweisungsOptionen::default())
            .unwrap();
        m.quelle_entfernen(pid);
        assert!(m.zuweisungen(&pid).is_empty());
        assert_eq!(m.aktive_quellen(), 0);
    }

    #[test]
    fn reload_vergleicht_busse() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("bleibt")).unwrap();
        m.bus_erstellen(&bus("geht")).unwrap();
        m.bus_erstellen(&bus("aendert")).unwrap();
        let pid = ParticipantId::new();
        m.zuweisen(pid, &BusId::new("geht"), &ZuweisungsOptionen::default())
            .unwrap();
        m.zuweisen(pid, &BusId::new("bleibt"), &ZuweisungsOptionen::default())
            .unwrap();

        let neu = vec![
            bus("bleibt"),
            bus("aendert").mit_konfig(BusKonfig {
                master_gain: 0.5,
                ..BusKonfig::default()
            }),
            bus("kommt"),
        ];
        let bericht = m.neu_laden(&neu, Vorgaben::new(), None).unwrap();

        assert_eq!(bericht.erstellt, vec![BusId::new("kommt")]);
        assert_eq!(bericht.entfernt, vec![BusId::new("geht")]);
        assert_eq!(bericht.aktualisiert, vec![BusId::new("aendert")]);
        assert_eq!(bericht.zuweisungen_geaendert, 1);
        assert_eq!(m.zuweisungen(&pid).len(), 1);
        assert_eq!(m.schnappschuss().busse[&BusId::new("aendert")].master_gain, 0.5);
    }

    #[test]
    fn reload_mit_fehler_aendert_nichts() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("a")).unwrap();
        let vorher = m.busse();

        let pid = ParticipantId::new();
        let mut vorgaben = Vorgaben::new();
        vorgaben.insert(pid, vec![(BusId::new("fehlt"), ZuweisungsOptionen::default())]);
        let ergebnis = m.neu_laden(&[bus("b")], vorgaben, None);
        assert!(matches!(ergebnis, Err(KlangraumError::UnbekannterBus(_))));
        assert_eq!(m.busse(), vorher);

        let doppelt = m.neu_laden(&[bus("x"), bus("x")], Vorgaben::new(), None);
        assert!(matches!(doppelt, Err(KlangraumError::Konfiguration(_))));
        assert_eq!(m.busse(), vorher);
    }

    #[test]
    fn reload_uebernimmt_vorgaben_fuer_registrierte_quellen() {
        let (m, _mixer) = matrix();
        m.bus_erstellen(&bus("haupt")).unwrap();
        let pid = ParticipantId::new();
        let _eingang = m.quelle_registrieren(pid);

        let mut vorgaben = Vorgaben::new();
        vorgaben.insert(
            pid,
            vec![(
                BusId::new("haupt"),
                ZuweisungsOptionen {
                    gain: 0.25,
                    ..ZuweisungsOptionen::default()
                },
            )],
        );
        let bericht = m
            .neu_laden(&[bus("haupt")], vorgaben, Some(BusId::new("haupt")))
            .unwrap();
        assert!(bericht.erstellt.is_empty() && bericht.aktualisiert.is_empty());
        assert_eq!(bericht.zuweisungen_geaendert, 1);
        assert_eq!(m.zuweisungen(&pid)[0].gain, 0.25);

        // Vorgabe entfernt: Zuweisung verschwindet
        let bericht = m
            .neu_laden(&[bus("haupt")], Vorgaben::new(), Some(BusId::new("haupt")))
            .unwrap();
        assert_eq!(bericht.zuweisungen_geaendert, 1);
        assert!(m.zuweisungen(&pid).is_empty());
    }

    #[test]
    fn reload_mit_neuem_standard_bus_weist_wartende_quellen_zu() {
        let fabrik = Arc::new(StandardSinkFabrik::neu());
        let (m, mut mixer) = RoutingMatrix::neu(
            MatrixConfig {
                format: AudioFormat::neu(48000, 1),
                zyklus_frames: 64,
                ..MatrixConfig::default()
            },
            fabrik.clone(),
            EreignisKanal::neu(),
        );
        let pid = ParticipantId::new();
        let mut eingang = m.quelle_registrieren(pid);
        assert!(m.zuweisungen(&pid).is_empty());

        let bericht = m
            .neu_laden(
                &[BusDefinition::neu("raum", SinkRef::Speicher)],
                Vorgaben::new(),
                Some(BusId::new("raum")),
            )
            .unwrap();
        assert_eq!(bericht.zuweisungen_geaendert, 1);
        let z = m.zuweisungen(&pid);
        assert_eq!(z.len(), 1);
        assert_eq!(z[0].bus_id, BusId::new("raum"));

        eingang.on_frame(AudioFrame::neu(pid, m.format(), 0, vec![0.3; 64]));
        mixer.zyklus();
        let block = fabrik
            .speicher_abzug(&BusId::new("raum"))
            .unwrap()
            .letzter()
            .unwrap();
        assert!(block.iter().all(|s| (s - 0.3).abs() < 1e-6));
    }

    #[test]
    fn spaeter_standard_bus_weist_wartende_quellen_zu() {
        let (m, _mixer) = RoutingMatrix::neu(
            MatrixConfig::default(),
            Arc::new(StandardSinkFabrik::neu()),
            EreignisKanal::neu(),
        );
        let wartend = ParticipantId::new();
        let abgemeldet = ParticipantId::new();
        let _a = m.quelle_registrieren(wartend);
        let _b = m.quelle_registrieren(abgemeldet);
        m.bus_erstellen(&bus("monitor")).unwrap();
        m.zuweisen(abgemeldet, &BusId::new("monitor"), &ZuweisungsOptionen::default())
            .unwrap();
        m.zuweisung_aufheben(abgemeldet, &BusId::new("monitor"))
            .unwrap();

        // Bus kommt nach dem Standard-Bus
        m.standard_bus_setzen(Some(BusId::new("haupt")));
        assert!(m.zuweisungen(&wartend).is_empty());
        m.bus_erstellen(&bus("haupt")).unwrap();

        assert_eq!(m.zuweisungen(&wartend)[0].bus_id, BusId::new("haupt"));
        // Explizit aufgehobene Zuweisungen bleiben aufgehoben
        assert!(m.zuweisungen(&abgemeldet).is_empty());
    }

    #[test]
    fn volle_befehlsqueue_blockiert_nicht() {
        let (m, _mixer) = matrix();
        // Der Mixer laeuft nicht, die Queue wird nie geleert
        let quellen: Vec<_> = (0..BEFEHL_KAPAZITAET + 10)
            .map(|_| m.quelle_registrieren(ParticipantId::new()))
            .collect();
        assert_eq!(quellen.len(), BEFEHL_KAPAZITAET + 10);
        assert_eq!(m.aktive_quellen(), BEFEHL_KAPAZITAET + 10);
    }

    #[test]
    fn volle_queue_verwirft_frames() {
        let (m, _mixer) = RoutingMatrix::neu(
            MatrixConfig {
                queue_frames: 2,
                ..MatrixConfig::default()
            },
            Arc::new(StandardSinkFabrik::neu()),
            EreignisKanal::neu(),
        );
        let pid = ParticipantId::new();
        let mut eingang = m.quelle_registrieren(pid);
        for _ in 0..5 {
            eingang.on_frame(AudioFrame::stille(pid, m.format(), 16));
        }
        assert_eq!(m.statistik().queue_verworfen, 3);
    }
}
