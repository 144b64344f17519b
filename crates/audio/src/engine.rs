//! MixEngine – Takt-Thread fuer den Bus-Mixer
//!
//! Ruft den `BusMixer` in fester Periode auf (Zyklus-Frames durch
//! Abtastrate). Der Thread wartet nie auf Netzwerk-I/O, sondern nur auf
//! seinen naechsten Takt oder ein Steuerkommando ueber crossbeam-channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::AudioResult;
use crate::mixer::{BusMixer, MixStatistik, MixZaehler};

/// Kommandos an den Mix-Thread
#[derive(Debug)]
pub enum EngineBefehl {
    Shutdown,
}

/// Treibt den Bus-Mixer auf einem eigenen Thread
///
/// Wird die Engine gedroppt, endet der Thread nach dem laufenden Zyklus.
pub struct MixEngine {
    cmd_tx: Sender<EngineBefehl>,
    thread: Option<JoinHandle<()>>,
    zaehler: Arc<MixZaehler>,
    periode: Duration,
}

impl MixEngine {
    /// Startet den Mix-Thread mit der Zyklusdauer des Mixers
    pub fn starten(mixer: BusMixer) -> AudioResult<Self> {
        let periode = mixer.zyklus_dauer();
        Self::mit_periode(mixer, periode)
    }

    /// Startet den Mix-Thread mit abweichender Periode
    pub fn mit_periode(mixer: BusMixer, periode: Duration) -> AudioResult<Self> {
        let (cmd_tx, cmd_rx) = bounded::<EngineBefehl>(8);
        let zaehler = mixer.zaehler();
        let periode = periode.max(Duration::from_micros(100));

        let thread = std::thread::Builder::new()
            .name("klangraum-mix".to_string())
            .spawn(move || mix_thread(mixer, cmd_rx, periode))?;

        info!(periode_us = periode.as_micros() as u64, "MixEngine gestartet");

        Ok(Self {
            cmd_tx,
            thread: Some(thread),
            zaehler,
            periode,
        })
    }

    pub fn periode(&self) -> Duration {
        self.periode
    }

    pub fn statistik(&self) -> MixStatistik {
        self.zaehler.statistik()
    }

    /// Stoppt den Thread und wartet auf sein Ende
    pub fn stoppen(mut self) {
        self.beenden();
    }

    fn beenden(&mut self) {
        let _ = self.cmd_tx.send(EngineBefehl::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Mix-Thread ist abgestuerzt");
            }
            debug!("MixEngine gestoppt");
        }
    }
}

impl Drop for MixEngine {
    fn drop(&mut self) {
        self.beenden();
    }
}

fn mix_thread(mut mixer: BusMixer, cmd_rx: Receiver<EngineBefehl>, periode: Duration) {
    let zaehler = mixer.zaehler();
    let mut naechster = Instant::now() + periode;

    debug!("Mix-Thread gestartet");

    loop {
        let warten = naechster.saturating_duration_since(Instant::now());
        match cmd_rx.recv_timeout(warten) {
            Ok(EngineBefehl::Shutdown) => {
                info!("Mix-Thread beendet");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Mix-Thread: Steuerkanal geschlossen");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        mixer.zyklus();
        naechster += periode;

        let jetzt = Instant::now();
        if jetzt > naechster {
            zaehler.ueberlaeufe.fetch_add(1, Ordering::Relaxed);
            // Mehr als eine Periode im Rueckstand: Takt neu ausrichten
            if jetzt - naechster > periode {
                naechster = jetzt;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusDefinition, SinkRef};
    use crate::matrix::{MatrixConfig, RoutingMatrix};
    use crate::sink::StandardSinkFabrik;
    use klangraum_core::{AudioFormat, AudioFrame, BusId, EreignisKanal, ParticipantId, QuellenRegister};

    fn aufbau() -> (RoutingMatrix, BusMixer, Arc<StandardSinkFabrik>) {
        let fabrik = Arc::new(StandardSinkFabrik::neu());
        let (m, mixer) = RoutingMatrix::neu(
            MatrixConfig {
                format: AudioFormat::neu(48000, 1),
                zyklus_frames: 240,
                standard_bus: Some(BusId::new("haupt")),
                ..MatrixConfig::default()
            },
            fabrik.clone(),
            EreignisKanal::neu(),
        );
        (m, mixer, fabrik)
    }

    #[test]
    fn periode_folgt_zyklus_frames() {
        let (_m, mixer, _f) = aufbau();
        let engine = MixEngine::starten(mixer).unwrap();
        assert_eq!(engine.periode(), Duration::from_millis(5));
        engine.stoppen();
    }

    #[test]
    fn engine_mischt_im_takt() {
        let (m, mixer, fabrik) = aufbau();
        m.bus_erstellen(&BusDefinition::neu("haupt", SinkRef::Speicher))
            .unwrap();
        let pid = ParticipantId::new();
        let mut eingang = m.quelle_registrieren(pid);
        eingang.on_frame(AudioFrame::neu(
            pid,
            AudioFormat::neu(48000, 1),
            0,
            vec![0.25; 240],
        ));

        let engine = MixEngine::starten(mixer).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let stat = engine.statistik();
        engine.stoppen();

        assert!(stat.zyklen >= 2, "zyklen={}", stat.zyklen);
        assert_eq!(stat.frames_gemischt, 1);
        let bloecke = fabrik
            .speicher_abzug(&BusId::new("haupt"))
            .unwrap()
            .entnehmen();
        assert!(bloecke.len() as u64 >= stat.zyklen);
        assert!(bloecke
            .iter()
            .any(|b| b.iter().all(|s| (s - 0.25).abs() < 1e-6)));
    }

    #[test]
    fn drop_beendet_thread() {
        let (_m, mixer, _f) = aufbau();
        let engine = MixEngine::mit_periode(mixer, Duration::from_millis(1)).unwrap();
        let zaehler = Arc::clone(&engine.zaehler);
        drop(engine);
        let danach = zaehler.statistik().zyklen;
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(zaehler.statistik().zyklen, danach);
    }
}
