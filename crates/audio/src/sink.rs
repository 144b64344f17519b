//! Senken fuer fertig gemischte Bus-Bloecke
//!
//! Der Mix-Thread schreibt jeden Zyklus genau einen Block pro Bus in
//! dessen Senke. Senken werden von einer `SinkFabrik` ausserhalb des
//! Mix-Threads erstellt, damit ein nicht unterstuetztes Format schon beim
//! Anlegen des Busses gemeldet wird.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use klangraum_core::{AudioFormat, BusId, KlangraumError, Result};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, error, info, trace};

use crate::bus::SinkRef;
use crate::device::{ausgabe_konfiguration, ausgabegeraet_laden};
use crate::error::{AudioError, AudioResult};

/// Ziel eines Busses
pub trait AudioSink: Send {
    /// Format, in dem die Senke Bloecke erwartet
    fn format(&self) -> AudioFormat;

    /// Schreibt einen Block interleavter Samples; darf nicht blockieren
    fn schreiben(&mut self, bus_id: &BusId, puffer: &[f32]) -> AudioResult<()>;
}

/// Erstellt Senken fuer neue Busse
pub trait SinkFabrik: Send + Sync {
    /// Lehnt Formate, die die Senke nicht bedienen kann, mit
    /// `NichtUnterstuetztesFormat` ab
    fn erstellen(
        &self,
        bus_id: &BusId,
        sink: &SinkRef,
        format: AudioFormat,
    ) -> Result<Box<dyn AudioSink>>;
}

// ---------------------------------------------------------------------------
// NullSink
// ---------------------------------------------------------------------------

/// Verwirft jeden Block
#[derive(Debug)]
pub struct NullSink {
    format: AudioFormat,
}

impl NullSink {
    pub fn neu(format: AudioFormat) -> Self {
        Self { format }
    }
}

impl AudioSink for NullSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn schreiben(&mut self, _bus_id: &BusId, _puffer: &[f32]) -> AudioResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SpeicherSink
// ---------------------------------------------------------------------------

/// Anzahl Bloecke, die eine Speicher-Senke hoechstens behaelt
pub const SPEICHER_MAX_BLOECKE: usize = 1024;

/// Haelt die letzten Bloecke im Speicher
pub struct SpeicherSink {
    format: AudioFormat,
    bloecke: Arc<Mutex<VecDeque<Vec<f32>>>>,
}

/// Lesender Zugriff auf die Bloecke einer `SpeicherSink`
#[derive(Clone, Default)]
pub struct SpeicherAbzug {
    bloecke: Arc<Mutex<VecDeque<Vec<f32>>>>,
}

impl SpeicherSink {
    pub fn neu(format: AudioFormat) -> (Self, SpeicherAbzug) {
        let bloecke = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                format,
                bloecke: Arc::clone(&bloecke),
            },
            SpeicherAbzug { bloecke },
        )
    }
}

impl AudioSink for SpeicherSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn schreiben(&mut self, _bus_id: &BusId, puffer: &[f32]) -> AudioResult<()> {
        let mut bloecke = self.bloecke.lock();
        if bloecke.len() >= SPEICHER_MAX_BLOECKE {
            bloecke.pop_front();
        }
        bloecke.push_back(puffer.to_vec());
        Ok(())
    }
}

impl SpeicherAbzug {
    pub fn anzahl(&self) -> usize {
        self.bloecke.lock().len()
    }

    pub fn letzter(&self) -> Option<Vec<f32>> {
        self.bloecke.lock().back().cloned()
    }

    /// Entnimmt alle bisher geschriebenen Bloecke
    pub fn entnehmen(&self) -> Vec<Vec<f32>> {
        self.bloecke.lock().drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// GeraeteSink
// ---------------------------------------------------------------------------

/// Pufferlaenge zwischen Mix-Thread und Geraet in Millisekunden
const GERAETE_PUFFER_MS: usize = 200;

/// Schreibt auf ein cpal-Ausgabegeraet
///
/// Der cpal-Stream lebt auf einem eigenen Thread und liest aus einem
/// lock-free Ring-Buffer, den der Mix-Thread befuellt. Wird die Senke
/// gedroppt, stoppt der Stream.
pub struct GeraeteSink {
    format: AudioFormat,
    producer: HeapProd<f32>,
    stream_fehler: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl GeraeteSink {
    /// Oeffnet das Geraet `name` (oder das Standardgeraet) fuer `bus_id`
    pub fn oeffnen(bus_id: &BusId, name: Option<&str>, format: AudioFormat) -> Result<Self> {
        let kapazitaet = (format.sample_rate as usize * GERAETE_PUFFER_MS / 1000)
            * format.kanaele.max(1) as usize;
        let rb = HeapRb::<f32>::new(kapazitaet.max(1));
        let (producer, consumer) = rb.split();

        let stream_fehler = Arc::new(AtomicBool::new(false));
        let (bereit_tx, bereit_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread_bus = bus_id.clone();
        let thread_name = name.map(str::to_string);
        let thread_fehler = Arc::clone(&stream_fehler);

        let thread = std::thread::Builder::new()
            .name(format!("klangraum-sink-{}", bus_id.as_str()))
            .spawn(move || {
                match stream_oeffnen(
                    &thread_bus,
                    thread_name.as_deref(),
                    format,
                    consumer,
                    thread_fehler,
                ) {
                    Ok(stream) => {
                        let _ = bereit_tx.send(Ok(()));
                        // Haelt den Stream bis zum Stop-Signal am Leben
                        let _ = stop_rx.recv();
                        drop(stream);
                        debug!(bus_id = %thread_bus, "Geraete-Stream beendet");
                    }
                    Err(e) => {
                        let _ = bereit_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| KlangraumError::from(AudioError::Io(e)))?;

        match bereit_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::StreamFehler(
                    "Sink-Thread wurde unerwartet beendet".into(),
                )
                .into());
            }
        }

        info!(
            bus_id = %bus_id,
            geraet = name.unwrap_or("standard"),
            sample_rate = format.sample_rate,
            kanaele = format.kanaele,
            "Geraete-Senke geoeffnet"
        );

        Ok(Self {
            format,
            producer,
            stream_fehler,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

fn stream_oeffnen(
    bus_id: &BusId,
    name: Option<&str>,
    format: AudioFormat,
    mut consumer: HeapCons<f32>,
    stream_fehler: Arc<AtomicBool>,
) -> Result<Stream> {
    let device = ausgabegeraet_laden(name).map_err(|e| e.fuer_bus(bus_id, format))?;
    let nicht_unterstuetzt = || KlangraumError::NichtUnterstuetztesFormat {
        bus_id: bus_id.clone(),
        sample_rate: format.sample_rate,
        kanaele: format.kanaele,
    };
    let supported = ausgabe_konfiguration(&device, format)
        .map_err(|e| e.fuer_bus(bus_id, format))?
        .ok_or_else(nicht_unterstuetzt)?;

    let stream_config = StreamConfig {
        channels: format.kanaele,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let fehler_bus = bus_id.clone();
    let err_fn = move |err| {
        error!(bus_id = %fehler_bus, "Geraete-Stream-Fehler: {}", err);
        stream_fehler.store(true, Ordering::Release);
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _| {
                    let read = consumer.pop_slice(data);
                    // Stille fuer fehlende Samples
                    if read < data.len() {
                        data[read..].fill(0.0);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?,
        SampleFormat::I16 => {
            let mut float_buf: Vec<f32> = Vec::new();
            device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _| {
                        float_buf.resize(data.len(), 0.0);
                        let read = consumer.pop_slice(&mut float_buf);
                        float_buf[read..].fill(0.0);
                        for (out, s) in data.iter_mut().zip(float_buf.iter()) {
                            *out = (*s * i16::MAX as f32)
                                .clamp(i16::MIN as f32, i16::MAX as f32)
                                as i16;
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| AudioError::StreamFehler(e.to_string()))?
        }
        _ => return Err(nicht_unterstuetzt()),
    };

    stream
        .play()
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;
    Ok(stream)
}

impl AudioSink for GeraeteSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn schreiben(&mut self, bus_id: &BusId, puffer: &[f32]) -> AudioResult<()> {
        if self.stream_fehler.load(Ordering::Acquire) {
            return Err(AudioError::SinkFehler(format!(
                "Geraete-Stream von {} ausgefallen",
                bus_id
            )));
        }
        let geschrieben = self.producer.push_slice(puffer);
        if geschrieben < puffer.len() {
            trace!(
                bus_id = %bus_id,
                verworfen = puffer.len() - geschrieben,
                "Geraete-Puffer voll"
            );
        }
        Ok(())
    }
}

impl Drop for GeraeteSink {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// StandardSinkFabrik
// ---------------------------------------------------------------------------

/// Erstellt Senken fuer alle `SinkRef`-Arten
///
/// Merkt sich die Abzuege der Speicher-Senken, damit Aufrufer den Mix eines
/// Busses lesen koennen.
#[derive(Default)]
pub struct StandardSinkFabrik {
    speicher: Mutex<HashMap<BusId, SpeicherAbzug>>,
}

impl StandardSinkFabrik {
    pub fn neu() -> Self {
        Self::default()
    }

    /// Abzug der zuletzt fuer `bus_id` erstellten Speicher-Senke
    pub fn speicher_abzug(&self, bus_id: &BusId) -> Option<SpeicherAbzug> {
        self.speicher.lock().get(bus_id).cloned()
    }
}

impl SinkFabrik for StandardSinkFabrik {
    fn erstellen(
        &self,
        bus_id: &BusId,
        sink: &SinkRef,
        format: AudioFormat,
    ) -> Result<Box<dyn AudioSink>> {
        if format.sample_rate == 0 || format.kanaele == 0 {
            return Err(KlangraumError::NichtUnterstuetztesFormat {
                bus_id: bus_id.clone(),
                sample_rate: format.sample_rate,
                kanaele: format.kanaele,
            });
        }
        match sink {
            SinkRef::Null => Ok(Box::new(NullSink::neu(format))),
            SinkRef::Speicher => {
                let (sink, abzug) = SpeicherSink::neu(format);
                self.speicher.lock().insert(bus_id.clone(), abzug);
                Ok(Box::new(sink))
            }
            SinkRef::Standard => Ok(Box::new(GeraeteSink::oeffnen(bus_id, None, format)?)),
            SinkRef::Geraet(name) => Ok(Box::new(GeraeteSink::oeffnen(
                bus_id,
                Some(name),
                format,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speicher_sink_behaelt_bloecke() {
        let (mut sink, abzug) = SpeicherSink::neu(AudioFormat::neu(48000, 2));
        let bus = BusId::new("a");
        sink.schreiben(&bus, &[0.1, 0.2]).unwrap();
        sink.schreiben(&bus, &[0.3, 0.4]).unwrap();
        assert_eq!(abzug.anzahl(), 2);
        assert_eq!(abzug.letzter(), Some(vec![0.3, 0.4]));
        assert_eq!(abzug.entnehmen().len(), 2);
        assert_eq!(abzug.anzahl(), 0);
    }

    #[test]
    fn speicher_sink_ist_begrenzt() {
        let (mut sink, abzug) = SpeicherSink::neu(AudioFormat::default());
        let bus = BusId::new("a");
        for i in 0..SPEICHER_MAX_BLOECKE + 10 {
            sink.schreiben(&bus, &[i as f32]).unwrap();
        }
        assert_eq!(abzug.anzahl(), SPEICHER_MAX_BLOECKE);
        assert_eq!(abzug.entnehmen()[0], vec![10.0]);
    }

    #[test]
    fn fabrik_lehnt_leeres_format_ab() {
        let fabrik = StandardSinkFabrik::neu();
        let ergebnis = fabrik.erstellen(&BusId::new("x"), &SinkRef::Null, AudioFormat::neu(0, 2));
        assert!(matches!(
            ergebnis,
            Err(KlangraumError::NichtUnterstuetztesFormat { .. })
        ));
    }

    #[test]
    fn fabrik_merkt_speicher_abzug() {
        let fabrik = StandardSinkFabrik::neu();
        let bus = BusId::new("aufnahme");
        let mut sink = fabrik
            .erstellen(&bus, &SinkRef::Speicher, AudioFormat::neu(48000, 1))
            .unwrap();
        sink.schreiben(&bus, &[0.5]).unwrap();
        assert_eq!(fabrik.speicher_abzug(&bus).unwrap().letzter(), Some(vec![0.5]));
        assert!(fabrik.speicher_abzug(&BusId::new("andere")).is_none());
    }

    #[test]
    #[ignore = "Benoetigt Audio-Hardware"]
    fn geraete_sink_oeffnen_und_schreiben() {
        let bus = BusId::new("lautsprecher");
        let mut sink = GeraeteSink::oeffnen(&bus, None, AudioFormat::neu(48000, 2)).unwrap();
        sink.schreiben(&bus, &vec![0.0; 512]).unwrap();
    }

    #[test]
    #[ignore = "Benoetigt Audio-Hardware"]
    fn geraete_sink_lehnt_exotisches_format_ab() {
        let bus = BusId::new("lautsprecher");
        let ergebnis = GeraeteSink::oeffnen(&bus, None, AudioFormat::neu(7, 31));
        assert!(matches!(
            ergebnis,
            Err(KlangraumError::NichtUnterstuetztesFormat { .. })
        ));
    }
}
