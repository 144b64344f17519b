//! Mikrofon-Aufnahme via cpal
//!
//! Oeffnet einen cpal InputStream auf einem eigenen Thread und buendelt die
//! Samples zu `AudioFrame`s fester Groesse. Der Zeitstempel folgt der
//! Sample-Position, nicht der Wanduhr, und steigt damit streng monoton.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use klangraum_core::{AudioFormat, AudioFrame, KlangraumError, ParticipantId, Result};
use tracing::{debug, error, info};

use crate::device::{eingabe_konfiguration, eingabegeraet_laden};
use crate::error::AudioError;

/// Konfiguration fuer die Aufnahme
#[derive(Debug, Clone)]
pub struct AufnahmeConfig {
    /// Name des Eingabegeraets (None = Standard)
    pub geraet: Option<String>,
    pub format: AudioFormat,
    /// Sample-Frames pro `AudioFrame`
    pub frame_groesse: usize,
}

impl Default for AufnahmeConfig {
    fn default() -> Self {
        Self {
            geraet: None,
            format: AudioFormat::neu(48000, 1),
            frame_groesse: 480, // 10ms bei 48kHz
        }
    }
}

/// Buendelt fortlaufende Samples zu Frames fester Groesse
pub struct FrameSammler {
    participant_id: ParticipantId,
    format: AudioFormat,
    frame_groesse: usize,
    puffer: Vec<f32>,
    /// Bisher ausgegebene Sample-Frames
    position: u64,
}

impl FrameSammler {
    pub fn neu(participant_id: ParticipantId, format: AudioFormat, frame_groesse: usize) -> Self {
        let frame_groesse = frame_groesse.max(1);
        Self {
            participant_id,
            format,
            frame_groesse,
            puffer: Vec::with_capacity(frame_groesse * format.kanaele.max(1) as usize),
            position: 0,
        }
    }

    /// Nimmt interleavte Samples auf und gibt jeden vollen Frame an `ziel`
    pub fn einspeisen(&mut self, samples: &[f32], ziel: &mut dyn FnMut(AudioFrame)) {
        let block = self.frame_groesse * self.format.kanaele.max(1) as usize;
        let mut rest = samples;
        while !rest.is_empty() {
            let fehlt = block - self.puffer.len();
            let n = fehlt.min(rest.len());
            self.puffer.extend_from_slice(&rest[..n]);
            rest = &rest[n..];

            if self.puffer.len() == block {
                let aufgenommen_us =
                    self.position * 1_000_000 / u64::from(self.format.sample_rate.max(1));
                let samples = std::mem::replace(&mut self.puffer, Vec::with_capacity(block));
                ziel(AudioFrame::neu(
                    self.participant_id,
                    self.format,
                    aufgenommen_us,
                    samples,
                ));
                self.position += self.frame_groesse as u64;
            }
        }
    }
}

/// Laufende Aufnahme
///
/// Haelt den cpal-Stream auf seinem Thread am Leben. Wird die Aufnahme
/// gedroppt, stoppt sie.
pub struct Aufnahme {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    stream_fehler: Arc<AtomicBool>,
}

impl Aufnahme {
    /// Startet die Aufnahme; jeder volle Frame geht an `ziel`
    pub fn starten<F>(config: AufnahmeConfig, participant_id: ParticipantId, ziel: F) -> Result<Self>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        let stream_fehler = Arc::new(AtomicBool::new(false));
        let (bereit_tx, bereit_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_config = config.clone();
        let thread_fehler = Arc::clone(&stream_fehler);

        let thread = std::thread::Builder::new()
            .name("klangraum-aufnahme".to_string())
            .spawn(move || {
                let sammler = FrameSammler::neu(
                    participant_id,
                    thread_config.format,
                    thread_config.frame_groesse,
                );
                match stream_oeffnen(&thread_config, sammler, Box::new(ziel), thread_fehler) {
                    Ok(stream) => {
                        let _ = bereit_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                        debug!("Aufnahme-Stream beendet");
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
                    "Aufnahme-Thread wurde unerwartet beendet".into(),
                )
                .into());
            }
        }

        info!(
            geraet = config.geraet.as_deref().unwrap_or("standard"),
            sample_rate = config.format.sample_rate,
            kanaele = config.format.kanaele,
            "Aufnahme gestartet"
        );

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            stream_fehler,
        })
    }

    /// Meldet, ob der Stream einen Fehler gemeldet hat
    pub fn fehlerhaft(&self) -> bool {
        self.stream_fehler.load(Ordering::Acquire)
    }
}

impl Drop for Aufnahme {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

type FrameZiel = Box<dyn FnMut(AudioFrame) + Send>;

fn stream_oeffnen(
    config: &AufnahmeConfig,
    mut sammler: FrameSammler,
    mut ziel: FrameZiel,
    stream_fehler: Arc<AtomicBool>,
) -> Result<Stream> {
    let device = eingabegeraet_laden(config.geraet.as_deref())?;
    let format = config.format;
    let nicht_unterstuetzt = || {
        KlangraumError::Konfiguration(format!(
            "Eingabegeraet unterstuetzt {} Hz mit {} Kanaelen nicht",
            format.sample_rate, format.kanaele
        ))
    };
    let supported = eingabe_konfiguration(&device, format)?.ok_or_else(nicht_unterstuetzt)?;

    let stream_config = StreamConfig {
        channels: format.kanaele,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = move |err| {
        error!("Aufnahme-Fehler: {}", err);
        stream_fehler.store(true, Ordering::Release);
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _| sammler.einspeisen(data, &mut ziel),
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamFehler(e.to_string()))?,
        SampleFormat::I16 => {
            let mut float_buf: Vec<f32> = Vec::new();
            device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _| {
                        float_buf.clear();
                        float_buf.extend(data.iter().map(|&s| s as f32 / i16::MAX as f32));
                        sammler.einspeisen(&float_buf, &mut ziel);
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
