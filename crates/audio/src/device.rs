//! Auswahl und Pruefung von Audio-Geraeten
//!
//! Geraete werden ueber einen Teil ihres Namens gefunden. Vor dem Oeffnen
//! eines Streams prueft [`ausgabe_konfiguration`], ob Rate und Kanalzahl
//! passen, damit ein Bus mit unpassendem Format schon bei der Erstellung
//! abgelehnt wird.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SupportedStreamConfigRange};
use klangraum_core::AudioFormat;
use tracing::{debug, warn};

use crate::error::{AudioError, AudioResult};

/// Kurzbeschreibung eines Ausgabegeraets
#[derive(Debug, Clone)]
pub struct GeraetInfo {
    pub name: String,
    /// Gaengige Abtastraten, die das Geraet anbietet
    pub sample_rates: Vec<u32>,
    pub max_kanaele: u16,
}

const GAENGIGE_RATEN: [u32; 5] = [16000, 24000, 32000, 44100, 48000];

/// Listet alle verfuegbaren Ausgabegeraete auf
pub fn ausgabegeraete_auflisten() -> AudioResult<Vec<GeraetInfo>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

    let mut result = Vec::new();
    for device in devices {
        match geraet_info(&device) {
            Ok(info) => result.push(info),
            Err(e) => warn!("Ausgabegeraet konnte nicht gelesen werden: {}", e),
        }
    }
    debug!(anzahl = result.len(), "Ausgabegeraete aufgelistet");
    Ok(result)
}

/// Laedt ein Ausgabegeraet; `None` waehlt das Standardgeraet
pub fn ausgabegeraet_laden(name: Option<&str>) -> AudioResult<Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or(AudioError::KeinStandardAusgabegeraet),
        Some(n) => geraet_suchen(host.output_devices(), n),
    }
}

/// Laedt ein Eingabegeraet; `None` waehlt das Standardgeraet
pub fn eingabegeraet_laden(name: Option<&str>) -> AudioResult<Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or(AudioError::KeinStandardEingabegeraet),
        Some(n) => geraet_suchen(host.input_devices(), n),
    }
}

/// Erstes Geraet, dessen Name `teil` enthaelt
fn geraet_suchen<I>(
    geraete: Result<I, cpal::DevicesError>,
    teil: &str,
) -> AudioResult<Device>
where
    I: Iterator<Item = Device>,
{
    geraete
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?
        .find(|d| d.name().map(|n| n.contains(teil)).unwrap_or(false))
        .ok_or_else(|| AudioError::GeraetNichtGefunden(teil.to_string()))
}

fn passt(cfg: &SupportedStreamConfigRange, format: AudioFormat) -> bool {
    cfg.min_sample_rate().0 <= format.sample_rate
        && cfg.max_sample_rate().0 >= format.sample_rate
        && cfg.channels() == format.kanaele
}

/// Sucht eine passende Ausgabe-Konfiguration fuer das Format
pub fn ausgabe_konfiguration(
    device: &Device,
    format: AudioFormat,
) -> AudioResult<Option<SupportedStreamConfigRange>> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;
    Ok(configs.into_iter().find(|c| passt(c, format)))
}

/// Sucht eine passende Eingabe-Konfiguration fuer das Format
pub fn eingabe_konfiguration(
    device: &Device,
    format: AudioFormat,
) -> AudioResult<Option<SupportedStreamConfigRange>> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;
    Ok(configs.into_iter().find(|c| passt(c, format)))
}

fn geraet_info(device: &Device) -> AudioResult<GeraetInfo> {
    let name = device
        .name()
        .map_err(|e| AudioError::StreamFehler(e.to_string()))?;

    let mut sample_rates = Vec::new();
    let mut max_kanaele = 1u16;

    if let Ok(configs) = device.supported_output_configs() {
        for cfg in configs {
            let min = cfg.min_sample_rate().0;
            let max = cfg.max_sample_rate().0;
            for rate in GAENGIGE_RATEN {
                if rate >= min && rate <= max && !sample_rates.contains(&rate) {
                    sample_rates.push(rate);
                }
            }
            max_kanaele = max_kanaele.max(cfg.channels());
        }
    }
    sample_rates.sort_unstable();

    Ok(GeraetInfo {
        name,
        sample_rates,
        max_kanaele,
    })
}
