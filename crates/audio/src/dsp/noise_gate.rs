//! Noise Gate mit Hysterese
//!
//! Unterdrueckt Signal unterhalb eines Schwellenwerts. Der Pegel wird pro
//! Sample-Frame ueber alle Kanaele bestimmt, damit ein Stereo-Signal nie
//! nur auf einer Seite geschlossen wird.

use super::{db_to_linear, time_to_coeff, AudioProcessor};

/// Abstand des Schliess-Schwellenwerts unter dem Oeffnungs-Schwellenwert
const HYSTERESE_DB: f32 = 5.0;

/// Konfiguration fuer den Noise Gate
#[derive(Debug, Clone)]
pub struct NoiseGateConfig {
    /// Oeffnungs-Schwellenwert in dB (z.B. -40.0)
    pub schwelle_db: f32,
    /// Attack-Zeit in Sekunden (wie schnell das Gate oeffnet)
    pub attack_secs: f32,
    /// Release-Zeit in Sekunden (wie schnell das Gate schliesst)
    pub release_secs: f32,
    pub sample_rate: u32,
    pub kanaele: u16,
}

impl Default for NoiseGateConfig {
    fn default() -> Self {
        Self {
            schwelle_db: -40.0,
            attack_secs: 0.005,
            release_secs: 0.1,
            sample_rate: 48000,
            kanaele: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GateState {
    Open,
    Closed,
}

/// Noise Gate Prozessor
pub struct NoiseGate {
    state: GateState,
    gain: f32,
    attack_coeff: f32,
    release_coeff: f32,
    schwelle_offen: f32,
    schwelle_zu: f32,
    kanaele: usize,
    enabled: bool,
}

impl NoiseGate {
    pub fn neu(config: NoiseGateConfig) -> Self {
        let rate = config.sample_rate as f32;
        Self {
            state: GateState::Closed,
            gain: 0.0,
            attack_coeff: time_to_coeff(config.attack_secs, rate),
            release_coeff: time_to_coeff(config.release_secs, rate),
            schwelle_offen: db_to_linear(config.schwelle_db),
            schwelle_zu: db_to_linear(config.schwelle_db - HYSTERESE_DB),
            kanaele: config.kanaele.max(1) as usize,
            enabled: true,
        }
    }

    /// Gate mit Standard-Zeiten fuer einen Schwellenwert
    pub fn mit_schwelle(schwelle_db: f32, sample_rate: u32, kanaele: u16) -> Self {
        Self::neu(NoiseGateConfig {
            schwelle_db,
            sample_rate,
            kanaele,
            ..NoiseGateConfig::default()
        })
    }

    /// Aktueller Gain (0.0 = geschlossen, 1.0 = offen)
    pub fn current_gain(&self) -> f32 {
        self.gain
    }

    pub fn is_open(&self) -> bool {
        self.state == GateState::Open
    }
}

impl AudioProcessor for NoiseGate {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }

        for frame in samples.chunks_mut(self.kanaele) {
            let level = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));

            match self.state {
                GateState::Closed if level >= self.schwelle_offen => {
                    self.state = GateState::Open;
                }
                GateState::Open if level < self.schwelle_zu => {
                    self.state = GateState::Closed;
                }
                _ => {}
            }

            let target = if self.state == GateState::Open {
                1.0f32
            } else {
                0.0f32
            };
            let coeff = if target > self.gain {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.gain = coeff * self.gain + (1.0 - coeff) * target;

            for s in frame.iter_mut() {
                *s *= self.gain;
            }
        }
    }

    fn reset(&mut self) {
        self.state = GateState::Closed;
        self.gain = 0.0;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stilles_signal_wird_gedaempft() {
        let mut gate = NoiseGate::mit_schwelle(-40.0, 48000, 1);
        let mut samples = vec![0.0001f32; 480];
        gate.process(&mut samples);
        let energie: f32 = samples.iter().map(|s| s * s).sum();
        assert!(energie < 0.001);
    }

    #[test]
    fn lautes_signal_passiert() {
        let mut gate = NoiseGate::neu(NoiseGateConfig {
            attack_secs: 0.0,
            ..NoiseGateConfig::default()
        });
        let mut samples = vec![0.5f32; 960];
        gate.process(&mut samples);
        assert!(samples[959] > 0.4, "last={}", samples[959]);
        assert!(gate.is_open());
    }

    #[test]
    fn hysterese_haelt_gate_knapp_unter_schwelle_offen() {
        let mut gate = NoiseGate::neu(NoiseGateConfig {
            attack_secs: 0.0,
            ..NoiseGateConfig::default()
        });
        // -6 dB oeffnet, danach ca. -42 dB liegt zwischen den Schwellen
        gate.process(&mut vec![0.5f32; 10]);
        gate.process(&mut vec![0.008f32; 10]);
        assert!(gate.is_open());
    }

    #[test]
    fn stereo_frame_schliesst_gemeinsam() {
        let mut gate = NoiseGate::neu(NoiseGateConfig {
            attack_secs: 0.0,
            kanaele: 2,
            ..NoiseGateConfig::default()
        });
        // Links laut, rechts leise: beide Kanaele erhalten denselben Gain
        let mut samples: Vec<f32> = (0..200).map(|i| if i % 2 == 0 { 0.5 } else { 0.01 }).collect();
        gate.process(&mut samples);
        assert!((samples[199] - 0.01).abs() < 0.001);
    }

    #[test]
    fn reset_schliesst_gate() {
        let mut gate = NoiseGate::mit_schwelle(-40.0, 48000, 1);
        gate.process(&mut vec![0.5f32; 960]);
        gate.reset();
        assert_eq!(gate.current_gain(), 0.0);
        assert!(!gate.is_open());
    }

    #[test]
    fn deaktiviert_passiert_alles() {
        let mut gate = NoiseGate::mit_schwelle(-40.0, 48000, 1);
        gate.set_enabled(false);
        let original = vec![0.001f32; 480];
        let mut samples = original.clone();
        gate.process(&mut samples);
        assert_eq!(original, samples);
    }
}
