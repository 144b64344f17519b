//! Feed-forward Kompressor
//!
//! Pegel oberhalb des Schwellenwerts werden um `ratio` reduziert. Eine
//! Huellkurve mit Attack/Release glaettet die Gain-Reduktion.

use super::{db_to_linear, linear_to_db, time_to_coeff, AudioProcessor};

const ATTACK_SECS: f32 = 0.005;
const RELEASE_SECS: f32 = 0.05;

pub struct Kompressor {
    schwelle_db: f32,
    ratio: f32,
    attack_coeff: f32,
    release_coeff: f32,
    huellkurve: f32,
    kanaele: usize,
    enabled: bool,
}

impl Kompressor {
    /// `ratio` unter 1.0 wird auf 1.0 (keine Kompression) angehoben
    pub fn neu(schwelle_db: f32, ratio: f32, sample_rate: u32, kanaele: u16) -> Self {
        let rate = sample_rate as f32;
        Self {
            schwelle_db,
            ratio: ratio.max(1.0),
            attack_coeff: time_to_coeff(ATTACK_SECS, rate),
            release_coeff: time_to_coeff(RELEASE_SECS, rate),
            huellkurve: 0.0,
            kanaele: kanaele.max(1) as usize,
            enabled: true,
        }
    }

    /// Statische Kennlinie: Gain-Faktor fuer einen Eingangspegel
    fn gain_fuer(&self, pegel: f32) -> f32 {
        let pegel_db = linear_to_db(pegel);
        if pegel_db <= self.schwelle_db {
            return 1.0;
        }
        let ziel_db = self.schwelle_db + (pegel_db - self.schwelle_db) / self.ratio;
        db_to_linear(ziel_db - pegel_db)
    }
}

impl AudioProcessor for Kompressor {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for frame in samples.chunks_mut(self.kanaele) {
            let level = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            let coeff = if level > self.huellkurve {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.huellkurve = coeff * self.huellkurve + (1.0 - coeff) * level;

            let g = self.gain_fuer(self.huellkurve);
            for s in frame.iter_mut() {
                *s *= g;
            }
        }
    }

    fn reset(&mut self) {
        self.huellkurve = 0.0;
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
    fn leises_signal_bleibt_unveraendert() {
        let mut k = Kompressor::neu(-12.0, 4.0, 48000, 1);
        let mut s = vec![0.1f32; 4800];
        k.process(&mut s);
        assert!((s[4799] - 0.1).abs() < 1e-4);
    }

    #[test]
    fn lautes_signal_wird_reduziert() {
        let mut k = Kompressor::neu(-20.0, 4.0, 48000, 1);
        // 0 dB Eingang, -20 dB Schwelle, Ratio 4 => Ziel -15 dB ~ 0.178
        let mut s = vec![1.0f32; 48000];
        k.process(&mut s);
        assert!((s[47999] - 0.178).abs() < 0.01, "wert={}", s[47999]);
    }

    #[test]
    fn ratio_unter_eins_komprimiert_nicht() {
        let mut k = Kompressor::neu(-20.0, 0.5, 48000, 1);
        let mut s = vec![1.0f32; 4800];
        k.process(&mut s);
        assert!((s[4799] - 1.0).abs() < 1e-3);
    }
}
