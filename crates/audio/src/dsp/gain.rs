//! Fester Verstaerkungsfaktor in dB

use super::{db_to_linear, AudioProcessor};

/// Multipliziert jedes Sample mit einem festen Faktor
pub struct Gain {
    db: f32,
    faktor: f32,
    enabled: bool,
}

impl Gain {
    pub fn neu(db: f32) -> Self {
        Self {
            db,
            faktor: db_to_linear(db),
            enabled: true,
        }
    }

    pub fn db(&self) -> f32 {
        self.db
    }
}

impl AudioProcessor for Gain {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for s in samples.iter_mut() {
            *s *= self.faktor;
        }
    }

    fn reset(&mut self) {}

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
    fn minus_sechs_db_halbiert_ungefaehr() {
        let mut g = Gain::neu(-6.0);
        let mut s = vec![1.0f32; 4];
        g.process(&mut s);
        assert!((s[0] - 0.501).abs() < 0.01);
    }

    #[test]
    fn deaktiviert_laesst_signal_unveraendert() {
        let mut g = Gain::neu(12.0);
        g.set_enabled(false);
        let mut s = vec![0.25f32; 4];
        g.process(&mut s);
        assert_eq!(s, vec![0.25; 4]);
    }
}
