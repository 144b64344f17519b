//! Einpolige Tief- und Hochpassfilter
//!
//! Beide Filter fuehren ihren Zustand pro Kanal und verarbeiten interleavte
//! Samples. Die Steilheit ist 6 dB/Oktave.

use std::f32::consts::PI;

use super::AudioProcessor;

fn alpha(grenzfrequenz_hz: f32, sample_rate: f32) -> f32 {
    if grenzfrequenz_hz <= 0.0 || sample_rate <= 0.0 {
        return 0.0;
    }
    let dt = 1.0 / sample_rate;
    let rc = 1.0 / (2.0 * PI * grenzfrequenz_hz);
    dt / (rc + dt)
}

/// Daempft Anteile oberhalb der Grenzfrequenz
pub struct Tiefpass {
    alpha: f32,
    kanaele: usize,
    letzte: Vec<f32>,
    enabled: bool,
}

impl Tiefpass {
    pub fn neu(grenzfrequenz_hz: f32, sample_rate: u32, kanaele: u16) -> Self {
        let kanaele = kanaele.max(1) as usize;
        Self {
            alpha: alpha(grenzfrequenz_hz, sample_rate as f32),
            kanaele,
            letzte: vec![0.0; kanaele],
            enabled: true,
        }
    }
}

impl AudioProcessor for Tiefpass {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for (i, s) in samples.iter_mut().enumerate() {
            let k = i % self.kanaele;
            let y = self.letzte[k] + self.alpha * (*s - self.letzte[k]);
            self.letzte[k] = y;
            *s = y;
        }
    }

    fn reset(&mut self) {
        self.letzte.iter_mut().for_each(|v| *v = 0.0);
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Daempft Anteile unterhalb der Grenzfrequenz (entfernt u.a. DC)
pub struct Hochpass {
    r: f32,
    kanaele: usize,
    letzte_eingabe: Vec<f32>,
    letzte_ausgabe: Vec<f32>,
    enabled: bool,
}

impl Hochpass {
    pub fn neu(grenzfrequenz_hz: f32, sample_rate: u32, kanaele: u16) -> Self {
        let kanaele = kanaele.max(1) as usize;
        let r = if sample_rate == 0 {
            1.0
        } else {
            let dt = 1.0 / sample_rate as f32;
            let rc = 1.0 / (2.0 * PI * grenzfrequenz_hz.max(f32::EPSILON));
            rc / (rc + dt)
        };
        Self {
            r,
            kanaele,
            letzte_eingabe: vec![0.0; kanaele],
            letzte_ausgabe: vec![0.0; kanaele],
            enabled: true,
        }
    }
}

impl AudioProcessor for Hochpass {
    fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for (i, s) in samples.iter_mut().enumerate() {
            let k = i % self.kanaele;
            let y = self.r * (self.letzte_ausgabe[k] + *s - self.letzte_eingabe[k]);
            self.letzte_eingabe[k] = *s;
            self.letzte_ausgabe[k] = y;
            *s = y;
        }
    }

    fn reset(&mut self) {
        self.letzte_eingabe.iter_mut().for_each(|v| *v = 0.0);
        self.letzte_ausgabe.iter_mut().for_each(|v| *v = 0.0);
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

    fn sinus(freq: f32, rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    fn spitze(s: &[f32]) -> f32 {
        s.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }

    #[test]
    fn tiefpass_laesst_gleichanteil_durch() {
        let mut f = Tiefpass::neu(1000.0, 48000, 1);
        let mut s = vec![0.5f32; 4800];
        f.process(&mut s);
        assert!((s[4799] - 0.5).abs() < 0.01);
    }

    #[test]
    fn tiefpass_daempft_hohe_frequenzen() {
        let mut f = Tiefpass::neu(200.0, 48000, 1);
        let mut s = sinus(8000.0, 48000, 4800);
        f.process(&mut s);
        assert!(spitze(&s[2400..]) < 0.1, "spitze={}", spitze(&s[2400..]));
    }

    #[test]
    fn hochpass_entfernt_gleichanteil() {
        let mut f = Hochpass::neu(100.0, 48000, 1);
        let mut s = vec![0.5f32; 48000];
        f.process(&mut s);
        assert!(s[47999].abs() < 0.01);
    }

    #[test]
    fn hochpass_laesst_hohe_frequenzen_durch() {
        let mut f = Hochpass::neu(50.0, 48000, 1);
        let mut s = sinus(5000.0, 48000, 4800);
        f.process(&mut s);
        assert!(spitze(&s[2400..]) > 0.9);
    }

    #[test]
    fn kanaele_haben_getrennten_zustand() {
        let mut f = Tiefpass::neu(100.0, 48000, 2);
        // Links konstant 1, rechts konstant 0
        let mut s: Vec<f32> = (0..9600).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
        f.process(&mut s);
        assert!(s[9598] > 0.9);
        assert!(s[9599].abs() < f32::EPSILON);
    }

    #[test]
    fn reset_loescht_historie() {
        let mut f = Tiefpass::neu(100.0, 48000, 1);
        let mut s = vec![1.0f32; 480];
        f.process(&mut s);
        f.reset();
        let mut t = vec![0.0f32; 1];
        f.process(&mut t);
        assert_eq!(t[0], 0.0);
    }
}
