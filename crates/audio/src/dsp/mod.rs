//! DSP-Stufen fuer Zuweisungs- und Bus-Ketten
//!
//! Alle Stufen implementieren das `AudioProcessor` Trait und arbeiten
//! in-place auf interleavten Samples. Die Kanalanzahl wird beim Bau
//! festgelegt, damit Filter ihren Zustand pro Kanal fuehren koennen.

pub mod filter;
pub mod gain;
pub mod kompressor;
pub mod noise_gate;

pub use filter::{Hochpass, Tiefpass};
pub use gain::Gain;
pub use kompressor::Kompressor;
pub use noise_gate::NoiseGate;

/// Gemeinsames Trait fuer alle Audio-Prozessoren
///
/// Laeuft im Mix-Thread: `process` darf weder blockieren noch allokieren.
pub trait AudioProcessor: Send {
    /// Verarbeitet einen Puffer interleavter Samples in-place
    fn process(&mut self, samples: &mut [f32]);

    /// Setzt den internen Zustand zurueck (z.B. Filter-Historie)
    fn reset(&mut self);

    /// Gibt zurueck ob der Prozessor aktiv ist
    fn is_enabled(&self) -> bool;

    /// Aktiviert oder deaktiviert den Prozessor
    fn set_enabled(&mut self, enabled: bool);
}

pub(crate) fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

pub(crate) fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.max(1e-9).log10()
}

/// Glaettungskoeffizient fuer eine Zeitkonstante
pub(crate) fn time_to_coeff(time_secs: f32, sample_rate: f32) -> f32 {
    if time_secs <= 0.0 || sample_rate <= 0.0 {
        return 0.0;
    }
    (-1.0 / (time_secs * sample_rate)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_to_linear_korrekt() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 0.001);
        assert!((db_to_linear(-20.0) - 0.1).abs() < 0.001);
        assert!((db_to_linear(-40.0) - 0.01).abs() < 0.001);
    }

    #[test]
    fn linear_to_db_umkehrung() {
        assert!((linear_to_db(0.1) + 20.0).abs() < 0.01);
        assert!(linear_to_db(0.0) < -150.0);
    }

    #[test]
    fn zeitkonstante_null_ist_sofort() {
        assert_eq!(time_to_coeff(0.0, 48000.0), 0.0);
        assert!(time_to_coeff(0.01, 48000.0) > 0.99);
    }
}
