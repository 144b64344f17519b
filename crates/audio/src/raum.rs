//! Raeumliche Platzierung von Teilnehmern
//!
//! Daempfung nach inverser Distanz mit Referenzabstand 1.0 und ein
//! balanciertes Stereo-Panorama aus dem x-Versatz. Mono-Busse erhalten nur
//! die Daempfung.

use serde::{Deserialize, Serialize};

/// Bis zu diesem Abstand bleibt die Lautstaerke unveraendert
pub const REFERENZ_ABSTAND: f32 = 1.0;

/// Punkt im virtuellen Raum, in der Konfiguration als `[x, y, z]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub const URSPRUNG: Position = Position::neu(0.0, 0.0, 0.0);

    pub const fn neu(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn abstand(&self, andere: &Position) -> f32 {
        let dx = self.x - andere.x;
        let dy = self.y - andere.y;
        let dz = self.z - andere.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl From<[f32; 3]> for Position {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self::neu(x, y, z)
    }
}

impl From<Position> for [f32; 3] {
    fn from(p: Position) -> Self {
        [p.x, p.y, p.z]
    }
}

/// Lautstaerke-Faktor einer Quelle fuer einen Hoerer
pub fn daempfung(quelle: &Position, hoerer: &Position) -> f32 {
    let d = quelle.abstand(hoerer);
    if !d.is_finite() {
        return 0.0;
    }
    REFERENZ_ABSTAND / d.max(REFERENZ_ABSTAND)
}

/// Kanal-Faktoren (links, rechts) eines balancierten Panoramas
///
/// Mitte ergibt (1.0, 1.0). Eine Quelle rechts vom Hoerer senkt nur den
/// linken Kanal ab und umgekehrt.
pub fn panorama(quelle: &Position, hoerer: &Position) -> (f32, f32) {
    let dx = quelle.x - hoerer.x;
    let d = quelle.abstand(hoerer).max(REFERENZ_ABSTAND);
    let p = (dx / d).clamp(-1.0, 1.0);
    if !p.is_finite() {
        return (1.0, 1.0);
    }
    (1.0 - p.max(0.0), 1.0 + p.min(0.0))
}

/// Wendet Daempfung und Panorama auf einen interleavten Block an
pub fn anwenden(samples: &mut [f32], kanaele: u16, quelle: &Position, hoerer: &Position) {
    let faktor = daempfung(quelle, hoerer);
    if kanaele < 2 {
        if faktor != 1.0 {
            samples.iter_mut().for_each(|s| *s *= faktor);
        }
        return;
    }

    let (links, rechts) = panorama(quelle, hoerer);
    if faktor == 1.0 && links == 1.0 && rechts == 1.0 {
        return;
    }
    for frame in samples.chunks_mut(kanaele as usize) {
        for (k, s) in frame.iter_mut().enumerate() {
            let pan = match k {
                0 => links,
                1 => rechts,
                _ => 1.0,
            };
            *s *= faktor * pan;
        }
    }
}
