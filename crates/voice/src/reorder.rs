//! Reorder-Fenster fuer den Relay-Pfad
//!
//! Ordnet eingehende Relay-Frames eines Teilnehmers nach Sequenznummer.
//! Eine Luecke wird hoechstens `fenster` lang abgewartet; danach wird der
//! naechste vorhandene Frame geliefert. Frames, deren Nachfolger bereits
//! geliefert wurde, werden verworfen statt verspaetet ausgeliefert.
//!
//! - O(log n) Einfuegen (BTreeMap nach Sequenz sortiert)
//! - Keine Locks (pro Teilnehmer, nur vom Supervisor benutzt)

use klangraum_core::frame::AudioFrame;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Zaehler des Reorder-Fensters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReorderStatistik {
    pub empfangen: u64,
    pub geliefert: u64,
    /// Zu spaet angekommen, Nachfolger war schon geliefert
    pub verspaetet: u64,
    pub duplikate: u64,
    /// Sequenznummern, die nie ankamen
    pub luecken: u64,
}

/// Sortierpuffer mit zeitlich begrenztem Warten auf Luecken
#[derive(Debug)]
pub struct ReorderPuffer {
    fenster: Duration,
    max_gepuffert: usize,
    frames: BTreeMap<u32, (Instant, AudioFrame)>,
    letzte_geliefert: Option<u32>,
    statistik: ReorderStatistik,
}

impl ReorderPuffer {
    pub fn neu(fenster: Duration, max_gepuffert: usize) -> Self {
        Self {
            fenster,
            max_gepuffert: max_gepuffert.max(1),
            frames: BTreeMap::new(),
            letzte_geliefert: None,
            statistik: ReorderStatistik::default(),
        }
    }

    /// Setzt die Lieferung nach `letzte` fort (z.B. nach einem Pfadwechsel)
    pub fn fortsetzen_nach(mut self, letzte: Option<u32>) -> Self {
        self.letzte_geliefert = letzte;
        self
    }

    /// Fuegt einen Frame ein und liefert alle jetzt auslieferbaren Frames
    pub fn einfuegen(
        &mut self,
        sequenz: u32,
        frame: AudioFrame,
        jetzt: Instant,
    ) -> Vec<(u32, AudioFrame)> {
        self.statistik.empfangen += 1;

        if let Some(letzte) = self.letzte_geliefert {
            if sequenz <= letzte {
                self.statistik.verspaetet += 1;
                tracing::debug!(
                    participant_id = %frame.participant_id,
                    sequenz,
                    letzte,
                    "Verspaeteter Relay-Frame verworfen"
                );
                return Vec::new();
            }
        }

        if self.frames.contains_key(&sequenz) {
            self.statistik.duplikate += 1;
            return Vec::new();
        }

        self.frames.insert(sequenz, (jetzt, frame));
        self.ausliefern(jetzt)
    }

    /// Liefert Frames, deren Wartezeit auf eine Luecke abgelaufen ist
    pub fn faellige(&mut self, jetzt: Instant) -> Vec<(u32, AudioFrame)> {
        self.ausliefern(jetzt)
    }

    /// Liefert alle gepufferten Frames sofort in Reihenfolge
    pub fn leeren(&mut self) -> Vec<(u32, AudioFrame)> {
        let mut geliefert = Vec::with_capacity(self.frames.len());
        while let Some((sequenz, (_, frame))) = self.frames.pop_first() {
            self.vermerken(sequenz);
            geliefert.push((sequenz, frame));
        }
        geliefert
    }

    pub fn letzte_geliefert(&self) -> Option<u32> {
        self.letzte_geliefert
    }

    pub fn fuellstand(&self) -> usize {
        self.frames.len()
    }

    pub fn statistik(&self) -> &ReorderStatistik {
        &self.statistik
    }

    fn ausliefern(&mut self, jetzt: Instant) -> Vec<(u32, AudioFrame)> {
        let mut geliefert = Vec::new();

        while let Some((&sequenz, (ankunft, _))) = self.frames.first_key_value() {
            let lueckenlos = match self.letzte_geliefert {
                None => true,
                Some(letzte) => letzte.checked_add(1) == Some(sequenz),
            };
            let abgelaufen = jetzt.duration_since(*ankunft) >= self.fenster;
            let ueberlauf = self.frames.len() > self.max_gepuffert;

            if !(lueckenlos || abgelaufen || ueberlauf) {
                break;
            }

            if let Some((_, frame)) = self.frames.remove(&sequenz) {
                if !lueckenlos {
                    if let Some(letzte) = self.letzte_geliefert {
                        let fehlend = sequenz.saturating_sub(letzte).saturating_sub(1);
                        self.statistik.luecken += fehlend as u64;
                        tracing::trace!(sequenz, fehlend, "Luecke im Relay-Strom aufgegeben");
                    }
                }
                self.vermerken(sequenz);
                geliefert.push((sequenz, frame));
            }
        }

        geliefert
    }

    fn vermerken(&mut self, sequenz: u32) {
        self.letzte_geliefert = Some(sequenz);
        self.statistik.geliefert += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
