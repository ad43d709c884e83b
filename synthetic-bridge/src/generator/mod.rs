//! Synthetic value generation
//!
//! A reading is produced in stages:
//! 1. the deterministic base model of the station's generator kind
//! 2. kind-specific jitter and rounding (coordinate gradients)
//! 3. the skew overlay for `skewed_*` kinds (may suppress the reading)
//! 4. the optional station-wide noise distribution

pub mod models;
pub mod sampler;
pub mod skew;

use crate::station::{ClientConfig, Position};
use chrono::{DateTime, Utc};
use models::{day_progress, BaseModel, GeneratorKind};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sampler::ValueDistribution;
use skew::SkewState;

pub struct ValueGenerator {
    kind: GeneratorKind,
    noise: Option<ValueDistribution>,
    rng: StdRng,
    skew_state: SkewState,
}

impl ValueGenerator {
    pub fn new(kind: GeneratorKind, noise: Option<ValueDistribution>) -> Self {
        Self::with_rng(kind, noise, StdRng::from_entropy())
    }

    /// Reproducible generator for tests and replays
    pub fn seeded(kind: GeneratorKind, noise: Option<ValueDistribution>, seed: u64) -> Self {
        Self::with_rng(kind, noise, StdRng::seed_from_u64(seed))
    }

    pub fn for_station(config: &ClientConfig) -> Self {
        Self::new(config.generator.clone(), config.noise.clone())
    }

    fn with_rng(kind: GeneratorKind, noise: Option<ValueDistribution>, rng: StdRng) -> Self {
        Self {
            kind,
            noise,
            rng,
            skew_state: SkewState::default(),
        }
    }

    /// Deterministic component only
    pub fn base_value(&self, at: DateTime<Utc>, position: &Position) -> f64 {
        self.kind.base_value(at, position)
    }

    /// Full reading for `at`, or `None` when the simulated sensor has nothing to report.
    pub fn next_reading(&mut self, at: DateTime<Utc>, position: &Position) -> Option<f64> {
        let mut value = self.kind.base_value(at, position);

        if let Some(gradient) = self.kind.gradient() {
            value = gradient.finish(&mut self.rng, value);
        }

        if let Some(skew) = self.kind.skew() {
            let progress = day_progress(at, skew.day_squeeze);
            value = skew.apply(&mut self.skew_state, &mut self.rng, at, progress, value)?;
        }

        if let Some(noise) = &self.noise {
            value += noise.sample(&mut self.rng);
        }

        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use models::{BlankParams, DiurnalParams, GradientParams};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 15, 30, 0).unwrap()
    }

    #[test]
    fn test_blank_without_noise_is_constant() {
        let mut generator = ValueGenerator::new(GeneratorKind::Blank(BlankParams { value: 0.0 }), None);
        let position = Position::new(1.0, 2.0);
        for _ in 0..5 {
            assert_eq!(generator.next_reading(at(), &position), Some(0.0));
        }
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let kind = GeneratorKind::Blank(BlankParams { value: 1.0 });
        let noise = Some(ValueDistribution::normal(0.0, 1.0));
        let position = Position::new(0.0, 0.0);
        let mut a = ValueGenerator::seeded(kind.clone(), noise.clone(), 11);
        let mut b = ValueGenerator::seeded(kind, noise, 11);
        for _ in 0..10 {
            assert_eq!(a.next_reading(at(), &position), b.next_reading(at(), &position));
        }
    }

    #[test]
    fn test_noise_does_not_touch_base_value() {
        let kind = GeneratorKind::DiurnalApproximation(DiurnalParams {
            peak_time: 0.6,
            min_temperature: 8.0,
            max_temperature: 22.0,
            equator_temperature_bias: 5.0,
            day_squeeze: 1.0,
        });
        let position = Position::new(48.0, 11.0);
        let mut generator = ValueGenerator::new(kind.clone(), Some(ValueDistribution::normal(0.0, 3.0)));
        let before = generator.base_value(at(), &position);
        let _ = generator.next_reading(at(), &position);
        assert_eq!(before, generator.base_value(at(), &position));
        assert_eq!(before, kind.base_value(at(), &position));
    }

    #[test]
    fn test_gradient_reading_is_rounded() {
        let kind = GeneratorKind::CoordinateGradient(GradientParams { decimal_accuracy: 0, ..GradientParams::default() });
        let mut generator = ValueGenerator::seeded(kind, None, 3);
        let value = generator.next_reading(at(), &Position::new(33.3, 0.0)).unwrap();
        assert_eq!(value, value.round());
    }
}
