//! Generator kinds and their deterministic base models
//!
//! The configuration names a kind through `client_class` (`GeneratorTemplate`). When a
//! station is created the template is resolved into a `GeneratorKind`: every randomly
//! drawn parameter (peak time, temperature range, biases) is fixed and persisted with
//! the station, so `base_value` is a pure function of the kind, time and position.

use super::sampler::ValueDistribution;
use super::skew::{SkewParams, SkewTemplate};
use crate::station::Position;
use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// A deterministic signal shape
pub trait BaseModel {
    fn base_value(&self, at: DateTime<Utc>, position: &Position) -> f64;
}

/// Fraction of the (possibly squeezed) simulated day elapsed at `at`, in `[0, 1)`
pub fn day_progress(at: DateTime<Utc>, day_squeeze: f64) -> f64 {
    let seconds = at.num_seconds_from_midnight() as f64 + at.nanosecond() as f64 / 1e9;
    let day_length = SECONDS_PER_DAY / day_squeeze;
    (seconds % day_length) / day_length
}

// ===== Blank =====

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlankTemplate {
    #[serde(default)]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlankParams {
    pub value: f64,
}

impl BaseModel for BlankParams {
    fn base_value(&self, _at: DateTime<Utc>, _position: &Position) -> f64 {
        self.value
    }
}

// ===== Coordinate gradient =====

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

fn default_deviation() -> f64 {
    0.1
}

fn default_decimal_accuracy() -> u32 {
    2
}

/// Reading proportional to latitude (or longitude)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientParams {
    #[serde(default = "default_true")]
    pub use_latitude: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Standard deviation of the per-reading jitter
    #[serde(default = "default_deviation")]
    pub deviation: f64,
    #[serde(default = "default_decimal_accuracy")]
    pub decimal_accuracy: u32,
}

impl Default for GradientParams {
    fn default() -> Self {
        Self {
            use_latitude: true,
            scale: default_scale(),
            offset: 0.0,
            deviation: default_deviation(),
            decimal_accuracy: default_decimal_accuracy(),
        }
    }
}

impl GradientParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.deviation >= 0.0) {
            return Err(format!("gradient deviation must be >= 0, got {}", self.deviation));
        }
        if self.decimal_accuracy > 15 {
            return Err(format!("decimal_accuracy must be <= 15, got {}", self.decimal_accuracy));
        }
        Ok(())
    }

    /// Jitter and round a base reading
    pub fn finish<R: Rng + ?Sized>(&self, rng: &mut R, value: f64) -> f64 {
        let jittered = ValueDistribution::normal(value, self.deviation).sample(rng);
        let factor = 10f64.powi(self.decimal_accuracy as i32);
        (jittered * factor).round() / factor
    }
}

impl BaseModel for GradientParams {
    fn base_value(&self, _at: DateTime<Utc>, position: &Position) -> f64 {
        let coordinate = if self.use_latitude { position.latitude } else { position.longitude };
        self.offset + self.scale * coordinate
    }
}

// ===== Diurnal approximation =====

fn default_peak_time() -> ValueDistribution {
    ValueDistribution::fixed(0.6)
}

fn default_min_temperature() -> ValueDistribution {
    ValueDistribution::normal(10.0, 3.0)
}

fn default_max_temperature() -> ValueDistribution {
    ValueDistribution::normal(25.0, 3.0)
}

fn default_equator_bias() -> f64 {
    10.0
}

fn default_day_squeeze() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiurnalTemplate {
    /// Fraction of the day at which the temperature peaks
    pub peak_time: Option<f64>,
    #[serde(default = "default_peak_time")]
    pub peak_time_generation: ValueDistribution,
    pub min_temperature: Option<f64>,
    #[serde(default = "default_min_temperature")]
    pub min_temperature_generation: ValueDistribution,
    pub max_temperature: Option<f64>,
    #[serde(default = "default_max_temperature")]
    pub max_temperature_generation: ValueDistribution,
    #[serde(default = "default_equator_bias")]
    pub equator_temperature_bias: f64,
    #[serde(default = "default_day_squeeze")]
    pub day_squeeze: f64,
}

impl Default for DiurnalTemplate {
    fn default() -> Self {
        Self {
            peak_time: None,
            peak_time_generation: default_peak_time(),
            min_temperature: None,
            min_temperature_generation: default_min_temperature(),
            max_temperature: None,
            max_temperature_generation: default_max_temperature(),
            equator_temperature_bias: default_equator_bias(),
            day_squeeze: default_day_squeeze(),
        }
    }
}

impl DiurnalTemplate {
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> DiurnalParams {
        let peak_time = self.peak_time.unwrap_or_else(|| self.peak_time_generation.sample(rng));
        let min = self.min_temperature.unwrap_or_else(|| self.min_temperature_generation.sample(rng));
        let max = self.max_temperature.unwrap_or_else(|| self.max_temperature_generation.sample(rng));
        DiurnalParams {
            peak_time: peak_time.rem_euclid(1.0),
            min_temperature: min.min(max),
            max_temperature: min.max(max),
            equator_temperature_bias: self.equator_temperature_bias,
            day_squeeze: self.day_squeeze,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.day_squeeze > 0.0) {
            return Err(format!("day_squeeze must be > 0, got {}", self.day_squeeze));
        }
        self.peak_time_generation.validate()?;
        self.min_temperature_generation.validate()?;
        self.max_temperature_generation.validate()
    }
}

/// Smooth daily temperature cycle, warmer towards the equator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiurnalParams {
    pub peak_time: f64,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub equator_temperature_bias: f64,
    pub day_squeeze: f64,
}

impl BaseModel for DiurnalParams {
    fn base_value(&self, at: DateTime<Utc>, position: &Position) -> f64 {
        let progress = day_progress(at, self.day_squeeze);
        let wave = ((progress * 2.0 * PI - PI * (self.peak_time * 2.0 - 0.5)).sin() + 1.0) / 2.0;
        let equator_distance = position.latitude.abs() / 90.0;
        wave * (self.max_temperature - self.min_temperature)
            + self.min_temperature
            + (1.0 - equator_distance) * self.equator_temperature_bias
    }
}

// ===== Kinds =====

/// A base template plus the skew overlay, sharing one configuration table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skewed<T> {
    #[serde(flatten)]
    pub base: T,
    #[serde(flatten)]
    pub skew: SkewTemplate,
}

/// Generator selection as written in the configuration (`client_class`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "client_class", rename_all = "snake_case")]
pub enum GeneratorTemplate {
    Blank(BlankTemplate),
    CoordinateGradient(GradientParams),
    SkewedCoordinateGradient(Skewed<GradientParams>),
    DiurnalApproximation(DiurnalTemplate),
    SkewedDiurnalApproximation(Skewed<DiurnalTemplate>),
}

impl GeneratorTemplate {
    pub fn class_name(&self) -> &'static str {
        match self {
            GeneratorTemplate::Blank(_) => "blank",
            GeneratorTemplate::CoordinateGradient(_) => "coordinate_gradient",
            GeneratorTemplate::SkewedCoordinateGradient(_) => "skewed_coordinate_gradient",
            GeneratorTemplate::DiurnalApproximation(_) => "diurnal_approximation",
            GeneratorTemplate::SkewedDiurnalApproximation(_) => "skewed_diurnal_approximation",
        }
    }

    /// Draw the per-station parameters
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> GeneratorKind {
        match self {
            GeneratorTemplate::Blank(t) => GeneratorKind::Blank(BlankParams { value: t.value }),
            GeneratorTemplate::CoordinateGradient(p) => GeneratorKind::CoordinateGradient(p.clone()),
            GeneratorTemplate::SkewedCoordinateGradient(t) => GeneratorKind::SkewedCoordinateGradient {
                gradient: t.base.clone(),
                skew: t.skew.resolve(rng),
            },
            GeneratorTemplate::DiurnalApproximation(t) => GeneratorKind::DiurnalApproximation(t.resolve(rng)),
            GeneratorTemplate::SkewedDiurnalApproximation(t) => {
                let diurnal = t.base.resolve(rng);
                // The shared `day_squeeze` key lands in the diurnal half of the table
                let skew = SkewParams { day_squeeze: diurnal.day_squeeze, ..t.skew.resolve(rng) };
                GeneratorKind::SkewedDiurnalApproximation { diurnal, skew }
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            GeneratorTemplate::Blank(t) if !t.value.is_finite() => Err("blank value must be finite".to_string()),
            GeneratorTemplate::Blank(_) => Ok(()),
            GeneratorTemplate::CoordinateGradient(p) => p.validate(),
            GeneratorTemplate::SkewedCoordinateGradient(t) => {
                t.base.validate()?;
                t.skew.validate()
            }
            GeneratorTemplate::DiurnalApproximation(t) => t.validate(),
            GeneratorTemplate::SkewedDiurnalApproximation(t) => {
                t.base.validate()?;
                t.skew.validate()
            }
        }
    }
}

/// Resolved generator of one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorKind {
    Blank(BlankParams),
    CoordinateGradient(GradientParams),
    SkewedCoordinateGradient { gradient: GradientParams, skew: SkewParams },
    DiurnalApproximation(DiurnalParams),
    SkewedDiurnalApproximation { diurnal: DiurnalParams, skew: SkewParams },
}

impl GeneratorKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            GeneratorKind::Blank(_) => "blank",
            GeneratorKind::CoordinateGradient(_) => "coordinate_gradient",
            GeneratorKind::SkewedCoordinateGradient { .. } => "skewed_coordinate_gradient",
            GeneratorKind::DiurnalApproximation(_) => "diurnal_approximation",
            GeneratorKind::SkewedDiurnalApproximation { .. } => "skewed_diurnal_approximation",
        }
    }

    fn model(&self) -> &dyn BaseModel {
        match self {
            GeneratorKind::Blank(p) => p,
            GeneratorKind::CoordinateGradient(p) => p,
            GeneratorKind::SkewedCoordinateGradient { gradient, .. } => gradient,
            GeneratorKind::DiurnalApproximation(p) => p,
            GeneratorKind::SkewedDiurnalApproximation { diurnal, .. } => diurnal,
        }
    }

    pub fn skew(&self) -> Option<&SkewParams> {
        match self {
            GeneratorKind::SkewedCoordinateGradient { skew, .. } | GeneratorKind::SkewedDiurnalApproximation { skew, .. } => {
                Some(skew)
            }
            _ => None,
        }
    }

    pub fn gradient(&self) -> Option<&GradientParams> {
        match self {
            GeneratorKind::CoordinateGradient(gradient) | GeneratorKind::SkewedCoordinateGradient { gradient, .. } => {
                Some(gradient)
            }
            _ => None,
        }
    }
}

impl BaseModel for GeneratorKind {
    fn base_value(&self, at: DateTime<Utc>, position: &Position) -> f64 {
        self.model().base_value(at, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, hour, minute, 0).unwrap()
    }

    fn fixed_diurnal() -> DiurnalParams {
        DiurnalParams {
            peak_time: 0.5,
            min_temperature: 10.0,
            max_temperature: 20.0,
            equator_temperature_bias: 0.0,
            day_squeeze: 1.0,
        }
    }

    #[test]
    fn test_day_progress() {
        assert_eq!(day_progress(at(0, 0), 1.0), 0.0);
        assert_eq!(day_progress(at(12, 0), 1.0), 0.5);
        // Two simulated days per real day: noon is the start of the second day
        assert_eq!(day_progress(at(12, 0), 2.0), 0.0);
        assert_eq!(day_progress(at(6, 0), 2.0), 0.5);
    }

    #[test]
    fn test_diurnal_peaks_at_peak_time() {
        let params = fixed_diurnal();
        let position = Position::new(0.0, 0.0);
        let peak = params.base_value(at(12, 0), &position);
        let trough = params.base_value(at(0, 0), &position);
        assert!((peak - 20.0).abs() < 1e-9);
        assert!((trough - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_diurnal_equator_bias() {
        let params = DiurnalParams { equator_temperature_bias: 8.0, ..fixed_diurnal() };
        let equator = params.base_value(at(12, 0), &Position::new(0.0, 0.0));
        let pole = params.base_value(at(12, 0), &Position::new(90.0, 0.0));
        assert!((equator - pole - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_gradient_follows_coordinate() {
        let lat = GradientParams::default();
        let lng = GradientParams { use_latitude: false, scale: 2.0, offset: 1.0, ..GradientParams::default() };
        let position = Position::new(45.0, -30.0);
        assert_eq!(lat.base_value(at(1, 0), &position), 45.0);
        assert_eq!(lng.base_value(at(1, 0), &position), -59.0);
    }

    #[test]
    fn test_gradient_finish_rounds() {
        let params = GradientParams { deviation: 0.0, decimal_accuracy: 1, ..GradientParams::default() };
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(params.finish(&mut rng, 12.345), 12.3);
    }

    #[test]
    fn test_base_value_is_pure() {
        let mut rng = StdRng::seed_from_u64(11);
        let skew = SkewTemplate {
            bias: Some(3.0),
            daily_bias_generation: Some(ValueDistribution::normal(0.0, 2.0)),
            positive_daytime_bias_impact: Some(0.4),
            noise_generation: Some(ValueDistribution::normal(0.0, 1.0)),
            impulse_noise_chance: Some(0.5),
            ..SkewTemplate::default()
        }
        .resolve(&mut rng);

        let kinds = [
            GeneratorKind::Blank(BlankParams { value: 4.0 }),
            GeneratorKind::CoordinateGradient(GradientParams::default()),
            GeneratorKind::SkewedCoordinateGradient {
                gradient: GradientParams::default(),
                skew: skew.clone(),
            },
            GeneratorKind::DiurnalApproximation(fixed_diurnal()),
            GeneratorKind::SkewedDiurnalApproximation {
                diurnal: fixed_diurnal(),
                skew,
            },
        ];
        let position = Position::new(12.5, 99.0);
        for kind in &kinds {
            let a = kind.base_value(at(9, 41), &position);
            let b = kind.base_value(at(9, 41), &position);
            assert_eq!(a, b, "{} should be deterministic", kind.class_name());
        }

        // the skew overlay never reaches the base value
        assert_eq!(kinds[2].base_value(at(9, 41), &position), kinds[1].base_value(at(9, 41), &position));
        assert_eq!(kinds[4].base_value(at(9, 41), &position), kinds[3].base_value(at(9, 41), &position));
    }

    #[test]
    fn test_diurnal_resolution_orders_range() {
        let template = DiurnalTemplate {
            min_temperature: Some(30.0),
            max_temperature: Some(5.0),
            peak_time: Some(0.25),
            ..DiurnalTemplate::default()
        };
        let mut rng = StdRng::seed_from_u64(9);
        let params = template.resolve(&mut rng);
        assert_eq!(params.min_temperature, 5.0);
        assert_eq!(params.max_temperature, 30.0);
        assert_eq!(params.peak_time, 0.25);
    }

    #[test]
    fn test_template_parses_skewed_kind() {
        let template: GeneratorTemplate = toml::from_str(
            r#"
            client_class = "skewed_diurnal_approximation"
            peak_time = 0.55
            min_temperature = 4
            max_temperature = 18.5
            bias = 0.5
            skipped_measurement_chance = 0.1
            "#,
        )
        .unwrap();
        match &template {
            GeneratorTemplate::SkewedDiurnalApproximation(t) => {
                assert_eq!(t.base.peak_time, Some(0.55));
                assert_eq!(t.base.min_temperature, Some(4.0));
                assert_eq!(t.skew.bias, Some(0.5));
                assert_eq!(t.skew.skipped_measurement_chance, Some(0.1));
            }
            other => panic!("unexpected template {other:?}"),
        }
    }

    #[test]
    fn test_unknown_client_class_is_rejected() {
        let parsed = toml::from_str::<GeneratorTemplate>(r#"client_class = "random_walk""#);
        assert!(parsed.is_err());
    }
}
