//! Sensor skew overlay
//!
//! Imitates the imperfections of cheap real-world sensors on top of a base model:
//! - static bias (fixed per station) and a daily bias (resampled every simulated day)
//! - a positive bias peaking around midday
//! - additive noise and impulse noise
//! - skipped measurements, prolonged dropouts and stuck (retained) values
//!
//! `SkewTemplate` comes from the configuration, `SkewParams` is the resolved and
//! persisted per-station form, `SkewState` is runtime only.

use super::sampler::ValueDistribution;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_day_squeeze() -> f64 {
    1.0
}

fn default_impulse() -> ValueDistribution {
    ValueDistribution::normal(10.0, 5.0)
}

fn default_period() -> ValueDistribution {
    ValueDistribution::fixed(300.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkewTemplate {
    /// Simulated days per real day
    #[serde(default = "default_day_squeeze")]
    pub day_squeeze: f64,
    pub bias: Option<f64>,
    pub bias_generation: Option<ValueDistribution>,
    pub daily_bias_generation: Option<ValueDistribution>,
    pub positive_daytime_bias_impact: Option<f64>,
    pub positive_daytime_bias_impact_generation: Option<ValueDistribution>,
    /// Zero-mean noise added to every reading
    pub noise_generation: Option<ValueDistribution>,
    pub impulse_noise_chance: Option<f64>,
    #[serde(default = "default_impulse")]
    pub impulse_generation: ValueDistribution,
    pub skipped_measurement_chance: Option<f64>,
    pub dropout_chance: Option<f64>,
    /// Seconds
    #[serde(default = "default_period")]
    pub dropout_period: ValueDistribution,
    pub value_retain_chance: Option<f64>,
    /// Seconds
    #[serde(default = "default_period")]
    pub value_retain_period: ValueDistribution,
}

impl Default for SkewTemplate {
    fn default() -> Self {
        Self {
            day_squeeze: default_day_squeeze(),
            bias: None,
            bias_generation: None,
            daily_bias_generation: None,
            positive_daytime_bias_impact: None,
            positive_daytime_bias_impact_generation: None,
            noise_generation: None,
            impulse_noise_chance: None,
            impulse_generation: default_impulse(),
            skipped_measurement_chance: None,
            dropout_chance: None,
            dropout_period: default_period(),
            value_retain_chance: None,
            value_retain_period: default_period(),
        }
    }
}

impl SkewTemplate {
    /// Fix the per-station values (static bias, daytime impact) once at creation.
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> SkewParams {
        let bias = self.bias.or_else(|| self.bias_generation.as_ref().map(|g| g.sample(rng)));
        let positive_daytime_bias_impact = self
            .positive_daytime_bias_impact
            .or_else(|| self.positive_daytime_bias_impact_generation.as_ref().map(|g| g.sample(rng)));

        SkewParams {
            day_squeeze: self.day_squeeze,
            bias,
            daily_bias_generation: self.daily_bias_generation.clone(),
            positive_daytime_bias_impact,
            noise_generation: self.noise_generation.clone(),
            impulse_noise_chance: self.impulse_noise_chance,
            impulse_generation: self.impulse_generation.clone(),
            skipped_measurement_chance: self.skipped_measurement_chance,
            dropout_chance: self.dropout_chance,
            dropout_period: self.dropout_period.clone(),
            value_retain_chance: self.value_retain_chance,
            value_retain_period: self.value_retain_period.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.day_squeeze > 0.0) {
            return Err(format!("day_squeeze must be > 0, got {}", self.day_squeeze));
        }
        let chances = [
            ("impulse_noise_chance", self.impulse_noise_chance),
            ("skipped_measurement_chance", self.skipped_measurement_chance),
            ("dropout_chance", self.dropout_chance),
            ("value_retain_chance", self.value_retain_chance),
        ];
        for (name, chance) in chances {
            if let Some(c) = chance {
                if !(0.0..=1.0).contains(&c) {
                    return Err(format!("{name} must be within [0, 1], got {c}"));
                }
            }
        }
        let distributions = [
            Some(&self.impulse_generation),
            Some(&self.dropout_period),
            Some(&self.value_retain_period),
            self.bias_generation.as_ref(),
            self.daily_bias_generation.as_ref(),
            self.positive_daytime_bias_impact_generation.as_ref(),
            self.noise_generation.as_ref(),
        ];
        for dist in distributions.into_iter().flatten() {
            dist.validate()?;
        }
        Ok(())
    }
}

/// Resolved skew settings of one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkewParams {
    pub day_squeeze: f64,
    pub bias: Option<f64>,
    pub daily_bias_generation: Option<ValueDistribution>,
    pub positive_daytime_bias_impact: Option<f64>,
    pub noise_generation: Option<ValueDistribution>,
    pub impulse_noise_chance: Option<f64>,
    pub impulse_generation: ValueDistribution,
    pub skipped_measurement_chance: Option<f64>,
    pub dropout_chance: Option<f64>,
    pub dropout_period: ValueDistribution,
    pub value_retain_chance: Option<f64>,
    pub value_retain_period: ValueDistribution,
}

/// Per-run skew memory (dropouts, retained values, daily bias)
#[derive(Debug, Clone)]
pub struct SkewState {
    dropout_until: Option<DateTime<Utc>>,
    retain_until: Option<DateTime<Utc>>,
    retained_value: Option<f64>,
    daily_bias: f64,
    last_day_progress: f64,
}

impl Default for SkewState {
    fn default() -> Self {
        Self {
            dropout_until: None,
            retain_until: None,
            retained_value: None,
            daily_bias: 0.0,
            // Anything >= 1.0 forces a daily bias draw on the first reading
            last_day_progress: 1.0,
        }
    }
}

fn happens<R: Rng + ?Sized>(rng: &mut R, chance: Option<f64>) -> bool {
    match chance {
        Some(c) => rng.gen::<f64>() < c,
        None => false,
    }
}

/// `at` plus a sampled period, saturating at the latest representable instant
fn deadline(rng: &mut (impl Rng + ?Sized), at: DateTime<Utc>, dist: &ValueDistribution) -> DateTime<Utc> {
    let secs = dist.sample(rng).max(0.0);
    Duration::try_milliseconds((secs * 1000.0) as i64)
        .and_then(|period| at.checked_add_signed(period))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl SkewParams {
    /// Skew one reading taken at `at` whose day progress is `day_progress`.
    ///
    /// Returns `None` when the sensor skips this measurement or is in a dropout.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        state: &mut SkewState,
        rng: &mut R,
        at: DateTime<Utc>,
        day_progress: f64,
        value: f64,
    ) -> Option<f64> {
        if day_progress < state.last_day_progress {
            if let Some(generation) = &self.daily_bias_generation {
                state.daily_bias = generation.sample(rng);
            }
        }
        state.last_day_progress = day_progress;

        if self.dropout_chance.is_some() {
            if state.dropout_until.is_some_and(|until| at < until) {
                return None;
            }
            if happens(rng, self.dropout_chance) {
                state.dropout_until = Some(deadline(rng, at, &self.dropout_period));
                return None;
            }
        }

        if happens(rng, self.skipped_measurement_chance) {
            return None;
        }

        let mut value = value + state.daily_bias;

        if let Some(bias) = self.bias {
            value += bias;
        }

        if let Some(strength) = self.positive_daytime_bias_impact {
            let offset: f64 = rng.gen_range(-0.1..=0.1);
            let spread: f64 = rng.gen_range(2.0..=15.0);
            let factor = (-((day_progress + offset) * spread - spread / 2.0).powi(2) + 1.0).max(0.0);
            value += value * factor * strength;
        }

        if let Some(noise) = &self.noise_generation {
            value += noise.sample(rng);
        }

        if happens(rng, self.impulse_noise_chance) {
            let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            value += self.impulse_generation.sample(rng) * sign;
        }

        if self.value_retain_chance.is_some() {
            if state.retain_until.is_some_and(|until| at < until) {
                if let Some(retained) = state.retained_value {
                    return Some(retained);
                }
            } else if happens(rng, self.value_retain_chance) {
                state.retain_until = Some(deadline(rng, at, &self.value_retain_period));
                state.retained_value = Some(value);
            }
        }

        Some(value)
    }
}
