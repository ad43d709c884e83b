//! Sampling helpers for values and station locations
//!
//! Distributions are plain configuration data; sampling takes the RNG explicitly
//! so station generation can be made reproducible in tests.

use crate::station::Position;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// How a single scalar is drawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueDistribution {
    Fixed { value: f64 },
    NormalRandom { mean: f64, deviation: f64 },
    UniformRandom { min: f64, max: f64 },
}

impl ValueDistribution {
    pub fn fixed(value: f64) -> Self {
        ValueDistribution::Fixed { value }
    }

    pub fn normal(mean: f64, deviation: f64) -> Self {
        ValueDistribution::NormalRandom { mean, deviation }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            ValueDistribution::Fixed { value } => value,
            ValueDistribution::UniformRandom { min, max } => {
                if min >= max {
                    min
                } else {
                    rng.gen_range(min..=max)
                }
            }
            ValueDistribution::NormalRandom { mean, deviation } => match Normal::new(mean, deviation) {
                Ok(normal) => normal.sample(rng),
                Err(_) => mean,
            },
        }
    }

    /// Check parameters once so sampling never has to fail
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            ValueDistribution::Fixed { value } if !value.is_finite() => {
                Err(format!("fixed value must be finite, got {value}"))
            }
            ValueDistribution::NormalRandom { mean, deviation } if !mean.is_finite() || !deviation.is_finite() || deviation < 0.0 => {
                Err(format!("normal distribution needs a finite mean and deviation >= 0, got mean={mean} deviation={deviation}"))
            }
            ValueDistribution::UniformRandom { min, max } if !min.is_finite() || !max.is_finite() || min > max => {
                Err(format!("uniform distribution needs finite min <= max, got min={min} max={max}"))
            }
            _ => Ok(()),
        }
    }
}

/// How the position of a newly created station is chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocationTemplate {
    Fixed {
        latitude: f64,
        longitude: f64,
    },
    Grid {
        #[serde(default = "whole_earth")]
        area: [Position; 2],
    },
    UniformRandom {
        #[serde(default = "whole_earth")]
        area: [Position; 2],
    },
    NormalRandom {
        latitude: f64,
        longitude: f64,
        latitude_deviation: f64,
        longitude_deviation: f64,
    },
}

fn whole_earth() -> [Position; 2] {
    [Position::new(-90.0, -180.0), Position::new(90.0, 180.0)]
}

impl Default for LocationTemplate {
    fn default() -> Self {
        LocationTemplate::Fixed { latitude: 0.0, longitude: 0.0 }
    }
}

impl LocationTemplate {
    /// Sample the position of station `index` out of `max_index` generated stations.
    ///
    /// Note that random placement does not compensate for the earth's curvature.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, index: usize, max_index: usize) -> Position {
        match self {
            LocationTemplate::Fixed { latitude, longitude } => Position::new(*latitude, *longitude),
            LocationTemplate::UniformRandom { area } => {
                let uniform = |a: f64, b: f64| ValueDistribution::UniformRandom { min: a.min(b), max: a.max(b) };
                Position::new(
                    uniform(area[0].latitude, area[1].latitude).sample(rng),
                    uniform(area[0].longitude, area[1].longitude).sample(rng),
                )
            }
            LocationTemplate::NormalRandom { latitude, longitude, latitude_deviation, longitude_deviation } => {
                let lat = ValueDistribution::normal(*latitude, *latitude_deviation).sample(rng);
                let lng = ValueDistribution::normal(*longitude, *longitude_deviation).sample(rng);
                Position::new(wrap(lat, 90.0), wrap(lng, 180.0))
            }
            LocationTemplate::Grid { area } => {
                let side = ((max_index as f64).sqrt().ceil() as usize).max(1);
                let cell = index % (side * side);
                let latitudes = linspace(area[0].latitude, area[1].latitude, side);
                let longitudes = linspace(area[0].longitude, area[1].longitude, side);
                Position::new(latitudes[cell % side], longitudes[cell / side])
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let in_range = |p: &Position| p.latitude.abs() <= 90.0 && p.longitude.abs() <= 180.0;
        match self {
            LocationTemplate::Fixed { latitude, longitude } if !in_range(&Position::new(*latitude, *longitude)) => {
                Err(format!("fixed location ({latitude}, {longitude}) is outside the valid coordinate range"))
            }
            LocationTemplate::Grid { area } | LocationTemplate::UniformRandom { area } if !area.iter().all(in_range) => {
                Err("location area corners must be valid coordinates".to_string())
            }
            LocationTemplate::NormalRandom { latitude_deviation, longitude_deviation, .. }
                if *latitude_deviation < 0.0 || *longitude_deviation < 0.0 =>
            {
                Err("location deviations must be >= 0".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Fold a coordinate that overshot `limit` back onto the opposite side
fn wrap(value: f64, limit: f64) -> f64 {
    if value > limit {
        -limit + (value % limit)
    } else if value < -limit {
        limit + (value % -limit)
    } else {
        value
    }
}

fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    if count <= 1 {
        return vec![start];
    }
    let step = (end - start) / (count - 1) as f64;
    (0..count).map(|i| start + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_fixed_value_is_constant() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(ValueDistribution::fixed(3.5).sample(&mut rng), 3.5);
    }

    #[test]
    fn test_uniform_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let dist = ValueDistribution::UniformRandom { min: -2.0, max: 4.0 };
        for _ in 0..1000 {
            let v = dist.sample(&mut rng);
            assert!((-2.0..=4.0).contains(&v));
        }
    }

    #[test]
    fn test_degenerate_uniform_returns_min() {
        let mut rng = StdRng::seed_from_u64(7);
        let dist = ValueDistribution::UniformRandom { min: 1.0, max: 1.0 };
        assert_eq!(dist.sample(&mut rng), 1.0);
    }

    #[test]
    fn test_seeded_normal_is_reproducible() {
        let dist = ValueDistribution::normal(10.0, 2.0);
        let a: Vec<f64> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..5).map(|_| dist.sample(&mut rng)).collect()
        };
        let b: Vec<f64> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..5).map(|_| dist.sample(&mut rng)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_validation_rejects_bad_parameters() {
        assert!(ValueDistribution::normal(0.0, -1.0).validate().is_err());
        assert!(ValueDistribution::UniformRandom { min: 2.0, max: 1.0 }.validate().is_err());
        assert!(ValueDistribution::fixed(f64::NAN).validate().is_err());
        assert!(ValueDistribution::normal(0.0, 0.0).validate().is_ok());
    }

    #[test]
    fn test_grid_covers_area_corners() {
        let mut rng = StdRng::seed_from_u64(0);
        let grid = LocationTemplate::Grid { area: whole_earth() };
        // 9 stations -> 3x3 grid
        let first = grid.sample(&mut rng, 0, 9);
        let last = grid.sample(&mut rng, 8, 9);
        assert_eq!(first, Position::new(-90.0, -180.0));
        assert_eq!(last, Position::new(90.0, 180.0));
        let second = grid.sample(&mut rng, 1, 9);
        assert_eq!(second, Position::new(0.0, -180.0));
    }

    #[test]
    fn test_coordinate_wrap() {
        assert_eq!(wrap(100.0, 90.0), -80.0);
        assert_eq!(wrap(-100.0, 90.0), 80.0);
        assert_eq!(wrap(45.0, 90.0), 45.0);
        assert_eq!(wrap(190.0, 180.0), -170.0);
    }

    #[test]
    fn test_location_template_from_toml() {
        let template: LocationTemplate = toml::from_str(
            r#"
            type = "normal_random"
            latitude = 48.1
            longitude = 11.5
            latitude_deviation = 0.2
            longitude_deviation = 0.3
            "#,
        )
        .unwrap();
        assert!(matches!(template, LocationTemplate::NormalRandom { .. }));
    }
}
