//! # Network Model
//!
//! Per-message delay and loss. In `Fixed` mode every message takes the
//! configured base delay; in `Randomized` mode the delay is re-sampled
//! per message from a distribution. Individual links can override both
//! delay and drop rate, and the base delay can be changed while a
//! simulation is running.

use std::collections::HashMap;

use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Exp;
use serde::{Deserialize, Serialize};

use crate::{sim_time_from_secs, ConfigError, NodeId, SimConfig, SimTime};

/// Whether message delay is constant or sampled per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Fixed,
    Randomized,
}

/// Delay distribution for randomized mode, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DelayDistribution {
    Uniform { min: f64, max: f64 },
    Exponential { mean: f64 },
}

impl DelayDistribution {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            DelayDistribution::Uniform { min, max } => {
                if !min.is_finite() || !max.is_finite() || min < 0.0 || min >= max {
                    return Err(ConfigError::InvalidDistribution(format!(
                        "uniform bounds must satisfy 0 <= min < max, got [{min}, {max}]"
                    )));
                }
            }
            DelayDistribution::Exponential { mean } => {
                if !mean.is_finite() || mean <= 0.0 {
                    return Err(ConfigError::InvalidDistribution(format!(
                        "exponential mean must be positive, got {mean}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Pre-built sampler, so per-message sampling cannot fail.
#[derive(Debug, Clone, Copy)]
enum DelaySampler {
    Fixed(SimTime),
    Uniform(Uniform<f64>),
    Exponential(Exp<f64>),
}

/// Per-link overrides for asymmetric topologies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Fixed delay in seconds for this link, overriding the sampler.
    pub delay: Option<f64>,
    /// Drop rate for this link, overriding the global rate.
    pub drop_rate: Option<f64>,
}

#[derive(Debug)]
pub struct NetworkModel {
    mode: NetworkMode,
    base_delay: f64,
    sampler: DelaySampler,
    drop_rate: f64,
    links: HashMap<(NodeId, NodeId), LinkConfig>,
}

impl NetworkModel {
    pub fn from_config(config: &SimConfig) -> Result<Self, ConfigError> {
        let sampler = match config.network_mode {
            NetworkMode::Fixed => DelaySampler::Fixed(sim_time_from_secs(config.delay)),
            NetworkMode::Randomized => match config.delay_distribution {
                Some(dist) => {
                    dist.validate()?;
                    Self::build_sampler(&dist)?
                }
                // the default jitter window collapses at zero delay
                None if config.delay == 0.0 => DelaySampler::Fixed(0),
                None => Self::build_sampler(&DelayDistribution::Uniform {
                    min: config.delay * 0.5,
                    max: config.delay * 1.5,
                })?,
            },
        };
        Ok(Self {
            mode: config.network_mode,
            base_delay: config.delay,
            sampler,
            drop_rate: config.drop_rate,
            links: HashMap::new(),
        })
    }

    fn build_sampler(dist: &DelayDistribution) -> Result<DelaySampler, ConfigError> {
        match *dist {
            DelayDistribution::Uniform { min, max } => {
                Ok(DelaySampler::Uniform(Uniform::new(min, max)))
            }
            DelayDistribution::Exponential { mean } => Exp::new(1.0 / mean)
                .map(DelaySampler::Exponential)
                .map_err(|e| ConfigError::InvalidDistribution(e.to_string())),
        }
    }

    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    pub fn base_delay_secs(&self) -> f64 {
        self.base_delay
    }

    /// Change the base delay while running. In randomized mode with
    /// the default distribution, the sampling window shifts with it.
    pub fn set_base_delay(&mut self, secs: f64) -> Result<(), ConfigError> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(ConfigError::InvalidDelay(secs));
        }
        self.base_delay = secs;
        match self.mode {
            NetworkMode::Fixed => {
                self.sampler = DelaySampler::Fixed(sim_time_from_secs(secs));
            }
            NetworkMode::Randomized => {
                if secs > 0.0 {
                    let dist = DelayDistribution::Uniform {
                        min: secs * 0.5,
                        max: secs * 1.5,
                    };
                    self.sampler = Self::build_sampler(&dist)?;
                } else {
                    self.sampler = DelaySampler::Fixed(0);
                }
            }
        }
        Ok(())
    }

    pub fn set_link(&mut self, from: NodeId, to: NodeId, link: LinkConfig) {
        self.links.insert((from, to), link);
    }

    /// One-way delay for a message on `from -> to`.
    pub fn sample_delay(&self, from: NodeId, to: NodeId, rng: &mut ChaCha8Rng) -> SimTime {
        if let Some(link) = self.links.get(&(from, to)) {
            if let Some(delay) = link.delay {
                return sim_time_from_secs(delay);
            }
        }
        match self.sampler {
            DelaySampler::Fixed(delay) => delay,
            DelaySampler::Uniform(dist) => sim_time_from_secs(dist.sample(rng)),
            DelaySampler::Exponential(dist) => sim_time_from_secs(dist.sample(rng)),
        }
    }

    /// Whether the message on `from -> to` is lost in transit.
    pub fn should_drop(&self, from: NodeId, to: NodeId, rng: &mut ChaCha8Rng) -> bool {
        let rate = self
            .links
            .get(&(from, to))
            .and_then(|l| l.drop_rate)
            .unwrap_or(self.drop_rate);
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        rng.gen_bool(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProtocolKind, SimConfig};
    use rand::SeedableRng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(1)
    }

    #[test]
    fn fixed_mode_always_returns_base_delay() {
        let config = SimConfig::new(ProtocolKind::Pbft).with_delay(0.2);
        let net = NetworkModel::from_config(&config).unwrap();
        let mut rng = rng();
        for _ in 0..10 {
            assert_eq!(net.sample_delay(0, 1, &mut rng), 200_000);
        }
    }

    #[test]
    fn randomized_mode_stays_within_default_window() {
        let config = SimConfig::new(ProtocolKind::Pbft)
            .with_delay(0.1)
            .with_network_mode(NetworkMode::Randomized);
        let net = NetworkModel::from_config(&config).unwrap();
        let mut rng = rng();
        for _ in 0..200 {
            let delay = net.sample_delay(0, 1, &mut rng);
            assert!((50_000..150_000).contains(&delay), "delay {delay} out of window");
        }
    }

    #[test]
    fn exponential_distribution_is_non_negative() {
        let config = SimConfig::new(ProtocolKind::Pbft)
            .with_network_mode(NetworkMode::Randomized)
            .with_delay_distribution(DelayDistribution::Exponential { mean: 0.05 });
        let net = NetworkModel::from_config(&config).unwrap();
        let mut rng = rng();
        for _ in 0..200 {
            let _delay = net.sample_delay(0, 1, &mut rng);
        }
    }

    #[test]
    fn randomized_mode_accepts_zero_delay() {
        let config = SimConfig::new(ProtocolKind::Pbft)
            .with_delay(0.0)
            .with_network_mode(NetworkMode::Randomized);
        assert!(config.validate().is_ok());
        let net = NetworkModel::from_config(&config).unwrap();
        let mut rng = rng();
        assert_eq!(net.sample_delay(0, 1, &mut rng), 0);
    }

    #[test]
    fn drop_rate_extremes() {
        let mut rng = rng();
        let never = NetworkModel::from_config(&SimConfig::default()).unwrap();
        assert!(!never.should_drop(0, 1, &mut rng));

        let always =
            NetworkModel::from_config(&SimConfig::default().with_drop_rate(1.0)).unwrap();
        assert!(always.should_drop(0, 1, &mut rng));
    }

    #[test]
    fn link_override_takes_precedence() {
        let config = SimConfig::new(ProtocolKind::Pbft).with_delay(0.1);
        let mut net = NetworkModel::from_config(&config).unwrap();
        net.set_link(
            0,
            1,
            LinkConfig {
                delay: Some(0.5),
                drop_rate: Some(1.0),
            },
        );
        let mut rng = rng();
        assert_eq!(net.sample_delay(0, 1, &mut rng), 500_000);
        assert_eq!(net.sample_delay(1, 0, &mut rng), 100_000);
        assert!(net.should_drop(0, 1, &mut rng));
        assert!(!net.should_drop(1, 0, &mut rng));
    }

    #[test]
    fn live_delay_update_applies() {
        let config = SimConfig::new(ProtocolKind::Pbft).with_delay(0.1);
        let mut net = NetworkModel::from_config(&config).unwrap();
        net.set_base_delay(0.3).unwrap();
        let mut rng = rng();
        assert_eq!(net.sample_delay(0, 1, &mut rng), 300_000);
        assert!(net.set_base_delay(f64::NAN).is_err());
    }

    #[test]
    fn invalid_uniform_bounds_rejected() {
        let dist = DelayDistribution::Uniform { min: 0.2, max: 0.1 };
        assert!(dist.validate().is_err());
    }
}
