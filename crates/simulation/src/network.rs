//! Simulated network conditions.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Network shape and conditions for a simulation.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub num_validators: u32,
    /// Base one-way message latency.
    pub latency: Duration,
    /// Uniform jitter as a fraction of `latency` (0.1 = ±10%).
    pub jitter_fraction: f64,
    /// Probability a message is silently lost.
    pub loss_probability: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_validators: 4,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            loss_probability: 0.0,
        }
    }
}

/// Connectivity and delivery model between simulated nodes.
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Symmetric connected pairs, stored with the lower index first.
    connected: HashSet<(u32, u32)>,
    /// Symmetric partitioned pairs; connected but undeliverable.
    partitioned: HashSet<(u32, u32)>,
    /// Crashed nodes: nothing in, nothing out.
    offline: HashSet<u32>,
    /// Messages dropped by loss or partition, for assertions.
    dropped: u64,
}

fn pair(a: u32, b: u32) -> (u32, u32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            connected: HashSet::new(),
            partitioned: HashSet::new(),
            offline: HashSet::new(),
            dropped: 0,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn connect(&mut self, a: u32, b: u32) {
        if a != b {
            self.connected.insert(pair(a, b));
        }
    }

    pub fn disconnect(&mut self, a: u32, b: u32) {
        self.connected.remove(&pair(a, b));
    }

    pub fn is_connected(&self, a: u32, b: u32) -> bool {
        self.connected.contains(&pair(a, b))
    }

    /// Peers `from` currently has a live connection to, ascending.
    pub fn peers_of(&self, from: u32) -> Vec<u32> {
        let mut peers: Vec<u32> = self
            .connected
            .iter()
            .filter_map(|&(a, b)| {
                if a == from {
                    Some(b)
                } else if b == from {
                    Some(a)
                } else {
                    None
                }
            })
            .filter(|p| !self.offline.contains(p))
            .collect();
        peers.sort_unstable();
        peers
    }

    pub fn partition(&mut self, a: u32, b: u32) {
        self.partitioned.insert(pair(a, b));
    }

    pub fn heal(&mut self, a: u32, b: u32) {
        self.partitioned.remove(&pair(a, b));
    }

    pub fn set_offline(&mut self, node: u32) {
        self.offline.insert(node);
    }

    pub fn set_online(&mut self, node: u32) {
        self.offline.remove(&node);
    }

    pub fn is_offline(&self, node: u32) -> bool {
        self.offline.contains(&node)
    }

    /// Sample a delivery delay, or `None` if the message is dropped.
    ///
    /// Draws from `rng` in call order, so delivery is reproducible for a
    /// fixed seed.
    pub fn sample_delivery(&mut self, from: u32, to: u32, rng: &mut ChaCha8Rng) -> Option<Duration> {
        if self.offline.contains(&from)
            || self.offline.contains(&to)
            || !self.is_connected(from, to)
            || self.partitioned.contains(&pair(from, to))
        {
            self.dropped += 1;
            return None;
        }
        if self.config.loss_probability > 0.0 && rng.gen::<f64>() < self.config.loss_probability {
            self.dropped += 1;
            return None;
        }

        let jitter = if self.config.jitter_fraction > 0.0 {
            1.0 + rng.gen_range(-self.config.jitter_fraction..self.config.jitter_fraction)
        } else {
            1.0
        };
        Some(self.config.latency.mul_f64(jitter.max(0.0)))
    }
}
