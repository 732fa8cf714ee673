//! Configuration records.
//!
//! Plain structs with explicit defaults; overriding a field is field-wise
//! assignment, not structural merging.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consensus engine timing and sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// How long non-proposers wait for a round-0 proposal before prevoting
    /// nil. Grows by `propose_rate` each round.
    pub propose_timeout: Duration,
    pub propose_rate: f64,

    /// How long to wait for prevotes to converge after any `> 2/3` of
    /// prevote power has arrived.
    pub prevote_timeout: Duration,
    pub prevote_rate: f64,

    /// How long to wait for precommit quorum before starting the next round.
    pub precommit_timeout: Duration,
    pub precommit_rate: f64,

    /// Pacing delay before the round-0 proposer builds a block. Keeps an
    /// idle chain from spinning heights as fast as the event loop allows.
    pub block_interval: Duration,

    /// Maximum transactions the proposer packs into one block.
    pub max_block_transactions: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            propose_timeout: Duration::from_millis(3000),
            propose_rate: 1.2,
            prevote_timeout: Duration::from_millis(1000),
            prevote_rate: 1.2,
            precommit_timeout: Duration::from_millis(1000),
            precommit_rate: 1.2,
            block_interval: Duration::from_millis(1000),
            max_block_transactions: 1000,
        }
    }
}

impl ConsensusConfig {
    /// Timeout for a step at `round`: `base * rate^round`.
    ///
    /// Geometric growth guarantees that once the network is synchronous,
    /// some round's timeout exceeds the message delay and quorum is reached.
    pub fn timeout_at(&self, base: Duration, rate: f64, round: u32) -> Duration {
        base.mul_f64(rate.powi(round.min(30) as i32))
    }

    pub fn propose_timeout_at(&self, round: u32) -> Duration {
        self.timeout_at(self.propose_timeout, self.propose_rate, round)
    }

    pub fn prevote_timeout_at(&self, round: u32) -> Duration {
        self.timeout_at(self.prevote_timeout, self.prevote_rate, round)
    }

    pub fn precommit_timeout_at(&self, round: u32) -> Duration {
        self.timeout_at(self.precommit_timeout, self.precommit_rate, round)
    }
}

/// Transaction pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum transactions held; exceeding evicts the oldest admitted.
    pub max_pool_size: usize,
    /// Maximum pending transactions attributed to one peer.
    pub max_per_peer_pending: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 10_000,
            max_per_peer_pending: 1_000,
        }
    }
}

/// Synchronizer fetch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Headers (and bodies) requested per batch.
    pub batch_size: u64,
    /// Outstanding request deadline; on expiry the peer is dropped and the
    /// batch retried elsewhere.
    pub request_timeout: Duration,
    /// Synchronizer tick interval.
    pub tick_interval: Duration,
    /// Consecutive failures before a peer is skipped for selection.
    pub max_peer_failures: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            request_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(500),
            max_peer_failures: 3,
        }
    }
}

/// Node-level configuration bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    pub pool: PoolConfig,
    pub sync: SyncConfig,
    /// Handshake deadline for newly connected peers.
    pub handshake_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusConfig::default(),
            pool: PoolConfig::default(),
            sync: SyncConfig::default(),
            handshake_timeout: Duration::from_secs(3),
        }
    }
}
