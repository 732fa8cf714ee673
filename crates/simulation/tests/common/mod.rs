//! Shared helpers for simulation scenarios.
#![allow(dead_code)]

use concord_simulation::{NetworkConfig, SimulationRunner};
use concord_types::{KeyPair, Transaction, TransactionData};
use std::time::Duration;

/// A fully connected network of `n` equal-power validators, started.
pub fn network_of(n: u32, seed: u64) -> SimulationRunner {
    let mut runner = SimulationRunner::new(
        NetworkConfig {
            num_validators: n,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            loss_probability: 0.0,
        },
        seed,
    );
    let nodes: Vec<u32> = (0..n).collect();
    runner.connect_all(&nodes);
    runner.start_nodes();
    runner
}

/// A signed transaction with a deterministic payload.
pub fn make_tx(seed: u8, nonce: u64) -> Transaction {
    let key = KeyPair::from_seed(&[seed; 32]);
    Transaction::sign(
        TransactionData {
            nonce,
            payload: format!("payload-{seed}-{nonce}").into_bytes(),
            signer: key.public_key(),
        },
        &key,
    )
}

/// Run in steps until `predicate` holds or the deadline passes.
pub fn run_until_or(
    runner: &mut SimulationRunner,
    deadline: Duration,
    mut predicate: impl FnMut(&SimulationRunner) -> bool,
) -> bool {
    while runner.now() < deadline {
        if predicate(runner) {
            return true;
        }
        let next = runner.now() + Duration::from_millis(500);
        runner.run_until(next);
    }
    predicate(runner)
}

/// Assert two nodes agree on every height both have committed.
pub fn assert_chains_agree(runner: &SimulationRunner, a: u32, b: u32) {
    let shared = runner.height(a).min(runner.height(b));
    for height in 1..=shared {
        let block_a = runner.store(a).block_of(height).unwrap();
        let block_b = runner.store(b).block_of(height).unwrap();
        assert_eq!(
            block_a.hash(),
            block_b.hash(),
            "nodes {a} and {b} disagree at height {height}"
        );
    }
}
