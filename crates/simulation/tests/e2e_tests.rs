//! End-to-end consensus scenarios on the deterministic simulation.
//!
//! Everything here runs single-threaded on a virtual clock; a fixed seed
//! makes each scenario exactly reproducible.

mod common;

use common::{assert_chains_agree, make_tx, network_of, run_until_or};
use concord_simulation::{NetworkConfig, SimulationRunner};
use concord_types::TransactionList;
use std::time::Duration;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn single_validator_paces_empty_blocks() {
    let mut runner = network_of(1, 7);
    runner.run_until(Duration::from_secs(10));

    // One block per interval, give or take startup.
    let height = runner.height(0);
    assert!(height >= 5, "expected steady progress, tip is {height}");
    assert!(height <= 10, "single node must not outrun its interval");

    // Every block carries the empty transaction list with its well-known
    // root.
    let empty_root = TransactionList::default().root();
    for h in 1..=height {
        let block = runner.store(0).block_of(h).unwrap();
        assert!(block.body.transactions.is_empty());
        assert_eq!(block.header.transaction_root, empty_root);
    }

    // Monotonic height: the store grew one block at a time and the commit
    // log has no gaps.
    assert_eq!(runner.committed_blocks(0).len() as u64, height);
}

#[traced_test]
#[test]
fn four_validators_commit_a_submitted_transaction() {
    let mut runner = network_of(4, 11);

    // Let the handshakes settle before submitting.
    runner.run_until(Duration::from_millis(200));
    let tx = make_tx(42, 1);
    runner.submit_transaction(0, tx.clone());

    let committed = run_until_or(&mut runner, Duration::from_secs(20), |r| {
        (0..4).all(|n| {
            r.committed_blocks(n)
                .iter()
                .any(|b| b.body.transactions.iter().any(|t| t.hash() == tx.hash()))
        })
    });
    assert!(committed, "transaction should reach a committed block everywhere");

    // Each node's executor saw the transaction exactly once, and the pool
    // no longer holds it.
    for node in 0..4 {
        assert_eq!(runner.dapp(node).execution_count(&tx.hash()), 1);
        assert!(!runner.node(node).pool().contains(&tx.hash()));
    }

    // Safety: all nodes agree on every shared height.
    for node in 1..4 {
        assert_chains_agree(&runner, 0, node);
    }

    // Agreement on app state: same executed height implies same hash.
    let (h0, s0) = runner.store(0).executed().unwrap();
    for node in 1..4 {
        let (h, s) = runner.store(node).executed().unwrap();
        if h == h0 {
            assert_eq!(s, s0, "app state diverged at height {h}");
        }
    }
}

#[traced_test]
#[test]
fn offline_proposer_is_skipped_in_round_one() {
    let mut runner = network_of(4, 23);

    // Crash the proposer of (height 1, round 0) before it can propose.
    let proposer = runner.proposer_at(1, 0);
    runner.network_mut().set_offline(proposer);

    let committed = run_until_or(&mut runner, Duration::from_secs(30), |r| {
        (0..4).filter(|n| *n != proposer).all(|n| r.height(n) >= 1)
    });
    assert!(committed, "round 1 should commit without the round-0 proposer");

    // The certificate for height 1 records the round that succeeded.
    for node in 0..4u32 {
        if node == proposer {
            continue;
        }
        let commit = runner.store(node).commit_of(1).unwrap();
        assert_eq!(commit.round, 1, "height 1 should commit in round 1");
    }
}

#[traced_test]
#[test]
fn liveness_with_one_crashed_validator() {
    let mut runner = network_of(4, 31);
    runner.network_mut().set_offline(3);

    // Spec bound: the tip advances within 5 * (propose + prevote +
    // precommit) of wall-clock time.
    let bound = Duration::from_secs(5 * (3 + 1 + 1));
    let advanced = run_until_or(&mut runner, bound, |r| {
        (0..3).all(|n| r.height(n) >= 1)
    });
    assert!(advanced, "tip should advance within the liveness bound");

    // And progress continues beyond the first block.
    runner.run_for(Duration::from_secs(30));
    assert!(runner.height(0) >= 3);
    assert_chains_agree(&runner, 0, 1);
    assert_chains_agree(&runner, 0, 2);
}

#[traced_test]
#[test]
fn empty_network_makes_no_progress_without_quorum() {
    // 2 of 4 validators cannot commit anything.
    let mut runner = SimulationRunner::new(
        NetworkConfig {
            num_validators: 4,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            loss_probability: 0.0,
        },
        3,
    );
    runner.connect(0, 1);
    runner.network_mut().set_offline(2);
    runner.network_mut().set_offline(3);
    runner.start_nodes();

    runner.run_until(Duration::from_secs(30));
    assert_eq!(runner.height(0), 0);
    assert_eq!(runner.height(1), 0);
}
