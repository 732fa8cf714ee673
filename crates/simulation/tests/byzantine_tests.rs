//! Byzantine behavior: equivocation does not stop the honest majority.

mod common;

use common::{assert_chains_agree, network_of, run_until_or};
use concord_core::Event;
use concord_simulation::{NetworkConfig, SimulationRunner};
use concord_types::{Hash, Vote, VoteType};
use std::time::Duration;
use tracing_test::traced_test;

#[traced_test]
#[test]
fn equivocating_prevotes_are_logged_and_ignored() {
    // Nodes 0..2 are honest; validator 3's key is driven by the test to
    // send conflicting prevotes.
    let mut runner = SimulationRunner::new(
        NetworkConfig {
            num_validators: 4,
            latency: Duration::from_millis(10),
            jitter_fraction: 0.1,
            loss_probability: 0.0,
        },
        61,
    );
    runner.connect_all(&[0, 1, 2]);
    runner.network_mut().set_offline(3);
    runner.start_nodes();

    // Enter height 1 round 0 (pacing interval is 1s), then inject two
    // conflicting signed prevotes from validator 3 into every honest node
    // before the round resolves.
    runner.run_until(Duration::from_millis(1002));
    let byzantine = runner.keys()[3].clone();
    for node in 0..3 {
        for evil in [b"evil-a".as_slice(), b"evil-b".as_slice()] {
            let vote = Vote::sign(
                VoteType::Prevote,
                1,
                0,
                Some(Hash::of(evil)),
                3,
                &byzantine,
            );
            runner.schedule(node, Duration::ZERO, Event::VoteReceived { vote });
        }
    }

    let committed = run_until_or(&mut runner, Duration::from_secs(30), |r| {
        (0..3).all(|n| r.height(n) >= 1)
    });
    assert!(committed, "honest power exceeds the threshold, chain advances");

    for node in 0..3 {
        let equivocations = runner.node(node).engine().equivocations();
        assert!(
            !equivocations.is_empty(),
            "node {node} should have logged the equivocation"
        );
        let (first, second) = &equivocations[0];
        assert_eq!(first.validator_index, 3);
        assert_eq!(second.validator_index, 3);
        assert_ne!(first.block_hash, second.block_hash);
    }

    assert_chains_agree(&runner, 0, 1);
    assert_chains_agree(&runner, 0, 2);
}

#[traced_test]
#[test]
fn forged_votes_never_count() {
    let mut runner = network_of(4, 67);
    runner.run_until(Duration::from_millis(1002));

    // Votes claiming validator 2 but signed with the wrong key.
    let wrong_key = runner.keys()[0].clone();
    for node in 0..4 {
        let vote = Vote::sign(
            VoteType::Prevote,
            1,
            0,
            Some(Hash::of(b"forged")),
            2,
            &wrong_key,
        );
        runner.schedule(node, Duration::ZERO, Event::VoteReceived { vote });
    }

    runner.run_until(Duration::from_secs(15));
    // Consensus proceeds normally; the forged value never gets power.
    assert!(runner.height(0) >= 1);
    for node in 0..4 {
        assert!(!runner
            .committed_blocks(node)
            .iter()
            .any(|b| b.hash() == Hash::of(b"forged")));
    }
    assert_chains_agree(&runner, 0, 1);
}
