//! Behavioral scoring: honest participation never lowers a score,
//! violations always do, and histories record every step.

use quorumsim::{
    MaliciousStrategy, ProtocolKind, SimConfig, Simulation,
};

fn run(config: SimConfig, rounds: usize) -> Simulation {
    let mut sim = Simulation::new(config).unwrap();
    for _ in 0..rounds {
        sim.run_round().unwrap();
    }
    sim
}

#[test]
fn honest_nodes_never_lose_score() {
    let config = SimConfig::new(ProtocolKind::Pbft).with_nodes(4).with_seed(8);
    let sim = run(config, 10);
    for record in sim.reputation().records() {
        assert!(
            record.score >= 50.0,
            "honest node {} dropped to {}",
            record.node,
            record.score
        );
        assert_eq!(record.violations, 0);
        for pair in record.history.windows(2) {
            assert!(
                pair[1] >= pair[0],
                "node {} score decreased {} -> {}",
                record.node,
                pair[0],
                pair[1]
            );
        }
    }
}

#[test]
fn withholding_node_accumulates_missed_votes() {
    let config = SimConfig::new(ProtocolKind::Pbft)
        .with_nodes(4)
        .with_malicious_ratio(0.25)
        .with_malicious_strategy(MaliciousStrategy::withholding())
        .with_seed(8);
    let sim = run(config, 10);
    let records = sim.reputation().records();
    let withholder = &records[3];
    assert!(withholder.violations > 0);
    assert!(
        withholder.score < 50.0,
        "withholder kept score {}",
        withholder.score
    );
    // and scores the honest quorum above it
    for honest in &records[..3] {
        assert!(honest.score > withholder.score);
    }
}

#[test]
fn honest_leader_is_not_blamed_for_a_stalled_view() {
    // nodes 2 and 3 withhold, so no view can reach the quorum of 3;
    // honest nodes 0 and 1 still take their turns as leader and their
    // stalled views must not count against them
    let config = SimConfig::new(ProtocolKind::Pbft)
        .with_nodes(4)
        .with_malicious_ratio(0.5)
        .with_malicious_strategy(MaliciousStrategy::withholding())
        .with_seed(8);
    let mut sim = Simulation::new(config).unwrap();
    sim.run_round().unwrap();
    let records = sim.reputation().records();
    for honest in &records[..2] {
        assert_eq!(
            honest.violations, 0,
            "honest node {} was penalized",
            honest.node
        );
        for pair in honest.history.windows(2) {
            assert!(
                pair[1] >= pair[0],
                "honest node {} score decreased {} -> {}",
                honest.node,
                pair[0],
                pair[1]
            );
        }
    }
    // the withholding leaders still pay for their silent views
    for withholder in &records[2..] {
        assert!(withholder.violations > 0);
    }
}

#[test]
fn equivocation_strictly_decreases_the_score() {
    let config = SimConfig::new(ProtocolKind::Pbft)
        .with_nodes(4)
        .with_malicious_ratio(0.25)
        .with_malicious_strategy(MaliciousStrategy::equivocating())
        .with_seed(4);
    // node 3 leads height 3 and equivocates there
    let sim = run(config, 4);
    let record = &sim.reputation().records()[3];
    assert!(record.violations > 0, "equivocation went unobserved");
    let strict_drop = record
        .history
        .windows(2)
        .any(|pair| pair[1] < pair[0]);
    assert!(strict_drop, "no strict decrease in {:?}", record.history);
}

#[test]
fn scores_stay_within_bounds_under_sustained_abuse() {
    let config = SimConfig::new(ProtocolKind::Pbft)
        .with_nodes(4)
        .with_malicious_ratio(0.25)
        .with_malicious_strategy(MaliciousStrategy::withholding())
        .with_seed(6);
    let sim = run(config, 40);
    for record in sim.reputation().records() {
        assert!((0.0..=100.0).contains(&record.score));
        for score in &record.history {
            assert!((0.0..=100.0).contains(score));
        }
    }
}
