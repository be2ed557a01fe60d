//! End-to-end scenarios driving the full stack: classical and quantum
//! delivery timing, reservation admission along a path, and entanglement
//! distribution with swapping on ideal hardware.

use qnetsim::components::photon::Photon;
use qnetsim::network::topology::{apply_perfect_hardware, populate_forwarding_tables};
use qnetsim::protocols::message::Message;
use qnetsim::simulation::{Simulation, Time, SECOND};

/// Two endpoints joined by both channel kinds, 1 km apart.
fn two_endpoints(distance_m: f64, attenuation: f64, seed: u64) -> Simulation {
    let mut sim = Simulation::new(10 * SECOND, seed);
    sim.network.add_endpoint("node1").unwrap();
    sim.network.add_endpoint("node2").unwrap();
    sim.network
        .connect_classical("node1", "node2", distance_m, None)
        .unwrap();
    sim.network
        .connect_quantum("node1", "node2", distance_m, attenuation)
        .unwrap();
    sim
}

#[test]
fn two_node_message_exchange_arrives_in_order() {
    let mut sim = two_endpoints(1e3, 0.0, 1);
    sim.init().unwrap();

    // Ten messages each way, one picosecond apart. 1 km of fiber is a
    // 5_000_000 ps classical delay.
    for i in 0..10u64 {
        sim.timeline.advance_to(i);
        sim.network
            .send_message(&mut sim.timeline, 0, "node2", Message::Raw(i.to_string()));
    }
    for i in 10..20u64 {
        sim.timeline.advance_to(i);
        sim.network.send_message(
            &mut sim.timeline,
            1,
            "node1",
            Message::Raw((i - 10).to_string()),
        );
    }
    assert!(sim.network.node(0).endpoint().message_log.is_empty());
    assert!(sim.network.node(1).endpoint().message_log.is_empty());

    sim.run().unwrap();

    let node2_log = &sim.network.node(1).endpoint().message_log;
    let expected: Vec<(Time, String, String)> = (0..10u64)
        .map(|i| (5_000_000 + i, "node1".to_string(), i.to_string()))
        .collect();
    assert_eq!(node2_log, &expected);

    let node1_log = &sim.network.node(0).endpoint().message_log;
    let expected: Vec<(Time, String, String)> = (0..10u64)
        .map(|i| (5_000_010 + i, "node2".to_string(), i.to_string()))
        .collect();
    assert_eq!(node1_log, &expected);
}

#[test]
fn lossless_qubit_send_keeps_every_photon() {
    // 20 km, zero attenuation: a 100_000_000 ps flight and no drops.
    let mut sim = two_endpoints(2e4, 0.0, 1);
    sim.init().unwrap();

    for i in 0..10u64 {
        sim.timeline.advance_to(i);
        let photon = Photon::new(i.to_string());
        sim.network
            .send_qubit(&mut sim.timeline, 0, "node2", photon);
    }
    sim.run().unwrap();

    let log = &sim.network.node(1).endpoint().qubit_log;
    assert_eq!(log.len(), 10);
    for (i, entry) in log.iter().enumerate() {
        assert_eq!(entry.0, 100_000_000 + i as Time);
        assert_eq!(entry.1, "node1");
        assert_eq!(entry.2, i.to_string());
    }
}

#[test]
fn lossy_qubit_send_is_reproducible() {
    // 20 km at 0.2 dB/km: ~40% survival. The surviving subset is
    // whatever the seed says, but it is exactly the same every run.
    let survivors = |seed: u64| -> Vec<String> {
        let mut sim = two_endpoints(2e4, 2e-4, seed);
        sim.init().unwrap();
        for i in 0..32u64 {
            sim.timeline.advance_to(i);
            sim.network
                .send_qubit(&mut sim.timeline, 0, "node2", Photon::new(i.to_string()));
        }
        sim.run().unwrap();
        sim.network
            .node(1)
            .endpoint()
            .qubit_log
            .iter()
            .map(|(_, _, name)| name.clone())
            .collect()
    };
    let first = survivors(7);
    let second = survivors(7);
    assert!(first.len() < 32, "attenuated fiber should drop photons");
    assert!(!first.is_empty(), "some photons should survive");
    assert_eq!(first, second);
}

#[test]
fn zero_distance_classical_channel_delivers_at_send_time() {
    let mut sim = Simulation::new(SECOND, 1);
    sim.network.add_endpoint("a").unwrap();
    sim.network.add_endpoint("b").unwrap();
    sim.network.connect_classical("a", "b", 0.0, None).unwrap();
    sim.init().unwrap();
    sim.network
        .send_message(&mut sim.timeline, 0, "b", Message::Raw("now".into()));
    sim.run().unwrap();
    let log = &sim.network.node(1).endpoint().message_log;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, 0);
}

/// A linear router chain with a BSM middle between each adjacent pair,
/// fully meshed with classical channels, 1 km per fiber span.
fn router_chain(names: &[&str], memo_size: usize, seed: u64, runtime: Time) -> Simulation {
    let mut sim = Simulation::new(runtime, seed);
    for name in names {
        sim.network.add_router(name, memo_size).unwrap();
    }
    let mut middles = Vec::new();
    for pair in names.windows(2) {
        let middle = format!("m.{}.{}", pair[0], pair[1]);
        sim.network.add_middle(&middle).unwrap();
        sim.network
            .connect_quantum(pair[0], &middle, 1e3, 0.0)
            .unwrap();
        sim.network
            .connect_quantum(pair[1], &middle, 1e3, 0.0)
            .unwrap();
        sim.network
            .connect_classical(pair[0], &middle, 1e3, None)
            .unwrap();
        sim.network
            .connect_classical(pair[1], &middle, 1e3, None)
            .unwrap();
        middles.push(middle);
    }
    for (i, a) in names.iter().enumerate() {
        for b in names.iter().skip(i + 1) {
            sim.network
                .connect_classical(a, b, 2e3, None)
                .unwrap();
        }
    }
    populate_forwarding_tables(&mut sim.network).unwrap();
    apply_perfect_hardware(&mut sim.network);
    sim
}

#[test]
fn perfect_link_delivers_entangled_pairs() {
    let mut sim = router_chain(&["r1", "r2"], 4, 1, SECOND / 20);
    let start = SECOND / 100;
    let end = SECOND / 2;
    sim.network
        .reserve(&mut sim.timeline, 0, "r2", start, end, 4, 1.0);
    sim.init().unwrap();
    sim.run().unwrap();

    let r1 = sim.network.node_by_name("r1").unwrap().router();
    let delivered: u64 = r1.delivered.values().sum();
    assert!(
        delivered > 0,
        "perfect hardware should deliver end-to-end pairs"
    );
    assert!(r1.manager.generation.pairs_generated > 0);
    // Single link: nothing to swap.
    assert_eq!(r1.manager.swapping.swaps_attempted, 0);
}

#[test]
fn swap_chain_extends_entanglement_end_to_end() {
    let mut sim = router_chain(&["r1", "r2", "r3"], 4, 1, SECOND / 10);
    let start = SECOND / 100;
    let end = SECOND / 2;
    sim.network
        .reserve(&mut sim.timeline, 0, "r3", start, end, 4, 1.0);
    sim.init().unwrap();
    sim.run().unwrap();

    let r1 = sim.network.node_by_name("r1").unwrap().router();
    let r2 = sim.network.node_by_name("r2").unwrap().router();
    let delivered: u64 = r1.delivered.values().sum();
    assert!(delivered > 0, "chain should deliver end-to-end pairs");
    assert!(
        r2.manager.swapping.swaps_succeeded > 0,
        "interior router must swap"
    );
    // Perfect hardware: every accepted reservation keeps fidelity 1, so
    // nothing is ever purified.
    let r2_accepted = &r2.manager.reservation.accepted;
    assert_eq!(r2_accepted.len(), 1);
    assert_eq!(r2_accepted[0].path, vec!["r1", "r2", "r3"]);
}

#[test]
fn identical_seeds_reproduce_the_run() {
    let run = |seed: u64| {
        let mut sim = router_chain(&["r1", "r2", "r3"], 4, seed, SECOND / 10);
        sim.network.reserve(
            &mut sim.timeline,
            0,
            "r3",
            SECOND / 100,
            SECOND / 2,
            4,
            1.0,
        );
        sim.init().unwrap();
        sim.run().unwrap();
        let r1 = sim.network.node_by_name("r1").unwrap().router();
        let r2 = sim.network.node_by_name("r2").unwrap().router();
        (
            sim.timeline.stats().executed,
            sim.timeline.now(),
            r1.delivered.values().sum::<u64>(),
            r2.manager.swapping.swaps_attempted,
            r2.manager.swapping.swaps_succeeded,
        )
    };
    assert_eq!(run(42), run(42));
}

#[test]
fn overlapping_reservations_contend_for_the_interior_router() {
    // r1 -> r3 and r3 -> r1 both want four memories over overlapping
    // windows. The endpoints hold eight each, so both requests clear
    // their ends; the interior router r2 holds only four, so exactly one
    // commits there, and submission order picks the survivor.
    let contend = |first_from_r1: bool| -> Vec<String> {
        let mut sim = Simulation::new(SECOND / 100, 1);
        for (name, size) in [("r1", 8), ("r2", 4), ("r3", 8)] {
            sim.network.add_router(name, size).unwrap();
        }
        for pair in [["r1", "r2"], ["r2", "r3"]] {
            let middle = format!("m.{}.{}", pair[0], pair[1]);
            sim.network.add_middle(&middle).unwrap();
            for router in pair {
                sim.network.connect_quantum(router, &middle, 1e3, 0.0).unwrap();
                sim.network
                    .connect_classical(router, &middle, 1e3, None)
                    .unwrap();
            }
        }
        for pair in [("r1", "r2"), ("r2", "r3"), ("r1", "r3")] {
            sim.network
                .connect_classical(pair.0, pair.1, 2e3, None)
                .unwrap();
        }
        populate_forwarding_tables(&mut sim.network).unwrap();

        let (a, b) = if first_from_r1 { (0, 2) } else { (2, 0) };
        let a_name = sim.network.node(a).name.clone();
        let b_name = sim.network.node(b).name.clone();
        sim.network.reserve(
            &mut sim.timeline,
            a,
            &b_name,
            SECOND / 10,
            SECOND / 2,
            4,
            0.9,
        );
        sim.network.reserve(
            &mut sim.timeline,
            b,
            &a_name,
            SECOND / 10 + 1000,
            SECOND / 2,
            4,
            0.9,
        );
        sim.init().unwrap();
        sim.run().unwrap();
        sim.network
            .node_by_name("r2")
            .unwrap()
            .router()
            .manager
            .reservation
            .accepted
            .iter()
            .map(|r| r.reservation.initiator.clone())
            .collect()
    };

    let winners = contend(true);
    assert_eq!(winners, vec!["r1".to_string()]);
    let winners = contend(false);
    assert_eq!(winners, vec!["r3".to_string()]);
}

#[test]
fn entangled_memories_point_at_each_other() {
    // A single held pair on a perfect link: the unreachable target
    // fidelity keeps it from being consumed, one memory per side keeps
    // purification out of it, and the queue drains into quiescence.
    let mut sim = router_chain(&["r1", "r2"], 2, 9, SECOND / 50);
    sim.network
        .reserve(&mut sim.timeline, 0, "r2", SECOND / 100, SECOND / 2, 1, 2.0);
    sim.init().unwrap();
    sim.run().unwrap();

    let network = &sim.network;
    let mut checked = 0;
    for node in &network.nodes {
        let Some(state) = node.try_router() else {
            continue;
        };
        for memory in state.memories.iter() {
            if memory.state != qnetsim::components::MemoryState::Entangled {
                continue;
            }
            let partner = memory.entangled_with.as_ref().unwrap();
            let other = network
                .node_by_name(&partner.node)
                .unwrap()
                .router()
                .memories
                .get(partner.index);
            assert_eq!(other.state, qnetsim::components::MemoryState::Entangled);
            assert_eq!(
                other.entangled_with.as_ref().unwrap(),
                &qnetsim::components::MemoryRef {
                    node: node.name.clone(),
                    index: memory.index,
                }
            );
            checked += 1;
        }
    }
    assert!(checked > 0, "expected held entangled pairs at quiescence");
}
