use std::collections::BTreeMap;
use std::path::Path;

use petgraph::algo::astar;
use petgraph::graph::{NodeIndex, UnGraph};
use serde::Deserialize;
use tracing::info;

use crate::app::RandomRequestApp;
use crate::error::SimError;
use crate::network::{Network, NodeKind};
use crate::simulation::{Simulation, Time};

/// Node type tags accepted by the topology file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum NodeType {
    QuantumRouter,
    MiddleNode,
    Node,
}

const DEFAULT_MEMO_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub memo_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct QChannelConfig {
    pub name: String,
    pub source: String,
    pub target: String,
    /// Meters.
    pub distance: f64,
    /// dB per meter.
    pub attenuation: f64,
}

#[derive(Debug, Deserialize)]
pub struct CChannelConfig {
    pub name: String,
    pub source: String,
    pub target: String,
    /// Meters.
    pub distance: f64,
    /// Picoseconds; derived from distance when omitted.
    pub delay: Option<f64>,
}

/// The declarative network description (spec'd JSON schema).
#[derive(Debug, Deserialize)]
pub struct TopologyConfig {
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub qchannels: Vec<QChannelConfig>,
    #[serde(default)]
    pub cchannels: Vec<CChannelConfig>,
}

impl Simulation {
    /// Build a simulation from a topology file. Configuration problems
    /// (duplicate names, unknown endpoints, bad JSON) surface here,
    /// before `init()`.
    pub fn from_json_file(
        path: impl AsRef<Path>,
        runtime: Time,
        seed: u64,
    ) -> Result<Simulation, SimError> {
        let text = std::fs::read_to_string(path)?;
        Simulation::from_json_str(&text, runtime, seed)
    }

    pub fn from_json_str(text: &str, runtime: Time, seed: u64) -> Result<Simulation, SimError> {
        let config: TopologyConfig = serde_json::from_str(text)?;
        let mut sim = Simulation::new(runtime, seed);
        for node in &config.nodes {
            match node.node_type {
                NodeType::QuantumRouter => {
                    sim.network
                        .add_router(&node.name, node.memo_size.unwrap_or(DEFAULT_MEMO_SIZE))?;
                }
                NodeType::MiddleNode => {
                    sim.network.add_middle(&node.name)?;
                }
                NodeType::Node => {
                    sim.network.add_endpoint(&node.name)?;
                }
            }
        }
        for qc in &config.qchannels {
            sim.network
                .connect_quantum(&qc.source, &qc.target, qc.distance, qc.attenuation)?;
        }
        for cc in &config.cchannels {
            sim.network.connect_classical(
                &cc.source,
                &cc.target,
                cc.distance,
                cc.delay.map(|d| d.round() as Time),
            )?;
        }
        info!(
            nodes = config.nodes.len(),
            qchannels = config.qchannels.len(),
            cchannels = config.cchannels.len(),
            "topology loaded"
        );
        Ok(sim)
    }
}

fn quantum_graph(network: &Network) -> UnGraph<(), f64> {
    let mut graph = UnGraph::<(), f64>::new_undirected();
    let indices: Vec<NodeIndex> = network.nodes.iter().map(|_| graph.add_node(())).collect();
    for channel in &network.qchannels {
        graph.add_edge(
            indices[channel.ends.0],
            indices[channel.ends.1],
            channel.distance_m,
        );
    }
    graph
}

/// Forwarding table for one router: destination router name to next-hop
/// router name, by shortest path over the quantum-channel graph weighted
/// by fiber distance. Middle nodes relay photons, not reservations, so
/// they are skipped when extracting hops.
pub fn generate_forwarding_table(
    network: &Network,
    node: &str,
) -> Result<BTreeMap<String, String>, SimError> {
    let src = network.require_node_id(node, "forwarding")?;
    if !network.nodes[src].is_router() {
        return Err(SimError::NotARouter(node.to_string()));
    }
    let graph = quantum_graph(network);
    let mut table = BTreeMap::new();
    for dst in network.nodes.iter().filter(|n| n.is_router()) {
        if dst.id == src {
            continue;
        }
        let found = astar(
            &graph,
            NodeIndex::new(src),
            |n| n == NodeIndex::new(dst.id),
            |e| *e.weight(),
            |_| 0.0,
        );
        let Some((_, path)) = found else {
            return Err(SimError::Unroutable(node.to_string(), dst.name.clone()));
        };
        let next_router = path
            .iter()
            .skip(1)
            .map(|idx| &network.nodes[idx.index()])
            .find(|n| n.is_router())
            .map(|n| n.name.clone())
            .expect("a route to a router passes through a router");
        table.insert(dst.name.clone(), next_router);
    }
    Ok(table)
}

/// Fill every router's forwarding table and register which middle node
/// serves each adjacent router pair. Runs once, before `init()`.
pub fn populate_forwarding_tables(network: &mut Network) -> Result<(), SimError> {
    let router_names = network.router_names();
    for name in &router_names {
        let table = generate_forwarding_table(network, name)?;
        let id = network.node_id(name).expect("router exists");
        let manager = &mut network.nodes[id].router_mut().manager;
        for (dst, next_hop) in table {
            manager.add_forwarding_rule(dst, next_hop);
        }
    }

    // A middle node flanked by two routers heralds that router pair.
    let mut links: Vec<(String, String, String)> = Vec::new();
    for node in &network.nodes {
        if !matches!(node.kind, NodeKind::Middle(_)) {
            continue;
        }
        let router_peers: Vec<String> = node
            .qchannels
            .keys()
            .filter(|peer| {
                network
                    .node_by_name(peer)
                    .map(|n| n.is_router())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if router_peers.len() == 2 {
            links.push((
                router_peers[0].clone(),
                router_peers[1].clone(),
                node.name.clone(),
            ));
        }
    }
    for (a, b, middle) in links {
        network.set_link_middle(&a, &b, &middle);
    }
    Ok(())
}

/// Idealized hardware, the perfect-network experiment configuration:
/// lossless fiber, unit efficiencies, infinite coherence, deterministic
/// swaps.
pub fn apply_perfect_hardware(network: &mut Network) {
    for node in &mut network.nodes {
        match &mut node.kind {
            NodeKind::Router(state) => {
                state.memories.update_memory_params("frequency", 1e11);
                state.memories.update_memory_params("coherence_time", -1.0);
                state.memories.update_memory_params("efficiency", 1.0);
                state.memories.update_memory_params("raw_fidelity", 1.0);
                state.manager.swapping.set_swapping_success_rate(1.0);
                state.manager.swapping.set_swapping_degradation(1.0);
            }
            NodeKind::Middle(state) => {
                state.bsm.update_detectors_params("efficiency", 1.0);
                state.bsm.update_detectors_params("count_rate", 1e12);
                state.bsm.update_detectors_params("time_resolution", 1.0);
            }
            NodeKind::Endpoint(_) => {}
        }
    }
    for channel in &mut network.qchannels {
        channel.attenuation_db_per_m = 0.0;
        channel.polarization_fidelity = 1.0;
        channel.frequency_hz = 1e11;
    }
}

/// Give every router a random-request application targeting all other
/// routers.
pub fn attach_random_request_apps(network: &mut Network) {
    let router_names = network.router_names();
    for name in &router_names {
        let others: Vec<String> = router_names
            .iter()
            .filter(|other| *other != name)
            .cloned()
            .collect();
        let id = network.node_id(name).expect("router exists");
        network.nodes[id].router_mut().app = Some(RandomRequestApp::new(others));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SECOND;

    const CONFIG: &str = r#"{
        "nodes": [
            {"name": "r1", "type": "QuantumRouter", "memo_size": 20},
            {"name": "m1", "type": "MiddleNode"},
            {"name": "r2", "type": "QuantumRouter", "memo_size": 20},
            {"name": "m2", "type": "MiddleNode"},
            {"name": "r3", "type": "QuantumRouter"}
        ],
        "qchannels": [
            {"name": "qc1", "source": "r1", "target": "m1", "distance": 1000, "attenuation": 0.0002},
            {"name": "qc2", "source": "r2", "target": "m1", "distance": 1000, "attenuation": 0.0002},
            {"name": "qc3", "source": "r2", "target": "m2", "distance": 1000, "attenuation": 0.0002},
            {"name": "qc4", "source": "r3", "target": "m2", "distance": 1000, "attenuation": 0.0002}
        ],
        "cchannels": [
            {"name": "cc1", "source": "r1", "target": "r2", "distance": 2000},
            {"name": "cc2", "source": "r2", "target": "r3", "distance": 2000},
            {"name": "cc3", "source": "r1", "target": "r3", "distance": 4000},
            {"name": "cc4", "source": "r1", "target": "m1", "distance": 1000},
            {"name": "cc5", "source": "r2", "target": "m1", "distance": 1000},
            {"name": "cc6", "source": "r2", "target": "m2", "distance": 1000},
            {"name": "cc7", "source": "r3", "target": "m2", "distance": 1000}
        ]
    }"#;

    #[test]
    fn test_load_topology_from_json() {
        let sim = Simulation::from_json_str(CONFIG, SECOND, 1).unwrap();
        assert_eq!(sim.network.nodes.len(), 5);
        assert_eq!(sim.network.qchannels.len(), 4);
        assert_eq!(sim.network.cchannels.len(), 7);
        assert_eq!(sim.network.node_by_name("r1").unwrap().router().memories.len(), 20);
        assert_eq!(
            sim.network.node_by_name("r3").unwrap().router().memories.len(),
            DEFAULT_MEMO_SIZE
        );
    }

    #[test]
    fn test_duplicate_node_is_config_error() {
        let bad = r#"{
            "nodes": [
                {"name": "r1", "type": "QuantumRouter"},
                {"name": "r1", "type": "MiddleNode"}
            ]
        }"#;
        assert!(matches!(
            Simulation::from_json_str(bad, SECOND, 1),
            Err(SimError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_unknown_channel_endpoint_is_config_error() {
        let bad = r#"{
            "nodes": [{"name": "r1", "type": "QuantumRouter"}],
            "qchannels": [
                {"name": "qc", "source": "r1", "target": "ghost", "distance": 1, "attenuation": 0}
            ]
        }"#;
        assert!(matches!(
            Simulation::from_json_str(bad, SECOND, 1),
            Err(SimError::UnknownNode(_, _))
        ));
    }

    #[test]
    fn test_forwarding_table_skips_middles() {
        let mut sim = Simulation::from_json_str(CONFIG, SECOND, 1).unwrap();
        populate_forwarding_tables(&mut sim.network).unwrap();
        let r1 = sim.network.node_by_name("r1").unwrap().router();
        assert_eq!(r1.manager.next_hop("r2"), Some(&"r2".to_string()));
        // r3 is two hops out; the next hop is still the adjacent router.
        assert_eq!(r1.manager.next_hop("r3"), Some(&"r2".to_string()));
    }

    #[test]
    fn test_link_middles_registered() {
        let mut sim = Simulation::from_json_str(CONFIG, SECOND, 1).unwrap();
        populate_forwarding_tables(&mut sim.network).unwrap();
        assert_eq!(
            sim.network.middle_between("r1", "r2"),
            Some(&"m1".to_string())
        );
        assert_eq!(
            sim.network.middle_between("r3", "r2"),
            Some(&"m2".to_string())
        );
        assert_eq!(sim.network.middle_between("r1", "r3"), None);
    }

    #[test]
    fn test_disconnected_routers_are_unroutable() {
        let config = r#"{
            "nodes": [
                {"name": "r1", "type": "QuantumRouter"},
                {"name": "r2", "type": "QuantumRouter"}
            ]
        }"#;
        let mut sim = Simulation::from_json_str(config, SECOND, 1).unwrap();
        assert!(matches!(
            populate_forwarding_tables(&mut sim.network),
            Err(SimError::Unroutable(_, _))
        ));
    }
}
