use std::collections::BTreeMap;

use crate::app::RandomRequestApp;
use crate::components::channel::ChannelId;
use crate::components::detector::{BsmStation, Detector};
use crate::components::light_source::LightSource;
use crate::components::memory::MemoryArray;
use crate::network::manager::NetworkManager;
use crate::network::NodeId;
use crate::protocols::bb84::Bb84;
use crate::protocols::reservation::ReservationId;
use crate::simulation::Time;

/// Which link of a reservation path one memory slot serves.
#[derive(Debug, Clone)]
pub struct LinkAssignment {
    pub reservation: ReservationId,
    /// Adjacent router on the other side of the link.
    pub peer: String,
    /// BSM node between the two routers, when the link has one.
    pub middle: Option<String>,
    /// True when this node drives generation on the link (it is the
    /// upstream side, closer to the reservation initiator).
    pub upstream: bool,
}

/// State owned by a quantum router: its memory bank, its network manager
/// with the layered protocol stack, and an optional application.
#[derive(Debug)]
pub struct RouterState {
    pub memories: MemoryArray,
    pub manager: NetworkManager,
    /// Per-memory link assignment for the reservations currently open.
    pub assignments: BTreeMap<usize, LinkAssignment>,
    /// End-to-end pairs delivered per reservation this node initiated.
    pub delivered: BTreeMap<ReservationId, u64>,
    pub app: Option<RandomRequestApp>,
}

impl RouterState {
    pub fn new(name: &str, memo_size: usize) -> Self {
        RouterState {
            memories: MemoryArray::new(format!("{}.memory_array", name), memo_size),
            manager: NetworkManager::new(name, memo_size),
            assignments: BTreeMap::new(),
            delivered: BTreeMap::new(),
            app: None,
        }
    }
}

/// State owned by a middle node: the BSM station between two routers.
#[derive(Debug)]
pub struct MiddleState {
    pub bsm: BsmStation,
}

/// A plain endpoint: optional photonic hardware plus delivery logs.
/// Used by QKD terminals and by tests observing raw traffic.
#[derive(Debug, Default)]
pub struct EndpointState {
    pub light_source: Option<LightSource>,
    pub detectors: Vec<Detector>,
    pub bb84: Option<Bb84>,
    /// (arrival time, source node, payload) of raw messages.
    pub message_log: Vec<(Time, String, String)>,
    /// (arrival time, source node, photon name) of delivered qubits.
    pub qubit_log: Vec<(Time, String, String)>,
}

/// Node behavior, as a tagged variant. The kernel dispatches through the
/// shared capability surface (init / receive_message / receive_qubit) in
/// [`Network::handle`]; no runtime type tests.
///
/// [`Network::handle`]: crate::network::Network::handle
#[derive(Debug)]
pub enum NodeKind {
    Router(Box<RouterState>),
    Middle(Box<MiddleState>),
    Endpoint(Box<EndpointState>),
}

/// A named collection of components plus per-peer channel maps.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// Peer name to classical channel.
    pub cchannels: BTreeMap<String, ChannelId>,
    /// Peer name to quantum channel.
    pub qchannels: BTreeMap<String, ChannelId>,
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>, kind: NodeKind) -> Self {
        Node {
            id,
            name: name.into(),
            kind,
            cchannels: BTreeMap::new(),
            qchannels: BTreeMap::new(),
        }
    }

    pub fn is_router(&self) -> bool {
        matches!(self.kind, NodeKind::Router(_))
    }

    pub fn try_router(&self) -> Option<&RouterState> {
        match &self.kind {
            NodeKind::Router(state) => Some(state),
            _ => None,
        }
    }

    pub fn try_router_mut(&mut self) -> Option<&mut RouterState> {
        match &mut self.kind {
            NodeKind::Router(state) => Some(state),
            _ => None,
        }
    }

    pub fn router(&self) -> &RouterState {
        self.try_router()
            .unwrap_or_else(|| panic!("node `{}` is not a quantum router", self.name))
    }

    pub fn router_mut(&mut self) -> &mut RouterState {
        let name = self.name.clone();
        self.try_router_mut()
            .unwrap_or_else(|| panic!("node `{}` is not a quantum router", name))
    }

    pub fn try_middle_mut(&mut self) -> Option<&mut MiddleState> {
        match &mut self.kind {
            NodeKind::Middle(state) => Some(state),
            _ => None,
        }
    }

    pub fn try_endpoint(&self) -> Option<&EndpointState> {
        match &self.kind {
            NodeKind::Endpoint(state) => Some(state),
            _ => None,
        }
    }

    pub fn try_endpoint_mut(&mut self) -> Option<&mut EndpointState> {
        match &mut self.kind {
            NodeKind::Endpoint(state) => Some(state),
            _ => None,
        }
    }

    pub fn endpoint(&self) -> &EndpointState {
        self.try_endpoint()
            .unwrap_or_else(|| panic!("node `{}` is not an endpoint", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_accessors() {
        let node = Node::new(
            0,
            "r1",
            NodeKind::Router(Box::new(RouterState::new("r1", 8))),
        );
        assert!(node.is_router());
        assert_eq!(node.router().memories.len(), 8);
        assert!(node.try_endpoint().is_none());
    }

    #[test]
    #[should_panic(expected = "not a quantum router")]
    fn test_router_accessor_panics_on_endpoint() {
        let node = Node::new(0, "e1", NodeKind::Endpoint(Box::default()));
        node.router();
    }
}
