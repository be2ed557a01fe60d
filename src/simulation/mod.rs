pub mod event;
pub mod random;
pub mod timeline;

pub use event::{Event, EventId, EventPayload, Time, DEFAULT_PRIORITY, SECOND};
pub use random::SimRng;
pub use timeline::{Simulation, Timeline, TimelineStats};
