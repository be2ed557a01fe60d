pub mod random_request;

pub use random_request::{RandomRequestApp, ReserveRecord};
