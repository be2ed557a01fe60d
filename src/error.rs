use thiserror::Error;

/// Errors surfaced to the caller before or during a simulation run.
///
/// Stochastic outcomes (photon loss, BSM failure, decoherence) are never
/// errors; they are folded into protocol state and counters. Invariant
/// violations (scheduling into the past, double-entangling a memory,
/// writing a committed reservation) are programmer errors and panic with a
/// diagnostic instead of passing through this type.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("duplicate node name `{0}` in topology")]
    DuplicateNode(String),

    #[error("unknown node `{0}` referenced by `{1}`")]
    UnknownNode(String, String),

    #[error("no route from `{0}` to `{1}`")]
    Unroutable(String, String),

    #[error("node `{0}` is not a quantum router")]
    NotARouter(String),

    #[error("simulation already initialized")]
    AlreadyInitialized,

    #[error("simulation must be initialized before run()")]
    NotInitialized,

    #[error("invalid topology config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}
