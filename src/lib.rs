pub mod config;
pub mod context;
pub mod dataset;
pub mod errors;
pub mod evolve;
pub mod genome;
pub mod metrics;
pub mod network;
pub mod repl;
pub mod squash;
pub mod trainer;

pub use context::Context;
pub use errors::{CbError, CbResult};
pub use genome::Genome;
pub use metrics::Metrics;
pub use network::Network;
pub use squash::{FastSigmoid, Squasher};
