pub mod artifacts;
pub mod backends;
pub mod context;
pub mod error;
pub mod events;
pub mod prediction;
pub mod request;

pub use error::{AttemptFailure, GenerationError, StepId};
