//! Journey automation engine: moves enrolled contacts through multi-step,
//! time-delayed, branching communication sequences.

pub mod collaborators;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod repository;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod template;
pub mod types;
pub mod validation;

pub use engine::{Collaborators, JourneyEngine};
pub use error::{JourneyError, JourneyResult};
pub use evaluator::ConditionEvaluator;
pub use scheduler::{JourneyScheduler, TickReport};
