// Optimistic mutations.
// Definitions, the coordinator that applies them, and post-settle invalidation.

pub mod coordinator;
pub mod definition;
pub mod invalidation;

pub use coordinator::{MutationCoordinator, MutationPhase, MutationReport, MutationSnapshot};
pub use definition::{MutationDefinition, Speculation, Updater};
pub use invalidation::{InvalidationRule, InvalidationScheduler, Outcome, When};
