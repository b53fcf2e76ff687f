//! Session layer: the platform-facing side of synchronization.
//!
//! The embedding platform implements [`PlatformDataProvider`] and forwards
//! its join, quit and save events to a [`SessionOrchestrator`].

mod orchestrator;
mod provider;

pub use orchestrator::{JoinOutcome, SessionOrchestrator};
pub use provider::{PlatformDataProvider, ProviderError, SaveHook};
pub use provider::Result as ProviderResult;
