//! Coordination engine for watching a provisioning request: stage polling, incremental output
//! tailing and paged detail polling, all fanned out through replaying multicast streams.

pub mod config;
pub mod detail;
pub mod multicast;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod tailer;

pub use config::{ConfigError, PollingConfig, PollingTable};
pub use detail::{poll_until_superseded, PagedStageDetailPoller};
pub use multicast::{Multicast, Subscription};
pub use orchestrator::{PollPhase, StageFeed, StagePollingOrchestrator};
pub use registry::{Claims, OwnerId, PollRegistry, RegistryEntry};
pub use session::ViewingSession;
pub use tailer::IncrementalLogTailer;
