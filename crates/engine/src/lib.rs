//! objwatch engine: runs one list-then-watch supervisor per watch target
//! and turns raw events into deduplicated change events.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod sink;
pub mod supervisor;
pub mod translate;

pub use config::{EngineConfig, Mode, PlannedTarget, TargetConfig};
pub use engine::{Engine, EngineHandle, TargetOutcome, TargetReport, TargetSpec};
pub use error::{ConfigError, EngineError, SinkError};
pub use resolver::{Resolution, Resolver};
pub use sink::{ChannelSink, CollectingSink, EventSink};
pub use supervisor::{RestartBackoff, Supervisor, SupervisorExit, SupervisorState};
pub use translate::{attributes, translate};
