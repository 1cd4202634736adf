//! mlnode library
//!
//! Resumable provisioning of a single-node machine-learning platform. The
//! core is a step sequencer that persists the last completed step so an
//! interrupted or paused installation picks up where it stopped.

pub mod cli;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod error;
pub mod marker;
pub mod process_guard;
pub mod sequencer;
pub mod steps;
pub mod tool_args;

// Re-export main types for convenience
pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use config::SetupConfig;
pub use error::{Result, SetupError};
pub use marker::{FileMarkerStore, Marker, MarkerError, MarkerStore, MemoryMarkerStore};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use sequencer::{RunResult, SequenceError, Step, StepAction, StepOutcome, StepSequence};
pub use steps::{Platform, default_sequence};
pub use tool_args::ToolArgs;
