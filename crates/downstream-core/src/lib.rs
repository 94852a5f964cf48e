//! drone-downstream core
//!
//! Triggers downstream builds on a Drone server and optionally waits for
//! them:
//! - parses `owner/name[@branch[@environment]]` references
//! - merges build parameters from literals, dotenv files and the environment
//! - resolves the build to act on (latest, last successful, or by number)
//! - restarts, forks or promotes it, retrying at a fixed tick while waiting
//! - optionally blocks until the triggered build finishes

pub mod build;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod fakes;
pub mod params;
pub mod poll;
pub mod repo_ref;
pub mod resolve;
pub mod runner;
pub mod settings;
pub mod telemetry;

// Re-export key types
pub use build::{BuildStatus, RemoteBuild};
pub use client::{build_history, BuildClient, ClientResult};
pub use dispatch::{Dispatcher, TriggerRequest};
pub use error::{ClientError, DownstreamError};
pub use params::{parse_params, ParamSources, ParameterSet, REDACTED, UPSTREAM_BUILD_NUMBER_PARAM};
pub use poll::{EntryOutcome, Phase, PollState, Poller};
pub use repo_ref::{RepoRef, RepoTarget};
pub use resolve::{Resolution, Resolver};
pub use runner::{EntryReport, RunSummary, Runner};
pub use settings::{
    server_with_defaults, validate_deploy_selector, DispatchRetry, Settings, TriggerMode,
    WaitPolicy,
};
pub use telemetry::init_tracing;

/// Result type for downstream operations
pub type Result<T> = std::result::Result<T, DownstreamError>;
