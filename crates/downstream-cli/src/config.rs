//! Command-line flags and their mapping onto [`Settings`].
//!
//! Every flag can also be set through the `PLUGIN_*` variables Drone passes
//! to plugin steps.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use downstream_core::{server_with_defaults, DispatchRetry, ParamSources, Settings, WaitPolicy};

/// Fallback variables for the server address, in priority order.
const SERVER_VARS: &[&str] = &["DOWNSTREAM_SERVER"];
/// Fallback variables for the access token, in priority order.
const TOKEN_VARS: &[&str] = &["DRONE_TOKEN", "DOWNSTREAM_TOKEN"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnDispatchError {
    /// Retry on the next tick until the timeout
    Retry,
    /// Fail the entry immediately
    Fail,
}

impl From<OnDispatchError> for DispatchRetry {
    fn from(value: OnDispatchError) -> Self {
        match value {
            OnDispatchError::Retry => DispatchRetry::RetryUntilTimeout,
            OnDispatchError::Fail => DispatchRetry::FailFast,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "drone-downstream")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Trigger a downstream drone build", long_about = None)]
pub struct Cli {
    /// List of repositories to trigger (owner/name[@branch[@environment]])
    #[arg(long, env = "PLUGIN_REPOSITORIES", value_delimiter = ',', required = true)]
    pub repositories: Vec<String>,

    /// Trigger a drone build on a custom server
    #[arg(long, env = "PLUGIN_SERVER")]
    pub server: Option<String>,

    /// Drone API token from your user settings
    #[arg(long, env = "PLUGIN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Create a new build instead of restarting the existing one
    #[arg(long, env = "PLUGIN_FORK")]
    pub fork: bool,

    /// Wait for any currently running builds to finish
    #[arg(long, env = "PLUGIN_WAIT")]
    pub wait: bool,

    /// How long to wait on any currently running builds
    #[arg(
        long,
        env = "PLUGIN_WAIT_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,

    /// How often to check a running build while waiting
    #[arg(
        long,
        env = "PLUGIN_TICK_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub tick_interval: Duration,

    /// Trigger last successful build
    #[arg(long, env = "PLUGIN_LAST_SUCCESSFUL")]
    pub last_successful: bool,

    /// Block until the triggered build is finished
    #[arg(long, env = "PLUGIN_BLOCK")]
    pub block: bool,

    /// How long to block on the triggered build
    #[arg(
        long,
        env = "PLUGIN_BLOCK_TIMEOUT",
        default_value = "60m",
        value_parser = humantime::parse_duration
    )]
    pub block_timeout: Duration,

    /// How often to check the triggered build while blocking
    #[arg(
        long,
        env = "PLUGIN_BLOCK_TICK_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub block_tick_interval: Duration,

    /// Environment to trigger deploy for the respective build
    #[arg(long, env = "PLUGIN_DEPLOY")]
    pub deploy: Option<String>,

    /// List of params (key=value or file paths of params) to pass to triggered builds
    #[arg(long, env = "PLUGIN_PARAMS", value_delimiter = ',')]
    pub params: Vec<String>,

    /// List of environment variables to pass to triggered builds
    #[arg(long, env = "PLUGIN_PARAMS_FROM_ENV", value_delimiter = ',')]
    pub params_from_env: Vec<String>,

    /// What to do when a trigger fails while waiting on a running build
    #[arg(long, env = "PLUGIN_ON_DISPATCH_ERROR", value_enum, default_value = "retry")]
    pub on_dispatch_error: OnDispatchError,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    pub json: bool,

    #[arg(long, env = "DRONE_SYSTEM_HOST", hide = true)]
    pub system_host: Option<String>,

    #[arg(long, env = "DRONE_SYSTEM_PROTO", hide = true)]
    pub system_proto: Option<String>,

    /// Build number of the pipeline running this plugin
    #[arg(long, env = "DRONE_BUILD_NUMBER", hide = true)]
    pub upstream_build_number: Option<String>,
}

impl Cli {
    /// Build settings, falling back to `lookup` for variables clap cannot
    /// bind to a single flag.
    pub fn settings<F>(&self, lookup: F) -> Settings
    where
        F: Fn(&str) -> Option<String>,
    {
        let first_set = |explicit: &Option<String>, fallbacks: &[&str]| {
            explicit
                .clone()
                .filter(|v| !v.is_empty())
                .or_else(|| fallbacks.iter().find_map(|&k| lookup(k).filter(|v| !v.is_empty())))
                .unwrap_or_default()
        };

        let server = first_set(&self.server, SERVER_VARS);
        let server = server_with_defaults(
            &server,
            self.system_host.as_deref().unwrap_or_default(),
            self.system_proto.as_deref().unwrap_or_default(),
        );

        Settings {
            repositories: self
                .repositories
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            server,
            token: first_set(&self.token, TOKEN_VARS),
            fork: self.fork,
            deploy: self.deploy.clone().filter(|d| !d.is_empty()),
            policy: WaitPolicy {
                wait: self.wait,
                last_successful_only: self.last_successful,
                timeout: self.timeout,
                tick_interval: self.tick_interval,
                block_after_trigger: self.block,
                block_timeout: self.block_timeout,
                block_tick_interval: self.block_tick_interval,
                dispatch_retry: self.on_dispatch_error.into(),
            },
            params: ParamSources {
                tokens: self.params.clone(),
                from_env: self.params_from_env.clone(),
                upstream_build_number: self.upstream_build_number.clone(),
            },
        }
    }
}
