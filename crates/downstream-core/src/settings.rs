//! Plugin settings and validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DownstreamError;
use crate::params::ParamSources;
use crate::repo_ref::RepoRef;
use crate::Result;

/// Default trigger-phase timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default trigger-phase poll interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Default post-trigger blocking timeout.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Default post-trigger poll interval.
pub const DEFAULT_BLOCK_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Action taken against the resolved build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Re-run the existing build record.
    Restart,
    /// Create a new build from the resolved build's commit.
    Fork,
    /// Deploy the resolved build to an environment.
    Promote(String),
}

impl TriggerMode {
    /// Pick the mode for one entry. An environment (per-entry or global)
    /// always means a promotion.
    pub fn select(fork: bool, environment: Option<&str>) -> Self {
        match environment {
            Some(env) if !env.is_empty() => TriggerMode::Promote(env.to_string()),
            _ if fork => TriggerMode::Fork,
            _ => TriggerMode::Restart,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            TriggerMode::Restart => "restart",
            TriggerMode::Fork => "fork",
            TriggerMode::Promote(_) => "deploy",
        }
    }

    pub fn environment(&self) -> Option<&str> {
        match self {
            TriggerMode::Promote(env) => Some(env),
            _ => None,
        }
    }
}

/// What to do when a trigger call fails while waiting for a build to finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchRetry {
    /// Retry on the next tick until the timeout elapses.
    #[default]
    RetryUntilTimeout,
    /// Fail the entry on the first trigger error.
    FailFast,
}

/// Polling and blocking behaviour for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Wait for an in-flight build to finish before triggering.
    pub wait: bool,
    /// Act on the last passing build instead of the latest one.
    pub last_successful_only: bool,
    /// Trigger-phase deadline.
    pub timeout: Duration,
    /// Trigger-phase poll interval.
    pub tick_interval: Duration,
    /// Block until the triggered build finishes.
    pub block_after_trigger: bool,
    /// Blocking-phase deadline.
    pub block_timeout: Duration,
    /// Blocking-phase poll interval.
    pub block_tick_interval: Duration,
    pub dispatch_retry: DispatchRetry,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            wait: false,
            last_successful_only: false,
            timeout: DEFAULT_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            block_after_trigger: false,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            block_tick_interval: DEFAULT_BLOCK_TICK_INTERVAL,
            dispatch_retry: DispatchRetry::default(),
        }
    }
}

impl WaitPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.wait && self.last_successful_only {
            return Err(DownstreamError::Config(
                "only one of wait and last_successful can be true; choose one".to_string(),
            ));
        }
        if self.tick_interval.is_zero() || self.block_tick_interval.is_zero() {
            return Err(DownstreamError::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a failed trigger call may be retried once waiting has begun.
    pub fn retries_dispatch(&self) -> bool {
        self.dispatch_retry == DispatchRetry::RetryUntilTimeout
    }
}

/// Everything needed to run the plugin.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Raw repository references, parsed per entry.
    pub repositories: Vec<String>,
    pub server: String,
    pub token: String,
    /// Create new builds instead of restarting existing ones.
    pub fork: bool,
    /// Global deploy environment; a per-entry environment overrides it.
    pub deploy: Option<String>,
    pub policy: WaitPolicy,
    pub params: ParamSources,
}

impl Settings {
    /// Checks that need no network access.
    ///
    /// Repository references are not parsed here: a bad reference fails only
    /// its own entry.
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(DownstreamError::Config(
                "you must provide your drone access token".to_string(),
            ));
        }
        if self.server.is_empty() {
            return Err(DownstreamError::Config(
                "you must provide your drone server".to_string(),
            ));
        }
        if self.repositories.is_empty() {
            return Err(DownstreamError::Config(
                "you must provide at least one repository".to_string(),
            ));
        }
        self.policy.validate()
    }

    /// Deploy environment for an entry, if any.
    pub fn environment_for<'a>(&'a self, entry: &'a RepoRef) -> Option<&'a str> {
        entry
            .environment
            .as_deref()
            .or(self.deploy.as_deref())
            .filter(|env| !env.is_empty())
    }
}

/// Check that a deploy selector can be resolved without a network call.
///
/// Deploys need either a numeric build number or, with last-successful, a
/// branch name.
pub fn validate_deploy_selector(selector: &str, last_successful_only: bool) -> Result<()> {
    if selector.is_empty() {
        return Err(DownstreamError::Config(
            "build no or branch must be mentioned for deploy, format repository@build/branch"
                .to_string(),
        ));
    }
    if selector.parse::<i64>().is_err() && !last_successful_only {
        return Err(DownstreamError::Config(
            "for deploy build no must be numeric only or for branch deploy last_successful \
             should be true, format repository@build/branch"
                .to_string(),
        ));
    }
    Ok(())
}

/// Use `server` when set, otherwise build one from the pipeline's host and protocol.
pub fn server_with_defaults(server: &str, host: &str, protocol: &str) -> String {
    if !server.is_empty() {
        return server.to_string();
    }
    if host.is_empty() || protocol.is_empty() {
        return String::new();
    }
    format!("{protocol}://{host}")
}
