//! Remote build snapshots as reported by the build server.

use serde::{Deserialize, Serialize};

/// Build status reported by the server.
///
/// Which statuses are terminal is decided here and nowhere else; the poll
/// loop only asks [`BuildStatus::is_terminal`] and [`BuildStatus::is_success`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Skipped,
    Blocked,
    Declined,
    WaitingOnDependencies,
    #[default]
    Pending,
    Running,
    /// Passing.
    Success,
    /// Failing.
    Failure,
    Killed,
    Error,
    /// Any status this client does not know about. Treated as still active.
    #[serde(other)]
    Unknown,
}

impl BuildStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Skipped => "skipped",
            BuildStatus::Blocked => "blocked",
            BuildStatus::Declined => "declined",
            BuildStatus::WaitingOnDependencies => "waiting_on_dependencies",
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Killed => "killed",
            BuildStatus::Error => "error",
            BuildStatus::Unknown => "unknown",
        }
    }

    /// No further transition is expected from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Skipped
                | BuildStatus::Declined
                | BuildStatus::Success
                | BuildStatus::Failure
                | BuildStatus::Killed
                | BuildStatus::Error
        )
    }

    /// The build is queued, running or otherwise not finished yet.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Success)
    }

    /// Terminal and not passing.
    pub fn is_failure(&self) -> bool {
        self.is_terminal() && !self.is_success()
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot of one build record on the server.
///
/// Fetched fresh on every tick and never mutated locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteBuild {
    #[serde(default)]
    pub id: i64,
    pub number: i64,
    #[serde(default)]
    pub status: BuildStatus,
    /// Trigger event (`push`, `promote`, `custom`, ...).
    #[serde(default)]
    pub event: String,
    /// Source branch.
    #[serde(default)]
    pub source: String,
    /// Target branch.
    #[serde(default)]
    pub target: String,
    /// Commit sha the build ran against.
    #[serde(default)]
    pub after: String,
    /// Deployment environment, for promotions.
    #[serde(default)]
    pub deploy_to: String,
    #[serde(default)]
    pub link: String,
}

impl RemoteBuild {
    pub fn new(number: i64, status: BuildStatus) -> Self {
        RemoteBuild {
            number,
            status,
            ..Default::default()
        }
    }

    /// Set the source branch.
    pub fn on_branch(mut self, branch: &str) -> Self {
        self.source = branch.to_string();
        self.target = branch.to_string();
        self
    }
}
