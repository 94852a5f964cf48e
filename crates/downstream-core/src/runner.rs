//! Sequential processing of every configured repository entry.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::BuildClient;
use crate::params::ParameterSet;
use crate::poll::{EntryOutcome, Poller};
use crate::repo_ref::RepoRef;
use crate::settings::{validate_deploy_selector, Settings, TriggerMode};

/// Outcome for one entry, keyed by the reference as configured.
#[derive(Debug)]
pub struct EntryReport {
    pub entry: String,
    pub outcome: EntryOutcome,
}

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<EntryReport>,
    /// Entries never started because the run was interrupted.
    pub skipped: Vec<String>,
}

impl RunSummary {
    /// True only when every configured entry reached `Done`.
    pub fn is_success(&self) -> bool {
        self.skipped.is_empty() && self.reports.iter().all(|r| r.outcome.is_done())
    }

    /// The first entry that did not reach `Done`, in input order.
    pub fn first_failure(&self) -> Option<&EntryReport> {
        self.reports.iter().find(|r| !r.outcome.is_done())
    }

    pub fn failed_count(&self) -> usize {
        self.reports.iter().filter(|r| !r.outcome.is_done()).count()
    }
}

/// Runs the state machine for each entry, one at a time, in input order.
pub struct Runner<'a> {
    client: &'a dyn BuildClient,
    settings: &'a Settings,
    params: &'a ParameterSet,
    cancel: CancellationToken,
}

impl<'a> Runner<'a> {
    pub fn new(
        client: &'a dyn BuildClient,
        settings: &'a Settings,
        params: &'a ParameterSet,
        cancel: CancellationToken,
    ) -> Self {
        Runner {
            client,
            settings,
            params,
            cancel,
        }
    }

    /// Process all entries. A failing entry never stops the ones after it,
    /// but no new entry is started once the run has been interrupted.
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();

        for (index, entry) in self.settings.repositories.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let rest = &self.settings.repositories[index..];
                warn!("interrupted; not triggering {} remaining entries", rest.len());
                summary.skipped.extend(rest.iter().cloned());
                break;
            }

            let outcome = self.run_entry(entry).await;
            if outcome.is_done() {
                info!("{}: {}", entry, outcome);
            } else {
                error!("{}: {}", entry, outcome);
            }
            summary.reports.push(EntryReport {
                entry: entry.clone(),
                outcome,
            });
        }

        summary
    }

    async fn run_entry(&self, entry: &str) -> EntryOutcome {
        let repo = match RepoRef::parse(entry) {
            Ok(repo) => repo,
            Err(err) => return err.into(),
        };

        let mode = TriggerMode::select(self.settings.fork, self.settings.environment_for(&repo));
        if mode.environment().is_some() {
            let last_successful = self.settings.policy.last_successful_only;
            if let Err(err) = validate_deploy_selector(&repo.target.selector, last_successful) {
                return err.into();
            }
        }

        Poller::new(self.client, &self.settings.policy, self.cancel.clone())
            .run(&repo.target, &mode, self.params)
            .await
    }
}
