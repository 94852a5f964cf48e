//! Poll/wait state machine for a single repository entry.
//!
//! ```text
//! Resolving -> (WaitingForIdle <-> Resolving) -> Triggering -> Done
//!                                                     \-> Blocking -> Done
//! any non-Done state -> Failed | TimedOut | Canceled
//! ```
//!
//! The trigger phase ticks every `tick_interval` until `timeout`; the
//! optional blocking phase has its own interval and deadline. Cancellation
//! is only observed while blocking, and only when the interrupt arrives
//! after blocking has started.

use std::fmt;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::build::RemoteBuild;
use crate::client::BuildClient;
use crate::dispatch::{Dispatcher, TriggerRequest};
use crate::error::DownstreamError;
use crate::params::ParameterSet;
use crate::repo_ref::RepoTarget;
use crate::resolve::{Resolution, Resolver};
use crate::settings::{TriggerMode, WaitPolicy};

/// States of the per-entry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollState {
    Resolving,
    WaitingForIdle,
    Triggering,
    Blocking,
    Done,
    Failed,
    TimedOut,
    Canceled,
}

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Trigger,
    Block,
}

/// Final result for one entry.
#[derive(Debug)]
pub enum EntryOutcome {
    /// The trigger succeeded and, when blocking, the build passed.
    Done { build: RemoteBuild },
    Failed { error: DownstreamError },
    /// The phase deadline elapsed. `build` is set when a build had already
    /// been triggered; it is left running.
    TimedOut {
        phase: Phase,
        timeout: Duration,
        build: Option<i64>,
    },
    /// Interrupted while blocking; `remote_canceled` reports whether the
    /// server accepted the cancel call.
    Canceled { build: i64, remote_canceled: bool },
}

impl EntryOutcome {
    pub fn state(&self) -> PollState {
        match self {
            EntryOutcome::Done { .. } => PollState::Done,
            EntryOutcome::Failed { .. } => PollState::Failed,
            EntryOutcome::TimedOut { .. } => PollState::TimedOut,
            EntryOutcome::Canceled { .. } => PollState::Canceled,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, EntryOutcome::Done { .. })
    }

    pub fn error(&self) -> Option<&DownstreamError> {
        match self {
            EntryOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

impl From<DownstreamError> for EntryOutcome {
    fn from(error: DownstreamError) -> Self {
        EntryOutcome::Failed { error }
    }
}

impl fmt::Display for EntryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryOutcome::Done { build } => write!(f, "build {} triggered", build.number),
            EntryOutcome::Failed { error } => write!(f, "{error}"),
            EntryOutcome::TimedOut {
                phase: Phase::Trigger,
                timeout,
                ..
            } => write!(f, "timed out waiting on a build after {timeout:?}"),
            EntryOutcome::TimedOut {
                phase: Phase::Block,
                timeout,
                build,
            } => write!(
                f,
                "timed out after {timeout:?} waiting for build {}",
                build.unwrap_or_default()
            ),
            EntryOutcome::Canceled {
                build,
                remote_canceled: true,
            } => write!(f, "canceled downstream build {build}"),
            EntryOutcome::Canceled { build, .. } => {
                write!(f, "interrupted; could not cancel downstream build {build}")
            }
        }
    }
}

/// Tracks and logs state transitions.
struct Machine<'a> {
    entry: &'a str,
    state: PollState,
}

impl<'a> Machine<'a> {
    fn new(entry: &'a str) -> Self {
        Machine {
            entry,
            state: PollState::Resolving,
        }
    }

    fn enter(&mut self, next: PollState) {
        if self.state != next {
            debug!(entry = self.entry, from = ?self.state, to = ?next, "state transition");
            self.state = next;
        }
    }
}

/// First tick fires one `period` after start, then every `period`.
fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Drives one entry from resolution to a terminal outcome.
pub struct Poller<'a> {
    client: &'a dyn BuildClient,
    policy: &'a WaitPolicy,
    cancel: CancellationToken,
}

impl<'a> Poller<'a> {
    pub fn new(
        client: &'a dyn BuildClient,
        policy: &'a WaitPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Poller {
            client,
            policy,
            cancel,
        }
    }

    /// Resolve, trigger and optionally block on one entry.
    pub async fn run(
        &self,
        target: &RepoTarget,
        mode: &TriggerMode,
        params: &ParameterSet,
    ) -> EntryOutcome {
        let entry = target.slug();
        let mut machine = Machine::new(&entry);

        let triggered = match self.trigger(&mut machine, target, mode, params).await {
            Ok(build) => build,
            Err(outcome) => {
                machine.enter(outcome.state());
                return outcome;
            }
        };

        if !self.policy.block_after_trigger {
            machine.enter(PollState::Done);
            return EntryOutcome::Done { build: triggered };
        }

        machine.enter(PollState::Blocking);
        let outcome = self.block(target, triggered).await;
        machine.enter(outcome.state());
        outcome
    }

    async fn trigger(
        &self,
        machine: &mut Machine<'_>,
        target: &RepoTarget,
        mode: &TriggerMode,
        params: &ParameterSet,
    ) -> Result<RemoteBuild, EntryOutcome> {
        let resolver = Resolver::new(self.client, self.policy);
        let dispatcher = Dispatcher::new(self.client);
        let deploying = mode.environment().is_some();

        let deadline = Instant::now() + self.policy.timeout;
        let mut tick = ticker(self.policy.tick_interval);
        let mut waiting = false;

        loop {
            tokio::select! {
                biased;
                _ = sleep_until(deadline) => {
                    return Err(EntryOutcome::TimedOut {
                        phase: Phase::Trigger,
                        timeout: self.policy.timeout,
                        build: None,
                    });
                }
                _ = tick.tick() => {}
            }

            machine.enter(PollState::Resolving);
            let build = match resolver.resolve(target, deploying).await {
                Ok(Resolution::Ready(build)) => build,
                Ok(Resolution::InFlight(build)) => {
                    if !waiting {
                        info!(
                            "Latest build for {} is #{} with a status of {}. Will retry for {:?}.",
                            machine.entry, build.number, build.status, self.policy.timeout
                        );
                    }
                    waiting = true;
                    machine.enter(PollState::WaitingForIdle);
                    continue;
                }
                Err(err) if waiting && err.is_retryable() => {
                    warn!("{err}; retrying");
                    machine.enter(PollState::WaitingForIdle);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            machine.enter(PollState::Triggering);
            let request = TriggerRequest {
                target,
                mode,
                build: &build,
                params,
            };
            match dispatcher.dispatch(&request).await {
                Ok(triggered) => {
                    log_params(params);
                    return Ok(triggered);
                }
                Err(err) if waiting && self.policy.retries_dispatch() => {
                    warn!("{err}; retrying");
                    machine.enter(PollState::WaitingForIdle);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn block(&self, target: &RepoTarget, triggered: RemoteBuild) -> EntryOutcome {
        let number = triggered.number;
        info!("blocking until triggered build {} is finished", number);

        // An interrupt taken during the trigger phase stays on the token; it
        // must not cancel a build that was triggered after it.
        let interruptible = !self.cancel.is_cancelled();
        if !interruptible {
            debug!("interrupt received before blocking; not canceling build {}", number);
        }

        let deadline = Instant::now() + self.policy.block_timeout;
        let mut tick = ticker(self.policy.block_tick_interval);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if interruptible => {
                    let remote_canceled = match self
                        .client
                        .cancel_build(&target.owner, &target.name, number)
                        .await
                    {
                        Ok(()) => {
                            info!("canceled downstream job {}", number);
                            true
                        }
                        Err(err) => {
                            warn!("could not cancel downstream job {}: {}", number, err);
                            false
                        }
                    };
                    return EntryOutcome::Canceled { build: number, remote_canceled };
                }
                _ = sleep_until(deadline) => {
                    return EntryOutcome::TimedOut {
                        phase: Phase::Block,
                        timeout: self.policy.block_timeout,
                        build: Some(number),
                    };
                }
                _ = tick.tick() => {}
            }

            let build = match self.client.build(&target.owner, &target.name, number).await {
                Ok(build) => build,
                Err(source) => {
                    return DownstreamError::BlockPoll { number, source }.into();
                }
            };

            if build.status.is_success() {
                return EntryOutcome::Done { build };
            }
            if build.status.is_failure() {
                return DownstreamError::BuildFailed {
                    number,
                    status: build.status,
                }
                .into();
            }
            info!("Waiting for build {} in status {}", number, build.status);
        }
    }
}

fn log_params(params: &ParameterSet) {
    if params.is_empty() {
        return;
    }
    info!("  with params:");
    for line in params.summary_lines() {
        info!("  - {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildStatus;
    use crate::error::ClientError;
    use crate::fakes::{MemoryBuildClient, TriggerCall};

    fn target() -> RepoTarget {
        RepoTarget {
            owner: "octocat".into(),
            name: "hello-world".into(),
            selector: "master".into(),
        }
    }

    fn waiting_policy() -> WaitPolicy {
        WaitPolicy {
            wait: true,
            timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_running_build() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Running)));
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Running)));
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        let policy = waiting_policy();

        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(outcome.is_done(), "{outcome}");
        let calls = client.calls();
        assert_eq!(calls.last_build, 3);
        assert_eq!(calls.triggers, vec![TriggerCall::Restart { number: 5 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_retried_while_waiting() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Running)));
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_trigger_result(Err(ClientError::Status {
            status: 500,
            body: "busy".into(),
        }));
        let policy = waiting_policy();

        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(outcome.is_done(), "{outcome}");
        assert_eq!(client.calls().triggers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_fail_fast_policy() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Running)));
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_trigger_result(Err(ClientError::Status {
            status: 500,
            body: "busy".into(),
        }));
        let policy = WaitPolicy {
            dispatch_retry: crate::settings::DispatchRetry::FailFast,
            ..waiting_policy()
        };

        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert_eq!(outcome.state(), PollState::Failed);
        assert_eq!(client.calls().triggers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_without_wait_is_fatal() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_trigger_result(Err(ClientError::Transport("refused".into())));
        let policy = WaitPolicy::default();

        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(matches!(
            outcome.error(),
            Some(DownstreamError::Dispatch { .. })
        ));
        assert_eq!(client.calls().triggers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_errors_retried_only_while_waiting() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Running)));
        client.push_last_build(Err(ClientError::Status {
            status: 502,
            body: "bad gateway".into(),
        }));
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        let policy = waiting_policy();

        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;
        assert!(outcome.is_done(), "{outcome}");
        assert_eq!(client.calls().last_build, 3);

        let client = MemoryBuildClient::new();
        client.push_last_build(Err(ClientError::NotFound("octocat/hello-world".into())));
        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;
        assert_eq!(outcome.state(), PollState::Failed);
        assert_eq!(client.calls().last_build, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_until_success() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_build(100, Ok(RemoteBuild::new(100, BuildStatus::Running)));
        client.push_build(100, Ok(RemoteBuild::new(100, BuildStatus::Success)));
        let policy = WaitPolicy {
            block_after_trigger: true,
            ..Default::default()
        };

        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        match outcome {
            EntryOutcome::Done { build } => assert_eq!(build.number, 100),
            other => panic!("unexpected outcome: {other}"),
        }
        assert_eq!(client.calls().build_numbers, vec![100, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_records_failure_status() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_build(100, Ok(RemoteBuild::new(100, BuildStatus::Killed)));
        let policy = WaitPolicy {
            block_after_trigger: true,
            ..Default::default()
        };

        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(matches!(
            outcome.error(),
            Some(DownstreamError::BuildFailed {
                number: 100,
                status: BuildStatus::Killed
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_timeout_leaves_build_running() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_build(100, Ok(RemoteBuild::new(100, BuildStatus::Running)));
        let policy = WaitPolicy {
            block_after_trigger: true,
            block_timeout: Duration::from_secs(25),
            block_tick_interval: Duration::from_secs(10),
            ..Default::default()
        };

        let outcome = Poller::new(&client, &policy, CancellationToken::new())
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(matches!(
            outcome,
            EntryOutcome::TimedOut {
                phase: Phase::Block,
                build: Some(100),
                ..
            }
        ));
        assert_eq!(client.calls().build_numbers.len(), 2);
        assert!(client.calls().cancels.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_blocking_cancels_remote_build() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_build(100, Ok(RemoteBuild::new(100, BuildStatus::Running)));
        let policy = WaitPolicy {
            block_after_trigger: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(35)).await;
            trigger.cancel();
        });

        let outcome = Poller::new(&client, &policy, cancel)
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(matches!(
            outcome,
            EntryOutcome::Canceled {
                build: 100,
                remote_canceled: true
            }
        ));
        assert_eq!(client.calls().cancels, vec![100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ignored_during_trigger_phase() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Running)));
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        let policy = waiting_policy();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = Poller::new(&client, &policy, cancel)
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(outcome.is_done(), "{outcome}");
        assert!(client.calls().cancels.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_before_blocking_does_not_cancel_build() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_build(100, Ok(RemoteBuild::new(100, BuildStatus::Running)));
        client.push_build(100, Ok(RemoteBuild::new(100, BuildStatus::Success)));
        let policy = WaitPolicy {
            block_after_trigger: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = Poller::new(&client, &policy, cancel)
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(outcome.is_done(), "{outcome}");
        let calls = client.calls();
        assert_eq!(calls.triggers, vec![TriggerCall::Restart { number: 5 }]);
        assert_eq!(calls.build_numbers, vec![100, 100]);
        assert!(calls.cancels.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_remote_cancel_still_ends_canceled() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(5, BuildStatus::Success)));
        client.push_build(100, Ok(RemoteBuild::new(100, BuildStatus::Running)));
        client.fail_cancel(ClientError::Status {
            status: 403,
            body: "forbidden".into(),
        });
        let policy = WaitPolicy {
            block_after_trigger: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let outcome = Poller::new(&client, &policy, cancel)
            .run(&target(), &TriggerMode::Restart, &ParameterSet::new())
            .await;

        assert!(matches!(
            outcome,
            EntryOutcome::Canceled {
                build: 100,
                remote_canceled: false
            }
        ));
        assert_eq!(
            outcome.to_string(),
            "interrupted; could not cancel downstream build 100"
        );
        assert_eq!(client.calls().cancels, vec![100]);
    }
}
