//! Trigger dispatch: one mutating call per request.

use tracing::info;

use crate::build::RemoteBuild;
use crate::client::BuildClient;
use crate::error::DownstreamError;
use crate::params::ParameterSet;
use crate::repo_ref::RepoTarget;
use crate::settings::TriggerMode;
use crate::Result;

/// A fully resolved trigger.
#[derive(Debug, Clone)]
pub struct TriggerRequest<'a> {
    pub target: &'a RepoTarget,
    pub mode: &'a TriggerMode,
    /// Build the action is derived from.
    pub build: &'a RemoteBuild,
    pub params: &'a ParameterSet,
}

/// Issues trigger calls against the build server.
pub struct Dispatcher<'a> {
    client: &'a dyn BuildClient,
}

impl<'a> Dispatcher<'a> {
    pub fn new(client: &'a dyn BuildClient) -> Self {
        Dispatcher { client }
    }

    /// Send exactly one restart, fork or promote call.
    ///
    /// Returns the build created or restarted by the server.
    pub async fn dispatch(&self, request: &TriggerRequest<'_>) -> Result<RemoteBuild> {
        let TriggerRequest {
            target,
            mode,
            build,
            params,
        } = request;
        let (owner, name) = (target.owner.as_str(), target.name.as_str());

        let result = match mode {
            TriggerMode::Restart => {
                self.client
                    .restart_build(owner, name, build.number, params)
                    .await
            }
            TriggerMode::Fork => self.client.fork_build(owner, name, build, params).await,
            TriggerMode::Promote(environment) => {
                self.client
                    .promote_build(owner, name, build.number, environment, params)
                    .await
            }
        };

        let triggered = result.map_err(|source| DownstreamError::Dispatch {
            entry: target.slug(),
            action: mode.action(),
            source,
        })?;

        match mode {
            TriggerMode::Restart => {
                info!("Restarting build {} for {}", build.number, target.slug())
            }
            TriggerMode::Fork => info!(
                "Starting new build {} for {} from build {}",
                triggered.number,
                target.slug(),
                build.number
            ),
            TriggerMode::Promote(environment) => info!(
                "Starting deploy for {} env - {} build - {}",
                target.slug(),
                environment,
                build.number
            ),
        }

        Ok(triggered)
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

    #[tokio::test]
    async fn test_each_mode_issues_one_call() {
        let mut params = ParameterSet::new();
        params.insert("FOO", "bar");
        let build = RemoteBuild::new(12, BuildStatus::Success).on_branch("master");
        let target = target();

        for mode in [
            TriggerMode::Restart,
            TriggerMode::Fork,
            TriggerMode::Promote("production".into()),
        ] {
            let client = MemoryBuildClient::new();
            let request = TriggerRequest {
                target: &target,
                mode: &mode,
                build: &build,
                params: &params,
            };
            Dispatcher::new(&client).dispatch(&request).await.unwrap();

            let calls = client.calls();
            assert_eq!(calls.triggers.len(), 1);
            let expected = match &mode {
                TriggerMode::Restart => TriggerCall::Restart { number: 12 },
                TriggerMode::Fork => TriggerCall::Fork { number: 12 },
                TriggerMode::Promote(env) => TriggerCall::Promote {
                    number: 12,
                    environment: env.clone(),
                },
            };
            assert_eq!(calls.triggers[0], expected);
            assert_eq!(calls.trigger_params[0].get("FOO"), Some("bar"));
        }
    }

    #[tokio::test]
    async fn test_failure_is_dispatch_error() {
        let client = MemoryBuildClient::new();
        client.push_trigger_result(Err(ClientError::Status {
            status: 409,
            body: "conflict".into(),
        }));
        let build = RemoteBuild::new(3, BuildStatus::Success);
        let target = target();
        let params = ParameterSet::new();
        let request = TriggerRequest {
            target: &target,
            mode: &TriggerMode::Restart,
            build: &build,
            params: &params,
        };

        let err = Dispatcher::new(&client).dispatch(&request).await.unwrap_err();
        assert!(matches!(err, DownstreamError::Dispatch { action: "restart", .. }));
    }
}
