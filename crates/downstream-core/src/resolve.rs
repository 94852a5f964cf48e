//! Build resolution: decide which remote build a trigger applies to.

use futures::StreamExt;
use tracing::debug;

use crate::build::RemoteBuild;
use crate::client::{build_history, BuildClient};
use crate::error::DownstreamError;
use crate::repo_ref::RepoTarget;
use crate::settings::WaitPolicy;
use crate::Result;

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Safe to trigger against this build now.
    Ready(RemoteBuild),
    /// The build is still running and the policy says to wait for it.
    InFlight(RemoteBuild),
}

impl Resolution {
    pub fn build(&self) -> &RemoteBuild {
        match self {
            Resolution::Ready(build) | Resolution::InFlight(build) => build,
        }
    }
}

/// Resolves the build to act on for one repository entry.
pub struct Resolver<'a> {
    client: &'a dyn BuildClient,
    policy: &'a WaitPolicy,
}

impl<'a> Resolver<'a> {
    pub fn new(client: &'a dyn BuildClient, policy: &'a WaitPolicy) -> Self {
        Resolver { client, policy }
    }

    /// Run one resolution pass.
    ///
    /// `deploying` selects the deploy rules: the selector is a build number,
    /// or a branch when last-successful is set.
    pub async fn resolve(&self, target: &RepoTarget, deploying: bool) -> Result<Resolution> {
        let build = if deploying {
            self.resolve_deploy(target).await?
        } else {
            self.resolve_latest(target).await?
        };

        debug!(
            repo = %target.slug(),
            build = build.number,
            status = %build.status,
            "resolved build"
        );

        if self.policy.wait && build.status.is_active() {
            Ok(Resolution::InFlight(build))
        } else {
            Ok(Resolution::Ready(build))
        }
    }

    async fn resolve_deploy(&self, target: &RepoTarget) -> Result<RemoteBuild> {
        if self.policy.last_successful_only {
            return self.last_successful(target, &target.selector).await;
        }

        let number: i64 = target.selector.parse().map_err(|_| {
            DownstreamError::Config(format!(
                "for deploy build no must be numeric only, got {:?}",
                target.selector
            ))
        })?;
        self.client
            .build(&target.owner, &target.name, number)
            .await
            .map_err(|source| DownstreamError::Resolve {
                entry: target.slug(),
                source,
            })
    }

    async fn resolve_latest(&self, target: &RepoTarget) -> Result<RemoteBuild> {
        let latest = self
            .client
            .last_build(&target.owner, &target.name, &target.selector)
            .await
            .map_err(|source| DownstreamError::Resolve {
                entry: target.slug(),
                source,
            })?;

        if !self.policy.last_successful_only || latest.status.is_success() {
            return Ok(latest);
        }

        // Without a branch, search the branch the latest build ran on.
        let branch = if target.selector.is_empty() {
            latest.source.clone()
        } else {
            target.selector.clone()
        };
        self.last_successful(target, &branch).await
    }

    /// First passing build on `branch`, newest first. Stops paging at the
    /// first match.
    async fn last_successful(&self, target: &RepoTarget, branch: &str) -> Result<RemoteBuild> {
        let mut history = build_history(self.client, &target.owner, &target.name);
        while let Some(item) = history.next().await {
            let build = item.map_err(|source| DownstreamError::Resolve {
                entry: target.slug(),
                source,
            })?;
            if build.source == branch && build.status.is_success() {
                return Ok(build);
            }
        }
        Err(DownstreamError::NoSuccessfulBuild(target.slug()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildStatus;
    use crate::error::ClientError;
    use crate::fakes::MemoryBuildClient;
    use crate::repo_ref::RepoRef;

    fn target(reference: &str) -> RepoTarget {
        RepoRef::parse(reference).unwrap().target
    }

    #[tokio::test]
    async fn test_latest_ready_without_wait() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(7, BuildStatus::Running)));
        let policy = WaitPolicy::default();

        let resolution = Resolver::new(&client, &policy)
            .resolve(&target("octocat/hello-world"), false)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Ready(RemoteBuild::new(7, BuildStatus::Running)));
    }

    #[tokio::test]
    async fn test_latest_in_flight_with_wait() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(7, BuildStatus::Pending)));
        let policy = WaitPolicy {
            wait: true,
            ..Default::default()
        };

        let resolution = Resolver::new(&client, &policy)
            .resolve(&target("octocat/hello-world@master"), false)
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::InFlight(ref b) if b.number == 7));
        assert_eq!(client.calls().last_build_branches, vec!["master".to_string()]);
    }

    #[tokio::test]
    async fn test_last_successful_scans_branch_history() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(9, BuildStatus::Failure).on_branch("master")));
        client.set_history(vec![
            vec![
                RemoteBuild::new(9, BuildStatus::Failure).on_branch("master"),
                RemoteBuild::new(8, BuildStatus::Success).on_branch("feature"),
            ],
            vec![RemoteBuild::new(6, BuildStatus::Success).on_branch("master")],
            vec![RemoteBuild::new(3, BuildStatus::Success).on_branch("master")],
        ]);
        let policy = WaitPolicy {
            last_successful_only: true,
            ..Default::default()
        };

        let resolution = Resolver::new(&client, &policy)
            .resolve(&target("o/n@master"), false)
            .await
            .unwrap();
        assert_eq!(resolution.build().number, 6);
        assert_eq!(client.calls().list_builds, 2);
    }

    #[tokio::test]
    async fn test_last_successful_skips_scan_when_latest_passes() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(9, BuildStatus::Success).on_branch("master")));
        let policy = WaitPolicy {
            last_successful_only: true,
            ..Default::default()
        };

        let resolution = Resolver::new(&client, &policy)
            .resolve(&target("o/n@master"), false)
            .await
            .unwrap();
        assert_eq!(resolution.build().number, 9);
        assert_eq!(client.calls().list_builds, 0);
    }

    #[tokio::test]
    async fn test_last_successful_without_match() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Ok(RemoteBuild::new(9, BuildStatus::Failure).on_branch("master")));
        client.set_history(vec![vec![
            RemoteBuild::new(9, BuildStatus::Failure).on_branch("master"),
            RemoteBuild::new(8, BuildStatus::Success).on_branch("develop"),
        ]]);
        let policy = WaitPolicy {
            last_successful_only: true,
            ..Default::default()
        };

        let err = Resolver::new(&client, &policy)
            .resolve(&target("o/n@master"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DownstreamError::NoSuccessfulBuild(_)));
    }

    #[tokio::test]
    async fn test_deploy_by_build_number() {
        let client = MemoryBuildClient::new();
        client.push_build(42, Ok(RemoteBuild::new(42, BuildStatus::Success)));
        let policy = WaitPolicy::default();

        let resolution = Resolver::new(&client, &policy)
            .resolve(&target("o/n@42"), true)
            .await
            .unwrap();
        assert_eq!(resolution.build().number, 42);
        assert_eq!(client.calls().last_build, 0);
    }

    #[tokio::test]
    async fn test_deploy_branch_uses_last_successful() {
        let client = MemoryBuildClient::new();
        client.set_history(vec![vec![
            RemoteBuild::new(5, BuildStatus::Running).on_branch("release"),
            RemoteBuild::new(4, BuildStatus::Success).on_branch("release"),
        ]]);
        let policy = WaitPolicy {
            last_successful_only: true,
            ..Default::default()
        };

        let resolution = Resolver::new(&client, &policy)
            .resolve(&target("o/n@release"), true)
            .await
            .unwrap();
        assert_eq!(resolution.build().number, 4);
    }

    #[tokio::test]
    async fn test_missing_build_is_resolve_error() {
        let client = MemoryBuildClient::new();
        client.push_last_build(Err(ClientError::NotFound("o/n".into())));
        let policy = WaitPolicy::default();

        let err = Resolver::new(&client, &policy)
            .resolve(&target("o/n"), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownstreamError::Resolve { source: ClientError::NotFound(_), .. }
        ));
    }
}
