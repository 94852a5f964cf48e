//! Build server client abstraction.
//!
//! `BuildClient` is the only way the core talks to the build server. The
//! Drone implementation lives in the `downstream-drone` crate; tests use
//! [`MemoryBuildClient`](crate::fakes::MemoryBuildClient).

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::build::RemoteBuild;
use crate::error::ClientError;
use crate::params::ParameterSet;

/// Result type for client calls
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Operations the core needs from the build server.
///
/// Every call is a self-contained, authenticated request; implementations
/// are shared by reference across all entries and ticks.
#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Most recent build, optionally restricted to a branch (empty = any).
    async fn last_build(&self, owner: &str, name: &str, branch: &str) -> ClientResult<RemoteBuild>;

    /// A build by number.
    async fn build(&self, owner: &str, name: &str, number: i64) -> ClientResult<RemoteBuild>;

    /// One page of build history, newest first. Pages start at 1; an empty
    /// page marks the end of history.
    async fn list_builds(&self, owner: &str, name: &str, page: u32)
        -> ClientResult<Vec<RemoteBuild>>;

    /// Re-run an existing build.
    async fn restart_build(
        &self,
        owner: &str,
        name: &str,
        number: i64,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild>;

    /// Create a new build from the commit and branch of an existing one.
    async fn fork_build(
        &self,
        owner: &str,
        name: &str,
        build: &RemoteBuild,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild>;

    /// Create a deployment of an existing build to `environment`.
    async fn promote_build(
        &self,
        owner: &str,
        name: &str,
        number: i64,
        environment: &str,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild>;

    /// Cancel a running build.
    async fn cancel_build(&self, owner: &str, name: &str, number: i64) -> ClientResult<()>;
}

/// Lazily page through a repository's build history, newest first.
///
/// Pages are fetched only as the stream is polled, so a consumer that stops
/// at the first match never downloads the rest of the history. Calling this
/// again restarts from page 1.
pub fn build_history<'a>(
    client: &'a dyn BuildClient,
    owner: &'a str,
    name: &'a str,
) -> BoxStream<'a, ClientResult<RemoteBuild>> {
    stream::unfold(Some(1u32), move |page| async move {
        let page = page?;
        match client.list_builds(owner, name, page).await {
            Ok(builds) if builds.is_empty() => None,
            Ok(builds) => {
                let items = stream::iter(builds.into_iter().map(Ok));
                Some((items.boxed(), Some(page + 1)))
            }
            Err(err) => Some((stream::once(async { Err::<RemoteBuild, _>(err) }).boxed(), None)),
        }
    })
    .flatten()
    .boxed()
}
