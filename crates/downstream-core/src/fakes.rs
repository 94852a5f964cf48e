//! In-memory fake build server (testing only)
//!
//! `MemoryBuildClient` answers from scripted responses and records every
//! call so tests can assert on exactly what was sent.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::build::{BuildStatus, RemoteBuild};
use crate::client::{BuildClient, ClientResult};
use crate::error::ClientError;
use crate::params::ParameterSet;

/// Number given to the first build created by a trigger call.
pub const FIRST_TRIGGERED_NUMBER: i64 = 100;

/// A trigger call received by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerCall {
    Restart { number: i64 },
    Fork { number: i64 },
    Promote { number: i64, environment: String },
}

/// Everything the fake has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub last_build: usize,
    pub last_build_branches: Vec<String>,
    /// Build numbers passed to `build`, in call order.
    pub build_numbers: Vec<i64>,
    pub list_builds: usize,
    pub triggers: Vec<TriggerCall>,
    /// Parameters sent with each trigger call.
    pub trigger_params: Vec<ParameterSet>,
    pub cancels: Vec<i64>,
}

/// A queue of responses where the last one repeats forever.
#[derive(Debug)]
struct Script<T> {
    responses: VecDeque<T>,
}

impl<T: Clone> Script<T> {
    fn new() -> Self {
        Script {
            responses: VecDeque::new(),
        }
    }

    fn push(&mut self, response: T) {
        self.responses.push_back(response);
    }

    fn next(&mut self) -> Option<T> {
        if self.responses.len() > 1 {
            self.responses.pop_front()
        } else {
            self.responses.front().cloned()
        }
    }
}

#[derive(Debug)]
struct State {
    last_build: Script<ClientResult<RemoteBuild>>,
    builds: HashMap<i64, Script<ClientResult<RemoteBuild>>>,
    history: Vec<Vec<RemoteBuild>>,
    list_error: Option<ClientError>,
    /// Consumed one per trigger call; when empty a new pending build is created.
    trigger_results: VecDeque<ClientResult<RemoteBuild>>,
    cancel_error: Option<ClientError>,
    next_number: i64,
    calls: CallLog,
}

/// Scripted, call-recording [`BuildClient`].
#[derive(Debug)]
pub struct MemoryBuildClient {
    state: Mutex<State>,
}

impl Default for MemoryBuildClient {
    fn default() -> Self {
        MemoryBuildClient {
            state: Mutex::new(State {
                last_build: Script::new(),
                builds: HashMap::new(),
                history: Vec::new(),
                list_error: None,
                trigger_results: VecDeque::new(),
                cancel_error: None,
                next_number: FIRST_TRIGGERED_NUMBER,
                calls: CallLog::default(),
            }),
        }
    }
}

impl MemoryBuildClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `last_build`. The final response repeats.
    pub fn push_last_build(&self, response: ClientResult<RemoteBuild>) {
        self.state.lock().unwrap().last_build.push(response);
    }

    /// Queue a response for `build(number)`. The final response repeats.
    pub fn push_build(&self, number: i64, response: ClientResult<RemoteBuild>) {
        self.state
            .lock()
            .unwrap()
            .builds
            .entry(number)
            .or_insert_with(Script::new)
            .push(response);
    }

    /// Pages returned by `list_builds`, page 1 first.
    pub fn set_history(&self, pages: Vec<Vec<RemoteBuild>>) {
        self.state.lock().unwrap().history = pages;
    }

    pub fn fail_list_builds(&self, error: ClientError) {
        self.state.lock().unwrap().list_error = Some(error);
    }

    /// Queue the result of the next trigger call.
    pub fn push_trigger_result(&self, result: ClientResult<RemoteBuild>) {
        self.state.lock().unwrap().trigger_results.push_back(result);
    }

    pub fn fail_cancel(&self, error: ClientError) {
        self.state.lock().unwrap().cancel_error = Some(error);
    }

    /// Snapshot of the calls received so far.
    pub fn calls(&self) -> CallLog {
        self.state.lock().unwrap().calls.clone()
    }

    fn record_trigger(
        &self,
        call: TriggerCall,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild> {
        let mut state = self.state.lock().unwrap();
        state.calls.triggers.push(call);
        state.calls.trigger_params.push(params.clone());
        match state.trigger_results.pop_front() {
            Some(result) => result,
            None => {
                let number = state.next_number;
                state.next_number += 1;
                Ok(RemoteBuild::new(number, BuildStatus::Pending))
            }
        }
    }
}

#[async_trait]
impl BuildClient for MemoryBuildClient {
    async fn last_build(&self, owner: &str, name: &str, branch: &str) -> ClientResult<RemoteBuild> {
        let mut state = self.state.lock().unwrap();
        state.calls.last_build += 1;
        state.calls.last_build_branches.push(branch.to_string());
        state
            .last_build
            .next()
            .unwrap_or_else(|| Err(ClientError::NotFound(format!("{owner}/{name}"))))
    }

    async fn build(&self, owner: &str, name: &str, number: i64) -> ClientResult<RemoteBuild> {
        let mut state = self.state.lock().unwrap();
        state.calls.build_numbers.push(number);
        state
            .builds
            .get_mut(&number)
            .and_then(Script::next)
            .unwrap_or_else(|| Err(ClientError::NotFound(format!("{owner}/{name}#{number}"))))
    }

    async fn list_builds(
        &self,
        _owner: &str,
        _name: &str,
        page: u32,
    ) -> ClientResult<Vec<RemoteBuild>> {
        let mut state = self.state.lock().unwrap();
        state.calls.list_builds += 1;
        if let Some(err) = &state.list_error {
            return Err(err.clone());
        }
        let index = page.saturating_sub(1) as usize;
        Ok(state.history.get(index).cloned().unwrap_or_default())
    }

    async fn restart_build(
        &self,
        _owner: &str,
        _name: &str,
        number: i64,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild> {
        self.record_trigger(TriggerCall::Restart { number }, params)
    }

    async fn fork_build(
        &self,
        _owner: &str,
        _name: &str,
        build: &RemoteBuild,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild> {
        self.record_trigger(
            TriggerCall::Fork {
                number: build.number,
            },
            params,
        )
    }

    async fn promote_build(
        &self,
        _owner: &str,
        _name: &str,
        number: i64,
        environment: &str,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild> {
        self.record_trigger(
            TriggerCall::Promote {
                number,
                environment: environment.to_string(),
            },
            params,
        )
    }

    async fn cancel_build(&self, _owner: &str, _name: &str, number: i64) -> ClientResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.cancels.push(number);
        match &state.cancel_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
