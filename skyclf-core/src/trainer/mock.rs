//! In-memory container platform for tests and dry runs.
//!
//! Containers are keyed by name and get sequential ids (`c1`, `c2`, ...).
//! A created container runs until [`MockContainerPlatform::finish`] or
//! `stop` gives it an exit code; `wait` resolves at that moment.

use super::logs::encode_log_frame;
use super::platform::{ContainerInfo, ContainerPlatform, ContainerSpec, WaitOutcome};
use crate::error::SkyError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

struct MockContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    exit: watch::Sender<Option<i64>>,
    logs: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    next_id: u64,
    journal: Vec<String>,
    failures: HashMap<String, String>,
    start_delay: Option<Duration>,
}

impl MockState {
    fn by_id(&mut self, id: &str) -> Option<&mut MockContainer> {
        self.containers.values_mut().find(|c| c.id == id)
    }

    fn take_failure(&mut self, op: &str) -> Result<(), SkyError> {
        match self.failures.remove(op) {
            Some(msg) => Err(SkyError::remote(msg)),
            None => Ok(()),
        }
    }

    fn insert(&mut self, name: &str, spec: ContainerSpec, running: bool) -> String {
        self.next_id += 1;
        let id = format!("c{}", self.next_id);
        let (exit, _) = watch::channel(None);
        self.containers.insert(
            name.to_string(),
            MockContainer {
                id: id.clone(),
                spec,
                running,
                exit,
                logs: Vec::new(),
            },
        );
        id
    }
}

/// Mock container platform with a call journal and injectable failures.
pub struct MockContainerPlatform {
    state: Mutex<MockState>,
    /// Exit code reported for containers ended by `stop`.
    pub stop_exit_code: i64,
}

impl Default for MockContainerPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            stop_exit_code: 143,
        }
    }

    /// Register an existing container, as if created by compose.
    pub fn seed(&self, name: &str, spec: ContainerSpec, running: bool) -> String {
        self.state.lock().unwrap().insert(name, spec, running)
    }

    /// End the named container's current process with `code`.
    pub fn finish(&self, name: &str, code: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.containers.get_mut(name) {
            c.running = false;
            c.exit.send_replace(Some(code));
        }
    }

    /// Replace the raw (framed) log bytes of the named container.
    pub fn set_logs(&self, name: &str, raw: Vec<u8>) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(name) {
            c.logs = raw;
        }
    }

    /// Append one stdout line to the named container's logs.
    pub fn push_log(&self, name: &str, line: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(name) {
            c.logs.extend(encode_log_frame(1, line.as_bytes()));
        }
    }

    /// Make the next call of `op` ("inspect", "create", "wait", ...) fail.
    pub fn fail_next(&self, op: &str, msg: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(op.to_string(), msg.to_string());
    }

    /// Delay every `start` call, to widen race windows in tests.
    pub fn set_start_delay(&self, delay: Duration) {
        self.state.lock().unwrap().start_delay = Some(delay);
    }

    /// Calls received so far, e.g. `"create skyclf-trainer"`, `"start c2"`.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    pub fn snapshot(&self, name: &str) -> Option<ContainerInfo> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| ContainerInfo {
                id: c.id.clone(),
                running: c.running,
                spec: c.spec.clone(),
            })
    }

    fn record(&self, op: &str, target: &str) -> Result<(), SkyError> {
        let mut state = self.state.lock().unwrap();
        state.journal.push(format!("{op} {target}"));
        state.take_failure(op)
    }
}

#[async_trait]
impl ContainerPlatform for MockContainerPlatform {
    fn name(&self) -> &str {
        "mock"
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo, SkyError> {
        self.record("inspect", name)?;
        self.snapshot(name)
            .ok_or_else(|| SkyError::NotFound(format!("no such container: {name}")))
    }

    async fn remove(&self, name: &str) -> Result<(), SkyError> {
        self.record("remove", name)?;
        let mut state = self.state.lock().unwrap();
        match state.containers.remove(name) {
            Some(c) => {
                if c.running {
                    c.exit.send_replace(Some(137));
                }
                Ok(())
            }
            None => Err(SkyError::NotFound(format!("no such container: {name}"))),
        }
    }

    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String, SkyError> {
        self.record("create", name)?;
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(name) {
            return Err(SkyError::remote(format!(
                "Conflict. The container name \"/{name}\" is already in use"
            )));
        }
        Ok(state.insert(name, spec.clone(), false))
    }

    async fn start(&self, id: &str) -> Result<(), SkyError> {
        self.record("start", id)?;
        let delay = self.state.lock().unwrap().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let container = state
            .by_id(id)
            .ok_or_else(|| SkyError::NotFound(format!("no such container: {id}")))?;
        container.running = true;
        container.exit.send_replace(None);
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), SkyError> {
        self.record("stop", id)?;
        let code = self.stop_exit_code;
        let mut state = self.state.lock().unwrap();
        let container = state
            .by_id(id)
            .ok_or_else(|| SkyError::NotFound(format!("no such container: {id}")))?;
        if container.running {
            container.running = false;
            container.exit.send_replace(Some(code));
        }
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<WaitOutcome, SkyError> {
        self.record("wait", id)?;
        let mut exit = {
            let mut state = self.state.lock().unwrap();
            let container = state
                .by_id(id)
                .ok_or_else(|| SkyError::NotFound(format!("no such container: {id}")))?;
            container.exit.subscribe()
        };
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SkyError::remote(format!("container {id} vanished while waiting")))?;
        Ok(WaitOutcome {
            status_code: code.unwrap_or_default(),
            error: None,
        })
    }

    async fn logs(&self, id: &str, _tail: usize) -> Result<Vec<u8>, SkyError> {
        self.record("logs", id)?;
        let mut state = self.state.lock().unwrap();
        let container = state
            .by_id(id)
            .ok_or_else(|| SkyError::NotFound(format!("no such container: {id}")))?;
        Ok(container.logs.clone())
    }
}
