//! Fake runtime — test double for container operations.
//!
//! Deterministic in-memory [`ContainerRuntime`] so the orchestrator and
//! controllers can be exercised without a Docker daemon. Supports
//! scripted exec responses, failure injection by container name, and
//! manual event emission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::traits::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, RuntimeError,
    RuntimeEvent, RuntimeResult,
};

/// A container held by the fake store
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub logs: Vec<String>,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, String>,
    volumes: Vec<String>,
    /// Container names whose create call must fail
    fail_create: Vec<String>,
    /// Scripted exec output, keyed by a substring of the joined command
    exec_scripts: Vec<(String, ExecOutput)>,
    /// Every exec invocation, for assertions
    exec_log: Vec<(String, Vec<String>)>,
}

/// In-memory fake runtime for tests
pub struct FakeRuntime {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    events_tx: broadcast::Sender<RuntimeEvent>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            events_tx,
        }
    }

    /// Make `create_container` fail for any spec whose name contains
    /// the given fragment.
    pub fn fail_create_matching(&self, fragment: &str) {
        self.inner.lock().fail_create.push(fragment.to_string());
    }

    /// Return the scripted output whenever an exec command line
    /// contains the given fragment.
    pub fn script_exec(&self, fragment: &str, output: ExecOutput) {
        self.inner
            .lock()
            .exec_scripts
            .push((fragment.to_string(), output));
    }

    /// Inject an engine event into subscribers
    pub fn emit_event(&self, event: RuntimeEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn container_by_name(&self, name: &str) -> Option<FakeContainer> {
        self.inner
            .lock()
            .containers
            .values()
            .find(|c| c.spec.name == name)
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.inner.lock().networks.len()
    }

    pub fn volume_count(&self) -> usize {
        self.inner.lock().volumes.len()
    }

    pub fn exec_invocations(&self) -> Vec<(String, Vec<String>)> {
        self.inner.lock().exec_log.clone()
    }

    fn details(container: &FakeContainer) -> ContainerDetails {
        ContainerDetails {
            id: container.id.clone(),
            name: container.spec.name.clone(),
            state: if container.running {
                ContainerState::Running
            } else {
                ContainerState::Exited
            },
            running: container.running,
            exit_code: if container.running { None } else { Some(0) },
            started_at: None,
            health: None,
            networks: container
                .spec
                .network
                .iter()
                .map(|n| (n.clone(), "172.28.0.2".to_string()))
                .collect(),
            labels: container.spec.labels.clone(),
        }
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn version(&self) -> RuntimeResult<String> {
        Ok("fake-1.0".to_string())
    }

    async fn ensure_image(&self, _image: &str) -> RuntimeResult<()> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut inner = self.inner.lock();

        if inner
            .fail_create
            .iter()
            .any(|fragment| spec.name.contains(fragment.as_str()))
        {
            return Err(RuntimeError::Other(format!(
                "injected create failure for {}",
                spec.name
            )));
        }

        if inner.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::ContainerExists(spec.name.clone()));
        }

        let id = format!("fake-{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                logs: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        container.running = true;
        drop(inner);

        let _ = self.events_tx.send(RuntimeEvent {
            container_id: id.to_string(),
            action: "start".to_string(),
            attributes: HashMap::new(),
            timestamp: 0,
        });
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        container.running = false;
        drop(inner);

        let _ = self.events_tx.send(RuntimeEvent {
            container_id: id.to_string(),
            action: "die".to_string(),
            attributes: HashMap::new(),
            timestamp: 0,
        });
        Ok(())
    }

    async fn kill_container(&self, id: &str, _signal: &str) -> RuntimeResult<()> {
        self.stop_container(id, Duration::ZERO).await
    }

    async fn remove_container(&self, id: &str, _force: bool) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        inner
            .containers
            .remove(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        let inner = self.inner.lock();
        // Lookup by id, falling back to name like the engine does
        inner
            .containers
            .get(id)
            .or_else(|| inner.containers.values().find(|c| c.spec.name == id))
            .map(Self::details)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    async fn container_logs(&self, id: &str, tail: u32) -> RuntimeResult<Vec<String>> {
        let inner = self.inner.lock();
        let container = inner
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;

        let logs = &container.logs;
        let start = logs.len().saturating_sub(tail as usize);
        Ok(logs[start..].to_vec())
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> RuntimeResult<ExecOutput> {
        let mut inner = self.inner.lock();
        if !inner.containers.contains_key(id) {
            return Err(RuntimeError::ContainerNotFound(id.to_string()));
        }

        inner.exec_log.push((id.to_string(), cmd.clone()));

        let joined = cmd.join(" ");
        for (fragment, output) in &inner.exec_scripts {
            if joined.contains(fragment.as_str()) {
                return Ok(output.clone());
            }
        }

        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<String> {
        let mut inner = self.inner.lock();
        let id = format!("net-{}", name);
        inner.networks.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        self.inner.lock().networks.remove(name);
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> RuntimeResult<String> {
        self.inner.lock().volumes.push(name.to_string());
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> RuntimeResult<()> {
        self.inner.lock().volumes.retain(|v| v != name);
        Ok(())
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<serde_json::Value> {
        let inner = self.inner.lock();
        if !inner.containers.contains_key(id) {
            return Err(RuntimeError::ContainerNotFound(id.to_string()));
        }
        Ok(serde_json::json!({ "id": id, "cpu_percent": 0.0 }))
    }

    fn events(&self) -> BoxStream<'static, RuntimeResult<RuntimeEvent>> {
        let rx = self.events_tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| item.ok().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "busybox:latest".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_start_remove() {
        let runtime = FakeRuntime::new();

        let id = runtime.create_container(&spec("web")).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        let details = runtime.inspect_container(&id).await.unwrap();
        assert!(details.running);

        runtime.remove_container(&id, true).await.unwrap();
        assert!(matches!(
            runtime.inspect_container(&id).await,
            Err(RuntimeError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_create_failure() {
        let runtime = FakeRuntime::new();
        runtime.fail_create_matching("gw");

        assert!(runtime.create_container(&spec("stack-gw")).await.is_err());
        assert!(runtime.create_container(&spec("stack-db")).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_exec() {
        let runtime = FakeRuntime::new();
        let id = runtime.create_container(&spec("db")).await.unwrap();

        runtime.script_exec(
            "SELECT 1",
            ExecOutput {
                exit_code: 0,
                stdout: "1\n".to_string(),
                stderr: String::new(),
            },
        );

        let out = runtime
            .exec(&id, vec!["psql".into(), "-c".into(), "SELECT 1".into()])
            .await
            .unwrap();
        assert_eq!(out.stdout, "1\n");
    }

    #[tokio::test]
    async fn test_event_emission_on_lifecycle() {
        let runtime = FakeRuntime::new();
        let mut events = runtime.events();

        let id = runtime.create_container(&spec("svc")).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.action, "start");
        assert_eq!(event.container_id, id);
    }
}
