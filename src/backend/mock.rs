//! In-memory container backend for tests.
//!
//! Behaves like a minimal container engine: created containers sit in a
//! table with their labels and state, list/inspect report them, and
//! removal deletes them (which is how device allocations are released in
//! the real system). `fail_next_start` injects a start failure so rollback
//! paths can be exercised.

use super::{ContainerBackend, ContainerSpec, ContainerView};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    state: String,
}

#[derive(Default)]
pub struct MockBackend {
    containers: Mutex<HashMap<String, MockContainer>>,
    next_id: AtomicU64,
    fail_next_start: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start` call fail, as a crashed engine would.
    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Number of containers currently in the table, any state.
    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Flip a running container to `exited`, simulating a backend crash.
    pub fn kill(&self, id: &str) {
        let mut containers = self.containers.lock().unwrap();
        if let Some(c) = containers.get_mut(id) {
            c.state = "exited".to_string();
        }
    }

    fn view(id: &str, c: &MockContainer) -> ContainerView {
        ContainerView {
            id: id.to_string(),
            name: c.spec.name.clone(),
            image: c.spec.image.clone(),
            running: c.state == "running",
            state: c.state.clone(),
            labels: c.spec.labels.clone(),
        }
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut containers = self.containers.lock().unwrap();
        if containers.values().any(|c| c.spec.name == spec.name) {
            return Err(Error::Conflict(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        let id = format!("mock-{:012x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                state: "created".to_string(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(Error::Upstream("injected start failure".into()));
        }
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("no such container: {}", id)))?;
        c.state = "running".to_string();
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("no such container: {}", id)))?;
        c.state = "exited".to_string();
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        match containers.get(id) {
            Some(c) if c.state == "running" && !force => Err(Error::Conflict(format!(
                "container {} is running; use force",
                id
            ))),
            Some(_) => {
                containers.remove(id);
                Ok(())
            }
            None => Err(Error::NotFound(format!("no such container: {}", id))),
        }
    }

    async fn list(&self, filter_labels: &HashMap<String, String>) -> Result<Vec<ContainerView>> {
        let containers = self.containers.lock().unwrap();
        let mut views: Vec<ContainerView> = containers
            .iter()
            .filter(|(_, c)| {
                filter_labels.iter().all(|(k, v)| match c.spec.labels.get(k) {
                    Some(actual) => v.is_empty() || actual == v,
                    None => false,
                })
            })
            .map(|(id, c)| Self::view(id, c))
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(views)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerView> {
        let containers = self.containers.lock().unwrap();
        containers
            .get(id)
            .map(|c| Self::view(id, c))
            .ok_or_else(|| Error::NotFound(format!("no such container: {}", id)))
    }

    async fn logs(&self, _id: &str, _tail: usize) -> Result<String> {
        Ok(String::new())
    }

    async fn exec(&self, _id: &str, _argv: &[String]) -> Result<String> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::labels;

    fn spec(name: &str, instance_id: &str) -> ContainerSpec {
        let mut labels_map = HashMap::new();
        labels_map.insert(labels::INSTANCE_ID.to_string(), instance_id.to_string());
        ContainerSpec {
            name: name.to_string(),
            image: "img".to_string(),
            labels: labels_map,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let backend = MockBackend::new();
        let id = backend.create(&spec("a", "inst-a")).await.unwrap();

        assert_eq!(backend.inspect(&id).await.unwrap().state, "created");
        backend.start(&id).await.unwrap();
        assert!(backend.inspect(&id).await.unwrap().running);

        backend.stop(&id, Duration::from_secs(1)).await.unwrap();
        backend.remove(&id, false).await.unwrap();
        assert!(backend.inspect(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_label_filter() {
        let backend = MockBackend::new();
        backend.create(&spec("a", "inst-a")).await.unwrap();
        backend.create(&spec("b", "inst-b")).await.unwrap();

        let mut filter = HashMap::new();
        filter.insert(labels::INSTANCE_ID.to_string(), "inst-a".to_string());
        assert_eq!(backend.list(&filter).await.unwrap().len(), 1);

        filter.insert(labels::INSTANCE_ID.to_string(), String::new());
        assert_eq!(backend.list(&filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_start_failure() {
        let backend = MockBackend::new();
        let id = backend.create(&spec("a", "inst-a")).await.unwrap();
        backend.fail_next_start();
        assert!(backend.start(&id).await.is_err());
        // Failure is one-shot.
        backend.start(&id).await.unwrap();
    }
}
