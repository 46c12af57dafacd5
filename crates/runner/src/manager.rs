//! Registry of runners arranged as a tree.
//!
//! A child depends on its parent being alive, so shutting down a runner stops
//! its whole subtree first, deepest runners first.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tollgate_core::ServerConfig;
use tracing::{error, info, warn};

use crate::{Runner, RunnerError, RunnerState};

/// Stable handle of a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RunnerId(u64);

/// Where a runner is attached when registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parent {
    Root,
    Named(String),
}

impl Parent {
    pub fn named(name: impl Into<String>) -> Self { Parent::Named(name.into()) }
}

/// Liveness of one runner, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerStatus {
    pub name: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub state: RunnerState,
    /// RFC 3339 time of the last successful start.
    pub started_at: Option<String>,
    pub last_error: Option<String>,
}

impl RunnerStatus {
    pub fn is_ready(&self) -> bool { self.state == RunnerState::Running && self.last_error.is_none() }
}

struct Node {
    runner: Arc<dyn Runner>,
    parent: Option<RunnerId>,
    children: Vec<RunnerId>,
    state: RunnerState,
    started_at: Option<String>,
}

#[derive(Default)]
struct Tree {
    nodes: FxHashMap<RunnerId, Node>,
    by_name: FxHashMap<String, RunnerId>,
    /// Registration order.
    order: Vec<RunnerId>,
    next_id: u64,
}

impl Tree {
    fn id(&self, name: &str) -> Result<RunnerId, RunnerError> {
        self.by_name.get(name).copied().ok_or_else(|| RunnerError::NotFound(name.to_string()))
    }

    fn name_of(&self, id: RunnerId) -> Option<String> {
        self.nodes.get(&id).map(|n| n.runner.name().to_string())
    }

    /// `id` and all its descendants, children before parents.
    fn post_order(&self, id: RunnerId, out: &mut Vec<RunnerId>) {
        let Some(node) = self.nodes.get(&id) else { return };
        for child in &node.children {
            self.post_order(*child, out);
        }
        out.push(id);
    }

    fn runners(&self, ids: &[RunnerId]) -> Vec<(RunnerId, Arc<dyn Runner>)> {
        ids.iter().filter_map(|id| self.nodes.get(id).map(|n| (*id, Arc::clone(&n.runner)))).collect()
    }

    fn set_state(&mut self, id: RunnerId, state: RunnerState) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.state = state;
            if state == RunnerState::Running {
                node.started_at = Some(Utc::now().to_rfc3339());
            }
        }
        let running = self.nodes.values().filter(|n| n.state == RunnerState::Running).count();
        gauge!("runners_running", running as f64);
    }

    fn roots(&self) -> Vec<RunnerId> {
        self.order.iter().copied().filter(|id| self.nodes.get(id).is_some_and(|n| n.parent.is_none())).collect()
    }
}

/// Owns the runner tree of one process.
///
/// Runner calls are made without holding the registry lock, so status
/// queries stay responsive while a runner is starting or stopping.
#[derive(Default)]
pub struct RunnerManager {
    tree: Mutex<Tree>,
}

impl RunnerManager {
    pub fn new() -> Self { Self::default() }

    pub async fn register(&self, runner: Arc<dyn Runner>, parent: Parent) -> Result<RunnerId, RunnerError> {
        let name = runner.name().to_string();
        let mut tree = self.tree.lock().await;
        if tree.by_name.contains_key(&name) {
            error!(runner = %name, "runner already registered");
            return Err(RunnerError::Duplicate(name));
        }
        let parent_id = match &parent {
            Parent::Root => None,
            Parent::Named(p) => match tree.by_name.get(p) {
                Some(id) => Some(*id),
                None => {
                    error!(runner = %name, parent = %p, "cannot register runner under unknown parent");
                    return Err(RunnerError::UnknownParent { name, parent: p.clone() });
                }
            },
        };
        let id = RunnerId(tree.next_id);
        tree.next_id += 1;
        if let Some(pid) = parent_id {
            if let Some(p) = tree.nodes.get_mut(&pid) {
                p.children.push(id);
            }
        }
        tree.nodes.insert(
            id,
            Node { runner, parent: parent_id, children: Vec::new(), state: RunnerState::Created, started_at: None },
        );
        tree.by_name.insert(name.clone(), id);
        tree.order.push(id);
        info!(runner = %name, parent = ?parent, "runner registered");
        Ok(id)
    }

    /// Start every runner in registration order, stopping at the first
    /// failure. Runners already running are left alone.
    pub async fn start_all(&self, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let pending = {
            let tree = self.tree.lock().await;
            let ids: Vec<_> =
                tree.order.iter().copied().filter(|id| tree.nodes.get(id).is_some_and(|n| n.state != RunnerState::Running)).collect();
            tree.runners(&ids)
        };
        for (id, runner) in pending {
            self.start_one(id, runner, cancel).await?;
        }
        Ok(())
    }

    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let (id, runner) = {
            let tree = self.tree.lock().await;
            let id = tree.id(name)?;
            tree.runners(&[id]).pop().ok_or_else(|| RunnerError::NotFound(name.to_string()))?
        };
        self.start_one(id, runner, cancel).await
    }

    async fn start_one(&self, id: RunnerId, runner: Arc<dyn Runner>, cancel: &CancellationToken) -> Result<(), RunnerError> {
        let name = runner.name().to_string();
        match runner.start(cancel).await {
            Ok(()) => {
                self.tree.lock().await.set_state(id, RunnerState::Running);
                counter!("runner_starts_total", 1, "runner" => name.clone());
                info!(runner = %name, "runner started");
                Ok(())
            }
            Err(e) => {
                error!(runner = %name, error = %e, "runner failed to start");
                Err(match e {
                    e @ RunnerError::Start { .. } => e,
                    other => RunnerError::Start { name, message: other.to_string() },
                })
            }
        }
    }

    /// Stop `name` and everything below it. Every descendant is stopped
    /// before its parent, and all of them before this returns.
    pub async fn shut_down(&self, name: &str) -> Result<(), RunnerError> {
        let subtree = {
            let tree = self.tree.lock().await;
            let mut ids = Vec::new();
            tree.post_order(tree.id(name)?, &mut ids);
            tree.runners(&ids)
        };
        self.stop_in_order(subtree).await;
        Ok(())
    }

    /// Stop every tree, most recently registered root first.
    pub async fn shut_down_all(&self) {
        let all = {
            let tree = self.tree.lock().await;
            let mut ids = Vec::new();
            for root in tree.roots().into_iter().rev() {
                tree.post_order(root, &mut ids);
            }
            tree.runners(&ids)
        };
        self.stop_in_order(all).await;
    }

    async fn stop_in_order(&self, runners: Vec<(RunnerId, Arc<dyn Runner>)>) {
        for (id, runner) in runners {
            runner.shut_down().await;
            self.tree.lock().await.set_state(id, RunnerState::Stopped);
            info!(runner = %runner.name(), "runner stopped");
        }
    }

    /// Shut down `name` with its subtree, then forget all of them.
    pub async fn remove(&self, name: &str) -> Result<(), RunnerError> {
        self.shut_down(name).await?;
        let mut tree = self.tree.lock().await;
        let id = tree.id(name)?;
        let mut ids = Vec::new();
        tree.post_order(id, &mut ids);
        if let Some(pid) = tree.nodes.get(&id).and_then(|n| n.parent) {
            if let Some(p) = tree.nodes.get_mut(&pid) {
                p.children.retain(|c| *c != id);
            }
        }
        for rid in &ids {
            if let Some(node) = tree.nodes.remove(rid) {
                tree.by_name.remove(node.runner.name());
            }
        }
        tree.order.retain(|o| !ids.contains(o));
        info!(runner = %name, removed = ids.len(), "runner removed");
        Ok(())
    }

    pub async fn remove_all(&self) {
        self.shut_down_all().await;
        let mut tree = self.tree.lock().await;
        let removed = tree.order.len();
        tree.nodes.clear();
        tree.by_name.clear();
        tree.order.clear();
        info!(removed, "all runners removed");
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Runner>> {
        let tree = self.tree.lock().await;
        let id = tree.by_name.get(name)?;
        tree.nodes.get(id).map(|n| Arc::clone(&n.runner))
    }

    /// Registered runners in registration order.
    pub async fn list(&self) -> Vec<Arc<dyn Runner>> {
        let tree = self.tree.lock().await;
        tree.runners(&tree.order).into_iter().map(|(_, r)| r).collect()
    }

    pub async fn list_names(&self) -> Vec<String> {
        let tree = self.tree.lock().await;
        tree.order.iter().filter_map(|id| tree.name_of(*id)).collect()
    }

    pub async fn state(&self, name: &str) -> Option<RunnerState> {
        let tree = self.tree.lock().await;
        let id = tree.by_name.get(name)?;
        tree.nodes.get(id).map(|n| n.state)
    }

    pub async fn status(&self) -> Vec<RunnerStatus> {
        let tree = self.tree.lock().await;
        tree.order
            .iter()
            .filter_map(|id| {
                let node = tree.nodes.get(id)?;
                Some(RunnerStatus {
                    name: node.runner.name().to_string(),
                    parent: node.parent.and_then(|p| tree.name_of(p)),
                    children: node.children.iter().filter_map(|c| tree.name_of(*c)).collect(),
                    state: node.state,
                    started_at: node.started_at.clone(),
                    last_error: node.runner.last_error(),
                })
            })
            .collect()
    }

    /// Hand new settings to every runner. All runners are tried; the first
    /// failure is returned.
    pub async fn reload_all(&self, config: &ServerConfig) -> Result<(), RunnerError> {
        let mut first_err = None;
        for runner in self.list().await {
            if let Err(e) = runner.reload(config).await {
                warn!(runner = %runner.name(), error = %e, "runner reload failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Start everything, wait for `cancel`, then stop everything.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RunnerError> {
        if let Err(e) = self.start_all(&cancel).await {
            self.shut_down_all().await;
            return Err(e);
        }
        cancel.cancelled().await;
        info!("shutting down runners");
        self.shut_down_all().await;
        Ok(())
    }
}
