#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tollgate_core::ServerConfig;
use tollgate_runner::{Parent, Runner, RunnerError, RunnerManager, RunnerState};

type Events = Arc<Mutex<Vec<String>>>;

/// Records lifecycle calls; `start` fails when built with `failing`.
struct Recorder {
    name: String,
    events: Events,
    running: AtomicBool,
    failing: bool,
}

impl Recorder {
    fn new(name: &str, events: &Events) -> Arc<Self> {
        Arc::new(Self { name: name.into(), events: events.clone(), running: AtomicBool::new(false), failing: false })
    }

    fn failing(name: &str, events: &Events) -> Arc<Self> {
        Arc::new(Self { name: name.into(), events: events.clone(), running: AtomicBool::new(false), failing: true })
    }

    fn log(&self, what: &str) { self.events.lock().unwrap().push(format!("{what} {}", self.name)); }
}

#[async_trait]
impl Runner for Recorder {
    fn name(&self) -> &str { &self.name }

    async fn start(&self, _cancel: &CancellationToken) -> Result<(), RunnerError> {
        if self.failing {
            return Err(RunnerError::Start { name: self.name.clone(), message: "boom".into() });
        }
        self.running.store(true, Ordering::SeqCst);
        self.log("start");
        Ok(())
    }

    async fn shut_down(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            // give the scheduler a chance to interleave other work
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.log("stop");
        }
    }

    async fn reload(&self, config: &ServerConfig) -> Result<(), RunnerError> {
        self.log(&format!("reload({})", config.dns_domain));
        Ok(())
    }
}

fn events() -> Events { Arc::new(Mutex::new(Vec::new())) }

fn taken(events: &Events) -> Vec<String> { std::mem::take(&mut *events.lock().unwrap()) }

#[tokio::test]
async fn child_stops_before_parent_and_stays_listed() {
    let ev = events();
    let mgr = RunnerManager::new();
    mgr.register(Recorder::new("A", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::new("B", &ev), Parent::named("A")).await.unwrap();

    mgr.start_all(&CancellationToken::new()).await.unwrap();
    assert_eq!(taken(&ev), vec!["start A", "start B"]);
    assert_eq!(mgr.state("B").await, Some(RunnerState::Running));

    mgr.shut_down("A").await.unwrap();
    assert_eq!(taken(&ev), vec!["stop B", "stop A"]);
    assert_eq!(mgr.state("A").await, Some(RunnerState::Stopped));
    assert_eq!(mgr.state("B").await, Some(RunnerState::Stopped));
    assert_eq!(mgr.list_names().await, vec!["A", "B"]);

    mgr.remove("A").await.unwrap();
    assert!(mgr.list_names().await.is_empty());
    assert!(mgr.get("B").await.is_none());
}

#[tokio::test]
async fn shutdown_is_depth_first_post_order() {
    let ev = events();
    let mgr = RunnerManager::new();
    mgr.register(Recorder::new("root", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::new("left", &ev), Parent::named("root")).await.unwrap();
    mgr.register(Recorder::new("leaf", &ev), Parent::named("left")).await.unwrap();
    mgr.register(Recorder::new("right", &ev), Parent::named("root")).await.unwrap();
    mgr.register(Recorder::new("other", &ev), Parent::Root).await.unwrap();
    mgr.start_all(&CancellationToken::new()).await.unwrap();
    taken(&ev);

    mgr.shut_down("root").await.unwrap();
    assert_eq!(taken(&ev), vec!["stop leaf", "stop left", "stop right", "stop root"]);
    assert_eq!(mgr.state("other").await, Some(RunnerState::Running));

    // idempotent
    mgr.shut_down("root").await.unwrap();
    assert!(taken(&ev).is_empty());

    mgr.shut_down_all().await;
    assert_eq!(taken(&ev), vec!["stop other"]);
}

#[tokio::test]
async fn shutting_down_a_child_leaves_the_parent_running() {
    let ev = events();
    let mgr = RunnerManager::new();
    mgr.register(Recorder::new("A", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::new("B", &ev), Parent::named("A")).await.unwrap();
    mgr.register(Recorder::new("C", &ev), Parent::named("B")).await.unwrap();
    mgr.start_all(&CancellationToken::new()).await.unwrap();

    mgr.shut_down("B").await.unwrap();
    assert_eq!(mgr.state("A").await, Some(RunnerState::Running));
    assert_eq!(mgr.state("B").await, Some(RunnerState::Stopped));
    assert_eq!(mgr.state("C").await, Some(RunnerState::Stopped));

    mgr.start("B", &CancellationToken::new()).await.unwrap();
    assert_eq!(mgr.state("B").await, Some(RunnerState::Running));
}

#[tokio::test]
async fn start_all_fails_fast() {
    let ev = events();
    let mgr = RunnerManager::new();
    mgr.register(Recorder::new("A", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::failing("B", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::new("C", &ev), Parent::Root).await.unwrap();

    let err = mgr.start_all(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RunnerError::Start { ref name, .. } if name == "B"));
    assert_eq!(taken(&ev), vec!["start A"]);
    assert_eq!(mgr.state("B").await, Some(RunnerState::Created));
    assert_eq!(mgr.state("C").await, Some(RunnerState::Created));
}

#[tokio::test]
async fn registration_errors_are_reported() {
    let ev = events();
    let mgr = RunnerManager::new();
    let err = mgr.register(Recorder::new("B", &ev), Parent::named("missing")).await.unwrap_err();
    assert_eq!(err, RunnerError::UnknownParent { name: "B".into(), parent: "missing".into() });
    assert!(mgr.list().await.is_empty());

    mgr.register(Recorder::new("A", &ev), Parent::Root).await.unwrap();
    assert_eq!(mgr.register(Recorder::new("A", &ev), Parent::Root).await.unwrap_err(), RunnerError::Duplicate("A".into()));
    assert_eq!(mgr.shut_down("nope").await.unwrap_err(), RunnerError::NotFound("nope".into()));
}

#[tokio::test]
async fn removing_a_child_detaches_it() {
    let ev = events();
    let mgr = RunnerManager::new();
    mgr.register(Recorder::new("A", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::new("B", &ev), Parent::named("A")).await.unwrap();
    mgr.register(Recorder::new("C", &ev), Parent::named("B")).await.unwrap();
    mgr.start_all(&CancellationToken::new()).await.unwrap();
    taken(&ev);

    mgr.remove("B").await.unwrap();
    assert_eq!(taken(&ev), vec!["stop C", "stop B"]);
    assert_eq!(mgr.list_names().await, vec!["A"]);
    let status = mgr.status().await;
    assert!(status[0].children.is_empty());

    // the name is free again
    mgr.register(Recorder::new("B", &ev), Parent::named("A")).await.unwrap();
    mgr.remove_all().await;
    assert!(mgr.list_names().await.is_empty());
}

#[tokio::test]
async fn status_reports_tree_and_serializes() {
    let ev = events();
    let mgr = RunnerManager::new();
    mgr.register(Recorder::new("provider", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::new("translator", &ev), Parent::named("provider")).await.unwrap();
    mgr.start("provider", &CancellationToken::new()).await.unwrap();

    let status = mgr.status().await;
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].children, vec!["translator"]);
    assert!(status[0].is_ready());
    assert!(status[0].started_at.is_some());
    assert_eq!(status[1].parent.as_deref(), Some("provider"));
    assert_eq!(status[1].state, RunnerState::Created);
    assert!(!status[1].is_ready());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json[1]["state"], "Created");
    assert_eq!(json[0]["name"], "provider");
}

#[tokio::test]
async fn reload_reaches_every_runner() {
    let ev = events();
    let mgr = RunnerManager::new();
    mgr.register(Recorder::new("A", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::new("B", &ev), Parent::named("A")).await.unwrap();
    let cfg = ServerConfig { dns_domain: "corp.local".into(), ..ServerConfig::default() };
    mgr.reload_all(&cfg).await.unwrap();
    assert_eq!(taken(&ev), vec!["reload(corp.local) A", "reload(corp.local) B"]);
}

#[tokio::test]
async fn run_stops_everything_on_cancel() {
    let ev = events();
    let mgr = Arc::new(RunnerManager::new());
    mgr.register(Recorder::new("A", &ev), Parent::Root).await.unwrap();
    mgr.register(Recorder::new("B", &ev), Parent::named("A")).await.unwrap();
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let (mgr, cancel) = (mgr.clone(), cancel.clone());
        async move { mgr.run(cancel).await }
    });

    for _ in 0..100 {
        if mgr.state("B").await == Some(RunnerState::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
    run.await.unwrap().unwrap();
    assert_eq!(taken(&ev), vec!["start A", "start B", "stop B", "stop A"]);
}
