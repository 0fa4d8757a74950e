//! Turns a [`JobMsg`] into a sandbox run and a [`ResultMsg`].
//!
//! # Pipeline
//!
//! ```text
//! 1 persist job (created) ─► 2 resolve automation ─► 3 inject secrets ─► 4 serialise
//!   │ any failure here: job → failed, no result
//!   ▼
//! 5 sandbox create ─► 6 job → running + container + pull log ─► 7 sandbox run
//!   │ sandbox failures become {"error": ...}
//!   ▼
//! 8 interpret stdout ─► 9 publish result ─► 10 job → completed
//! ```
//!
//! Steps run strictly in order for one job; jobs run concurrently because
//! every delivery is its own task. The coordinator counts handlers between
//! delivery and step 10 so shutdown can wait for them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use catalyst_core::messages::{
    AutomationOutput, JobMsg, ResultMsg, SECRET_API_KEY, SECRET_API_URL,
};
use catalyst_core::model::{Job, JobStatus, JobUpdate};
use catalyst_core::store::{AutomationStore, JobStore};
use catalyst_core::{Bus, CatalystError, ErrorKind};
use catalyst_sandbox::{container_name, LogSink, Sandbox, SandboxError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::observe::Reporter;

/// Credentials handed to every script so it can call back into the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSecrets {
    pub api_url: String,
    pub api_key: String,
}

pub struct JobCoordinator {
    bus: Arc<Bus>,
    jobs: Arc<dyn JobStore>,
    automations: Arc<dyn AutomationStore>,
    sandbox: Arc<dyn Sandbox>,
    secrets: PlatformSecrets,
    reporter: Reporter,
    cancel: CancellationToken,
    in_flight: InFlight,
}

/// Handlers that have started and not yet returned.
#[derive(Debug, Default)]
struct InFlight {
    active: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self)
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("api_url", &self.secrets.api_url)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl JobCoordinator {
    pub fn new(
        bus: Arc<Bus>,
        jobs: Arc<dyn JobStore>,
        automations: Arc<dyn AutomationStore>,
        sandbox: Arc<dyn Sandbox>,
        secrets: PlatformSecrets,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reporter: Reporter::new(Arc::clone(&bus)),
            bus,
            jobs,
            automations,
            sandbox,
            secrets,
            cancel,
            in_flight: InFlight::default(),
        }
    }

    /// Number of jobs currently being handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.active.load(Ordering::SeqCst)
    }

    /// Resolve once no job is being handled.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Handle every message published on the job channel from now on.
    pub fn subscribe(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.bus.job.subscribe(move |msg: Arc<JobMsg>| {
            let this = Arc::clone(&this);
            async move {
                this.handle(&msg).await;
            }
        });
    }

    /// Run one job to completion. Returns the published result, or `None`
    /// when the job was aborted before reaching the sandbox.
    pub async fn handle(&self, msg: &JobMsg) -> Option<ResultMsg> {
        let _guard = self.in_flight.enter();
        let id = msg.id.as_str();

        // 1. persist
        if let Err(e) = self.jobs.create_job(&Job::from_msg(msg)).await {
            self.reporter.report(Some(id), ErrorKind::Storage, "persist", &e);
            return None;
        }

        // 2. resolve
        let automation = match self.automations.get_automation(&msg.automation).await {
            Ok(a) if a.script.is_empty() => {
                self.abort(id, "resolve", CatalystError::EmptyScript(a.id)).await;
                return None;
            }
            Ok(a) => a,
            Err(e) => {
                self.abort(id, "resolve", e).await;
                return None;
            }
        };

        // 3. secrets
        let mut message = msg.message.clone();
        message
            .secrets
            .insert(SECRET_API_KEY.to_string(), self.secrets.api_key.clone());
        message
            .secrets
            .insert(SECRET_API_URL.to_string(), self.secrets.api_url.clone());

        // 4. serialise
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                self.abort(id, "serialise", CatalystError::Json(e)).await;
                return None;
            }
        };

        let cancel = self.cancel.child_token();
        let output = self
            .execute(id, &automation.image, &automation.script, &payload, &cancel)
            .await;

        // 9. publish
        let result = ResultMsg {
            automation: msg.automation.clone(),
            data: output,
            target: msg.origin.clone(),
        };
        self.bus.result.publish(result.clone());

        // 10. complete
        if let Err(e) = self.jobs.complete_job(id, &result.data).await {
            self.reporter.report(Some(id), ErrorKind::Storage, "complete", &e);
        }
        info!(job_id = id, automation = %msg.automation, failed = result.data.is_error(), "job finished");
        Some(result)
    }

    /// Steps 5 to 8: everything that involves the sandbox.
    async fn execute(
        &self,
        id: &str,
        image: &str,
        script: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> AutomationOutput {
        // 5. create
        let name = container_name(id);
        let created = match self.sandbox.create(&name, image, script, payload, cancel).await {
            Ok(c) => c,
            Err(e) => return self.sandbox_failure(id, "create", e),
        };
        debug!(job_id = id, container = %created.id, "container ready");

        // 6. running
        let update = JobUpdate {
            status: Some(JobStatus::Running),
            container: Some(created.id.clone()),
            log: Some(created.pull_log),
        };
        if let Err(e) = self.jobs.update_job(id, update).await {
            self.reporter.report(Some(id), ErrorKind::Storage, "update", &e);
        }

        // 7. run
        let sink = Arc::new(JobLog {
            job_id: id.to_string(),
            jobs: Arc::clone(&self.jobs),
            reporter: self.reporter.clone(),
        });
        let outcome = self.sandbox.run(&created.id, sink, cancel).await;

        // 8. interpret
        match outcome {
            Ok(stdout) => AutomationOutput::from_stdout(&stdout),
            Err(e) => self.sandbox_failure(id, "run", e),
        }
    }

    fn sandbox_failure(&self, id: &str, stage: &str, err: SandboxError) -> AutomationOutput {
        self.reporter.report(Some(id), err.kind(), stage, &err);
        AutomationOutput::error(format!("error running script {err}"))
    }

    async fn abort(&self, id: &str, stage: &str, err: CatalystError) {
        self.reporter.report(Some(id), err.kind(), stage, &err);
        if let Err(e) = self.jobs.fail_job(id, &err.to_string()).await {
            self.reporter.report(Some(id), ErrorKind::Storage, "fail", &e);
        }
    }
}

/// Appends the script's stderr to the job log.
struct JobLog {
    job_id: String,
    jobs: Arc<dyn JobStore>,
    reporter: Reporter,
}

#[async_trait]
impl LogSink for JobLog {
    async fn append_line(&self, line: &str) {
        if let Err(e) = self.jobs.append_job_log(&self.job_id, line).await {
            self.reporter
                .report(Some(&self.job_id), ErrorKind::Storage, "log", &e);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use catalyst_core::config::TimeoutConfig;
    use catalyst_core::messages::{ErrorEvent, Origin, ScriptMessage};
    use catalyst_core::model::Automation;
    use catalyst_sandbox::scripted::{ScriptedEngine, ScriptedRun, StdoutFn};
    use catalyst_sandbox::ContainerRuntime;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn automation(script: &str) -> Automation {
        Automation {
            id: "hash.sha1".into(),
            image: "docker.io/python:3".into(),
            script: script.into(),
            schema: None,
            types: vec![],
        }
    }

    fn job_msg(id: &str, origin: Origin) -> JobMsg {
        JobMsg {
            id: id.into(),
            automation: "hash.sha1".into(),
            origin,
            message: ScriptMessage {
                payload: json!({"default": "hello"}),
                ..Default::default()
            },
        }
    }

    struct Harness {
        cancel: CancellationToken,
        bus: Arc<Bus>,
        store: MemoryStore,
        engine: ScriptedEngine,
        coordinator: Arc<JobCoordinator>,
    }

    fn harness(store: MemoryStore, engine: ScriptedEngine) -> Harness {
        let bus = Arc::new(Bus::default());
        let cancel = CancellationToken::new();
        let runtime = ContainerRuntime::new(
            Arc::new(engine.clone()),
            "catalyst",
            TimeoutConfig::default(),
        );
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::clone(&bus),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(runtime),
            PlatformSecrets {
                api_url: "http://catalyst:8000/api".into(),
                api_key: "k3y".into(),
            },
            cancel.clone(),
        ));
        Harness {
            cancel,
            bus,
            store,
            engine,
            coordinator,
        }
    }

    fn ok_run(stdout: &str) -> ScriptedEngine {
        ScriptedEngine::new(ScriptedRun {
            stdout: stdout.as_bytes().to_vec(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn json_stdout_becomes_result_data() {
        let h = harness(
            MemoryStore::with_automation(automation("print()")),
            ok_run(r#"{"hash":"abc"}"#),
        );

        let result = h.coordinator.handle(&job_msg("j1", Origin::None)).await.unwrap();

        assert_eq!(
            serde_json::to_value(&result.data).unwrap(),
            json!({"hash": "abc"})
        );
        assert_eq!(result.automation, "hash.sha1");
        let job = h.store.job("j1");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.container.as_deref(), Some("container-0"));
        assert!(job.log.contains("Pulling"));
    }

    #[tokio::test]
    async fn empty_script_never_reaches_sandbox() {
        let h = harness(MemoryStore::with_automation(automation("")), ok_run("{}"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.bus.result.subscribe(move |msg: Arc<ResultMsg>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        });

        assert!(h.coordinator.handle(&job_msg("j1", Origin::None)).await.is_none());

        assert!(h.engine.calls().is_empty());
        let job = h.store.job("j1");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("empty script"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_automation_fails_job() {
        let h = harness(MemoryStore::default(), ok_run("{}"));
        assert!(h.coordinator.handle(&job_msg("j1", Origin::None)).await.is_none());
        assert_eq!(h.store.job("j1").status, JobStatus::Failed);
        assert!(h.engine.created().is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_yields_error_result() {
        let engine = ScriptedEngine::new(ScriptedRun {
            exit_code: 1,
            stdout: b"".to_vec(),
            stderr: vec![b"Traceback\nKeyError: 'default'\n".to_vec()],
            ..Default::default()
        });
        let h = harness(MemoryStore::with_automation(automation("x")), engine);

        let result = h
            .coordinator
            .handle(&job_msg("j1", Origin::task(1, "p", "t")))
            .await
            .unwrap();

        let data = result.data.to_map();
        let error = data["error"].as_str().unwrap();
        assert!(error.starts_with("error running script container returned status code 1"));
        assert!(error.contains("KeyError"));
        assert_eq!(result.target, Origin::task(1, "p", "t"));

        let job = h.store.job("j1");
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.output.unwrap().is_error());
        assert!(job.log.ends_with("Traceback\nKeyError: 'default'\n"));
    }

    #[tokio::test]
    async fn non_json_stdout_is_kept_as_error() {
        let h = harness(
            MemoryStore::with_automation(automation("x")),
            ok_run("hello world"),
        );
        let result = h.coordinator.handle(&job_msg("j1", Origin::None)).await.unwrap();
        assert_eq!(
            serde_json::to_value(&result.data).unwrap(),
            json!({"error": "hello world"})
        );
    }

    #[tokio::test]
    async fn pull_failure_is_reported_as_result() {
        let mut engine = ok_run("{}");
        engine.fail_pull = true;
        let h = harness(MemoryStore::with_automation(automation("x")), engine);

        let result = h.coordinator.handle(&job_msg("j1", Origin::None)).await.unwrap();

        assert!(result.data.is_error());
        assert!(result.data.to_map()["error"]
            .as_str()
            .unwrap()
            .contains("manifest unknown"));
        assert_eq!(h.store.job("j1").status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn secrets_and_payload_are_the_only_argument() {
        let h = harness(MemoryStore::with_automation(automation("x")), ok_run("{}"));
        h.coordinator.handle(&job_msg("j1", Origin::None)).await.unwrap();

        let spec = &h.engine.created()[0];
        assert_eq!(spec.name, "catalyst-j1");
        assert_eq!(spec.cmd.len(), 2);
        assert_eq!(spec.cmd[0], "/script");
        let arg: serde_json::Value = serde_json::from_str(&spec.cmd[1]).unwrap();
        assert_eq!(arg["payload"], json!({"default": "hello"}));
        assert_eq!(arg["secrets"]["catalyst_apikey"], "k3y");
        assert_eq!(arg["secrets"]["catalyst_apiurl"], "http://catalyst:8000/api");
    }

    #[tokio::test]
    async fn update_failure_does_not_stop_pipeline() {
        let mut store = MemoryStore::with_automation(automation("x"));
        store.fail_job_update = true;
        let h = harness(store, ok_run(r#"{"ok":true}"#));
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.bus.errors.subscribe(move |event: Arc<ErrorEvent>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        });

        let result = h.coordinator.handle(&job_msg("j1", Origin::None)).await.unwrap();

        assert!(!result.data.is_error());
        assert!(h.engine.removed().contains(&"container-0".to_string()));
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.stage, "update");
        assert_eq!(event.kind, ErrorKind::Storage);
        assert_eq!(event.job_id.as_deref(), Some("j1"));
    }

    #[tokio::test]
    async fn failed_log_append_skips_line_only() {
        let mut store = MemoryStore::with_automation(automation("x"));
        store.fail_log_append = true;
        let engine = ScriptedEngine::new(ScriptedRun {
            stdout: br#"{"hash":"abc"}"#.to_vec(),
            stderr: vec![b"one\ntwo\n".to_vec()],
            ..Default::default()
        });
        let h = harness(store, engine);

        let result = h.coordinator.handle(&job_msg("j1", Origin::None)).await.unwrap();
        assert!(!result.data.is_error());
        assert_eq!(h.store.job("j1").status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_job_is_not_run_twice() {
        let h = harness(MemoryStore::with_automation(automation("x")), ok_run("{}"));
        h.coordinator.handle(&job_msg("j1", Origin::None)).await.unwrap();
        assert!(h.coordinator.handle(&job_msg("j1", Origin::None)).await.is_none());
        assert_eq!(h.engine.created().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_jobs_have_independent_results() {
        // Echo the payload back so outputs can be told apart.
        let mut engine = ok_run("{}");
        engine.stdout_from_cmd = Some(StdoutFn(Arc::new(|cmd: &[String]| {
            let arg: serde_json::Value = serde_json::from_str(&cmd[1]).unwrap();
            serde_json::to_vec(&json!({"echo": arg["payload"]["default"]})).unwrap()
        })));
        let h = harness(MemoryStore::with_automation(automation("x")), engine);
        h.coordinator.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.bus.result.subscribe(move |msg: Arc<ResultMsg>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        });

        for (id, ticket) in [("a", 1), ("b", 2)] {
            let mut msg = job_msg(id, Origin::artifact(ticket, format!("{id}.exe")));
            msg.message.payload = json!({"default": id});
            h.bus.job.publish(msg);
        }

        for _ in 0..2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let Origin::Artifact(artifact) = &msg.target else {
                panic!("expected artifact target, got {:?}", msg.target)
            };
            let echo = msg.data.to_map()["echo"].as_str().unwrap().to_string();
            assert_eq!(format!("{echo}.exe"), artifact.artifact);
        }
        assert_eq!(h.engine.created().len(), 2);
        assert_eq!(h.engine.removed().len(), 2);
    }

    #[tokio::test]
    async fn in_flight_counts_jobs_until_they_finish() {
        let engine = ScriptedEngine::new(ScriptedRun {
            runtime: Duration::from_secs(3600),
            ..Default::default()
        });
        let h = harness(MemoryStore::with_automation(automation("x")), engine);
        assert_eq!(h.coordinator.in_flight(), 0);

        let coordinator = Arc::clone(&h.coordinator);
        let job = tokio::spawn(async move {
            coordinator.handle(&job_msg("slow", Origin::None)).await
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.coordinator.in_flight() == 0 || h.engine.created().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.coordinator.in_flight(), 1);

        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.coordinator.wait_idle())
            .await
            .unwrap();
        assert_eq!(h.coordinator.in_flight(), 0);
        assert!(job.await.unwrap().unwrap().data.is_error());
        assert_eq!(h.engine.removed(), vec!["container-0".to_string()]);
    }

    #[tokio::test]
    async fn wait_idle_returns_at_once_without_jobs() {
        let h = harness(MemoryStore::with_automation(automation("x")), ok_run("{}"));
        h.coordinator.handle(&job_msg("j1", Origin::None)).await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), h.coordinator.wait_idle())
            .await
            .unwrap();
    }
}
