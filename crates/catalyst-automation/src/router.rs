//! Applies a [`ResultMsg`] to the task or artifact that asked for it.
//!
//! Routing is decoupled from the job: by the time a result arrives here the
//! job is already completed, and nothing that happens here changes that.

use std::sync::Arc;

use catalyst_core::messages::{Origin, ResultMsg};
use catalyst_core::model::Enrichment;
use catalyst_core::store::{ArtifactStore, TaskStore};
use catalyst_core::{Bus, ErrorKind};
use chrono::Utc;
use tracing::debug;

use crate::observe::Reporter;

pub struct ResultRouter {
    tasks: Arc<dyn TaskStore>,
    artifacts: Arc<dyn ArtifactStore>,
    reporter: Reporter,
}

impl ResultRouter {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        artifacts: Arc<dyn ArtifactStore>,
        reporter: Reporter,
    ) -> Self {
        Self {
            tasks,
            artifacts,
            reporter,
        }
    }

    pub fn subscribe(self: &Arc<Self>, bus: &Bus) {
        let this = Arc::clone(self);
        bus.result.subscribe(move |msg: Arc<ResultMsg>| {
            let this = Arc::clone(&this);
            async move { this.handle(&msg).await }
        });
    }

    pub async fn handle(&self, msg: &ResultMsg) {
        match &msg.target {
            Origin::Task(task) => {
                if let Err(e) = self.tasks.complete_task(task, &msg.data).await {
                    self.reporter.report(None, ErrorKind::Routing, "task", &e);
                }
            }
            Origin::Artifact(artifact) => {
                let enrichment = Enrichment {
                    name: msg.automation.clone(),
                    data: msg.data.to_map(),
                    created: Utc::now(),
                };
                if let Err(e) = self.artifacts.enrich_artifact(artifact, enrichment).await {
                    self.reporter.report(None, ErrorKind::Routing, "artifact", &e);
                }
            }
            Origin::None => {
                debug!(automation = %msg.automation, "global automation result; nothing to route");
            }
        }
    }
}
