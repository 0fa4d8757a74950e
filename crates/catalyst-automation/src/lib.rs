//! `catalyst-automation`: the bus subscribers that run automations.
//!
//! # Architecture
//!
//! ```text
//! bus.job ──► JobCoordinator ──► Sandbox ──► bus.result ──► ResultRouter ──► TaskStore / ArtifactStore
//! bus.request ──► RequestLogger ──► LogStore
//! any handled failure ──► Reporter ──► tracing + bus.errors
//! ```

pub mod coordinator;
pub mod observe;
pub mod request_log;
pub mod router;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use catalyst_core::store::{ArtifactStore, AutomationStore, JobStore, LogStore, TaskStore};
use catalyst_core::{Bus, ServiceConfig};
use catalyst_sandbox::Sandbox;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use coordinator::{JobCoordinator, PlatformSecrets};
pub use observe::Reporter;
pub use request_log::RequestLogger;
pub use router::ResultRouter;

/// The collaborator stores the subscribers write to.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub automations: Arc<dyn AutomationStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub logs: Arc<dyn LogStore>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn shared<S>(store: S) -> Self
    where
        S: JobStore + AutomationStore + TaskStore + ArtifactStore + LogStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            jobs: store.clone(),
            automations: store.clone(),
            tasks: store.clone(),
            artifacts: store.clone(),
            logs: store,
        }
    }
}

/// All subscribers, wired to one bus.
pub struct AutomationService {
    pub coordinator: Arc<JobCoordinator>,
    pub router: Arc<ResultRouter>,
    pub request_logger: Arc<RequestLogger>,
    cancel: CancellationToken,
}

impl AutomationService {
    /// Subscribe every component to `bus`. Must run inside a Tokio runtime.
    pub fn start(
        bus: Arc<Bus>,
        stores: Stores,
        sandbox: Arc<dyn Sandbox>,
        config: &ServiceConfig,
        cancel: CancellationToken,
    ) -> Self {
        let reporter = Reporter::new(Arc::clone(&bus));
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::clone(&bus),
            stores.jobs,
            stores.automations,
            sandbox,
            PlatformSecrets {
                api_url: config.api_url.clone(),
                api_key: config.api_key.clone(),
            },
            cancel.clone(),
        ));
        let router = Arc::new(ResultRouter::new(
            stores.tasks,
            stores.artifacts,
            reporter.clone(),
        ));
        let request_logger = Arc::new(RequestLogger::new(stores.logs, reporter));

        coordinator.subscribe();
        router.subscribe(&bus);
        request_logger.subscribe(&bus);
        info!(network = %config.network, "automation service started");

        Self {
            coordinator,
            router,
            request_logger,
            cancel,
        }
    }

    /// Cancel every in-flight job; their containers are removed.
    pub fn shutdown(&self) {
        info!("cancelling in-flight jobs");
        self.cancel.cancel();
    }

    /// Wait up to `within` for every job handler to return, containers
    /// removed and results published. `false` when some are still running.
    pub async fn drain(&self, within: Duration) -> bool {
        tokio::time::timeout(within, self.coordinator.wait_idle())
            .await
            .is_ok()
    }
}
