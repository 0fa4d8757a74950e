use std::fmt::Display;
use std::sync::Arc;

use catalyst_core::messages::ErrorEvent;
use catalyst_core::{Bus, ErrorKind};
use tracing::{error, warn};

/// Logs a handled failure and publishes it on the `errors` channel.
///
/// Publishing never waits for observers, so reporting is safe on every
/// pipeline path.
#[derive(Debug, Clone)]
pub struct Reporter {
    bus: Arc<Bus>,
}

impl Reporter {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    pub fn report(&self, job_id: Option<&str>, kind: ErrorKind, stage: &str, err: &dyn Display) {
        let message = err.to_string();
        match kind {
            ErrorKind::Storage | ErrorKind::Configuration => {
                error!(job_id, kind = %kind, stage, error = %message, "automation step failed")
            }
            _ => warn!(job_id, kind = %kind, stage, error = %message, "automation step failed"),
        }
        self.bus
            .errors
            .publish(ErrorEvent::new(job_id, kind, stage, message));
    }
}
