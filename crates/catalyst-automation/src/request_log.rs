//! Audit trail of user-facing calls.

use std::sync::Arc;

use catalyst_core::messages::RequestMsg;
use catalyst_core::model::LogEntry;
use catalyst_core::store::LogStore;
use catalyst_core::{Bus, ErrorKind};
use chrono::Utc;

use crate::observe::Reporter;

/// `type` of every entry written by the request logger.
pub const REQUEST_LOG_TYPE: &str = "request";

pub struct RequestLogger {
    logs: Arc<dyn LogStore>,
    reporter: Reporter,
}

impl RequestLogger {
    pub fn new(logs: Arc<dyn LogStore>, reporter: Reporter) -> Self {
        Self { logs, reporter }
    }

    pub fn subscribe(self: &Arc<Self>, bus: &Bus) {
        let this = Arc::clone(self);
        bus.request.subscribe(move |msg: Arc<RequestMsg>| {
            let this = Arc::clone(&this);
            async move { this.handle(&msg).await }
        });
    }

    /// Write one entry per referenced ID, as a single batch.
    pub async fn handle(&self, msg: &RequestMsg) {
        if msg.ids.is_empty() {
            return;
        }
        let created = Utc::now();
        let entries = msg
            .ids
            .iter()
            .map(|id| LogEntry {
                kind: REQUEST_LOG_TYPE.to_string(),
                reference: id.clone(),
                creator: msg.user.clone(),
                message: msg.function.clone(),
                created,
            })
            .collect();
        if let Err(e) = self.logs.batch_create_logs(entries).await {
            self.reporter.report(None, ErrorKind::Storage, "request-log", &e);
        }
    }
}
