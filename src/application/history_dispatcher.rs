//! Fire-and-forget delivery of call history records

use crate::domain::history::{CallHistorySink, HistoryRecord};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Feeds the history sink from a background worker
///
/// `dispatch` never waits on the sink, so sink latency or failure cannot
/// reach call control.
#[derive(Clone)]
pub struct HistoryDispatcher {
    tx: mpsc::UnboundedSender<HistoryRecord>,
}

impl HistoryDispatcher {
    /// Spawn the worker on the current runtime
    pub fn spawn(sink: Arc<dyn CallHistorySink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<HistoryRecord>();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let record_type = record.record_type();
                match sink.record(record).await {
                    Ok(()) => debug!("Recorded {} history entry", record_type),
                    Err(e) => warn!("Call history sink failed for {} entry: {}", record_type, e),
                }
            }
            debug!("History dispatcher stopped");
        });

        Self { tx }
    }

    pub fn dispatch(&self, record: HistoryRecord) {
        if self.tx.send(record).is_err() {
            warn!("History dispatcher is gone, dropping record");
        }
    }
}
