//! Call history sinks

use crate::domain::history::{CallHistorySink, HistoryRecord};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

/// Keeps every record in memory, in arrival order
#[derive(Default)]
pub struct InMemoryHistorySink {
    records: RwLock<Vec<HistoryRecord>>,
}

impl InMemoryHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<HistoryRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CallHistorySink for InMemoryHistorySink {
    async fn record(&self, record: HistoryRecord) -> Result<(), String> {
        self.records.write().await.push(record);
        Ok(())
    }
}

/// Writes each record to the log as JSON
pub struct TracingHistorySink;

#[async_trait]
impl CallHistorySink for TracingHistorySink {
    async fn record(&self, record: HistoryRecord) -> Result<(), String> {
        let json = serde_json::to_string(&record).map_err(|e| e.to_string())?;
        info!(target: "call_history", "{}", json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::history::LegHistoryEntry;
    use crate::domain::leg::{CallLeg, LegState};
    use crate::domain::shared::value_objects::LegId;

    #[tokio::test]
    async fn test_in_memory_sink_keeps_order() {
        let sink = InMemoryHistorySink::new();
        assert!(sink.is_empty().await);

        for id in ["sim-1", "sim-2"] {
            let mut leg = CallLeg::outbound(LegId::from(id), "sip:1001@pbx.local");
            leg.transition_to(LegState::Disconnected).unwrap();
            sink.record(HistoryRecord::Leg(LegHistoryEntry::from_leg(&leg)))
                .await
                .unwrap();
        }

        let records = sink.records().await;
        assert_eq!(records.len(), 2);
        match &records[1] {
            HistoryRecord::Leg(entry) => assert_eq!(entry.leg_id, LegId::from("sim-2")),
            other => panic!("unexpected record {:?}", other),
        }
    }
}
