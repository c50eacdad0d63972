//! One structured record per scheduling decision.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use solvergrid_state::{RequestId, SectionId, StudentId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub session_id: String,
    pub student_id: StudentId,
    pub request_id: RequestId,
    pub action: String,
    pub requester: String,
    /// Outcome kind, e.g. `assigned` or `rejected`.
    pub outcome: String,
    pub detail: Option<String>,
    pub sections: Vec<SectionId>,
    pub previous_sections: Vec<SectionId>,
    pub weight: Option<f64>,
    pub candidates: usize,
    pub filtered: usize,
    pub timestamp: u64,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &DecisionRecord);
}

/// Logs each record as JSON on the `solvergrid::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &DecisionRecord) {
        match serde_json::to_string(record) {
            Ok(json) => info!(target: "solvergrid::audit", record = %json, "sectioning decision"),
            Err(e) => warn!(target: "solvergrid::audit", error = %e, "unserializable decision record"),
        }
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<DecisionRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &DecisionRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}
