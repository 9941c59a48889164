//! history.rs: bounded in-memory log of finished cycles for `/api/cycles`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

use crate::pipeline::CycleReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Ok,
    Aborted,
    Panicked,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<CycleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct CycleHistory {
    inner: Mutex<Vec<CycleRecord>>,
    cap: usize,
}

impl CycleHistory {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 10_000);
        Self {
            inner: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    pub fn push_ok(&self, report: CycleReport) {
        self.push(CycleRecord {
            finished_at: Utc::now(),
            outcome: CycleOutcome::Ok,
            report: Some(report),
            error: None,
        });
    }

    pub fn push_failed(&self, outcome: CycleOutcome, error: String) {
        self.push(CycleRecord {
            finished_at: Utc::now(),
            outcome,
            report: None,
            error: Some(error),
        });
    }

    fn push(&self, entry: CycleRecord) {
        let mut v = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        v.push(entry);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
    }

    /// Newest last.
    pub fn snapshot_last_n(&self, n: usize) -> Vec<CycleRecord> {
        let v = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let start = v.len().saturating_sub(n);
        v[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CycleHistory {
    fn default() -> Self {
        Self::with_capacity(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_entries() {
        let h = CycleHistory::with_capacity(2);
        h.push_failed(CycleOutcome::Aborted, "one".into());
        h.push_failed(CycleOutcome::Panicked, "two".into());
        h.push_failed(CycleOutcome::Aborted, "three".into());
        assert_eq!(h.len(), 2);
        let last = h.snapshot_last_n(10);
        assert_eq!(last[0].error.as_deref(), Some("two"));
        assert_eq!(last[1].error.as_deref(), Some("three"));
        assert_eq!(h.snapshot_last_n(1)[0].outcome, CycleOutcome::Aborted);
    }
}
