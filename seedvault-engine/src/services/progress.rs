//! Live progress of running runs, polled by status readers.
//!
//! Each entry is written only by the worker that owns the run and removed
//! when the run terminates.

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
}

impl RunProgress {
    fn new(current: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            (current as f64 / total as f64 * 100.0).min(100.0)
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProgressTable {
    entries: DashMap<i64, RunProgress>,
}

impl ProgressTable {
    pub fn start(&self, run_id: i64) {
        self.entries.insert(run_id, RunProgress::new(0, 0));
    }

    pub fn set_total(&self, run_id: i64, total: u64) {
        if let Some(mut entry) = self.entries.get_mut(&run_id) {
            *entry = RunProgress::new(entry.current, total);
        }
    }

    pub fn advance(&self, run_id: i64) {
        if let Some(mut entry) = self.entries.get_mut(&run_id) {
            *entry = RunProgress::new(entry.current + 1, entry.total);
        }
    }

    pub fn get(&self, run_id: i64) -> Option<RunProgress> {
        self.entries.get(&run_id).map(|e| *e)
    }

    pub fn finish(&self, run_id: i64) {
        self.entries.remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_lifecycle() {
        let table = ProgressTable::default();
        assert!(table.get(1).is_none());

        table.start(1);
        assert_eq!(table.get(1).unwrap().percentage, 0.0);
        table.set_total(1, 4);
        table.advance(1);
        let p = table.get(1).unwrap();
        assert_eq!((p.current, p.total), (1, 4));
        assert_eq!(p.percentage, 25.0);

        table.finish(1);
        assert!(table.get(1).is_none());
        table.advance(1);
        assert!(table.get(1).is_none());
    }
}
