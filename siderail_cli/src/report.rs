use serde::Serialize;
use siderail_core::extract::{Capture, MARKER_WORD};
use siderail_core::{BranchState, PrefixRecord};
use std::fmt::Write;

use crate::executor::{ExecutionStatus, RunResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tuple {
    pub slot: usize,
    pub value: u8,
}

/// Histogram of map bytes read as branch records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BranchSummary {
    pub only_true: usize,
    pub only_false: usize,
    pub both: usize,
}

impl BranchSummary {
    pub fn from_map(area: &[u8]) -> Self {
        let mut summary = Self::default();
        for &byte in area {
            match BranchState::from_byte(byte) {
                Some(BranchState::OnlyTrue) => summary.only_true += 1,
                Some(BranchState::OnlyFalse) => summary.only_false += 1,
                Some(BranchState::Both) => summary.both += 1,
                Some(BranchState::Unseen) | None => {}
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub input: String,
    pub pid: i32,
    pub status: ExecutionStatus,
    pub digest: String,
    pub branches: BranchSummary,
    pub tuples: Vec<Tuple>,
}

impl TraceReport {
    pub fn new(input: impl Into<String>, run: &RunResult, area: &[u8]) -> Self {
        let tuples = area
            .iter()
            .enumerate()
            .filter(|&(_, &value)| value != 0)
            .map(|(slot, &value)| Tuple { slot, value })
            .collect();
        Self {
            input: input.into(),
            pid: run.pid,
            status: run.status.clone(),
            digest: format!("{:x}", md5::compute(area)),
            branches: BranchSummary::from_map(area),
            tuples,
        }
    }

    /// afl-showmap style `slot:value` lines.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for t in &self.tuples {
            let _ = writeln!(out, "{:06}:{}", t.slot, t.value);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub input: String,
    pub pid: i32,
    pub status: ExecutionStatus,
    pub branch: i32,
    pub op1: Option<i32>,
    pub op2: Option<i32>,
}

impl ExtractReport {
    pub fn new(input: impl Into<String>, branch: i32, run: &RunResult, capture: Option<Capture>) -> Self {
        Self {
            input: input.into(),
            pid: run.pid,
            status: run.status.clone(),
            branch,
            op1: capture.map(|c| c.op1),
            op2: capture.map(|c| c.op2),
        }
    }

    pub fn render_text(&self) -> String {
        match (self.op1, self.op2) {
            (Some(op1), Some(op2)) => format!("branch {}: op1={} op2={}", self.branch, op1, op2),
            _ => format!("branch {}: not reached", self.branch),
        }
    }
}

/// Decodes one slot written by a length-limited string comparison.
pub fn prefix_record(area: &[u8], slot: usize) -> Option<PrefixRecord> {
    // The first words belong to extraction mode, not to branch records.
    if slot < (MARKER_WORD + 1) * 4 {
        return None;
    }
    area.get(slot).map(|&byte| PrefixRecord::from_byte(byte))
}
