//! Duplicate-handling decision flow for one ingested question:
//! scanning -> (duplicates found) awaiting the user's choice -> resolved.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dedup::{DuplicateCandidate, DuplicateReport};

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DuplicateFlow {
  Scanning,
  AwaitingUserDecision { duplicates: Vec<DuplicateCandidate>, count: usize },
  Resolved { resolution: Resolution },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Resolution {
  /// Store as a new question.
  Insert,
  /// Overwrite an existing question instead of adding a new one.
  Update {
    #[serde(rename = "targetId")]
    target_id: String,
  },
  Cancelled,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UserDecision {
  UpdateExisting,
  KeepBoth,
  Cancel,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
  #[error("cannot {action} while {state}")]
  InvalidTransition { action: &'static str, state: &'static str },
}

impl Default for DuplicateFlow {
  fn default() -> Self { DuplicateFlow::Scanning }
}

impl DuplicateFlow {
  pub fn new() -> Self { Self::default() }

  fn state_name(&self) -> &'static str {
    match self {
      DuplicateFlow::Scanning => "scanning",
      DuplicateFlow::AwaitingUserDecision { .. } => "awaiting user decision",
      DuplicateFlow::Resolved { .. } => "resolved",
    }
  }

  /// Feed the scan result. Without duplicates the flow resolves to `Insert`
  /// right away; otherwise it waits for the user.
  pub fn on_scan_complete(self, report: DuplicateReport) -> Result<Self, FlowError> {
    match self {
      DuplicateFlow::Scanning if report.duplicates.is_empty() => {
        Ok(DuplicateFlow::Resolved { resolution: Resolution::Insert })
      }
      DuplicateFlow::Scanning => Ok(DuplicateFlow::AwaitingUserDecision {
        duplicates: report.duplicates,
        count: report.count,
      }),
      other => Err(FlowError::InvalidTransition { action: "complete a scan", state: other.state_name() }),
    }
  }

  /// Apply the user's choice. `UpdateExisting` targets the best-ranked match.
  pub fn decide(self, decision: UserDecision) -> Result<Self, FlowError> {
    match self {
      DuplicateFlow::AwaitingUserDecision { duplicates, .. } => {
        let resolution = match (decision, duplicates.first()) {
          (UserDecision::UpdateExisting, Some(top)) => Resolution::Update { target_id: top.id.clone() },
          (UserDecision::UpdateExisting, None) | (UserDecision::KeepBoth, _) => Resolution::Insert,
          (UserDecision::Cancel, _) => Resolution::Cancelled,
        };
        Ok(DuplicateFlow::Resolved { resolution })
      }
      other => Err(FlowError::InvalidTransition { action: "decide", state: other.state_name() }),
    }
  }

  pub fn resolution(&self) -> Option<&Resolution> {
    match self {
      DuplicateFlow::Resolved { resolution } => Some(resolution),
      _ => None,
    }
  }

  pub fn is_resolved(&self) -> bool {
    self.resolution().is_some()
  }
}
