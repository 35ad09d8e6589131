use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use state_machines::state_machine;

use crate::error::AppError;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    #[default]
    Pending,
    Processing,
    Preprocessed,
    Processed,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Processing => "processing",
            DocStatus::Preprocessed => "preprocessed",
            DocStatus::Processed => "processed",
            DocStatus::Failed => "failed",
        }
    }

    /// Statuses picked up by a processing run.
    pub fn needs_processing(&self) -> bool {
        !matches!(self, DocStatus::Processed)
    }

    pub fn all() -> [DocStatus; 5] {
        [
            DocStatus::Pending,
            DocStatus::Processing,
            DocStatus::Preprocessed,
            DocStatus::Processed,
            DocStatus::Failed,
        ]
    }
}

impl fmt::Display for DocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        DocStatus::all()
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| AppError::Validation(format!("unknown document status '{value}'")))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DocTransition {
    Start,
    Preprocess,
    Complete,
    Fail,
}

impl DocTransition {
    fn as_str(&self) -> &'static str {
        match self {
            DocTransition::Start => "start",
            DocTransition::Preprocess => "preprocess",
            DocTransition::Complete => "complete",
            DocTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: DocumentLifecycle,
        initial: Pending,
        states: [Pending, Processing, Preprocessed, Processed, Failed],
        events {
            start {
                transition: { from: Pending, to: Processing }
                transition: { from: Preprocessed, to: Processing }
                transition: { from: Failed, to: Processing }
            }
            preprocess {
                transition: { from: Processing, to: Preprocessed }
            }
            complete {
                transition: { from: Preprocessed, to: Processed }
            }
            fail {
                transition: { from: Pending, to: Failed }
                transition: { from: Processing, to: Failed }
                transition: { from: Preprocessed, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> DocumentLifecycle<(), Pending> {
        DocumentLifecycle::new(())
    }

    pub(super) fn processing() -> Option<DocumentLifecycle<(), Processing>> {
        pending().start().ok()
    }

    pub(super) fn preprocessed() -> Option<DocumentLifecycle<(), Preprocessed>> {
        processing()?.preprocess().ok()
    }

    pub(super) fn failed() -> Option<DocumentLifecycle<(), Failed>> {
        pending().fail().ok()
    }
}

fn invalid_transition(status: DocStatus, event: DocTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid document transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

/// Validates `event` against the document lifecycle and returns the new status.
/// A document left in `processing` by an interrupted run may be started again.
pub fn next_status(status: DocStatus, event: DocTransition) -> Result<DocStatus, AppError> {
    use lifecycle::{failed, pending, preprocessed, processing};
    let next = match (status, event) {
        (DocStatus::Pending, DocTransition::Start) => {
            pending().start().ok().map(|_| DocStatus::Processing)
        }
        (DocStatus::Preprocessed, DocTransition::Start) => preprocessed()
            .and_then(|machine| machine.start().ok())
            .map(|_| DocStatus::Processing),
        (DocStatus::Failed, DocTransition::Start) => failed()
            .and_then(|machine| machine.start().ok())
            .map(|_| DocStatus::Processing),
        (DocStatus::Processing, DocTransition::Start) => Some(DocStatus::Processing),
        (DocStatus::Processing, DocTransition::Preprocess) => processing()
            .and_then(|machine| machine.preprocess().ok())
            .map(|_| DocStatus::Preprocessed),
        (DocStatus::Preprocessed, DocTransition::Complete) => preprocessed()
            .and_then(|machine| machine.complete().ok())
            .map(|_| DocStatus::Processed),
        (DocStatus::Pending, DocTransition::Fail) => failed().map(|_| DocStatus::Failed),
        (DocStatus::Processing, DocTransition::Fail) => processing()
            .and_then(|machine| machine.fail().ok())
            .map(|_| DocStatus::Failed),
        (DocStatus::Preprocessed, DocTransition::Fail) => preprocessed()
            .and_then(|machine| machine.fail().ok())
            .map(|_| DocStatus::Failed),
        _ => None,
    };
    next.ok_or_else(|| invalid_transition(status, event))
}

/// Status row of one ingested document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub status: DocStatus,
    pub content_summary: String,
    pub content_length: usize,
    pub file_path: String,
    pub track_id: String,
    #[serde(default)]
    pub chunk_ids: Vec<String>,
    #[serde(default)]
    pub chunks_count: usize,
    #[serde(default)]
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const UNKNOWN_SOURCE: &str = "unknown_source";

impl DocumentRecord {
    pub fn new(id: String, content: &str, file_path: Option<String>, track_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: DocStatus::Pending,
            content_summary: content.trim().chars().take(100).collect(),
            content_length: content.chars().count(),
            file_path: file_path.unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
            track_id,
            chunk_ids: Vec::new(),
            chunks_count: 0,
            error_msg: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, event: DocTransition) -> Result<(), AppError> {
        self.status = next_status(self.status, event)?;
        self.updated_at = Utc::now();
        if !matches!(event, DocTransition::Fail) {
            self.error_msg = None;
        }
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), AppError> {
        self.apply(DocTransition::Fail)?;
        self.error_msg = Some(message.into());
        Ok(())
    }
}
