use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineStatusSnapshot {
    pub busy: bool,
    pub job_name: String,
    pub docs: usize,
    pub job_start: Option<DateTime<Utc>>,
    pub latest_message: String,
    /// Most recent messages, oldest first.
    pub history_messages: Vec<String>,
}

/// Progress of the current processing run, shared with status readers.
pub struct PipelineStatus {
    inner: Mutex<PipelineStatusSnapshot>,
    history_len: usize,
}

impl PipelineStatus {
    pub fn new(history_len: usize) -> Self {
        Self {
            inner: Mutex::new(PipelineStatusSnapshot::default()),
            history_len: history_len.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineStatusSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self, job_name: &str, docs: usize) {
        {
            let mut state = self.lock();
            state.busy = true;
            state.job_name = job_name.to_string();
            state.docs = docs;
            state.job_start = Some(Utc::now());
        }
        self.message(format!("{job_name}: {docs} document(s) queued"));
    }

    pub fn message(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.lock();
        state.history_messages.push(message.clone());
        let overflow = state.history_messages.len().saturating_sub(self.history_len);
        if overflow > 0 {
            state.history_messages.drain(..overflow);
        }
        state.latest_message = message;
    }

    pub fn end(&self, message: impl Into<String>) {
        self.message(message);
        self.lock().busy = false;
    }

    pub fn snapshot(&self) -> PipelineStatusSnapshot {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_a_bounded_history() {
        let status = PipelineStatus::new(3);
        status.begin("batch", 2);
        for i in 0..4 {
            status.message(format!("step {i}"));
        }
        status.end("done");

        let snapshot = status.snapshot();
        assert!(!snapshot.busy);
        assert_eq!(snapshot.docs, 2);
        assert_eq!(snapshot.latest_message, "done");
        assert_eq!(snapshot.history_messages, vec!["step 2", "step 3", "done"]);
    }
}
