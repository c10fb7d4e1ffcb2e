//! Hand-off buffer between the correlation thread and consumers.

use std::sync::Mutex;

use crate::present::PresentEvent;

/// Completed presents, in per-(process, swapchain) submission order, waiting
/// for a consumer to drain them. The correlation thread pushes one batch per
/// completion under a single lock acquisition; any thread may drain.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    completed: Mutex<Vec<PresentEvent>>,
}

impl CompletionQueue {
    pub fn push_batch(&self, batch: Vec<PresentEvent>) {
        if batch.is_empty() {
            return;
        }
        let mut completed = self.completed.lock().unwrap();
        completed.extend(batch);
    }

    /// Takes everything queued so far. Empty when nothing completed since
    /// the last call.
    pub fn drain(&self) -> Vec<PresentEvent> {
        let mut completed = self.completed.lock().unwrap();
        std::mem::take(&mut *completed)
    }
}
