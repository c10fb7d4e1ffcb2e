//! Process start/end observation, drained separately from presents.

use std::sync::Mutex;

/// A process coming or going. An empty `image_file_name` means the process
/// ended.
#[derive(Debug, Clone)]
pub struct ProcessEvent {
    pub process_id: u32,
    pub image_file_name: String,
    pub qpc_time: u64,
}

/// Mutex-protected hand-off buffer, same shape as the completion queue.
#[derive(Debug, Default)]
pub struct ProcessEventQueue {
    events: Mutex<Vec<ProcessEvent>>,
}

impl ProcessEventQueue {
    pub fn push(&self, event: ProcessEvent) {
        let mut events = self.events.lock().unwrap();
        events.push(event);
    }

    pub fn drain(&self) -> Vec<ProcessEvent> {
        let mut events = self.events.lock().unwrap();
        std::mem::take(&mut *events)
    }
}
