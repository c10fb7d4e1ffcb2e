//! Frame boundaries reported by application-side markers.
//!
//! Renderers that emit BeginFrame/EndFrame marker strings get their CPU
//! frame spans recorded and tied to the present that was in flight on the
//! marking thread, which lets a consumer line up simulation time with
//! display time.

use rustc_hash::FxHashMap;

use crate::store::PresentId;

#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub start_time: u64,
    pub end_time: u64,
    /// Present in flight on the marker thread at EndFrame. The id may have
    /// retired by the time the frame is drained; it is a correlation hint,
    /// not a live handle.
    pub present: Option<PresentId>,
}

#[derive(Debug, Default)]
pub struct FrameTracker {
    in_progress: FxHashMap<u32, u64>,
    frames: Vec<Frame>,
}

impl FrameTracker {
    pub fn begin(&mut self, thread_id: u32, qpc_time: u64) {
        if let Some(prev) = self.in_progress.insert(thread_id, qpc_time) {
            log::debug!("thread {thread_id}: BeginFrame at {qpc_time} while frame from {prev} still open");
        }
    }

    pub fn end(&mut self, thread_id: u32, qpc_time: u64, present: Option<PresentId>) {
        let Some(start_time) = self.in_progress.remove(&thread_id) else {
            log::debug!("thread {thread_id}: EndFrame at {qpc_time} without BeginFrame");
            return;
        };
        self.frames.push(Frame {
            start_time,
            end_time: qpc_time,
            present,
        });
    }

    pub fn drain(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.frames)
    }
}
