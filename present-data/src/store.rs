//! Ownership and lookup of in-flight presents.
//!
//! All presents live in a generational arena; every index holds a
//! [`PresentId`], never a reference. Completion moves the present out of the
//! arena, which retires its id — an index entry pointing at a retired id is
//! simply purged the next time it is touched. That keeps the invariant that
//! a completed present can never be mutated through a leftover index entry,
//! without requiring every index to be scrubbed eagerly.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use etw_decode::EventHeader;

use crate::present::{CompositionTokenKey, PresentEvent, PresentMode, PresentResult, Runtime};
use crate::queue::CompletionQueue;

/// Handle to a present in the store. Stale handles (their present has been
/// completed and handed off) fail every lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresentId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    present: Option<PresentEvent>,
}

#[derive(Debug, Default)]
struct PresentPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl PresentPool {
    fn insert(&mut self, present: PresentEvent) -> PresentId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.present = Some(present);
            PresentId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                present: Some(present),
            });
            PresentId {
                index,
                generation: 0,
            }
        }
    }

    fn get(&self, id: PresentId) -> Option<&PresentEvent> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.present.as_ref()
    }

    fn get_mut(&mut self, id: PresentId) -> Option<&mut PresentEvent> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.present.as_mut()
    }

    fn remove(&mut self, id: PresentId) -> Option<PresentEvent> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let present = slot.present.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(present)
    }

    fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StoreStats {
    /// In-progress presents abandoned because a later event found them in an
    /// unexpected state. Nonzero values tend to track upstream event loss.
    pub stuck_presents: u64,
    /// Attempts to complete an already-completed present.
    pub double_completions: u64,
    pub completed_presents: u64,
}

/// Owns every in-flight present and the indexes used to find them by
/// whichever key the current pipeline stage has at hand.
pub struct PresentStore {
    pool: PresentPool,

    /// The single present currently between paired events on each thread.
    by_thread: FxHashMap<u32, PresentId>,
    /// Per-process, submission-ordered presents that have not progressed
    /// past their runtime call; a kernel event on another thread of the
    /// process adopts the earliest one (present batching).
    pending_by_process: FxHashMap<u32, BTreeMap<u64, PresentId>>,
    /// Per-(process, swapchain) submission order; drives completion order.
    by_process_swapchain: FxHashMap<(u32, u64), VecDeque<PresentId>>,
    by_submit_sequence: FxHashMap<u32, PresentId>,
    by_token: FxHashMap<u64, PresentId>,
    by_composition_key: FxHashMap<CompositionTokenKey, PresentId>,
    by_legacy_blit_token: FxHashMap<u64, PresentId>,
    /// Most recent windowed present per window, waiting for compositor
    /// pickup.
    by_last_window: FxHashMap<u64, PresentId>,
    /// Blits without a kernel present event, keyed by GPU context.
    by_blt_context: FxHashMap<u64, PresentId>,
    /// Presents that will ride along with the compositor's next present.
    dwm_waiting: VecDeque<PresentId>,
    /// Thread the compositor announced its next present on; consumed by the
    /// next flip on that thread.
    dwm_thread_id: u32,

    completed: Arc<CompletionQueue>,
    stats: StoreStats,
}

impl PresentStore {
    pub fn new(completed: Arc<CompletionQueue>) -> Self {
        PresentStore {
            pool: PresentPool::default(),
            by_thread: FxHashMap::default(),
            pending_by_process: FxHashMap::default(),
            by_process_swapchain: FxHashMap::default(),
            by_submit_sequence: FxHashMap::default(),
            by_token: FxHashMap::default(),
            by_composition_key: FxHashMap::default(),
            by_legacy_blit_token: FxHashMap::default(),
            by_last_window: FxHashMap::default(),
            by_blt_context: FxHashMap::default(),
            dwm_waiting: VecDeque::new(),
            dwm_thread_id: 0,
            completed,
            stats: StoreStats::default(),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.pool.len()
    }

    pub fn present(&self, id: PresentId) -> Option<&PresentEvent> {
        self.pool.get(id)
    }

    pub fn present_mut(&mut self, id: PresentId) -> Option<&mut PresentEvent> {
        self.pool.get_mut(id)
    }

    /// The in-progress present on `thread_id`, if it is still alive.
    pub fn thread_present(&mut self, thread_id: u32) -> Option<PresentId> {
        let id = *self.by_thread.get(&thread_id)?;
        if self.pool.get(id).is_some() {
            Some(id)
        } else {
            self.by_thread.remove(&thread_id);
            None
        }
    }

    pub fn remove_thread_present(&mut self, thread_id: u32) {
        self.by_thread.remove(&thread_id);
    }

    /// Abandons the in-progress present on `thread_id`. Used when an event
    /// finds the present in a state it should not be in yet; the abandoned
    /// present stays in its ordering deque and may only complete as a
    /// casualty of a later present on the same swapchain.
    pub fn discard_in_progress(&mut self, thread_id: u32) {
        if self.thread_present(thread_id).is_some() {
            self.by_thread.remove(&thread_id);
            self.stats.stuck_presents += 1;
        }
    }

    /// Registers a new present and makes it the in-progress present of its
    /// thread, displacing whatever was there.
    pub fn create(&mut self, present: PresentEvent) -> PresentId {
        let thread_id = present.thread_id;
        let process_id = present.process_id;
        let qpc_time = present.qpc_time;
        let swap_chain = present.swap_chain_id;

        let id = self.pool.insert(present);
        self.pending_by_process
            .entry(process_id)
            .or_default()
            .entry(qpc_time)
            .or_insert(id);
        self.by_process_swapchain
            .entry((process_id, swap_chain))
            .or_default()
            .push_back(id);
        self.by_thread.insert(thread_id, id);
        id
    }

    /// The present the event belongs to: the thread's in-progress present,
    /// or an adopted batched present from the same process, or a fresh
    /// kernel-originated present.
    pub fn find_or_create_by_thread(&mut self, header: &EventHeader) -> PresentId {
        if let Some(id) = self.thread_present(header.thread_id) {
            return id;
        }
        if let Some(id) = self.adopt_pending(header.process_id) {
            self.by_thread.insert(header.thread_id, id);
            return id;
        }
        self.create(PresentEvent::new(header, Runtime::Other))
    }

    /// Earliest present of the process that has not been classified yet.
    /// Entries that progressed past classification can never be adopted
    /// again and are dropped on the way.
    fn adopt_pending(&mut self, process_id: u32) -> Option<PresentId> {
        let pending = self.pending_by_process.get_mut(&process_id)?;
        loop {
            let (&qpc, &id) = pending.iter().next()?;
            pending.remove(&qpc);
            if let Some(p) = self.pool.get(id) {
                if p.present_mode == PresentMode::Unknown {
                    return Some(id);
                }
            }
        }
    }

    // Submit-sequence index.

    pub fn submit_sequence_present(&mut self, sequence: u32) -> Option<PresentId> {
        let id = *self.by_submit_sequence.get(&sequence)?;
        if self.pool.get(id).is_some() {
            Some(id)
        } else {
            self.by_submit_sequence.remove(&sequence);
            None
        }
    }

    pub fn index_submit_sequence(&mut self, sequence: u32, id: PresentId) {
        self.by_submit_sequence.insert(sequence, id);
    }

    // Kernel present-history token index.

    pub fn token_present(&mut self, token: u64) -> Option<PresentId> {
        let id = *self.by_token.get(&token)?;
        if self.pool.get(id).is_some() {
            Some(id)
        } else {
            self.by_token.remove(&token);
            None
        }
    }

    pub fn index_token(&mut self, token: u64, id: PresentId) {
        self.by_token.insert(token, id);
    }

    pub fn remove_token(&mut self, token: u64) {
        self.by_token.remove(&token);
    }

    // Composition token index.

    pub fn composition_present(&mut self, key: CompositionTokenKey) -> Option<PresentId> {
        let id = *self.by_composition_key.get(&key)?;
        if self.pool.get(id).is_some() {
            Some(id)
        } else {
            self.by_composition_key.remove(&key);
            None
        }
    }

    pub fn index_composition(&mut self, key: CompositionTokenKey, id: PresentId) {
        self.by_composition_key.insert(key, id);
    }

    pub fn remove_composition(&mut self, key: CompositionTokenKey) {
        self.by_composition_key.remove(&key);
    }

    // Legacy blit token index.

    pub fn legacy_blit_present(&mut self, token: u64) -> Option<PresentId> {
        let id = *self.by_legacy_blit_token.get(&token)?;
        if self.pool.get(id).is_some() {
            Some(id)
        } else {
            self.by_legacy_blit_token.remove(&token);
            None
        }
    }

    pub fn index_legacy_blit(&mut self, token: u64, id: PresentId) {
        self.by_legacy_blit_token.insert(token, id);
    }

    pub fn remove_legacy_blit(&mut self, token: u64) {
        self.by_legacy_blit_token.remove(&token);
    }

    // Last-present-per-window index.

    pub fn last_window_present(&mut self, hwnd: u64) -> Option<PresentId> {
        let id = *self.by_last_window.get(&hwnd)?;
        if self.pool.get(id).is_some() {
            Some(id)
        } else {
            self.by_last_window.remove(&hwnd);
            None
        }
    }

    pub fn set_last_window(&mut self, hwnd: u64, id: PresentId) {
        self.by_last_window.insert(hwnd, id);
    }

    pub fn clear_last_window(&mut self, hwnd: u64) {
        self.by_last_window.remove(&hwnd);
    }

    /// Empties the per-window table, returning the ids that are still alive.
    pub fn take_last_window_entries(&mut self) -> Vec<PresentId> {
        let entries: Vec<PresentId> = self
            .by_last_window
            .values()
            .copied()
            .filter(|&id| self.pool.get(id).is_some())
            .collect();
        self.by_last_window.clear();
        entries
    }

    // Blt-context index (blits whose kernel present event never comes).

    pub fn blt_context_present(&mut self, context: u64) -> Option<PresentId> {
        let id = *self.by_blt_context.get(&context)?;
        if self.pool.get(id).is_some() {
            Some(id)
        } else {
            self.by_blt_context.remove(&context);
            None
        }
    }

    pub fn index_blt_context(&mut self, context: u64, id: PresentId) {
        self.by_blt_context.insert(context, id);
    }

    pub fn remove_blt_context(&mut self, context: u64) {
        self.by_blt_context.remove(&context);
    }

    // Compositor ride-along bookkeeping.

    pub fn push_dwm_waiting(&mut self, id: PresentId) {
        self.dwm_waiting.push_back(id);
    }

    pub fn record_dwm_thread(&mut self, thread_id: u32) {
        self.dwm_thread_id = thread_id;
    }

    /// If `thread_id` is the announced compositor thread, hands over every
    /// present waiting to ride along and resets the announcement.
    pub fn adopt_dwm_waiting(&mut self, thread_id: u32) -> Option<Vec<PresentId>> {
        if self.dwm_thread_id == 0 || self.dwm_thread_id != thread_id {
            return None;
        }
        self.dwm_thread_id = 0;
        let pool = &self.pool;
        let ids: Vec<PresentId> = self
            .dwm_waiting
            .drain(..)
            .filter(|&id| pool.get(id).is_some())
            .collect();
        Some(ids)
    }

    /// Finishes a present's lifecycle and hands it (and everything it
    /// obligates) to the completion queue.
    ///
    /// Obligations are processed iteratively: dependents complete first,
    /// inheriting this present's screen time; a presented frame forces every
    /// earlier present on its (process, swapchain) deque to complete first,
    /// discarded if they never got a verdict of their own. The queue
    /// therefore always receives presents in submission order per swapchain.
    pub fn complete(&mut self, root: PresentId) {
        let mut work = vec![root];
        while let Some(id) = work.pop() {
            let Some(p) = self.pool.get(id) else { continue };
            if p.completed {
                self.stats.double_completions += 1;
                if let Some(p) = self.pool.get_mut(id) {
                    p.final_state = PresentResult::Error;
                }
                continue;
            }

            if !p.dependent_presents.is_empty() {
                let screen_time = p.screen_time;
                let deps = std::mem::take(&mut self.pool.get_mut(id).unwrap().dependent_presents);
                work.push(id);
                for &dep in deps.iter().rev() {
                    if let Some(d) = self.pool.get_mut(dep) {
                        if !d.completed {
                            d.screen_time = screen_time;
                            d.final_state = PresentResult::Presented;
                        }
                        work.push(dep);
                    }
                }
                continue;
            }

            let (process_id, swap_chain, final_state) = {
                let p = self.pool.get(id).unwrap();
                (p.process_id, p.swap_chain_id, p.final_state)
            };
            let key = (process_id, swap_chain);

            if final_state == PresentResult::Presented {
                let front = self
                    .by_process_swapchain
                    .get(&key)
                    .and_then(|deque| deque.front().copied());
                if let Some(front_id) = front {
                    if front_id != id {
                        if self.pool.get(front_id).is_none() {
                            self.by_process_swapchain
                                .get_mut(&key)
                                .unwrap()
                                .pop_front();
                            work.push(id);
                            continue;
                        }
                        if let Some(f) = self.pool.get_mut(front_id) {
                            if f.final_state == PresentResult::Unknown {
                                f.final_state = PresentResult::Discarded;
                            }
                        }
                        work.push(id);
                        work.push(front_id);
                        continue;
                    }
                }
            }

            self.unlink(id);
            self.pool.get_mut(id).unwrap().completed = true;
            self.drain_completed(key);
        }
    }

    /// Removes every index entry known to point at `id`. The blt-context and
    /// legacy-blit-token indexes are keyed by values not kept on the present
    /// and are purged lazily at lookup instead.
    fn unlink(&mut self, id: PresentId) {
        let (sequence, token, hwnd, comp_key, process_id, qpc_time) = {
            let p = self.pool.get(id).unwrap();
            (
                p.queue_submit_sequence,
                p.token_ptr,
                p.hwnd,
                p.composition_token_key,
                p.process_id,
                p.qpc_time,
            )
        };
        if sequence != 0 && self.by_submit_sequence.get(&sequence) == Some(&id) {
            self.by_submit_sequence.remove(&sequence);
        }
        if token != 0 && self.by_token.get(&token) == Some(&id) {
            self.by_token.remove(&token);
        }
        if hwnd != 0 && self.by_last_window.get(&hwnd) == Some(&id) {
            self.by_last_window.remove(&hwnd);
        }
        if let Some(key) = comp_key {
            if self.by_composition_key.get(&key) == Some(&id) {
                self.by_composition_key.remove(&key);
            }
        }
        if let Some(pending) = self.pending_by_process.get_mut(&process_id) {
            if pending.get(&qpc_time) == Some(&id) {
                pending.remove(&qpc_time);
            }
        }
    }

    /// Pops the run of completed presents at the front of the deque and
    /// pushes them to the queue in one batch.
    fn drain_completed(&mut self, key: (u32, u64)) {
        let Some(deque) = self.by_process_swapchain.get_mut(&key) else {
            return;
        };
        let mut batch = Vec::new();
        loop {
            let Some(&front) = deque.front() else { break };
            match self.pool.get(front) {
                Some(p) if p.completed => {}
                Some(_) => break,
                None => {
                    deque.pop_front();
                    continue;
                }
            }
            deque.pop_front();
            batch.push(self.pool.remove(front).unwrap());
        }
        if deque.is_empty() {
            self.by_process_swapchain.remove(&key);
        }
        if !batch.is_empty() {
            self.stats.completed_presents += batch.len() as u64;
            self.completed.push_batch(batch);
        }
    }
}
