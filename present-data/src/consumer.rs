//! The correlation state machine.
//!
//! One consumer thread feeds events here in timestamp order. The dispatcher
//! resolves the provider family, decodes the named fields the handler needs,
//! and applies the handler's transition to the present store. A present that
//! reaches the end of its lifecycle is handed to the completion queue, from
//! which any thread may drain.
//!
//! Handlers never fail: a field that cannot be decoded skips that handler's
//! correlation step and bumps a counter, nothing more.

use std::sync::Arc;

use etw_decode::parser::{Parser, TryParse};
use etw_decode::schema::{EventSchema, SchemaLocator, SchemaSource};
use etw_decode::{EventHeader, RawEvent};
use uuid::Uuid;

use crate::frames::{Frame, FrameTracker};
use crate::legacy;
use crate::present::{
    CompositionTokenKey, PresentEvent, PresentFlags, PresentMode, PresentResult, Runtime,
};
use crate::process::{ProcessEvent, ProcessEventQueue};
use crate::providers::{
    d3d11, d3d9, dwm, dxgi, dxgkrnl, win32k, ProviderKind, ProviderRegistry, OPCODE_DC_START,
    OPCODE_DC_STOP, OPCODE_INFO, OPCODE_START, OPCODE_STOP,
};
use crate::queue::CompletionQueue;
use crate::store::PresentStore;

#[derive(Debug, Clone, Copy)]
pub struct ConsumerOptions {
    /// Track only runtime present start/stop; every present completes at its
    /// runtime stop and the kernel/compositor sources are ignored.
    pub simple_mode: bool,
    /// Tick frequency of the event timestamps, supplied by the session at
    /// startup. Carried for consumers; the engine never converts.
    pub qpc_frequency: u64,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            simple_mode: false,
            qpc_frequency: 10_000_000,
        }
    }
}

/// Counters surfaced to consumers; none of them stop the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceStats {
    pub completed_presents: u64,
    /// In-progress presents abandoned in an unexpected state; tends to track
    /// upstream event loss.
    pub stuck_presents: u64,
    pub double_completions: u64,
    pub decode_misses: u64,
    pub events_lost: u64,
    pub buffers_lost: u64,
}

pub struct PresentTraceConsumer {
    options: ConsumerOptions,
    providers: ProviderRegistry,
    locator: SchemaLocator,
    store: PresentStore,
    completed: Arc<CompletionQueue>,
    process_events: Arc<ProcessEventQueue>,
    frames: FrameTracker,
    decode_misses: u64,
    events_lost: u64,
    buffers_lost: u64,
}

impl PresentTraceConsumer {
    pub fn new(options: ConsumerOptions) -> Self {
        let completed = Arc::new(CompletionQueue::default());
        PresentTraceConsumer {
            options,
            providers: ProviderRegistry::default(),
            locator: SchemaLocator::new(),
            store: PresentStore::new(completed.clone()),
            completed,
            process_events: Arc::new(ProcessEventQueue::default()),
            frames: FrameTracker::default(),
            decode_misses: 0,
            events_lost: 0,
            buffers_lost: 0,
        }
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn qpc_frequency(&self) -> u64 {
        self.options.qpc_frequency
    }

    /// Maps an additional provider id onto one of the handled families.
    pub fn register_provider(&mut self, provider: Uuid, kind: ProviderKind) {
        self.providers.register(provider, kind);
    }

    pub fn add_event_schema(
        &mut self,
        provider: Uuid,
        event_id: u16,
        version: u8,
        schema: EventSchema,
    ) {
        self.locator.add_schema(provider, event_id, version, schema);
    }

    pub fn set_schema_source(&mut self, source: Box<dyn SchemaSource>) {
        self.locator.set_source(source);
    }

    /// Shared handle to the completed-present queue, for draining from
    /// another thread.
    pub fn completion_queue(&self) -> Arc<CompletionQueue> {
        self.completed.clone()
    }

    pub fn process_event_queue(&self) -> Arc<ProcessEventQueue> {
        self.process_events.clone()
    }

    pub fn drain_completed(&self) -> Vec<PresentEvent> {
        self.completed.drain()
    }

    pub fn drain_process_events(&self) -> Vec<ProcessEvent> {
        self.process_events.drain()
    }

    pub fn drain_frames(&mut self) -> Vec<Frame> {
        self.frames.drain()
    }

    /// Folds in the session's periodic lost-event counters.
    pub fn record_lost_events(&mut self, events_lost: u32, buffers_lost: u32) {
        if events_lost != 0 || buffers_lost != 0 {
            log::warn!("{events_lost} events and {buffers_lost} buffers lost");
        }
        self.events_lost += events_lost as u64;
        self.buffers_lost += buffers_lost as u64;
    }

    pub fn stats(&self) -> TraceStats {
        let store = self.store.stats();
        TraceStats {
            completed_presents: store.completed_presents,
            stuck_presents: store.stuck_presents,
            double_completions: store.double_completions,
            decode_misses: self.decode_misses,
            events_lost: self.events_lost,
            buffers_lost: self.buffers_lost,
        }
    }

    pub fn in_flight_presents(&self) -> usize {
        self.store.in_flight()
    }

    pub fn handle_event(&mut self, event: &RawEvent) {
        let Some(kind) = self.providers.kind(&event.header.provider_id) else {
            return;
        };
        if self.options.simple_mode
            && !matches!(
                kind,
                ProviderKind::Dxgi | ProviderKind::D3d9 | ProviderKind::NtProcess
            )
        {
            return;
        }
        match kind {
            ProviderKind::Dxgi => self.handle_dxgi_event(event),
            ProviderKind::D3d9 => self.handle_d3d9_event(event),
            ProviderKind::D3d11 => self.handle_d3d11_event(event),
            ProviderKind::DxgKrnl => self.handle_dxgkrnl_event(event),
            ProviderKind::Win32k => self.handle_win32k_event(event),
            ProviderKind::Dwm => self.handle_dwm_event(event, false),
            ProviderKind::LegacyDwm => self.handle_dwm_event(event, true),
            ProviderKind::NtProcess => self.handle_process_event(event),
            ProviderKind::LegacyBlt => {
                if let Some(blt) = legacy::parse_blt(event) {
                    self.dxgk_blit(&event.header, blt.hwnd, blt.redirected_present);
                } else {
                    self.decode_misses += 1;
                }
            }
            ProviderKind::LegacyFlip => {
                if let Some(flip) = legacy::parse_flip(event) {
                    self.dxgk_flip(&event.header, flip.flip_interval as i32, flip.mmio);
                } else {
                    self.decode_misses += 1;
                }
            }
            ProviderKind::LegacyPresentHistory => match event.header.opcode {
                OPCODE_START => {
                    if let Some(token) = legacy::parse_present_history_token(event) {
                        self.dxgk_submit_present_history(
                            &event.header,
                            token,
                            0,
                            PresentMode::Unknown,
                        );
                    } else {
                        self.decode_misses += 1;
                    }
                }
                OPCODE_INFO => {
                    if let Some(token) = legacy::parse_present_history_token(event) {
                        self.dxgk_propagate_present_history(&event.header, token);
                    } else {
                        self.decode_misses += 1;
                    }
                }
                _ => {}
            },
            ProviderKind::LegacyQueuePacket => match event.header.opcode {
                OPCODE_START => {
                    if let Some(submit) = legacy::parse_queue_submit(event) {
                        self.dxgk_queue_submit(
                            &event.header,
                            submit.packet_type,
                            submit.submit_sequence,
                            submit.context,
                            submit.present,
                            false,
                        );
                    } else {
                        self.decode_misses += 1;
                    }
                }
                OPCODE_STOP => {
                    if let Some(sequence) = legacy::parse_queue_complete_sequence(event) {
                        self.dxgk_queue_complete(&event.header, sequence);
                    } else {
                        self.decode_misses += 1;
                    }
                }
                _ => {}
            },
            ProviderKind::LegacyVSyncDpc => {
                if let Some(sequence) = legacy::parse_vsync_dpc_sequence(event) {
                    self.dxgk_sync_dpc(&event.header, sequence);
                } else {
                    self.decode_misses += 1;
                }
            }
            ProviderKind::LegacyMmioFlip => {
                if let Some(flip) = legacy::parse_mmio_flip(event) {
                    self.dxgk_mmio_flip(&event.header, flip.flip_submit_sequence, flip.flags);
                } else {
                    self.decode_misses += 1;
                }
            }
        }
    }

    // Runtime events.

    fn handle_dxgi_event(&mut self, event: &RawEvent) {
        match event.header.event_id {
            dxgi::PRESENT_START | dxgi::PRESENT_MPO_START => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(swap_chain), Ok(flags), Ok(sync_interval)) = (
                    TryParse::<u64>::try_parse(&mut parser, "pIDXGISwapChain"),
                    TryParse::<u32>::try_parse(&mut parser, "Flags"),
                    TryParse::<i32>::try_parse(&mut parser, "SyncInterval"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                self.runtime_present_start(
                    &event.header,
                    Runtime::Dxgi,
                    swap_chain,
                    PresentFlags::from_bits_retain(flags),
                    sync_interval,
                );
            }
            dxgi::PRESENT_STOP | dxgi::PRESENT_MPO_STOP => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let Ok(result) = TryParse::<u32>::try_parse(&mut parser, "Result") else {
                    self.decode_misses += 1;
                    return;
                };
                let succeeded = (result as i32) >= 0;
                let allow_batching = succeeded
                    && result != dxgi::STATUS_OCCLUDED
                    && result != dxgi::STATUS_MODE_CHANGE_IN_PROGRESS
                    && result != dxgi::STATUS_NO_DESKTOP_ACCESS;
                self.runtime_present_stop(&event.header, allow_batching);
            }
            _ => {}
        }
    }

    fn handle_d3d9_event(&mut self, event: &RawEvent) {
        match event.header.event_id {
            d3d9::PRESENT_START => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(swap_chain), Ok(flags)) = (
                    TryParse::<u64>::try_parse(&mut parser, "pSwapchain"),
                    TryParse::<u32>::try_parse(&mut parser, "Flags"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut present_flags = PresentFlags::empty();
                if flags & d3d9::PRESENT_DONOTFLIP != 0 {
                    present_flags |= PresentFlags::DO_NOT_SEQUENCE;
                }
                if flags & d3d9::PRESENT_DONOTWAIT != 0 {
                    present_flags |= PresentFlags::DO_NOT_WAIT;
                }
                if flags & d3d9::PRESENT_FLIPRESTART != 0 {
                    present_flags |= PresentFlags::RESTART;
                }
                let sync_interval = if flags & d3d9::PRESENT_FORCEIMMEDIATE != 0 {
                    0
                } else {
                    -1
                };
                self.runtime_present_start(
                    &event.header,
                    Runtime::D3d9,
                    swap_chain,
                    present_flags,
                    sync_interval,
                );
            }
            d3d9::PRESENT_STOP => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let Ok(result) = TryParse::<u32>::try_parse(&mut parser, "Result") else {
                    self.decode_misses += 1;
                    return;
                };
                let succeeded = (result as i32) >= 0;
                let allow_batching = succeeded && result != d3d9::S_PRESENT_OCCLUDED;
                self.runtime_present_stop(&event.header, allow_batching);
            }
            _ => {}
        }
    }

    fn runtime_present_start(
        &mut self,
        header: &EventHeader,
        runtime: Runtime,
        swap_chain: u64,
        flags: PresentFlags,
        sync_interval: i32,
    ) {
        // A fullscreen-status probe presents nothing.
        if flags.contains(PresentFlags::TEST) {
            return;
        }
        let mut present = PresentEvent::new(header, runtime);
        present.swap_chain_id = swap_chain;
        present.present_flags = flags;
        present.sync_interval = sync_interval;
        self.store.create(present);
    }

    fn runtime_present_stop(&mut self, header: &EventHeader, allow_batching: bool) {
        let Some(id) = self.store.thread_present(header.thread_id) else {
            return;
        };
        let complete_now = !allow_batching || self.options.simple_mode;
        {
            let present = self.store.present_mut(id).unwrap();
            debug_assert!(present.qpc_time <= header.timestamp_qpc);
            present.time_taken = header.timestamp_qpc.saturating_sub(present.qpc_time);
            if complete_now {
                present.final_state = if allow_batching {
                    PresentResult::Presented
                } else {
                    PresentResult::Discarded
                };
            }
        }
        if complete_now {
            self.store.complete(id);
        }
        self.store.remove_thread_present(header.thread_id);
    }

    // Kernel graphics events.

    fn handle_dxgkrnl_event(&mut self, event: &RawEvent) {
        let header = event.header;
        match header.event_id {
            dxgkrnl::FLIP => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(flip_interval), Ok(mmio)) = (
                    TryParse::<u32>::try_parse(&mut parser, "FlipInterval"),
                    TryParse::<bool>::try_parse(&mut parser, "MMIOFlip"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                self.dxgk_flip(&header, flip_interval as i32, mmio);
            }
            dxgkrnl::FLIP_MPO => {
                self.dxgk_flip(&header, -1, true);
            }
            dxgkrnl::QUEUE_SUBMIT => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(packet_type), Ok(sequence), Ok(context), Ok(present)) = (
                    TryParse::<u32>::try_parse(&mut parser, "PacketType"),
                    TryParse::<u32>::try_parse(&mut parser, "SubmitSequence"),
                    TryParse::<u64>::try_parse(&mut parser, "hContext"),
                    TryParse::<bool>::try_parse(&mut parser, "bPresent"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                self.dxgk_queue_submit(&header, packet_type, sequence, context, present, true);
            }
            dxgkrnl::QUEUE_COMPLETE => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let Ok(sequence) = TryParse::<u32>::try_parse(&mut parser, "SubmitSequence") else {
                    self.decode_misses += 1;
                    return;
                };
                self.dxgk_queue_complete(&header, sequence);
            }
            dxgkrnl::MMIO_FLIP => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(sequence), Ok(flags)) = (
                    TryParse::<u32>::try_parse(&mut parser, "FlipSubmitSequence"),
                    TryParse::<u32>::try_parse(&mut parser, "Flags"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                self.dxgk_mmio_flip(&header, sequence, flags);
            }
            dxgkrnl::MMIO_FLIP_MPO => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let Ok(fence) = TryParse::<u64>::try_parse(&mut parser, "FlipSubmitSequence")
                else {
                    self.decode_misses += 1;
                    return;
                };
                // The flip-entry status only exists from version 2 on.
                let status = if header.version >= 2 {
                    TryParse::<u32>::try_parse(&mut parser, "FlipEntryStatusAfterFlip").ok()
                } else {
                    None
                };
                self.dxgk_mmio_flip_mpo(&header, (fence >> 32) as u32, status);
            }
            dxgkrnl::HSYNC_DPC_MULTIPLANE => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let Ok(count) = TryParse::<u32>::try_parse(&mut parser, "FlipEntryCount") else {
                    self.decode_misses += 1;
                    return;
                };
                let mut sequences = Vec::with_capacity(count as usize);
                for i in 0..count as usize {
                    match parser.try_parse_u64_at("FlipSubmitSequence", i) {
                        Ok(fence) => sequences.push((fence >> 32) as u32),
                        Err(_) => {
                            self.decode_misses += 1;
                            break;
                        }
                    }
                }
                for sequence in sequences {
                    self.dxgk_sync_dpc(&header, sequence);
                }
            }
            dxgkrnl::VSYNC_DPC => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let Ok(fence) = TryParse::<u64>::try_parse(&mut parser, "FlipFenceId") else {
                    self.decode_misses += 1;
                    return;
                };
                self.dxgk_sync_dpc(&header, (fence >> 32) as u32);
            }
            dxgkrnl::PRESENT => {
                let hwnd = match self.locator.event_schema(event) {
                    Ok(typed) => {
                        let mut parser = Parser::create(&typed);
                        TryParse::<u64>::try_parse(&mut parser, "hWindow").unwrap_or(0)
                    }
                    Err(_) => 0,
                };
                self.dxgk_present(&header, hwnd);
            }
            dxgkrnl::PRESENT_HISTORY_START | dxgkrnl::PRESENT_HISTORY_DETAILED => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(token), Ok(token_data), Ok(model)) = (
                    TryParse::<u64>::try_parse(&mut parser, "Token"),
                    TryParse::<u64>::try_parse(&mut parser, "TokenData"),
                    TryParse::<u32>::try_parse(&mut parser, "Model"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                if model == dxgkrnl::PM_REDIRECTED_GDI {
                    return;
                }
                let hint = match model {
                    dxgkrnl::PM_REDIRECTED_BLT => PresentMode::ComposedCopyGpuGdi,
                    dxgkrnl::PM_REDIRECTED_VISTABLT => PresentMode::ComposedCopyCpuGdi,
                    dxgkrnl::PM_REDIRECTED_FLIP => PresentMode::ComposedFlip,
                    dxgkrnl::PM_REDIRECTED_COMPOSITION => PresentMode::ComposedCompositionAtlas,
                    _ => PresentMode::Unknown,
                };
                self.dxgk_submit_present_history(&header, token, token_data, hint);
            }
            dxgkrnl::PRESENT_HISTORY_INFO => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let Ok(token) = TryParse::<u64>::try_parse(&mut parser, "Token") else {
                    self.decode_misses += 1;
                    return;
                };
                self.dxgk_propagate_present_history(&header, token);
            }
            dxgkrnl::BLIT => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(hwnd), Ok(redirected)) = (
                    TryParse::<u64>::try_parse(&mut parser, "hwnd"),
                    TryParse::<bool>::try_parse(&mut parser, "bRedirectedPresent"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                self.dxgk_blit(&header, hwnd, redirected);
            }
            _ => {}
        }
    }

    /// A blit was submitted. It may be a fullscreen front-buffer copy or the
    /// first step of a composed copy; later events decide.
    fn dxgk_blit(&mut self, header: &EventHeader, hwnd: u64, redirected_present: bool) {
        let mut id = self.store.find_or_create_by_thread(header);
        if self.store.present(id).unwrap().present_mode != PresentMode::Unknown {
            // The thread's present already progressed past this point; it is
            // stuck from an earlier frame.
            self.store.discard_in_progress(header.thread_id);
            id = self.store.find_or_create_by_thread(header);
        }
        let present = self.store.present_mut(id).unwrap();
        present.hwnd = hwnd;
        if redirected_present {
            present.present_mode = PresentMode::ComposedCopyCpuGdi;
            present.supports_tearing = false;
        } else {
            present.present_mode = PresentMode::HardwareLegacyCopyToFrontBuffer;
            present.supports_tearing = true;
        }
    }

    /// A fullscreen flip was submitted; an MMIO flip packet on the same
    /// thread will carry it toward the screen.
    fn dxgk_flip(&mut self, header: &EventHeader, flip_interval: i32, mmio: bool) {
        let mut id = self.store.find_or_create_by_thread(header);
        {
            let present = self.store.present(id).unwrap();
            if present.queue_submit_sequence != 0 || present.seen_kernel_present {
                self.store.discard_in_progress(header.thread_id);
                id = self.store.find_or_create_by_thread(header);
            }
        }
        if self.store.present(id).unwrap().present_mode != PresentMode::Unknown {
            // Multi-plane overlays repeat the flip event per plane; only the
            // first one matters.
            return;
        }
        {
            let present = self.store.present_mut(id).unwrap();
            present.mmio = mmio;
            present.present_mode = PresentMode::HardwareLegacyFlip;
            if present.sync_interval == -1 {
                present.sync_interval = flip_interval;
            }
            if !mmio {
                present.supports_tearing = flip_interval == 0;
            }
        }
        // A flip on the compositor's announced present thread carries every
        // windowed present waiting to ride along.
        if let Some(dependents) = self.store.adopt_dwm_waiting(header.thread_id) {
            self.store
                .present_mut(id)
                .unwrap()
                .dependent_presents
                .extend(dependents);
        }
    }

    fn dxgk_queue_submit(
        &mut self,
        header: &EventHeader,
        packet_type: u32,
        submit_sequence: u32,
        context: u64,
        present: bool,
        supports_kernel_present_event: bool,
    ) {
        // Without a kernel present event, a blit that was not redirected by
        // the time more work hits its context is a front-buffer copy; treat
        // this submit as that missing event.
        if !supports_kernel_present_event {
            if let Some(blt_id) = self.store.blt_context_present(context) {
                let complete_now = {
                    let blt = self.store.present_mut(blt_id).unwrap();
                    if blt.present_mode == PresentMode::HardwareLegacyCopyToFrontBuffer {
                        blt.seen_kernel_present = true;
                        blt.screen_time != 0
                    } else {
                        false
                    }
                };
                if complete_now {
                    self.store.complete(blt_id);
                }
                self.store.remove_blt_context(context);
            }
        }

        if packet_type == dxgkrnl::PACKET_TYPE_MMIO_FLIP
            || packet_type == dxgkrnl::PACKET_TYPE_SOFTWARE
            || present
        {
            let Some(id) = self.store.thread_present(header.thread_id) else {
                return;
            };
            if self.store.present(id).unwrap().queue_submit_sequence != 0 {
                return;
            }
            self.store.present_mut(id).unwrap().queue_submit_sequence = submit_sequence;
            self.store.index_submit_sequence(submit_sequence, id);
            let mode = self.store.present(id).unwrap().present_mode;
            if mode == PresentMode::HardwareLegacyCopyToFrontBuffer && !supports_kernel_present_event
            {
                self.store.index_blt_context(context, id);
            }
        }
    }

    fn dxgk_queue_complete(&mut self, header: &EventHeader, submit_sequence: u32) {
        let Some(id) = self.store.submit_sequence_present(submit_sequence) else {
            return;
        };
        let (mode, mmio, seen_kernel_present) = {
            let present = self.store.present(id).unwrap();
            (
                present.present_mode,
                present.mmio,
                present.seen_kernel_present,
            )
        };
        if mode == PresentMode::HardwareLegacyCopyToFrontBuffer
            || (mode == PresentMode::HardwareLegacyFlip && !mmio)
        {
            {
                let present = self.store.present_mut(id).unwrap();
                present.ready_time = header.timestamp_qpc;
                present.screen_time = header.timestamp_qpc;
                present.final_state = PresentResult::Presented;
            }
            // A blit might still turn out to be windowed; without the kernel
            // present event we cannot tell yet, so defer.
            if seen_kernel_present || mode != PresentMode::HardwareLegacyCopyToFrontBuffer {
                self.store.complete(id);
            }
        }
    }

    /// The MMIO flip packet was dequeued: all GPU work before the flip is
    /// done. The flags say whether it flipped immediately or waits for sync.
    fn dxgk_mmio_flip(&mut self, header: &EventHeader, flip_submit_sequence: u32, flags: u32) {
        let Some(id) = self.store.submit_sequence_present(flip_submit_sequence) else {
            return;
        };
        {
            let present = self.store.present_mut(id).unwrap();
            present.ready_time = header.timestamp_qpc;
            if present.present_mode == PresentMode::ComposedFlip {
                present.present_mode = PresentMode::HardwareIndependentFlip;
            }
        }
        if flags & dxgkrnl::MMIO_FLIP_IMMEDIATE != 0 {
            let mode = {
                let present = self.store.present_mut(id).unwrap();
                present.final_state = PresentResult::Presented;
                present.screen_time = header.timestamp_qpc;
                present.supports_tearing = true;
                present.present_mode
            };
            if mode == PresentMode::HardwareLegacyFlip {
                self.store.complete(id);
            }
        }
    }

    fn dxgk_mmio_flip_mpo(
        &mut self,
        header: &EventHeader,
        flip_submit_sequence: u32,
        status_after_flip: Option<u32>,
    ) {
        let Some(id) = self.store.submit_sequence_present(flip_submit_sequence) else {
            return;
        };
        {
            let present = self.store.present_mut(id).unwrap();
            // The same packet is reported once per plane; keep the first
            // ready time.
            if present.ready_time == 0 {
                present.ready_time = header.timestamp_qpc;
            }
            if present.present_mode == PresentMode::HardwareIndependentFlip
                || present.present_mode == PresentMode::ComposedFlip
            {
                present.present_mode = PresentMode::HardwareComposedIndependentFlip;
            }
        }
        let Some(status) = status_after_flip else {
            return;
        };
        // Sync-waiting flips are finished by the corresponding sync DPC,
        // which carries the more accurate screen time.
        if status == dxgkrnl::FLIP_WAIT_VSYNC || status == dxgkrnl::FLIP_WAIT_HSYNC {
            return;
        }
        let mode = {
            let present = self.store.present_mut(id).unwrap();
            present.supports_tearing = true;
            present.final_state = PresentResult::Presented;
            if status == dxgkrnl::FLIP_WAIT_COMPLETE {
                present.screen_time = header.timestamp_qpc;
            }
            present.present_mode
        };
        if mode == PresentMode::HardwareLegacyFlip {
            self.store.complete(id);
        }
    }

    /// The sync DPC names the flip that just became visible.
    fn dxgk_sync_dpc(&mut self, header: &EventHeader, flip_submit_sequence: u32) {
        let Some(id) = self.store.submit_sequence_present(flip_submit_sequence) else {
            return;
        };
        let mode = {
            let present = self.store.present_mut(id).unwrap();
            present.screen_time = header.timestamp_qpc;
            present.final_state = PresentResult::Presented;
            present.present_mode
        };
        if mode == PresentMode::HardwareLegacyFlip {
            self.store.complete(id);
        }
    }

    /// End of the kernel present call. For blits this is the only signal
    /// that no present-history token is coming.
    fn dxgk_present(&mut self, header: &EventHeader, hwnd: u64) {
        let Some(id) = self.store.thread_present(header.thread_id) else {
            return;
        };
        let (deferred_blit_done, unbind_thread) = {
            let present = self.store.present_mut(id).unwrap();
            present.seen_kernel_present = true;
            if present.hwnd == 0 {
                present.hwnd = hwnd;
            }
            // An event thread other than the originating one means the
            // runtime batched this present off to the driver.
            let batched = present.thread_id != header.thread_id;
            if batched {
                if present.time_taken == 0 {
                    present.time_taken = header.timestamp_qpc.saturating_sub(present.qpc_time);
                }
                present.was_batched = true;
            }
            (
                present.present_mode == PresentMode::HardwareLegacyCopyToFrontBuffer
                    && present.screen_time != 0,
                batched,
            )
        };
        if deferred_blit_done {
            // Fullscreen blit whose work already completed; it was deferred
            // because only now is it certain to be fullscreen.
            self.store.complete(id);
        }
        if unbind_thread {
            self.store.remove_thread_present(header.thread_id);
        }
    }

    /// A present-history token was submitted; every windowed present under a
    /// live compositor goes through here.
    fn dxgk_submit_present_history(
        &mut self,
        header: &EventHeader,
        token: u64,
        token_data: u64,
        mode_hint: PresentMode,
    ) {
        let mut id = self.store.find_or_create_by_thread(header);
        if self.store.present(id).unwrap().token_ptr != 0 {
            self.store.discard_in_progress(header.thread_id);
            id = self.store.find_or_create_by_thread(header);
        }
        let mode = {
            let present = self.store.present_mut(id).unwrap();
            present.ready_time = 0;
            present.screen_time = 0;
            present.supports_tearing = false;
            present.final_state = PresentResult::Unknown;
            present.token_ptr = token;
            match present.present_mode {
                PresentMode::HardwareLegacyCopyToFrontBuffer => {
                    present.present_mode = PresentMode::ComposedCopyGpuGdi;
                }
                PresentMode::Unknown => {
                    if mode_hint == PresentMode::ComposedCompositionAtlas {
                        present.present_mode = PresentMode::ComposedCompositionAtlas;
                    } else {
                        // With no composition events (either an old OS or a
                        // trace without that source), assume a flip token so
                        // the present is not dropped on the floor.
                        debug_assert!(!present.seen_composition_events);
                        present.present_mode = PresentMode::ComposedFlip;
                    }
                }
                _ => {}
            }
            present.present_mode
        };
        if mode == PresentMode::ComposedCopyCpuGdi {
            if token_data == 0 {
                // Without token data there is no way to match this blit to a
                // specific compositor pass; ride along with the next one.
                self.store.push_dwm_waiting(id);
            } else {
                self.store.index_legacy_blit(token_data, id);
            }
        }
        self.store.index_token(token, id);
    }

    /// The token was handed to the compositor; the frame's work is done.
    fn dxgk_propagate_present_history(&mut self, header: &EventHeader, token: u64) {
        let Some(id) = self.store.token_present(token) else {
            return;
        };
        let (mode, hwnd) = {
            let present = self.store.present_mut(id).unwrap();
            present.ready_time = if present.ready_time == 0 {
                header.timestamp_qpc
            } else {
                present.ready_time.min(header.timestamp_qpc)
            };
            (present.present_mode, present.hwnd)
        };
        let seen_composition_events = self.store.present(id).unwrap().seen_composition_events;
        if mode == PresentMode::ComposedCompositionAtlas
            || (mode == PresentMode::ComposedFlip && !seen_composition_events)
        {
            self.store.push_dwm_waiting(id);
        }
        if mode == PresentMode::ComposedCopyGpuGdi {
            // The compositor picks up the most recent present per window.
            self.store.set_last_window(hwnd, id);
        }
        self.store.remove_token(token);
    }

    // Composition events.

    fn handle_win32k_event(&mut self, event: &RawEvent) {
        let header = event.header;
        match header.event_id {
            win32k::TOKEN_COMPOSITION_SURFACE_OBJECT => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(surface_luid), Ok(present_count), Ok(bind_id)) = (
                    TryParse::<u64>::try_parse(&mut parser, "CompositionSurfaceLuid"),
                    TryParse::<u64>::try_parse(&mut parser, "PresentCount"),
                    TryParse::<u64>::try_parse(&mut parser, "BindId"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                let dest_width = TryParse::<u32>::try_parse(&mut parser, "DestWidth").unwrap_or(0);
                let dest_height =
                    TryParse::<u32>::try_parse(&mut parser, "DestHeight").unwrap_or(0);
                let key = CompositionTokenKey {
                    surface_luid,
                    present_count,
                    bind_id,
                };
                self.win32k_token_created(&header, key, dest_width, dest_height);
            }
            win32k::TOKEN_STATE_CHANGED => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(surface_luid), Ok(present_count), Ok(bind_id), Ok(new_state)) = (
                    TryParse::<u64>::try_parse(&mut parser, "CompositionSurfaceLuid"),
                    TryParse::<u64>::try_parse(&mut parser, "PresentCount"),
                    TryParse::<u64>::try_parse(&mut parser, "BindId"),
                    TryParse::<u32>::try_parse(&mut parser, "NewState"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                let independent_flip =
                    TryParse::<bool>::try_parse(&mut parser, "IndependentFlip").unwrap_or(false);
                let key = CompositionTokenKey {
                    surface_luid,
                    present_count,
                    bind_id,
                };
                self.win32k_token_state_changed(&header, key, new_state, independent_flip);
            }
            _ => {}
        }
    }

    fn win32k_token_created(
        &mut self,
        header: &EventHeader,
        key: CompositionTokenKey,
        dest_width: u32,
        dest_height: u32,
    ) {
        let mut id = self.store.find_or_create_by_thread(header);
        if self.store.present(id).unwrap().seen_composition_events {
            self.store.discard_in_progress(header.thread_id);
            id = self.store.find_or_create_by_thread(header);
        }
        {
            let present = self.store.present_mut(id).unwrap();
            present.present_mode = PresentMode::ComposedFlip;
            present.seen_composition_events = true;
            present.dest_width = dest_width;
            present.dest_height = dest_height;
            present.composition_token_key = Some(key);
        }
        self.store.index_composition(key, id);
    }

    fn win32k_token_state_changed(
        &mut self,
        header: &EventHeader,
        key: CompositionTokenKey,
        new_state: u32,
        independent_flip: bool,
    ) {
        let Some(id) = self.store.composition_present(key) else {
            return;
        };
        match new_state {
            win32k::TOKEN_STATE_IN_FRAME => {
                // Composition is starting. The newest token per window wins;
                // an older one still parked there will never be shown.
                let hwnd = self.store.present(id).unwrap().hwnd;
                if hwnd != 0 {
                    match self.store.last_window_present(hwnd) {
                        Some(previous) if previous != id => {
                            self.store.present_mut(previous).unwrap().final_state =
                                PresentResult::Discarded;
                            self.store.set_last_window(hwnd, id);
                        }
                        Some(_) => {}
                        None => self.store.set_last_window(hwnd, id),
                    }
                }
                let present = self.store.present_mut(id).unwrap();
                if independent_flip && present.present_mode == PresentMode::ComposedFlip {
                    present.present_mode = PresentMode::HardwareIndependentFlip;
                }
            }
            win32k::TOKEN_STATE_CONFIRMED => {
                let hwnd = {
                    let present = self.store.present_mut(id).unwrap();
                    if present.final_state == PresentResult::Unknown {
                        // A do-not-sequence present can be confirmed when a
                        // frame happens to be composed at completion time,
                        // but nothing of it reaches the screen.
                        present.final_state =
                            if present.present_flags.contains(PresentFlags::DO_NOT_SEQUENCE) {
                                PresentResult::Discarded
                            } else {
                                PresentResult::Presented
                            };
                    }
                    present.hwnd
                };
                if hwnd != 0 {
                    self.store.clear_last_window(hwnd);
                }
            }
            win32k::TOKEN_STATE_RETIRED => {
                // The token's buffer is on screen now.
                self.store.present_mut(id).unwrap().screen_time = header.timestamp_qpc;
            }
            win32k::TOKEN_STATE_DISCARDED => {
                self.store.remove_composition(key);
                {
                    let present = self.store.present_mut(id).unwrap();
                    if present.final_state == PresentResult::Unknown || present.screen_time == 0 {
                        present.final_state = PresentResult::Discarded;
                    }
                }
                self.store.complete(id);
            }
            _ => {}
        }
    }

    // Compositor events.

    fn handle_dwm_event(&mut self, event: &RawEvent, legacy_provider: bool) {
        let header = event.header;
        match header.event_id {
            dwm::GET_PRESENT_HISTORY => {
                // The compositor collected its tokens; the most recent
                // windowed copy per window will be composed next pass.
                for id in self.store.take_last_window_entries() {
                    let qualifies = matches!(
                        self.store.present(id).unwrap().present_mode,
                        PresentMode::ComposedCopyGpuGdi | PresentMode::ComposedCopyCpuGdi
                    );
                    if qualifies {
                        self.store.present_mut(id).unwrap().dwm_notified = true;
                        self.store.push_dwm_waiting(id);
                    }
                }
            }
            dwm::SCHEDULE_PRESENT_START => {
                self.store.record_dwm_thread(header.thread_id);
            }
            dwm::FLIP_CHAIN_PENDING | dwm::FLIP_CHAIN_COMPLETE | dwm::FLIP_CHAIN_DIRTY => {
                if legacy_provider {
                    return;
                }
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(flip_chain), Ok(serial_number), Ok(hwnd)) = (
                    TryParse::<u32>::try_parse(&mut parser, "ulFlipChain"),
                    TryParse::<u32>::try_parse(&mut parser, "ulSerialNumber"),
                    TryParse::<u64>::try_parse(&mut parser, "hwnd"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                // The token data of a legacy blit splits into flip chain id
                // and serial.
                let token = ((flip_chain as u64) << 32) | serial_number as u64;
                let Some(id) = self.store.legacy_blit_present(token) else {
                    return;
                };
                self.store.set_last_window(hwnd, id);
                self.store.present_mut(id).unwrap().dwm_notified = true;
                self.store.remove_legacy_blit(token);
            }
            dwm::SCHEDULE_SURFACE_UPDATE => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(surface_luid), Ok(present_count), Ok(bind_id)) = (
                    TryParse::<u64>::try_parse(&mut parser, "luidSurface"),
                    TryParse::<u64>::try_parse(&mut parser, "PresentCount"),
                    TryParse::<u64>::try_parse(&mut parser, "bindId"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                let key = CompositionTokenKey {
                    surface_luid,
                    present_count,
                    bind_id,
                };
                if let Some(id) = self.store.composition_present(key) {
                    self.store.present_mut(id).unwrap().dwm_notified = true;
                }
            }
            _ => {}
        }
    }

    // Process events.

    fn handle_process_event(&mut self, event: &RawEvent) {
        let header = event.header;
        match header.opcode {
            OPCODE_START | OPCODE_DC_START => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let (Ok(process_id), Ok(image_file_name)) = (
                    TryParse::<u32>::try_parse(&mut parser, "ProcessId"),
                    TryParse::<String>::try_parse(&mut parser, "ImageFileName"),
                ) else {
                    self.decode_misses += 1;
                    return;
                };
                self.process_events.push(ProcessEvent {
                    process_id,
                    image_file_name,
                    qpc_time: header.timestamp_qpc,
                });
            }
            OPCODE_STOP | OPCODE_DC_STOP => {
                let Ok(typed) = self.locator.event_schema(event) else {
                    self.decode_misses += 1;
                    return;
                };
                let mut parser = Parser::create(&typed);
                let Ok(process_id) = TryParse::<u32>::try_parse(&mut parser, "ProcessId") else {
                    self.decode_misses += 1;
                    return;
                };
                self.process_events.push(ProcessEvent {
                    process_id,
                    image_file_name: String::new(),
                    qpc_time: header.timestamp_qpc,
                });
            }
            _ => {}
        }
    }

    // Application frame markers.

    fn handle_d3d11_event(&mut self, event: &RawEvent) {
        if event.header.event_id != d3d11::MARKER {
            return;
        }
        let Ok(typed) = self.locator.event_schema(event) else {
            self.decode_misses += 1;
            return;
        };
        let mut parser = Parser::create(&typed);
        let Ok(label) = TryParse::<String>::try_parse(&mut parser, "Label") else {
            self.decode_misses += 1;
            return;
        };
        let header = event.header;
        if label.starts_with("BeginFrame") {
            self.frames.begin(header.thread_id, header.timestamp_qpc);
        } else if label.starts_with("EndFrame") {
            let present = self.store.thread_present(header.thread_id);
            self.frames
                .end(header.thread_id, header.timestamp_qpc, present);
        }
    }
}
