//! The present record and its wire-facing enums.

use bitflags::bitflags;

use etw_decode::EventHeader;

/// How a present reaches the screen (or fails to).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresentMode {
    #[default]
    Unknown,
    /// Fullscreen flip handed straight to the display controller.
    HardwareLegacyFlip,
    /// Fullscreen blit into the surface that is already being scanned out.
    HardwareLegacyCopyToFrontBuffer,
    HardwareDirectFlip,
    /// Compositor bypass while a fullscreen window owns the screen.
    HardwareIndependentFlip,
    /// Windowed flip-model present composed by the compositor.
    ComposedFlip,
    /// Windowed blit composed on the GPU.
    ComposedCopyGpuGdi,
    /// Windowed blit composed on the CPU (the oldest redirection path).
    ComposedCopyCpuGdi,
    ComposedCompositionAtlas,
    HardwareComposedIndependentFlip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresentResult {
    #[default]
    Unknown,
    Presented,
    Discarded,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Runtime {
    Dxgi,
    D3d9,
    #[default]
    Other,
}

bitflags! {
    /// Present flags in their DXGI encoding; D3D9 flags are translated at
    /// the event handler.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PresentFlags: u32 {
        /// Fullscreen-status probe; no frame is presented.
        const TEST = 0x1;
        const DO_NOT_SEQUENCE = 0x2;
        const RESTART = 0x4;
        const DO_NOT_WAIT = 0x8;
        const ALLOW_TEARING = 0x200;
    }
}

/// Identity of a composition present-history token: composition surface,
/// per-surface present count, and bind id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompositionTokenKey {
    pub surface_luid: u64,
    pub present_count: u64,
    pub bind_id: u64,
}

/// One tracked present, from runtime entry (or first kernel sighting) until
/// it is displayed or discarded.
#[derive(Debug, Clone)]
pub struct PresentEvent {
    /// Timestamp of the first event of this present's lifecycle.
    pub qpc_time: u64,
    pub process_id: u32,
    /// Thread the present originated on.
    pub thread_id: u32,
    pub runtime: Runtime,

    /// Swapchain handle; 0 when the present never went through a tracked
    /// runtime.
    pub swap_chain_id: u64,
    /// -1 until a runtime or flip event supplies one.
    pub sync_interval: i32,
    pub present_flags: PresentFlags,

    /// Duration of the runtime present call.
    pub time_taken: u64,
    /// When the GPU work for the frame completed; 0 = not yet seen.
    pub ready_time: u64,
    /// When the pixels reached the screen; 0 = not yet seen.
    pub screen_time: u64,

    /// Target window; 0 when unknown.
    pub hwnd: u64,
    /// Kernel present-history token; 0 when unset.
    pub token_ptr: u64,
    pub composition_token_key: Option<CompositionTokenKey>,
    /// GPU queue packet sequence; 0 when unset.
    pub queue_submit_sequence: u32,
    pub dest_width: u32,
    pub dest_height: u32,

    pub present_mode: PresentMode,
    pub final_state: PresentResult,
    pub supports_tearing: bool,
    pub mmio: bool,
    pub seen_kernel_present: bool,
    pub seen_composition_events: bool,
    pub was_batched: bool,
    pub dwm_notified: bool,
    pub completed: bool,

    /// Presents that ride along inside this one (a compositor present
    /// carries the windowed presents it composed). Drained at completion.
    pub dependent_presents: Vec<super::store::PresentId>,
}

impl PresentEvent {
    pub fn new(header: &EventHeader, runtime: Runtime) -> Self {
        PresentEvent {
            qpc_time: header.timestamp_qpc,
            process_id: header.process_id,
            thread_id: header.thread_id,
            runtime,
            swap_chain_id: 0,
            sync_interval: -1,
            present_flags: PresentFlags::empty(),
            time_taken: 0,
            ready_time: 0,
            screen_time: 0,
            hwnd: 0,
            token_ptr: 0,
            composition_token_key: None,
            queue_submit_sequence: 0,
            dest_width: 0,
            dest_height: 0,
            present_mode: PresentMode::Unknown,
            final_state: PresentResult::Unknown,
            supports_tearing: false,
            mmio: false,
            seen_kernel_present: false,
            seen_composition_events: false,
            was_batched: false,
            dwm_notified: false,
            completed: false,
            dependent_presents: Vec::new(),
        }
    }
}
