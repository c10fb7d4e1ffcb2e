//! Provider identities, event ids, and wire constants.
//!
//! The engine declares which event sources it understands; the trace
//! session is responsible for enabling the matching OS providers and can
//! register additional provider ids (the legacy kernel sources predate
//! manifest-based identification, so their ids vary by session setup).

use rustc_hash::FxHashMap;
use uuid::{uuid, Uuid};

pub const DXGI_PROVIDER: Uuid = uuid!("CA11C036-0102-4A2D-A6AD-F03CFED5D3C9");
pub const DXGKRNL_PROVIDER: Uuid = uuid!("802EC45A-1E99-4B83-9920-87C98277BA9D");
pub const WIN32K_PROVIDER: Uuid = uuid!("8C416C79-D49B-4F01-A467-E56D3AA8234C");
pub const DWM_PROVIDER: Uuid = uuid!("9E9BBA3C-2E38-40CB-99F4-9E8281425164");
pub const D3D9_PROVIDER: Uuid = uuid!("783ACA0A-790E-4D7F-8451-AA850511C6B9");
pub const D3D11_PROVIDER: Uuid = uuid!("DB6F6DDB-AC77-4E88-8253-819DF9BBF140");
pub const NT_PROCESS_PROVIDER: Uuid = uuid!("3D6FA8D0-FE05-11D0-9DDA-00C04FD7BA7C");

/// Event families the correlation engine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Dxgi,
    D3d9,
    D3d11,
    DxgKrnl,
    Win32k,
    Dwm,
    NtProcess,
    /// Win7-era kernel sources with packed payloads.
    LegacyDwm,
    LegacyBlt,
    LegacyFlip,
    LegacyPresentHistory,
    LegacyQueuePacket,
    LegacyVSyncDpc,
    LegacyMmioFlip,
}

/// Maps provider ids seen on events to the family that handles them.
#[derive(Debug)]
pub struct ProviderRegistry {
    kinds: FxHashMap<Uuid, ProviderKind>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut kinds = FxHashMap::default();
        kinds.insert(DXGI_PROVIDER, ProviderKind::Dxgi);
        kinds.insert(D3D9_PROVIDER, ProviderKind::D3d9);
        kinds.insert(D3D11_PROVIDER, ProviderKind::D3d11);
        kinds.insert(DXGKRNL_PROVIDER, ProviderKind::DxgKrnl);
        kinds.insert(WIN32K_PROVIDER, ProviderKind::Win32k);
        kinds.insert(DWM_PROVIDER, ProviderKind::Dwm);
        kinds.insert(NT_PROCESS_PROVIDER, ProviderKind::NtProcess);
        ProviderRegistry { kinds }
    }
}

impl ProviderRegistry {
    pub fn kind(&self, provider: &Uuid) -> Option<ProviderKind> {
        self.kinds.get(provider).copied()
    }

    pub fn register(&mut self, provider: Uuid, kind: ProviderKind) {
        self.kinds.insert(provider, kind);
    }
}

/// What the engine asks the trace session to enable for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderFilter {
    pub kind: ProviderKind,
    pub level: u8,
    pub keyword_any: u64,
}

pub const LEVEL_INFORMATION: u8 = 4;
pub const LEVEL_VERBOSE: u8 = 5;

/// The sources needed for full tracking, or just the runtime + process
/// sources when only simple runtime timing is wanted.
pub fn provider_filters(simple_mode: bool) -> Vec<ProviderFilter> {
    let mut filters = vec![
        ProviderFilter {
            kind: ProviderKind::Dxgi,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::D3d9,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::NtProcess,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
    ];
    if simple_mode {
        return filters;
    }
    filters.extend([
        ProviderFilter {
            kind: ProviderKind::DxgKrnl,
            level: LEVEL_INFORMATION,
            keyword_any: 0x1,
        },
        ProviderFilter {
            kind: ProviderKind::Win32k,
            level: LEVEL_INFORMATION,
            keyword_any: 0x1000,
        },
        ProviderFilter {
            kind: ProviderKind::Dwm,
            level: LEVEL_VERBOSE,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::LegacyDwm,
            level: LEVEL_VERBOSE,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::LegacyBlt,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::LegacyFlip,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::LegacyPresentHistory,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::LegacyQueuePacket,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::LegacyVSyncDpc,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::LegacyMmioFlip,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
        ProviderFilter {
            kind: ProviderKind::D3d11,
            level: LEVEL_INFORMATION,
            keyword_any: 0,
        },
    ]);
    filters
}

// Header opcodes shared by the kernel MOF-style sources.
pub const OPCODE_INFO: u8 = 0;
pub const OPCODE_START: u8 = 1;
pub const OPCODE_STOP: u8 = 2;
pub const OPCODE_DC_START: u8 = 3;
pub const OPCODE_DC_STOP: u8 = 4;

pub mod dxgi {
    pub const PRESENT_START: u16 = 42;
    pub const PRESENT_STOP: u16 = 43;
    pub const PRESENT_MPO_START: u16 = 55;
    pub const PRESENT_MPO_STOP: u16 = 56;

    // Status returns that still count as success but mean nothing was shown.
    pub const STATUS_OCCLUDED: u32 = 0x087A_0001;
    pub const STATUS_NO_DESKTOP_ACCESS: u32 = 0x087A_0005;
    pub const STATUS_MODE_CHANGE_IN_PROGRESS: u32 = 0x087A_0008;
}

pub mod d3d9 {
    pub const PRESENT_START: u16 = 1;
    pub const PRESENT_STOP: u16 = 2;

    pub const PRESENT_DONOTWAIT: u32 = 0x1;
    pub const PRESENT_DONOTFLIP: u32 = 0x4;
    pub const PRESENT_FLIPRESTART: u32 = 0x8;
    pub const PRESENT_FORCEIMMEDIATE: u32 = 0x100;

    pub const S_PRESENT_OCCLUDED: u32 = 0x0026_2307;
}

pub mod d3d11 {
    pub const MARKER: u16 = 38;
}

pub mod dxgkrnl {
    pub const FLIP: u16 = 168;
    pub const FLIP_MPO: u16 = 252;
    pub const QUEUE_SUBMIT: u16 = 178;
    pub const QUEUE_COMPLETE: u16 = 180;
    pub const MMIO_FLIP: u16 = 116;
    pub const MMIO_FLIP_MPO: u16 = 259;
    pub const VSYNC_DPC: u16 = 17;
    pub const HSYNC_DPC_MULTIPLANE: u16 = 382;
    pub const PRESENT: u16 = 184;
    pub const PRESENT_HISTORY_START: u16 = 171;
    pub const PRESENT_HISTORY_INFO: u16 = 172;
    pub const PRESENT_HISTORY_DETAILED: u16 = 213;
    pub const BLIT: u16 = 166;

    // Queue packet types; only the flip and software buffers carry presents.
    pub const PACKET_TYPE_MMIO_FLIP: u32 = 3;
    pub const PACKET_TYPE_SOFTWARE: u32 = 7;

    // MMIOFlip flags.
    pub const MMIO_FLIP_IMMEDIATE: u32 = 0x2;
    pub const MMIO_FLIP_ON_NEXT_VSYNC: u32 = 0x4;

    // FlipEntryStatusAfterFlip values.
    pub const FLIP_WAIT_VSYNC: u32 = 5;
    pub const FLIP_WAIT_COMPLETE: u32 = 11;
    pub const FLIP_WAIT_HSYNC: u32 = 15;

    // Present-history models.
    pub const PM_REDIRECTED_GDI: u32 = 1;
    pub const PM_REDIRECTED_FLIP: u32 = 2;
    pub const PM_REDIRECTED_BLT: u32 = 3;
    pub const PM_REDIRECTED_VISTABLT: u32 = 4;
    pub const PM_REDIRECTED_COMPOSITION: u32 = 7;
}

pub mod win32k {
    pub const TOKEN_COMPOSITION_SURFACE_OBJECT: u16 = 201;
    pub const TOKEN_STATE_CHANGED: u16 = 301;

    // TokenStateChanged NewState values.
    pub const TOKEN_STATE_IN_FRAME: u32 = 3;
    pub const TOKEN_STATE_CONFIRMED: u32 = 4;
    pub const TOKEN_STATE_RETIRED: u32 = 5;
    pub const TOKEN_STATE_DISCARDED: u32 = 6;
}

pub mod dwm {
    pub const GET_PRESENT_HISTORY: u16 = 64;
    pub const SCHEDULE_PRESENT_START: u16 = 15;
    pub const FLIP_CHAIN_PENDING: u16 = 69;
    pub const FLIP_CHAIN_COMPLETE: u16 = 70;
    pub const FLIP_CHAIN_DIRTY: u16 = 101;
    pub const SCHEDULE_SURFACE_UPDATE: u16 = 196;
}
