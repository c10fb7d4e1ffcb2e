//! Event builders for feeding literal sequences through the consumer.
//!
//! Each builder produces a `RawEvent` whose payload matches the schema this
//! module registers, so the tests exercise the same decode path a live
//! session does.

#![allow(dead_code)]

use etw_decode::prop_types::{InType, Property, PropertyCount};
use etw_decode::schema::EventSchema;
use etw_decode::{EventHeader, RawEvent};
use present_data::providers::{
    self, d3d11, d3d9, dwm, dxgi, dxgkrnl, win32k, OPCODE_START, OPCODE_STOP,
};
use present_data::{ConsumerOptions, PresentTraceConsumer};
use uuid::Uuid;

#[derive(Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new() -> Self {
        Payload(Vec::new())
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn utf16(mut self, s: &str) -> Self {
        for c in s.encode_utf16() {
            self.0.extend_from_slice(&c.to_le_bytes());
        }
        self.0.extend_from_slice(&[0, 0]);
        self
    }

    pub fn ansi(mut self, s: &str) -> Self {
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(0);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.0
    }
}

fn event(
    provider: Uuid,
    event_id: u16,
    version: u8,
    opcode: u8,
    pid: u32,
    tid: u32,
    qpc: u64,
    payload: Vec<u8>,
) -> RawEvent {
    RawEvent {
        header: EventHeader {
            provider_id: provider,
            event_id,
            version,
            opcode,
            level: 0,
            flags: 0,
            process_id: pid,
            thread_id: tid,
            timestamp_qpc: qpc,
        },
        payload,
        is_32bit_header: false,
    }
}

/// A consumer with the schemas of every event the tests feed.
pub fn consumer_with_options(options: ConsumerOptions) -> PresentTraceConsumer {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut consumer = PresentTraceConsumer::new(options);

    for id in [dxgi::PRESENT_START, dxgi::PRESENT_MPO_START] {
        consumer.add_event_schema(
            providers::DXGI_PROVIDER,
            id,
            0,
            EventSchema::new(
                "Microsoft-Windows-DXGI/Present/Start",
                vec![
                    Property::primitive("pIDXGISwapChain", InType::Pointer),
                    Property::primitive("Flags", InType::UInt32),
                    Property::primitive("SyncInterval", InType::Int32),
                ],
            ),
        );
    }
    for id in [dxgi::PRESENT_STOP, dxgi::PRESENT_MPO_STOP] {
        consumer.add_event_schema(
            providers::DXGI_PROVIDER,
            id,
            0,
            EventSchema::new(
                "Microsoft-Windows-DXGI/Present/Stop",
                vec![Property::primitive("Result", InType::UInt32)],
            ),
        );
    }
    consumer.add_event_schema(
        providers::D3D9_PROVIDER,
        d3d9::PRESENT_START,
        0,
        EventSchema::new(
            "Microsoft-Windows-D3D9/Present/Start",
            vec![
                Property::primitive("pSwapchain", InType::Pointer),
                Property::primitive("Flags", InType::UInt32),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::D3D9_PROVIDER,
        d3d9::PRESENT_STOP,
        0,
        EventSchema::new(
            "Microsoft-Windows-D3D9/Present/Stop",
            vec![Property::primitive("Result", InType::UInt32)],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::FLIP,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/Flip/Info",
            vec![
                Property::primitive("FlipInterval", InType::UInt32),
                Property::primitive("MMIOFlip", InType::Boolean),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::QUEUE_SUBMIT,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/QueuePacket/Start",
            vec![
                Property::primitive("PacketType", InType::UInt32),
                Property::primitive("SubmitSequence", InType::UInt32),
                Property::primitive("hContext", InType::Pointer),
                Property::primitive("bPresent", InType::Boolean),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::QUEUE_COMPLETE,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/QueuePacket/Stop",
            vec![Property::primitive("SubmitSequence", InType::UInt32)],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::MMIO_FLIP,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/MMIOFlip/Info",
            vec![
                Property::primitive("FlipSubmitSequence", InType::UInt32),
                Property::primitive("Flags", InType::UInt32),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::MMIO_FLIP_MPO,
        3,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/MMIOFlipMultiPlaneOverlay/Info",
            vec![
                Property::primitive("FlipSubmitSequence", InType::UInt64),
                Property::primitive("FlipEntryStatusAfterFlip", InType::UInt32),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::HSYNC_DPC_MULTIPLANE,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/HSyncDPCMultiPlane/Info",
            vec![
                Property::primitive("FlipEntryCount", InType::UInt32),
                Property::primitive("FlipSubmitSequence", InType::UInt64)
                    .with_count(PropertyCount::FromField(0)),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::VSYNC_DPC,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/VSyncDPC/Info",
            vec![Property::primitive("FlipFenceId", InType::UInt64)],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::PRESENT,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/Present/Info",
            vec![Property::primitive("hWindow", InType::Pointer)],
        ),
    );
    for id in [
        dxgkrnl::PRESENT_HISTORY_START,
        dxgkrnl::PRESENT_HISTORY_DETAILED,
    ] {
        consumer.add_event_schema(
            providers::DXGKRNL_PROVIDER,
            id,
            0,
            EventSchema::new(
                "Microsoft-Windows-DxgKrnl/PresentHistory/Start",
                vec![
                    Property::primitive("Token", InType::Pointer),
                    Property::primitive("TokenData", InType::UInt64),
                    Property::primitive("Model", InType::UInt32),
                ],
            ),
        );
    }
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::PRESENT_HISTORY_INFO,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/PresentHistory/Info",
            vec![Property::primitive("Token", InType::Pointer)],
        ),
    );
    consumer.add_event_schema(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::BLIT,
        0,
        EventSchema::new(
            "Microsoft-Windows-DxgKrnl/Blit/Info",
            vec![
                Property::primitive("hwnd", InType::Pointer),
                Property::primitive("bRedirectedPresent", InType::UInt32),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::WIN32K_PROVIDER,
        win32k::TOKEN_COMPOSITION_SURFACE_OBJECT,
        0,
        EventSchema::new(
            "Microsoft-Windows-Win32k/TokenCompositionSurfaceObject/Info",
            vec![
                Property::primitive("CompositionSurfaceLuid", InType::UInt64),
                Property::primitive("PresentCount", InType::UInt64),
                Property::primitive("BindId", InType::UInt64),
                Property::primitive("DestWidth", InType::UInt32),
                Property::primitive("DestHeight", InType::UInt32),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::WIN32K_PROVIDER,
        win32k::TOKEN_STATE_CHANGED,
        0,
        EventSchema::new(
            "Microsoft-Windows-Win32k/TokenStateChanged/Info",
            vec![
                Property::primitive("CompositionSurfaceLuid", InType::UInt64),
                Property::primitive("PresentCount", InType::UInt32),
                Property::primitive("BindId", InType::UInt64),
                Property::primitive("NewState", InType::UInt32),
                Property::primitive("IndependentFlip", InType::Boolean),
            ],
        ),
    );
    for id in [
        dwm::FLIP_CHAIN_PENDING,
        dwm::FLIP_CHAIN_COMPLETE,
        dwm::FLIP_CHAIN_DIRTY,
    ] {
        consumer.add_event_schema(
            providers::DWM_PROVIDER,
            id,
            0,
            EventSchema::new(
                "Microsoft-Windows-Dwm-Core/FlipChain",
                vec![
                    Property::primitive("ulFlipChain", InType::UInt32),
                    Property::primitive("ulSerialNumber", InType::UInt32),
                    Property::primitive("hwnd", InType::Pointer),
                ],
            ),
        );
    }
    consumer.add_event_schema(
        providers::DWM_PROVIDER,
        dwm::SCHEDULE_SURFACE_UPDATE,
        0,
        EventSchema::new(
            "Microsoft-Windows-Dwm-Core/ScheduleSurfaceUpdate/Info",
            vec![
                Property::primitive("luidSurface", InType::UInt64),
                Property::primitive("PresentCount", InType::UInt64),
                Property::primitive("bindId", InType::UInt64),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::NT_PROCESS_PROVIDER,
        0,
        0,
        EventSchema::new(
            "NT Kernel/Process",
            vec![
                Property::primitive("ProcessId", InType::UInt32),
                Property::primitive("ImageFileName", InType::AnsiString),
            ],
        ),
    );
    consumer.add_event_schema(
        providers::D3D11_PROVIDER,
        d3d11::MARKER,
        0,
        EventSchema::new(
            "Microsoft-Windows-D3D11/Marker",
            vec![Property::primitive("Label", InType::UnicodeString)],
        ),
    );

    consumer
}

pub fn consumer() -> PresentTraceConsumer {
    consumer_with_options(ConsumerOptions::default())
}

pub fn simple_consumer() -> PresentTraceConsumer {
    consumer_with_options(ConsumerOptions {
        simple_mode: true,
        ..Default::default()
    })
}

// Runtime events.

pub fn dxgi_present_start(
    pid: u32,
    tid: u32,
    qpc: u64,
    swap_chain: u64,
    flags: u32,
    sync_interval: i32,
) -> RawEvent {
    event(
        providers::DXGI_PROVIDER,
        dxgi::PRESENT_START,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new()
            .u64(swap_chain)
            .u32(flags)
            .i32(sync_interval)
            .build(),
    )
}

pub fn dxgi_present_stop(pid: u32, tid: u32, qpc: u64, result: u32) -> RawEvent {
    event(
        providers::DXGI_PROVIDER,
        dxgi::PRESENT_STOP,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u32(result).build(),
    )
}

pub fn d3d9_present_start(pid: u32, tid: u32, qpc: u64, swap_chain: u64, flags: u32) -> RawEvent {
    event(
        providers::D3D9_PROVIDER,
        d3d9::PRESENT_START,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u64(swap_chain).u32(flags).build(),
    )
}

pub fn d3d9_present_stop(pid: u32, tid: u32, qpc: u64, result: u32) -> RawEvent {
    event(
        providers::D3D9_PROVIDER,
        d3d9::PRESENT_STOP,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u32(result).build(),
    )
}

// Kernel graphics events.

pub fn dxgk_flip(pid: u32, tid: u32, qpc: u64, flip_interval: u32, mmio: bool) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::FLIP,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new()
            .u32(flip_interval)
            .u32(mmio as u32)
            .build(),
    )
}

pub fn dxgk_queue_submit(
    pid: u32,
    tid: u32,
    qpc: u64,
    packet_type: u32,
    sequence: u32,
    context: u64,
    present: bool,
) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::QUEUE_SUBMIT,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new()
            .u32(packet_type)
            .u32(sequence)
            .u64(context)
            .u32(present as u32)
            .build(),
    )
}

pub fn dxgk_queue_complete(pid: u32, tid: u32, qpc: u64, sequence: u32) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::QUEUE_COMPLETE,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u32(sequence).build(),
    )
}

pub fn dxgk_mmio_flip(pid: u32, tid: u32, qpc: u64, sequence: u32, flags: u32) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::MMIO_FLIP,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u32(sequence).u32(flags).build(),
    )
}

pub fn dxgk_mmio_flip_mpo(pid: u32, tid: u32, qpc: u64, sequence: u32, status: u32) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::MMIO_FLIP_MPO,
        3,
        0,
        pid,
        tid,
        qpc,
        Payload::new()
            .u64((sequence as u64) << 32)
            .u32(status)
            .build(),
    )
}

pub fn dxgk_hsync_dpc(pid: u32, tid: u32, qpc: u64, sequences: &[u32]) -> RawEvent {
    let mut payload = Payload::new().u32(sequences.len() as u32);
    for &sequence in sequences {
        payload = payload.u64((sequence as u64) << 32);
    }
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::HSYNC_DPC_MULTIPLANE,
        0,
        0,
        pid,
        tid,
        qpc,
        payload.build(),
    )
}

pub fn dxgk_vsync_dpc(pid: u32, tid: u32, qpc: u64, sequence: u32) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::VSYNC_DPC,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u64((sequence as u64) << 32).build(),
    )
}

pub fn dxgk_present(pid: u32, tid: u32, qpc: u64, hwnd: u64) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::PRESENT,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u64(hwnd).build(),
    )
}

pub fn dxgk_present_history_start(
    pid: u32,
    tid: u32,
    qpc: u64,
    token: u64,
    token_data: u64,
    model: u32,
) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::PRESENT_HISTORY_START,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u64(token).u64(token_data).u32(model).build(),
    )
}

pub fn dxgk_present_history_info(pid: u32, tid: u32, qpc: u64, token: u64) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::PRESENT_HISTORY_INFO,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u64(token).build(),
    )
}

pub fn dxgk_blit(pid: u32, tid: u32, qpc: u64, hwnd: u64, redirected: bool) -> RawEvent {
    event(
        providers::DXGKRNL_PROVIDER,
        dxgkrnl::BLIT,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().u64(hwnd).u32(redirected as u32).build(),
    )
}

// Composition events.

pub fn win32k_token_created(
    pid: u32,
    tid: u32,
    qpc: u64,
    surface_luid: u64,
    present_count: u64,
    bind_id: u64,
) -> RawEvent {
    event(
        providers::WIN32K_PROVIDER,
        win32k::TOKEN_COMPOSITION_SURFACE_OBJECT,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new()
            .u64(surface_luid)
            .u64(present_count)
            .u64(bind_id)
            .u32(1920)
            .u32(1080)
            .build(),
    )
}

pub fn win32k_token_state(
    pid: u32,
    tid: u32,
    qpc: u64,
    surface_luid: u64,
    present_count: u64,
    bind_id: u64,
    new_state: u32,
    independent_flip: bool,
) -> RawEvent {
    event(
        providers::WIN32K_PROVIDER,
        win32k::TOKEN_STATE_CHANGED,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new()
            .u64(surface_luid)
            .u32(present_count as u32)
            .u64(bind_id)
            .u32(new_state)
            .u32(independent_flip as u32)
            .build(),
    )
}

// Compositor events.

pub fn dwm_get_present_history(pid: u32, tid: u32, qpc: u64) -> RawEvent {
    event(
        providers::DWM_PROVIDER,
        dwm::GET_PRESENT_HISTORY,
        0,
        0,
        pid,
        tid,
        qpc,
        Vec::new(),
    )
}

pub fn dwm_schedule_present_start(pid: u32, tid: u32, qpc: u64) -> RawEvent {
    event(
        providers::DWM_PROVIDER,
        dwm::SCHEDULE_PRESENT_START,
        0,
        0,
        pid,
        tid,
        qpc,
        Vec::new(),
    )
}

pub fn dwm_flip_chain(
    pid: u32,
    tid: u32,
    qpc: u64,
    flip_chain: u32,
    serial: u32,
    hwnd: u64,
) -> RawEvent {
    event(
        providers::DWM_PROVIDER,
        dwm::FLIP_CHAIN_PENDING,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new()
            .u32(flip_chain)
            .u32(serial)
            .u64(hwnd)
            .build(),
    )
}

pub fn dwm_schedule_surface_update(
    pid: u32,
    tid: u32,
    qpc: u64,
    surface_luid: u64,
    present_count: u64,
    bind_id: u64,
) -> RawEvent {
    event(
        providers::DWM_PROVIDER,
        dwm::SCHEDULE_SURFACE_UPDATE,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new()
            .u64(surface_luid)
            .u64(present_count)
            .u64(bind_id)
            .build(),
    )
}

// Process and marker events.

pub fn nt_process_start(process_id: u32, qpc: u64, image_file_name: &str) -> RawEvent {
    event(
        providers::NT_PROCESS_PROVIDER,
        0,
        0,
        OPCODE_START,
        process_id,
        0,
        qpc,
        Payload::new().u32(process_id).ansi(image_file_name).build(),
    )
}

pub fn nt_process_end(process_id: u32, qpc: u64) -> RawEvent {
    event(
        providers::NT_PROCESS_PROVIDER,
        0,
        0,
        OPCODE_STOP,
        process_id,
        0,
        qpc,
        Payload::new().u32(process_id).ansi("").build(),
    )
}

pub fn d3d11_marker(pid: u32, tid: u32, qpc: u64, label: &str) -> RawEvent {
    event(
        providers::D3D11_PROVIDER,
        d3d11::MARKER,
        0,
        0,
        pid,
        tid,
        qpc,
        Payload::new().utf16(label).build(),
    )
}
