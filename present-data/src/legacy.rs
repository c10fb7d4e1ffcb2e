//! Decoding of the Win7-era kernel graphics events.
//!
//! These sources predate schema-described payloads; each event is a packed
//! struct at a fixed layout, with handle fields always logged 64 bits wide.
//! Only the MMIO flip record differs between 32- and 64-bit loggers.

use byteorder::{ByteOrder, LittleEndian};

use etw_decode::RawEvent;

fn read_u32(payload: &[u8], offset: usize) -> Option<u32> {
    payload
        .get(offset..offset + 4)
        .map(LittleEndian::read_u32)
}

fn read_u64(payload: &[u8], offset: usize) -> Option<u64> {
    payload
        .get(offset..offset + 8)
        .map(LittleEndian::read_u64)
}

fn read_u8(payload: &[u8], offset: usize) -> Option<u8> {
    payload.get(offset).copied()
}

#[derive(Debug, Clone, Copy)]
pub struct BltEvent {
    pub hwnd: u64,
    pub redirected_present: bool,
}

pub fn parse_blt(event: &RawEvent) -> Option<BltEvent> {
    let payload = &event.payload;
    Some(BltEvent {
        hwnd: read_u64(payload, 0)?,
        // hwnd, dma buffer, history token, source and dest allocations
        // precede the submit and redirect booleans.
        redirected_present: read_u32(payload, 44)? != 0,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct FlipEvent {
    pub flip_interval: u32,
    pub mmio: bool,
}

pub fn parse_flip(event: &RawEvent) -> Option<FlipEvent> {
    let payload = &event.payload;
    Some(FlipEvent {
        flip_interval: read_u32(payload, 20)?,
        mmio: read_u8(payload, 25)? != 0,
    })
}

pub fn parse_present_history_token(event: &RawEvent) -> Option<u64> {
    read_u64(&event.payload, 8)
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSubmitEvent {
    pub context: u64,
    pub packet_type: u32,
    pub submit_sequence: u32,
    pub present: bool,
}

pub fn parse_queue_submit(event: &RawEvent) -> Option<QueueSubmitEvent> {
    let payload = &event.payload;
    Some(QueueSubmitEvent {
        context: read_u64(payload, 0)?,
        packet_type: read_u32(payload, 8)?,
        submit_sequence: read_u32(payload, 12)?,
        present: read_u32(payload, 32)? != 0,
    })
}

pub fn parse_queue_complete_sequence(event: &RawEvent) -> Option<u32> {
    read_u32(&event.payload, 12)
}

/// The sync DPC carries the flip fence id; the submit sequence is its upper
/// half.
pub fn parse_vsync_dpc_sequence(event: &RawEvent) -> Option<u32> {
    read_u64(&event.payload, 48).map(|fence| (fence >> 32) as u32)
}

#[derive(Debug, Clone, Copy)]
pub struct MmioFlipEvent {
    pub flip_submit_sequence: u32,
    pub flags: u32,
}

pub fn parse_mmio_flip(event: &RawEvent) -> Option<MmioFlipEvent> {
    let payload = &event.payload;
    let flags_offset = if event.is_32bit_header { 40 } else { 44 };
    Some(MmioFlipEvent {
        flip_submit_sequence: read_u32(payload, 12)?,
        flags: read_u32(payload, flags_offset)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use etw_decode::EventHeader;

    fn raw(payload: Vec<u8>, is_32bit: bool) -> RawEvent {
        RawEvent {
            header: EventHeader::default(),
            payload,
            is_32bit_header: is_32bit,
        }
    }

    #[test]
    fn mmio_flip_layout_follows_header_bitness() {
        let mut payload = vec![0u8; 48];
        LittleEndian::write_u32(&mut payload[12..16], 77);
        LittleEndian::write_u32(&mut payload[44..48], 0x2);
        let parsed = parse_mmio_flip(&raw(payload, false)).unwrap();
        assert_eq!(parsed.flip_submit_sequence, 77);
        assert_eq!(parsed.flags, 0x2);

        let mut payload = vec![0u8; 44];
        LittleEndian::write_u32(&mut payload[12..16], 78);
        LittleEndian::write_u32(&mut payload[40..44], 0x4);
        let parsed = parse_mmio_flip(&raw(payload, true)).unwrap();
        assert_eq!(parsed.flip_submit_sequence, 78);
        assert_eq!(parsed.flags, 0x4);
    }

    #[test]
    fn vsync_dpc_takes_the_upper_fence_half() {
        let mut payload = vec![0u8; 56];
        LittleEndian::write_u64(&mut payload[48..56], (42u64 << 32) | 7);
        assert_eq!(parse_vsync_dpc_sequence(&raw(payload, false)), Some(42));
    }

    #[test]
    fn truncated_payloads_decode_to_none() {
        assert!(parse_blt(&raw(vec![0u8; 10], false)).is_none());
        assert!(parse_queue_submit(&raw(vec![0u8; 16], false)).is_none());
    }
}
