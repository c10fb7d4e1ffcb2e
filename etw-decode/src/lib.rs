//! Schema-driven decoding of raw trace events.
//!
//! A trace session hands the consumer a stream of [`RawEvent`]s: an event
//! header plus an undecoded payload. The layout of the payload is described
//! by a per-(provider, event id, version) schema, which this crate caches in
//! a [`SchemaLocator`](schema::SchemaLocator) and uses to pull named, typed
//! fields out of the payload with a [`Parser`](parser::Parser).

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use fxhash::FxHasher;
use uuid::Uuid;

pub mod parser;
pub mod prop_types;
pub mod property;
pub mod schema;
pub mod utils;

pub type FastHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;

/// Set in [`EventHeader::flags`] when the event was logged by a 32-bit
/// process; pointer-sized fields in the payload are then 4 bytes wide.
pub const EVENT_HEADER_FLAG_32_BIT_HEADER: u16 = 0x0020;
pub const EVENT_HEADER_FLAG_64_BIT_HEADER: u16 = 0x0040;

/// The fixed portion of a trace event, as delivered by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub provider_id: Uuid,
    pub event_id: u16,
    pub version: u8,
    pub opcode: u8,
    pub level: u8,
    pub flags: u16,
    pub process_id: u32,
    pub thread_id: u32,
    pub timestamp_qpc: u64,
}

impl Default for EventHeader {
    fn default() -> Self {
        EventHeader {
            provider_id: Uuid::nil(),
            event_id: 0,
            version: 0,
            opcode: 0,
            level: 0,
            flags: 0,
            process_id: 0,
            thread_id: 0,
            timestamp_qpc: 0,
        }
    }
}

/// One event as fed to the consumer: header plus undecoded payload bytes.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub header: EventHeader,
    pub payload: Vec<u8>,
    pub is_32bit_header: bool,
}

impl RawEvent {
    pub fn user_buffer(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_64bit(&self) -> bool {
        !self.is_32bit_header
    }

    pub fn pointer_size(&self) -> usize {
        if self.is_32bit_header {
            4
        } else {
            8
        }
    }
}
