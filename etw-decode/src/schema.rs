//! Schema cache and typed event wrapper.
//!
//! Schemas are looked up by (provider id, event id, version). A miss is
//! forwarded to the registered [`SchemaSource`], the seam behind which the
//! platform's event-metadata facility (or a trace-embedded metadata stream)
//! lives; a miss with no source, or a source that comes up empty, is a
//! recoverable error and the event is simply not decoded.

use std::rc::Rc;

use thiserror::Error;
use uuid::Uuid;

use crate::prop_types::Property;
use crate::property::PropertyIndex;
use crate::{EventHeader, FastHashMap, RawEvent};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("no schema for provider {provider} event {event_id} v{version}")]
    NotFound {
        provider: Uuid,
        event_id: u16,
        version: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SchemaKey {
    provider: Uuid,
    id: u16,
    version: u8,
}

impl SchemaKey {
    fn for_event(header: &EventHeader) -> Self {
        SchemaKey {
            provider: header.provider_id,
            id: header.event_id,
            version: header.version,
        }
    }
}

/// A schema as registered: a display name plus the ordered property list.
/// Struct members, if any, come after the first `top_level_count` entries.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub name: String,
    pub properties: Vec<Property>,
    pub top_level_count: usize,
}

impl EventSchema {
    /// A schema whose properties are all top-level (no structs).
    pub fn new(name: &str, properties: Vec<Property>) -> Self {
        let top_level_count = properties.len();
        EventSchema {
            name: name.to_string(),
            properties,
            top_level_count,
        }
    }
}

/// Cached, lookup-ready form of an [`EventSchema`].
#[derive(Debug)]
pub struct Schema {
    name: String,
    properties: PropertyIndex,
}

impl Schema {
    fn new(schema: EventSchema) -> Self {
        Schema {
            name: schema.name,
            properties: PropertyIndex::new(schema.properties, schema.top_level_count),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &PropertyIndex {
        &self.properties
    }
}

/// Where schemas come from on a cache miss.
pub trait SchemaSource {
    fn event_schema(&mut self, header: &EventHeader) -> Option<EventSchema>;
}

/// Cache of decoded schemas, one entry per (provider, event id, version).
#[derive(Default)]
pub struct SchemaLocator {
    schemas: FastHashMap<SchemaKey, Rc<Schema>>,
    source: Option<Box<dyn SchemaSource>>,
}

impl SchemaLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(source: Box<dyn SchemaSource>) -> Self {
        SchemaLocator {
            schemas: FastHashMap::default(),
            source: Some(source),
        }
    }

    pub fn set_source(&mut self, source: Box<dyn SchemaSource>) {
        self.source = Some(source);
    }

    /// Registers (or replaces) the schema for one event kind.
    pub fn add_schema(&mut self, provider: Uuid, event_id: u16, version: u8, schema: EventSchema) {
        let key = SchemaKey {
            provider,
            id: event_id,
            version,
        };
        self.schemas.insert(key, Rc::new(Schema::new(schema)));
    }

    /// Resolves the schema for `event` and pairs the two up for parsing.
    pub fn event_schema<'a>(&mut self, event: &'a RawEvent) -> Result<TypedEvent<'a>, SchemaError> {
        let key = SchemaKey::for_event(&event.header);
        if let Some(schema) = self.schemas.get(&key) {
            return Ok(TypedEvent::new(event, schema.clone()));
        }

        if let Some(source) = self.source.as_mut() {
            if let Some(schema) = source.event_schema(&event.header) {
                let schema = Rc::new(Schema::new(schema));
                log::debug!(
                    "schema for {}/{} v{} resolved from source: {}",
                    key.provider,
                    key.id,
                    key.version,
                    schema.name()
                );
                self.schemas.insert(key, schema.clone());
                return Ok(TypedEvent::new(event, schema));
            }
        }

        Err(SchemaError::NotFound {
            provider: key.provider,
            event_id: key.id,
            version: key.version,
        })
    }
}

/// A raw event paired with its resolved schema.
pub struct TypedEvent<'a> {
    record: &'a RawEvent,
    schema: Rc<Schema>,
}

impl<'a> TypedEvent<'a> {
    pub fn new(record: &'a RawEvent, schema: Rc<Schema>) -> Self {
        TypedEvent { record, schema }
    }

    pub fn record(&self) -> &RawEvent {
        self.record
    }

    pub fn user_buffer(&self) -> &'a [u8] {
        &self.record.payload
    }

    pub fn event_id(&self) -> u16 {
        self.record.header.event_id
    }

    pub fn version(&self) -> u8 {
        self.record.header.version
    }

    pub fn opcode(&self) -> u8 {
        self.record.header.opcode
    }

    pub fn process_id(&self) -> u32 {
        self.record.header.process_id
    }

    pub fn thread_id(&self) -> u32 {
        self.record.header.thread_id
    }

    pub fn timestamp(&self) -> u64 {
        self.record.header.timestamp_qpc
    }

    pub fn is_64bit(&self) -> bool {
        self.record.is_64bit()
    }

    pub fn pointer_size(&self) -> usize {
        self.record.pointer_size()
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn properties(&self) -> &PropertyIndex {
        self.schema.properties()
    }
}
