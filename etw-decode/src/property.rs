use crate::prop_types::Property;
use crate::FastHashMap;

/// Property list of a schema plus a name lookup table.
///
/// The first `top_level_count` entries are the top-level properties laid out
/// back to back in the payload; entries past that are struct members,
/// reachable only through a struct descriptor's start index.
#[derive(Debug, Clone, Default)]
pub struct PropertyIndex {
    properties: Vec<Property>,
    top_level_count: usize,
    name_to_index: FastHashMap<String, usize>,
}

impl PropertyIndex {
    pub fn new(properties: Vec<Property>, top_level_count: usize) -> Self {
        let top_level_count = top_level_count.min(properties.len());
        let mut name_to_index = FastHashMap::default();
        for (i, property) in properties.iter().take(top_level_count).enumerate() {
            name_to_index.entry(property.name.clone()).or_insert(i);
        }
        PropertyIndex {
            properties,
            top_level_count,
            name_to_index,
        }
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, index: usize) -> Option<&Property> {
        self.properties.get(index)
    }

    /// Index of a top-level property by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn top_level_count(&self) -> usize {
        self.top_level_count
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// A property located within a specific event payload: its descriptor, the
/// offset of its data, and the data itself (covering all array elements).
#[derive(Debug, Clone)]
pub struct PropertyInfo<'a> {
    pub property: &'a Property,
    pub offset: usize,
    pub buffer: &'a [u8],
    /// Size in bytes of one element; `buffer` holds `count` of them.
    pub elem_size: usize,
}
