//! Neuroglancer segment properties builder.
//!
//! Produces the `neuroglancer_segment_properties` info JSON: inline IDs plus
//! a label property and, optionally, a tags property whose values index into
//! a deduplicated tag vocabulary.

use hashbrown::HashMap;
use serde_json::{json, Value};

#[derive(Debug, Default)]
pub struct SegmentProperties {
    ids: Vec<u64>,
    labels: Vec<String>,
    tag_vocab: Vec<String>,
    tag_index: HashMap<String, usize>,
    tag_values: Option<Vec<Vec<usize>>>,
}

impl SegmentProperties {
    pub fn new(with_tags: bool) -> Self {
        Self {
            tag_values: with_tags.then(Vec::new),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append one segment. `tags` is ignored unless the builder was created
    /// with tags enabled.
    pub fn push(&mut self, id: u64, label: String, tags: &[String]) {
        self.ids.push(id);
        self.labels.push(label);

        if self.tag_values.is_none() {
            return;
        }

        let mut indices = Vec::with_capacity(tags.len());
        for tag in tags {
            let next = self.tag_vocab.len();
            let idx = *self.tag_index.entry(tag.clone()).or_insert(next);
            if idx == next {
                self.tag_vocab.push(tag.clone());
            }
            indices.push(idx);
        }
        indices.sort_unstable();
        indices.dedup();
        if let Some(values) = &mut self.tag_values {
            values.push(indices);
        }
    }

    /// The info JSON consumed by neuroglancer.
    pub fn to_info(&self) -> Value {
        let ids: Vec<String> = self.ids.iter().map(|id| id.to_string()).collect();

        let mut properties = vec![json!({
            "id": "label",
            "type": "label",
            "values": self.labels,
        })];

        if let Some(values) = &self.tag_values {
            properties.push(json!({
                "id": "tags",
                "type": "tags",
                "tags": self.tag_vocab,
                "values": values,
            }));
        }

        json!({
            "@type": "neuroglancer_segment_properties",
            "inline": {
                "ids": ids,
                "properties": properties,
            }
        })
    }
}
