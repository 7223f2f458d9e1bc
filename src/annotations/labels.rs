//! Label template mini-language.
//!
//! A label spec is either a bare column name (`cell_type`), a backfill chain
//! (`cell_type<hemibrain_type`, first non-empty wins), or a format string
//! mixing literals and `{...}` placeholders, e.g.
//! `{cell_type<hemibrain_type} ({side})`.

use hashbrown::HashSet;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Unwrap is fine: the pattern is a compile-time constant
    RE.get_or_init(|| Regex::new(r"\{(.*?)\}").unwrap())
}

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Literal(String),
    /// Column chain; the first column with a value wins.
    Field(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct LabelTemplate {
    pieces: Vec<Piece>,
}

fn parse_chain(spec: &str) -> Vec<String> {
    spec.split('<').map(|c| c.trim().to_string()).collect()
}

impl LabelTemplate {
    pub fn parse(labels: &str) -> Self {
        let mut pieces = Vec::new();

        if labels.contains('{') {
            let mut last = 0;
            for m in placeholder_re().captures_iter(labels) {
                let whole = m.get(0).expect("capture 0 always present");
                if whole.start() > last {
                    pieces.push(Piece::Literal(labels[last..whole.start()].to_string()));
                }
                pieces.push(Piece::Field(parse_chain(&m[1])));
                last = whole.end();
            }
            if last < labels.len() {
                pieces.push(Piece::Literal(labels[last..].to_string()));
            }
        } else {
            // A bare column (or chain) is shorthand for "{spec}"
            pieces.push(Piece::Field(parse_chain(labels)));
        }

        Self { pieces }
    }

    /// All columns the template reads.
    pub fn columns(&self) -> HashSet<String> {
        let mut cols = HashSet::new();
        for piece in &self.pieces {
            if let Piece::Field(chain) = piece {
                for col in chain {
                    cols.insert(col.clone());
                }
            }
        }
        cols
    }

    /// Render the label for one row; missing values render as "".
    pub fn render(&self, row: &Map<String, Value>) -> String {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Field(chain) => {
                    let value = chain
                        .iter()
                        .find_map(|col| row.get(col).and_then(cell_to_string));
                    if let Some(v) = value {
                        out.push_str(&v);
                    }
                }
            }
        }
        out
    }
}

/// Render one cell as display text. Empty strings and nulls count as
/// missing so backfills can take over.
pub fn cell_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        // Multi-select columns come back as arrays
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(cell_to_string).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(","))
            }
        }
        Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_bare_column() {
        let template = LabelTemplate::parse("cell_type");
        let cols = template.columns();
        assert_eq!(cols.len(), 1);
        assert!(cols.contains("cell_type"));

        let r = row(&[("cell_type", json!("KCg"))]);
        assert_eq!(template.render(&r), "KCg");
    }

    #[test]
    fn test_bare_backfill_chain() {
        let template = LabelTemplate::parse("cell_type<hemibrain_type");
        let cols = template.columns();
        assert_eq!(cols.len(), 2);
        assert!(cols.contains("cell_type"));
        assert!(cols.contains("hemibrain_type"));

        let r = row(&[
            ("cell_type", Value::Null),
            ("hemibrain_type", json!("PEN_a")),
        ]);
        assert_eq!(template.render(&r), "PEN_a");

        let r = row(&[
            ("cell_type", json!("PEG")),
            ("hemibrain_type", json!("PEN_a")),
        ]);
        assert_eq!(template.render(&r), "PEG");
    }

    #[test]
    fn test_format_string() {
        let template = LabelTemplate::parse("{cell_type<hemibrain_type} ({side})");
        let r = row(&[
            ("cell_type", json!("")),
            ("hemibrain_type", json!("PEN_a")),
            ("side", json!("left")),
        ]);
        assert_eq!(template.render(&r), "PEN_a (left)");
    }

    #[test]
    fn test_missing_renders_empty() {
        let template = LabelTemplate::parse("{cell_type}/{side}");
        let r = row(&[("side", json!("right"))]);
        assert_eq!(template.render(&r), "/right");
    }

    #[test]
    fn test_spaces_in_chain_are_trimmed() {
        let template = LabelTemplate::parse("{cell_type < malecns_type}");
        assert!(template.columns().contains("malecns_type"));
    }

    #[test]
    fn test_cell_rendering() {
        assert_eq!(cell_to_string(&json!("  x  ")), Some("x".to_string()));
        assert_eq!(cell_to_string(&json!("")), None);
        assert_eq!(cell_to_string(&Value::Null), None);
        assert_eq!(cell_to_string(&json!(42)), Some("42".to_string()));
        assert_eq!(
            cell_to_string(&json!(["a", "b"])),
            Some("a,b".to_string())
        );
    }
}
