//! Segment property compilation from SeaTable rows.

pub mod labels;
pub mod properties;

pub use labels::LabelTemplate;
pub use properties::SegmentProperties;

use anyhow::Context;
use hashbrown::HashSet;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::AnnotationDataset;
use crate::error::ServiceError;
use crate::seatable::SeaTableClient;

/// Compile neuroglancer segment properties for one annotation dataset.
///
/// `version` selects the root ID column (materialization version), `labels`
/// is a label template and `tags` an optional comma-separated list of tag
/// columns.
pub async fn segmentation_properties(
    client: &SeaTableClient,
    dataset: &str,
    ds: &AnnotationDataset,
    version: &str,
    labels: &str,
    tags: Option<&str>,
) -> Result<Value, ServiceError> {
    let id_col = ds.versions.get(version).ok_or_else(|| {
        ServiceError::BadRequest(format!(
            "Invalid mat_version: {}. Must be one of {:?}.",
            version,
            ds.versions.keys().collect::<Vec<_>>()
        ))
    })?;

    let template = LabelTemplate::parse(labels);
    let tag_cols: Vec<String> = tags
        .map(|t| {
            t.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let first_table = ds.tables.first().ok_or_else(|| {
        ServiceError::Internal(anyhow::anyhow!(
            "Annotation dataset '{}' has no tables configured",
            dataset
        ))
    })?;

    // The first table defines the available columns
    let available: HashSet<String> = client
        .table_columns(first_table)
        .await
        .context("Failed to fetch table columns")?
        .into_iter()
        .collect();

    let mut needed: HashSet<String> = template.columns();
    needed.insert(id_col.clone());
    for col in &tag_cols {
        needed.insert(col.clone());
    }

    for col in &needed {
        if !available.contains(col) {
            let mut columns: Vec<&String> = available.iter().collect();
            columns.sort();
            return Err(ServiceError::BadRequest(format!(
                "Invalid label column: '{}' does not exist in table(s). Available columns: {:?}",
                col, columns
            )));
        }
    }

    let has_status = available.contains("status");
    let mut fetch_cols: Vec<String> = needed.iter().cloned().collect();
    fetch_cols.sort();
    if has_status && !needed.contains("status") {
        fetch_cols.push("status".to_string());
    }

    let fetches = ds.tables.iter().map(|t| client.fetch_rows(t, &fetch_cols));
    let tables = futures::future::try_join_all(fetches)
        .await
        .context("Failed to fetch annotation rows")?;

    let total_rows: usize = tables.iter().map(|rows| rows.len()).sum();
    debug!(
        "Fetched {} rows across {} tables for dataset '{}'",
        total_rows,
        tables.len(),
        dataset
    );

    let props = compile_rows(&tables, id_col, &template, &tag_cols, &ds.bad_status, has_status);

    info!(
        "Compiled segment properties for '{}' ({} of {} rows kept)",
        dataset,
        props.len(),
        total_rows
    );

    Ok(props.to_info())
}

/// Turn fetched table rows into segment properties: drop bad-status rows,
/// rename the version-selected root column to root_id, drop rows without a
/// parseable root ID and de-duplicate on it (first row wins).
fn compile_rows(
    tables: &[Vec<Map<String, Value>>],
    id_col: &str,
    template: &LabelTemplate,
    tag_cols: &[String],
    bad_status: &[String],
    has_status: bool,
) -> SegmentProperties {
    let mut props = SegmentProperties::new(!tag_cols.is_empty());
    let mut seen = HashSet::new();

    for row in tables.iter().flatten() {
        if has_status && is_bad_status(row, bad_status) {
            continue;
        }
        let Some(root_id) = parse_root_id(row.get(id_col)) else {
            continue;
        };
        if !seen.insert(root_id) {
            continue;
        }

        // The template may refer to the root column by its canonical name
        let mut row = row.clone();
        row.insert("root_id".to_string(), Value::from(root_id));

        let label = template.render(&row);
        let row_tags: Vec<String> = tag_cols
            .iter()
            .filter_map(|col| row.get(col.as_str()).and_then(labels::cell_to_string))
            .collect();
        props.push(root_id, label, &row_tags);
    }

    props
}

fn is_bad_status(row: &Map<String, Value>, bad_status: &[String]) -> bool {
    match row.get("status").and_then(labels::cell_to_string) {
        Some(status) => bad_status.iter().any(|bad| *bad == status),
        None => false,
    }
}

/// Root IDs arrive as numbers or strings depending on the column type.
fn parse_root_id(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
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

    fn bad() -> Vec<String> {
        vec!["duplicate".to_string(), "bad_nucleus".to_string()]
    }

    #[test]
    fn test_compile_rows_first_duplicate_wins() {
        let tables = vec![vec![
            row(&[("root_630", json!(10)), ("cell_type", json!("KCg"))]),
            row(&[("root_630", json!(10)), ("cell_type", json!("PEN_a"))]),
            row(&[("root_630", json!(11)), ("cell_type", json!("PEG"))]),
        ]];
        let template = LabelTemplate::parse("cell_type");
        let props = compile_rows(&tables, "root_630", &template, &[], &bad(), false);

        let info = props.to_info();
        assert_eq!(info["inline"]["ids"], json!(["10", "11"]));
        assert_eq!(
            info["inline"]["properties"][0]["values"],
            json!(["KCg", "PEG"])
        );
    }

    #[test]
    fn test_compile_rows_drops_bad_status_and_bad_ids() {
        let tables = vec![vec![
            row(&[("root_id", json!(1)), ("status", json!("duplicate"))]),
            row(&[("root_id", json!("nope")), ("status", json!("ok"))]),
            row(&[("root_id", Value::Null)]),
            row(&[("root_id", json!(2)), ("status", json!("ok"))]),
        ]];
        let template = LabelTemplate::parse("root_id");
        let props = compile_rows(&tables, "root_id", &template, &[], &bad(), true);

        assert_eq!(props.len(), 1);
        assert_eq!(props.to_info()["inline"]["ids"], json!(["2"]));
    }

    #[test]
    fn test_compile_rows_renames_root_column() {
        // The template addresses the version column by its canonical name
        let tables = vec![vec![row(&[
            ("root_630", json!(720575940612345678u64)),
            ("side", json!("left")),
        ])]];
        let template = LabelTemplate::parse("{root_id} ({side})");
        let props = compile_rows(&tables, "root_630", &template, &[], &bad(), false);

        let info = props.to_info();
        assert_eq!(
            info["inline"]["properties"][0]["values"],
            json!(["720575940612345678 (left)"])
        );
    }

    #[test]
    fn test_compile_rows_concatenates_tables_with_tags() {
        let tables = vec![
            vec![row(&[("root_id", json!(1)), ("side", json!("left"))])],
            vec![row(&[("root_id", json!(2)), ("side", json!("right"))])],
        ];
        let template = LabelTemplate::parse("root_id");
        let tag_cols = vec!["side".to_string()];
        let props = compile_rows(&tables, "root_id", &template, &tag_cols, &bad(), false);

        let info = props.to_info();
        assert_eq!(info["inline"]["ids"], json!(["1", "2"]));
        let tags = &info["inline"]["properties"][1];
        assert_eq!(tags["tags"], json!(["left", "right"]));
        assert_eq!(tags["values"], json!([[0], [1]]));
    }

    #[test]
    fn test_parse_root_id() {
        assert_eq!(parse_root_id(Some(&json!(42))), Some(42));
        assert_eq!(
            parse_root_id(Some(&json!("720575940612345678"))),
            Some(720575940612345678)
        );
        assert_eq!(parse_root_id(Some(&json!(" 7 "))), Some(7));
        assert_eq!(parse_root_id(Some(&json!(-1))), None);
        assert_eq!(parse_root_id(Some(&json!("abc"))), None);
        assert_eq!(parse_root_id(Some(&Value::Null)), None);
        assert_eq!(parse_root_id(None), None);
    }

    #[test]
    fn test_bad_status_filter() {
        let bad = vec!["duplicate".to_string(), "bad_nucleus".to_string()];

        let mut row = Map::new();
        row.insert("status".to_string(), json!("duplicate"));
        assert!(is_bad_status(&row, &bad));

        row.insert("status".to_string(), json!("ok"));
        assert!(!is_bad_status(&row, &bad));

        row.insert("status".to_string(), Value::Null);
        assert!(!is_bad_status(&row, &bad));
    }
}
