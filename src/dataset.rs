//! Loading and selecting instances from a SWE-bench dataset export.
//!
//! Accepts either a JSON array of rows or JSON lines (one row per line).

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::DatasetError;
use crate::instance::Instance;

/// Reads every instance in a dataset file.
pub fn load_instances(path: &Path) -> Result<Vec<Instance>, DatasetError> {
    if !path.exists() {
        return Err(DatasetError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let instances = parse_instances(&content)?;
    info!(path = %path.display(), count = instances.len(), "Loaded dataset");
    Ok(instances)
}

/// Parses dataset text in either supported format.
pub fn parse_instances(content: &str) -> Result<Vec<Instance>, DatasetError> {
    if content.trim_start().starts_with('[') {
        let rows: Vec<Instance> = serde_json::from_str(content)?;
        return Ok(rows.into_iter().map(Instance::normalized).collect());
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<Instance>(line)
                .map(Instance::normalized)
                .map_err(|e| DatasetError::InvalidRow {
                    line: index + 1,
                    reason: e.to_string(),
                })
        })
        .collect()
}

/// Picks the instances a run should cover.
///
/// With `instance_id`, exactly that instance. Otherwise instances are
/// sorted by id and the first `per_repo_limit` of each repository are kept
/// (0 keeps all).
pub fn select_instances(
    mut instances: Vec<Instance>,
    instance_id: Option<&str>,
    per_repo_limit: usize,
) -> Result<Vec<Instance>, DatasetError> {
    if let Some(id) = instance_id {
        let instance = instances
            .into_iter()
            .find(|i| i.instance_id == id)
            .ok_or_else(|| DatasetError::UnknownInstance(id.to_string()))?;
        return Ok(vec![instance]);
    }

    instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    if per_repo_limit == 0 {
        return Ok(instances);
    }

    let mut taken: HashMap<String, usize> = HashMap::new();
    Ok(instances
        .into_iter()
        .filter(|instance| {
            let count = taken.entry(instance.repo.clone()).or_insert(0);
            *count += 1;
            *count <= per_repo_limit
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const JSONL: &str = r#"{"instance_id": "psf__requests-2", "repo": "psf/requests", "version": "2.0"}
{"instance_id": "django__django-9", "repo": "django/django", "version": "3.0"}

{"instance_id": "psf__requests-1", "repo": "psf/requests", "version": "2.0"}
{"instance_id": "psf__requests-3", "repo": "psf/requests", "version": "2.0"}
"#;

    #[test]
    fn test_parse_jsonl_and_array() {
        let instances = parse_instances(JSONL).unwrap();
        assert_eq!(instances.len(), 4);
        assert!(!instances[0].instance_image_key.is_empty());

        let array = r#"[{"instance_id": "a__b-1", "repo": "a/b"}]"#;
        assert_eq!(parse_instances(array).unwrap()[0].instance_id, "a__b-1");
    }

    #[test]
    fn test_invalid_row_reports_line() {
        let err = parse_instances("{\"instance_id\": \"a\", \"repo\": \"o/r\"}\n{oops}\n")
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidRow { line: 2, .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = load_instances(&temp.path().join("nope.jsonl")).unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[test]
    fn test_select_per_repo_sorted() {
        let selected = select_instances(parse_instances(JSONL).unwrap(), None, 2).unwrap();
        let ids: Vec<&str> = selected.iter().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["django__django-9", "psf__requests-1", "psf__requests-2"]);

        let all = select_instances(parse_instances(JSONL).unwrap(), None, 0).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_select_single_instance() {
        let instances = parse_instances(JSONL).unwrap();
        let selected = select_instances(instances.clone(), Some("psf__requests-3"), 2).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].instance_id, "psf__requests-3");

        let err = select_instances(instances, Some("missing"), 2).unwrap_err();
        assert!(matches!(err, DatasetError::UnknownInstance(_)));
    }
}
