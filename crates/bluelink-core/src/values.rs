//! Helpers over loosely-typed spec data.
//!
//! Resource specs, link data and export values are all `serde_json::Value`
//! documents. The engine addresses into them with dotted field paths that
//! support array indices, e.g. `handler`, `environment.variables[0].name`.

use serde_json::{Map, Value};

/// Maximum number of path segments honoured when extracting or injecting a
/// field path. Deeper paths are treated as unresolvable.
pub const MAX_FIELD_PATH_DEPTH: usize = 10;

/// One segment of a parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Parse a dotted field path like `a.b[0].c` into segments.
///
/// Returns `None` for malformed paths (empty segments, unterminated index
/// brackets, non-numeric indices) or paths deeper than
/// [`MAX_FIELD_PATH_DEPTH`].
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let mut rest = part;
        let field_end = rest.find('[').unwrap_or(rest.len());
        let field = &rest[..field_end];
        if field.is_empty() {
            return None;
        }
        segments.push(PathSegment::Field(field.to_string()));
        rest = &rest[field_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let index: usize = stripped[..close].parse().ok()?;
            segments.push(PathSegment::Index(index));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    if segments.is_empty() || segments.len() > MAX_FIELD_PATH_DEPTH {
        return None;
    }
    Some(segments)
}

/// Extract the value at `path` from `value`, if present.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path)?;
    let mut current = value;
    for segment in &segments {
        current = match segment {
            PathSegment::Field(name) => current.as_object()?.get(name)?,
            PathSegment::Index(index) => current.as_array()?.get(*index)?,
        };
    }
    Some(current)
}

/// Set the value at `path` in `value`, creating intermediate objects and
/// extending arrays with nulls as needed. Returns false when the path is
/// malformed or collides with an existing scalar.
pub fn inject_path(value: &mut Value, path: &str, new_value: Value) -> bool {
    let Some(segments) = parse_path(path) else {
        return false;
    };
    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            PathSegment::Field(name) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let Some(object) = current.as_object_mut() else {
                    return false;
                };
                if last {
                    object.insert(name.clone(), new_value);
                    return true;
                }
                current = object.entry(name.clone()).or_insert(Value::Null);
            }
            PathSegment::Index(index) => {
                if current.is_null() {
                    *current = Value::Array(Vec::new());
                }
                let Some(array) = current.as_array_mut() else {
                    return false;
                };
                if array.len() <= *index {
                    array.resize(*index + 1, Value::Null);
                }
                if last {
                    array[*index] = new_value;
                    return true;
                }
                current = &mut array[*index];
            }
        }
    }
    false
}

/// Flatten a document into its leaf field paths, depth-capped.
///
/// Leaves are scalars, empty objects and empty arrays. Paths deeper than
/// [`MAX_FIELD_PATH_DEPTH`] are truncated at the cap and the subtree at the
/// cap is treated as a single leaf.
pub fn flatten_leaves(value: &Value) -> Vec<(String, &Value)> {
    let mut leaves = Vec::new();
    flatten_into(value, String::new(), 0, &mut leaves);
    leaves
}

fn flatten_into<'a>(
    value: &'a Value,
    prefix: String,
    depth: usize,
    leaves: &mut Vec<(String, &'a Value)>,
) {
    if depth >= MAX_FIELD_PATH_DEPTH {
        leaves.push((prefix, value));
        return;
    }
    match value {
        Value::Object(object) if !object.is_empty() => {
            for (key, child) in object {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(child, path, depth + 1, leaves);
            }
        }
        Value::Array(array) if !array.is_empty() => {
            for (index, child) in array.iter().enumerate() {
                flatten_into(child, format!("{prefix}[{index}]"), depth + 1, leaves);
            }
        }
        _ => {
            if !prefix.is_empty() {
                leaves.push((prefix, value));
            }
        }
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key-by-key; anything else
/// in `overlay` replaces the value in `base`. Null overlays are ignored so a
/// stage that contributes nothing leaves the document untouched.
pub fn merge_documents(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_object), Value::Object(overlay_object)) => {
            for (key, overlay_value) in overlay_object {
                match base_object.get_mut(&key) {
                    Some(base_value) => merge_documents(base_value, overlay_value),
                    None => {
                        base_object.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_value, overlay_value) => *base_value = overlay_value,
    }
}

/// The flattened structural difference between two documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDiff {
    /// Paths present in `desired` but not `current`.
    pub added: Vec<String>,
    /// Paths present in `current` but not `desired`.
    pub removed: Vec<String>,
    /// Paths present in both with unequal values.
    pub changed: Vec<String>,
    /// Paths present in both with equal values.
    pub unchanged: Vec<String>,
}

impl FieldDiff {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.changed.is_empty()
    }
}

/// Structurally diff two documents by their flattened leaf paths.
pub fn diff_documents(current: &Value, desired: &Value) -> FieldDiff {
    let current_leaves: std::collections::BTreeMap<String, &Value> =
        flatten_leaves(current).into_iter().collect();
    let desired_leaves: std::collections::BTreeMap<String, &Value> =
        flatten_leaves(desired).into_iter().collect();

    let mut diff = FieldDiff::default();
    for (path, desired_value) in &desired_leaves {
        match current_leaves.get(path) {
            None => diff.added.push(path.clone()),
            Some(current_value) if current_value != desired_value => {
                diff.changed.push(path.clone());
            }
            Some(_) => diff.unchanged.push(path.clone()),
        }
    }
    for path in current_leaves.keys() {
        if !desired_leaves.contains_key(path) {
            diff.removed.push(path.clone());
        }
    }
    diff
}
