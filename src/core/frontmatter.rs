//! YAML frontmatter codec for markdown job files

use serde_yaml::{Mapping, Value};
use std::path::Path;

use crate::error::{FlowError, Result};

const DELIMITER: &str = "---";

/// Split `content` into its frontmatter mapping and body.
///
/// Content without a leading `---` line has no frontmatter: the mapping is
/// empty and the whole text is the body. An opening delimiter without a
/// closing one is an error.
pub fn parse(path: &Path, content: &str) -> Result<(Mapping, String)> {
    let Some(rest) = strip_delimiter_line(content) else {
        return Ok((Mapping::new(), content.to_string()));
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == DELIMITER {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((parse_mapping(path, yaml)?, body.to_string()));
        }
        offset += line.len();
    }

    Err(FlowError::Frontmatter {
        path: path.to_path_buf(),
        reason: "missing closing '---' delimiter".to_string(),
    })
}

fn strip_delimiter_line(content: &str) -> Option<&str> {
    content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
}

fn parse_mapping(path: &Path, yaml: &str) -> Result<Mapping> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    serde_yaml::from_str(yaml).map_err(|e| FlowError::Frontmatter {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Reassemble a job file from its frontmatter and body.
pub fn render(frontmatter: &Mapping, body: &str) -> Result<String> {
    let yaml = if frontmatter.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(frontmatter)?
    };
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n{body}"))
}

/// Set each key to its value; a `Null` value removes the key. Keys not
/// mentioned are left untouched.
pub fn apply_updates(frontmatter: &mut Mapping, updates: Vec<(&str, Value)>) {
    for (key, value) in updates {
        let key = Value::String(key.to_string());
        if value.is_null() {
            frontmatter.remove(&key);
        } else {
            frontmatter.insert(key, value);
        }
    }
}

/// String value of `key`, if present and scalar.
pub fn get_str(frontmatter: &Mapping, key: &str) -> Option<String> {
    match frontmatter.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `depends_on` accepts a list or a single string.
pub fn get_list(frontmatter: &Mapping, key: &str) -> Vec<String> {
    match frontmatter.get(key) {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}
