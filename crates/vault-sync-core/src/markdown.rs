//! Markdown parsing and serialization with frontmatter support.
//!
//! Handles the conversion between raw markdown files and structured data
//! (frontmatter YAML + body text). Timestamps are carried by the file
//! itself, so `sequence`, `createdAt` and `updatedAt` never survive a parse.

use crate::entity::TIMESTAMP_FIELDS;
use std::collections::BTreeMap;

pub type Frontmatter = BTreeMap<String, serde_yaml::Value>;

/// Parsed markdown document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMarkdown {
    /// Frontmatter as key-value pairs (empty if the file has none)
    pub frontmatter: Frontmatter,
    /// Markdown body (everything after frontmatter)
    pub body: String,
}

/// Parse a markdown file into frontmatter and body.
///
/// Frontmatter must be delimited by `---` at the start of the file:
/// ```markdown
/// ---
/// title: My Note
/// tags: [a, b, c]
/// ---
///
/// # Content here
/// ```
/// A block that is not valid YAML mapping is left in the body.
pub fn parse(content: &str) -> ParsedMarkdown {
    let whole = || ParsedMarkdown {
        frontmatter: Frontmatter::new(),
        body: content.to_string(),
    };

    let Some(rest) = content.strip_prefix("---\n") else {
        return whole();
    };

    // The block may be empty, in which case the closing delimiter comes first
    let (yaml, after) = if let Some(after) = rest.strip_prefix("---") {
        ("", after)
    } else {
        match rest.find("\n---") {
            Some(pos) => (&rest[..pos], &rest[pos + 4..]),
            None => return whole(),
        }
    };

    // The closing delimiter must end its line
    if !(after.is_empty() || after.starts_with('\n') || after.starts_with("\r\n")) {
        return whole();
    }

    let mut frontmatter = if yaml.trim().is_empty() {
        Frontmatter::new()
    } else {
        match serde_yaml::from_str::<Frontmatter>(yaml) {
            Ok(fm) => fm,
            Err(_) => return whole(),
        }
    };
    for key in TIMESTAMP_FIELDS {
        frontmatter.remove(key);
    }

    let body = after
        .trim_start_matches("\r\n")
        .trim_start_matches('\n')
        .to_string();
    ParsedMarkdown { frontmatter, body }
}

/// Serialize frontmatter and body back to markdown. An empty mapping
/// produces the bare body.
pub fn serialize(frontmatter: &Frontmatter, body: &str) -> String {
    let mut fm = frontmatter.clone();
    for key in TIMESTAMP_FIELDS {
        fm.remove(key);
    }
    if fm.is_empty() {
        return body.to_string();
    }
    let yaml = serde_yaml::to_string(&fm).unwrap_or_default();
    format!("---\n{}---\n\n{}", yaml, body)
}

/// Convert a YAML value into JSON for storage in entity properties.
pub fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Convert a JSON property back into YAML for writing front matter.
pub fn json_to_yaml(value: &serde_json::Value) -> serde_yaml::Value {
    serde_yaml::to_value(value).unwrap_or(serde_yaml::Value::Null)
}
