//! Frontmatter parsing and serialization.
//!
//! Markdown projections are stored as a YAML frontmatter block followed by a
//! free-form body:
//!
//! ```text
//! ---
//! id: 0b5c…
//! title: Hello
//! ---
//! body text
//! ```

use indexmap::IndexMap;
use serde_yaml::Value;
use std::path::Path;

use crate::error::{EpicenterError, Result};

/// Result of parsing a markdown file with frontmatter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    /// The parsed frontmatter, in file order.
    pub frontmatter: IndexMap<String, Value>,
    /// Everything after the closing delimiter, verbatim.
    pub body: String,
}

/// Parse frontmatter and body from markdown content.
///
/// `path` is only used for error reporting. Returns `NoFrontmatter` when the
/// delimiters are missing and `InvalidFrontmatter` when the YAML does not
/// parse into a mapping.
pub fn parse(content: &str, path: &Path) -> Result<ParsedFile> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))
        .ok_or_else(|| EpicenterError::NoFrontmatter(path.to_path_buf()))?;

    let (frontmatter_str, body) = if let Some(idx) = rest.find("\n---\n") {
        (&rest[..idx], &rest[idx + 5..])
    } else if let Some(idx) = rest.find("\n---\r\n") {
        (&rest[..idx], &rest[idx + 6..])
    } else if let Some(stripped) = rest.strip_suffix("\n---") {
        (stripped, "")
    } else {
        return Err(EpicenterError::NoFrontmatter(path.to_path_buf()));
    };

    let frontmatter = if frontmatter_str.trim().is_empty() {
        IndexMap::new()
    } else {
        serde_yaml::from_str::<IndexMap<String, Value>>(frontmatter_str).map_err(|e| {
            EpicenterError::InvalidFrontmatter {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?
    };

    Ok(ParsedFile {
        frontmatter,
        body: body.to_string(),
    })
}

/// Serialize frontmatter and body back to markdown content.
pub fn serialize(frontmatter: &IndexMap<String, Value>, body: &str) -> Result<String> {
    let yaml = if frontmatter.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(frontmatter)?
    };
    Ok(format!("---\n{}---\n{}", yaml, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn path() -> PathBuf {
        PathBuf::from("content/posts/a.md")
    }

    #[test]
    fn test_parse_basic() {
        let parsed = parse("---\ntitle: Hello\ncount: 3\n---\nBody text\n", &path()).unwrap();
        assert_eq!(parsed.frontmatter["title"], Value::String("Hello".into()));
        assert_eq!(parsed.frontmatter["count"], Value::Number(3.into()));
        assert_eq!(parsed.body, "Body text\n");
    }

    #[test]
    fn test_parse_preserves_order() {
        let parsed = parse("---\nid: x\nzeta: 1\nalpha: 2\n---\n", &path()).unwrap();
        let keys: Vec<&String> = parsed.frontmatter.keys().collect();
        assert_eq!(keys, vec!["id", "zeta", "alpha"]);
        assert_eq!(parsed.body, "");
    }

    #[test]
    fn test_parse_closing_delimiter_at_eof() {
        let parsed = parse("---\nid: x\n---", &path()).unwrap();
        assert_eq!(parsed.frontmatter.len(), 1);
        assert_eq!(parsed.body, "");
    }

    #[test]
    fn test_parse_crlf() {
        let parsed = parse("---\r\ntitle: Hi\r\n---\r\nBody", &path()).unwrap();
        assert_eq!(parsed.body, "Body");
    }

    #[test]
    fn test_missing_frontmatter_carries_path() {
        let err = parse("just text", &path()).unwrap_err();
        assert!(matches!(err, EpicenterError::NoFrontmatter(p) if p == path()));

        let err = parse("---\ntitle: unterminated\n", &path()).unwrap_err();
        assert!(matches!(err, EpicenterError::NoFrontmatter(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = parse("---\ntitle: [unclosed\n---\n", &path()).unwrap_err();
        assert!(matches!(err, EpicenterError::InvalidFrontmatter { .. }));

        let err = parse("---\n- a list\n---\n", &path()).unwrap_err();
        assert!(matches!(err, EpicenterError::InvalidFrontmatter { .. }));
    }

    #[test]
    fn test_serialize_then_parse() {
        let mut frontmatter = IndexMap::new();
        frontmatter.insert("id".to_string(), Value::String("r1".into()));
        frontmatter.insert("draft".to_string(), Value::Bool(true));
        let content = serialize(&frontmatter, "Hello\n\n---\nnot a delimiter").unwrap();
        assert!(content.starts_with("---\nid: r1\ndraft: true\n---\n"));

        let parsed = parse(&content, &path()).unwrap();
        assert_eq!(parsed.frontmatter, frontmatter);
        assert_eq!(parsed.body, "Hello\n\n---\nnot a delimiter");
    }
}
