//! Field path expressions.
//!
//! Bean fields are addressed with small path expressions such as
//! `/customer/address/city` or `lines[2].sku`. A path is a sequence of
//! named segments, each optionally followed by an `[n]` index. Both `.`
//! and `/` act as separators and a leading `/` is ignored, so
//! `/lines[2]/sku` and `lines[2].sku` name the same field.
//!
//! Every path has a canonical string form (segments joined with `.`),
//! which is the key used by [`AttributeStore`](crate::AttributeStore).

use crate::error::{Error, Result};
use std::fmt;

/// One segment of a field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    pub name: String,
    pub index: Option<usize>,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{}]", self.name, index),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a path expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPath {
            path: expr.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = expr.trim();
        let body = trimmed.strip_prefix('/').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(invalid("empty path"));
        }

        let mut segments = Vec::new();
        for raw in body.split(['.', '/']) {
            if raw.is_empty() {
                return Err(invalid("empty segment"));
            }
            segments.push(parse_segment(raw).map_err(|reason| invalid(reason))?);
        }

        Ok(Self { segments })
    }

    /// The parsed segments, outermost first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Canonical string form, used as the attribute key.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Whether `self` lies strictly beneath `prefix`.
    pub fn is_nested_under(&self, prefix: &FieldPath) -> bool {
        self.segments.len() > prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FieldPath::parse(s)
    }
}

fn parse_segment(raw: &str) -> std::result::Result<Segment, &'static str> {
    let Some(open) = raw.find('[') else {
        if raw.contains(']') {
            return Err("unexpected ']'");
        }
        return Ok(Segment {
            name: raw.to_string(),
            index: None,
        });
    };

    let name = &raw[..open];
    if name.is_empty() {
        return Err("index without a field name");
    }
    let rest = &raw[open + 1..];
    let close = rest.find(']').ok_or("unterminated index")?;
    if close + 1 != rest.len() {
        return Err("trailing characters after index");
    }
    let index = rest[..close]
        .parse::<usize>()
        .map_err(|_| "index must be a non-negative integer")?;

    Ok(Segment {
        name: name.to_string(),
        index: Some(index),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let path = FieldPath::parse("status").unwrap();
        assert_eq!(path.segments().len(), 1);
        assert_eq!(path.canonical(), "status");
    }

    #[test]
    fn slash_and_dot_are_equivalent() {
        let a = FieldPath::parse("/customer/address/city").unwrap();
        let b = FieldPath::parse("customer.address.city").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), "customer.address.city");
    }

    #[test]
    fn indexed_segments() {
        let path = FieldPath::parse("/lines[2]/sku").unwrap();
        assert_eq!(path.segments()[0].index, Some(2));
        assert_eq!(path.canonical(), "lines[2].sku");
    }

    #[test]
    fn nesting() {
        let parent = FieldPath::parse("customer").unwrap();
        let child = FieldPath::parse("customer.name").unwrap();
        assert!(child.is_nested_under(&parent));
        assert!(!parent.is_nested_under(&parent));
        assert!(!parent.is_nested_under(&child));
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "/", "a..b", "a//b", "[1]", "a[x]", "a[1", "a]", "a[1]b", "a[-1]"] {
            let err = FieldPath::parse(bad).unwrap_err();
            assert!(
                matches!(err, Error::InvalidPath { .. }),
                "expected InvalidPath for {:?}",
                bad
            );
        }
    }
}
