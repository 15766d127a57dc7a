//! Defines the `Relationship` type, a link from a variable of one dataset into a
//! dimension of another.

use crate::error::{FlowError, Result};
use crate::store::dataset::is_identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the source variable's values address the target dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkMode {
    /// Values are coordinate labels of the target dimension (`@`).
    Label,
    /// Values are already zero-based positions along the target dimension (`->`).
    Positional,
}

impl LinkMode {
    pub fn symbol(&self) -> &'static str {
        match self {
            LinkMode::Label => "@",
            LinkMode::Positional => "->",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub source_node: String,
    pub source_var: String,
    pub target_node: String,
    pub target_dim: String,
    pub mode: LinkMode,
}

impl Relationship {
    /// Parses `"node.variable @ node.dimension"` or `"node.variable -> node.dimension"`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (lhs, rhs, mode) = match (spec.find("->"), spec.find('@')) {
            (Some(i), None) => (&spec[..i], &spec[i + 2..], LinkMode::Positional),
            (None, Some(i)) => (&spec[..i], &spec[i + 1..], LinkMode::Label),
            (Some(_), Some(_)) => {
                return Err(FlowError::Graph(format!(
                    "relationship '{}' mixes '@' and '->'",
                    spec.trim()
                )))
            }
            (None, None) => {
                return Err(FlowError::Graph(format!(
                    "relationship '{}' has no '@' or '->' operator",
                    spec.trim()
                )))
            }
        };

        let (source_node, source_var) = split_dotted(lhs)?;
        let (target_node, target_dim) = split_dotted(rhs)?;

        Ok(Self { source_node, source_var, target_node, target_dim, mode })
    }
}

fn split_dotted(side: &str) -> Result<(String, String)> {
    let trimmed = side.trim();
    let mut parts = trimmed.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(node), Some(member), None) => {
            let node = node.trim();
            let member = member.trim();
            if is_identifier(node) && is_identifier(member) {
                return Ok((node.to_string(), member.to_string()));
            }
        }
        _ => {}
    }
    Err(FlowError::Graph(format!(
        "malformed relationship endpoint '{}', expected 'node.name'",
        trimmed
    )))
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} {} {}.{}",
            self.source_node,
            self.source_var,
            self.mode.symbol(),
            self.target_node,
            self.target_dim
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("tours.otaz @ skims.otaz", LinkMode::Label)]
    #[case("tours.otaz@skims.otaz", LinkMode::Label)]
    #[case("  tours . otaz->skims . otaz ", LinkMode::Positional)]
    fn test_parse_whitespace_insensitive(#[case] spec: &str, #[case] mode: LinkMode) {
        let r = Relationship::parse(spec).unwrap();
        assert_eq!(r.source_node, "tours");
        assert_eq!(r.source_var, "otaz");
        assert_eq!(r.target_node, "skims");
        assert_eq!(r.target_dim, "otaz");
        assert_eq!(r.mode, mode);
    }

    #[rstest]
    #[case("tours.otaz skims.otaz", "no '@' or '->'")]
    #[case("tours.otaz @ skims", "'skims'")]
    #[case("tours.a.b -> skims.otaz", "'tours.a.b'")]
    #[case("tours.otaz @ -> skims.otaz", "mixes")]
    #[case("1tours.otaz @ skims.otaz", "'1tours.otaz'")]
    fn test_malformed_names_offending_part(#[case] spec: &str, #[case] fragment: &str) {
        let err = Relationship::parse(spec).unwrap_err();
        assert!(matches!(err, FlowError::Graph(_)));
        assert!(err.to_string().contains(fragment), "{} should mention {}", err, fragment);
    }

    #[test]
    fn test_display_is_canonical() {
        let r = Relationship::parse(" a.x->b.row ").unwrap();
        assert_eq!(r.to_string(), "a.x -> b.row");
    }
}
