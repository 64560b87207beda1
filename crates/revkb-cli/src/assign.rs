//! `name=value` arguments.
//!
//! | Input | Value |
//! |-------|-------|
//! | `null` | `Null` (removes the attribute) |
//! | `true` / `false` | `Bool` |
//! | `42` | `Int` |
//! | `4.5` | `Float` |
//! | `@7` | `Ref(7)` |
//! | `"42"` | `Text("42")` (quotes force text) |
//! | anything else | `Text` |

use anyhow::{anyhow, Result};
use revkb_store::{AttrValue, Attributes};

/// Like [`AttrValue::parse_literal`], plus double quotes to force text.
pub fn parse_value(raw: &str) -> AttrValue {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return AttrValue::Text(raw[1..raw.len() - 1].to_string());
    }
    AttrValue::parse_literal(raw)
}

pub fn parse_assignment(arg: &str) -> Result<(String, AttrValue)> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected name=value, got `{arg}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("missing attribute name in `{arg}`"));
    }
    Ok((name.to_string(), parse_value(raw)))
}

pub fn parse_assignments(args: &[String]) -> Result<Attributes> {
    args.iter().map(|arg| parse_assignment(arg)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use revkb_store::ObjectId;

    #[test]
    fn literals() {
        assert_eq!(parse_value("null"), AttrValue::Null);
        assert_eq!(parse_value("true"), AttrValue::Bool(true));
        assert_eq!(parse_value("-3"), AttrValue::Int(-3));
        assert_eq!(parse_value("2.5"), AttrValue::Float(2.5));
        assert_eq!(parse_value("@12"), AttrValue::Ref(ObjectId(12)));
        assert_eq!(parse_value("\"12\""), AttrValue::Text("12".to_string()));
        assert_eq!(parse_value("@me"), AttrValue::Text("@me".to_string()));
    }

    #[test]
    fn assignments_split_on_the_first_equals() {
        let (name, value) = parse_assignment("title=a=b").unwrap();
        assert_eq!(name, "title");
        assert_eq!(value, AttrValue::Text("a=b".to_string()));
        assert!(parse_assignment("title").is_err());
        assert!(parse_assignment("=x").is_err());
    }

    proptest! {
        #[test]
        fn integers_parse_as_ints(n in any::<i64>()) {
            prop_assert_eq!(parse_value(&n.to_string()), AttrValue::Int(n));
        }

        #[test]
        fn quoted_text_is_kept_verbatim(s in "[a-z0-9 ]{0,12}") {
            prop_assert_eq!(parse_value(&format!("\"{s}\"")), AttrValue::Text(s));
        }
    }
}
