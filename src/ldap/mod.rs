//! LDAP filter parsing and evaluation (RFC 4515 subset used by OSGi).
//!
//! Filters are parsed once into an immutable [`Filter`] tree and can then
//! be evaluated against a property map any number of times from any
//! thread; there is no interior mutability anywhere in this module.

mod parser;

use std::collections::HashMap;
use std::fmt;

pub use parser::parse;

use crate::error::{Result, RuntimeError};

/// A property value as stored in a service's property map.
///
/// A list value matches a comparison if *any* element of the list
/// matches, mirroring how OSGi treats multi-valued properties.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    fn leaf_strings(&self, out: &mut Vec<String>) {
        match self {
            PropertyValue::Str(s) => out.push(s.clone()),
            PropertyValue::Int(n) => out.push(n.to_string()),
            PropertyValue::Bool(b) => out.push(b.to_string()),
            PropertyValue::List(items) => {
                for item in items {
                    item.leaf_strings(out);
                }
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Int(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

pub type Properties = HashMap<String, PropertyValue>;

/// A parsed LDAP filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Present(String),
    Equal(String, String),
    Approx(String, String),
    GreaterEq(String, String),
    LessEq(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Parses a filter string, e.g. `(&(objectClass=spec.Foo)(x>=1))`.
    pub fn parse(text: &str) -> Result<Filter> {
        parser::parse(text)
    }

    /// Tests this filter against a property map. Missing attributes never
    /// match any comparison operator, including `!=`-style negations of a
    /// present-but-mismatched value (a `Not` only flips whatever its child
    /// evaluated to).
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Filter::Present(attr) => props.contains_key(attr),
            Filter::Equal(attr, value) => match_values(props, attr, |candidate| {
                wildcard_match(candidate, value)
            }),
            Filter::Approx(attr, value) => {
                let normalized = normalize_approx(value);
                match_values(props, attr, |candidate| {
                    normalize_approx(candidate) == normalized
                })
            }
            Filter::GreaterEq(attr, value) => {
                match_values(props, attr, |candidate| compare(candidate, value).is_ge())
            }
            Filter::LessEq(attr, value) => {
                match_values(props, attr, |candidate| compare(candidate, value).is_le())
            }
            Filter::And(children) => children.iter().all(|c| c.matches(props)),
            Filter::Or(children) => children.iter().any(|c| c.matches(props)),
            Filter::Not(child) => !child.matches(props),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Present(attr) => write!(f, "({attr}=*)"),
            Filter::Equal(attr, value) => write!(f, "({attr}={value})"),
            Filter::Approx(attr, value) => write!(f, "({attr}~={value})"),
            Filter::GreaterEq(attr, value) => write!(f, "({attr}>={value})"),
            Filter::LessEq(attr, value) => write!(f, "({attr}<={value})"),
            Filter::And(children) => {
                write!(f, "(&")?;
                for c in children {
                    write!(f, "{c}")?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(|")?;
                for c in children {
                    write!(f, "{c}")?;
                }
                write!(f, ")")
            }
            Filter::Not(child) => write!(f, "(!{child})"),
        }
    }
}

fn match_values(props: &Properties, attr: &str, predicate: impl Fn(&str) -> bool) -> bool {
    let Some(value) = props.get(attr) else {
        return false;
    };
    let mut leaves = Vec::new();
    value.leaf_strings(&mut leaves);
    leaves.iter().any(|leaf| predicate(leaf))
}

fn normalize_approx(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Numeric comparison when both sides parse as integers, falling back to
/// byte-wise string comparison otherwise.
fn compare(candidate: &str, value: &str) -> std::cmp::Ordering {
    match (candidate.parse::<i64>(), value.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => candidate.cmp(value),
    }
}

/// Matches `candidate` against a pattern that may contain `*` wildcards.
/// Segments are matched left to right and must appear in order: the
/// pattern `*a*b*` matches `xaxxb` but not `bxa`.
fn wildcard_match(candidate: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return candidate == pattern;
    }

    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let segments: Vec<&str> = pattern.split('*').filter(|s| !s.is_empty()).collect();

    if segments.is_empty() {
        // Bare "*": presence-style match against any existing value.
        return true;
    }

    let mut cursor = candidate;
    for (i, segment) in segments.iter().enumerate() {
        let is_first = i == 0;
        let is_last = i == segments.len() - 1;

        if is_first && anchored_start {
            if !cursor.starts_with(segment) {
                return false;
            }
            cursor = &cursor[segment.len()..];
            continue;
        }

        match cursor.find(segment) {
            Some(pos) => {
                cursor = &cursor[pos + segment.len()..];
            }
            None => return false,
        }

        if is_last && anchored_end && !cursor.is_empty() {
            // We consumed up through the last segment but there is
            // trailing text and the pattern did not end with '*'.
            return false;
        }
    }

    true
}

/// Escapes `\`, `*`, `(`, `)` and NUL per RFC 4515 so a literal value can be
/// embedded safely in a filter string.
pub fn escape_ldap(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}

/// ANDs a `(objectClass=spec)` equality term with an optional user filter,
/// matching how the registry narrows a lookup to one specification.
pub fn combine_filters(spec: &str, user_filter: Option<&Filter>) -> Filter {
    let spec_term = Filter::Equal("objectClass".to_string(), spec.to_string());
    match user_filter {
        None => spec_term,
        Some(f) => Filter::And(vec![spec_term, f.clone()]),
    }
}

/// Parses a filter string, wrapping the error as [`RuntimeError::BadFilter`].
pub fn get_ldap_filter(text: &str) -> Result<Filter> {
    Filter::parse(text).map_err(|_| RuntimeError::BadFilter(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), PropertyValue::Str(v.to_string())))
            .collect()
    }

    #[test]
    fn equality_and_presence() {
        let f = Filter::parse("(x=1)").unwrap();
        assert!(f.matches(&props(&[("x", "1")])));
        assert!(!f.matches(&props(&[("x", "2")])));

        let f = Filter::parse("(x=*)").unwrap();
        assert!(f.matches(&props(&[("x", "anything")])));
        assert!(!f.matches(&props(&[("y", "anything")])));
    }

    #[test]
    fn wildcard_ordering() {
        assert!(wildcard_match("xaxxb", "*a*b*"));
        assert!(!wildcard_match("bxa", "*a*b*"));
    }

    #[test]
    fn and_or_not() {
        let f = Filter::parse("(&(x=1)(y=2))").unwrap();
        assert!(f.matches(&props(&[("x", "1"), ("y", "2")])));
        assert!(!f.matches(&props(&[("x", "1"), ("y", "3")])));

        let f = Filter::parse("(|(x=1)(x=2))").unwrap();
        assert!(f.matches(&props(&[("x", "2")])));

        let f = Filter::parse("(!(x=1))").unwrap();
        assert!(f.matches(&props(&[("x", "2")])));
        assert!(!f.matches(&props(&[("x", "1")])));
    }

    #[test]
    fn ordering_operators() {
        let f = Filter::parse("(x>=5)").unwrap();
        assert!(f.matches(&props(&[("x", "10")])));
        assert!(!f.matches(&props(&[("x", "4")])));

        let f = Filter::parse("(x<=5)").unwrap();
        assert!(f.matches(&props(&[("x", "4")])));
        assert!(!f.matches(&props(&[("x", "10")])));
    }

    #[test]
    fn approx_is_case_and_space_insensitive() {
        let f = Filter::parse("(x~=Hello World)").unwrap();
        assert!(f.matches(&props(&[("x", "helloworld")])));
    }

    #[test]
    fn list_valued_property_matches_any_element() {
        let mut p = Properties::new();
        p.insert(
            "objectClass".to_string(),
            PropertyValue::List(vec!["spec.A".into(), "spec.B".into()]),
        );
        let f = Filter::parse("(objectClass=spec.B)").unwrap();
        assert!(f.matches(&p));
    }

    #[test]
    fn combine_and_escape() {
        let combined = combine_filters("spec.Foo", Some(&Filter::parse("(x=1)").unwrap()));
        assert_eq!(combined.to_string(), "(&(objectClass=spec.Foo)(x=1))");

        assert_eq!(escape_ldap("a*b(c)\\"), "a\\2ab\\28c\\29\\5c");
    }
}
