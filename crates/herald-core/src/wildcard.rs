//! Wildcard template language.
//!
//! Templates are plain strings with `{name}` placeholders. The same syntax
//! drives inbound routing (resource paths matched against document URIs) and
//! outbound templating (endpoint URLs and subscription data values filled from
//! the matched path).
//!
//! ```
//! use std::collections::HashMap;
//!
//! use herald_core::wildcard;
//!
//! let values = wildcard::extract_value("/users/{id}", "/users/42").unwrap();
//! assert_eq!(values["id"], "42");
//!
//! let url = wildcard::replace("https://cb.io/{id}", &values).unwrap();
//! assert_eq!(url, "https://cb.io/42");
//! ```
//!
//! The anonymous name `*` matches like any other placeholder but is never
//! extracted, so it can only be used for routing.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// Anonymous placeholder name.
pub const ANONYMOUS: &str = "*";

/// Placeholder name bound to the document revision during delivery.
pub const REVISION: &str = "revision";

/// Template validation and matching failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WildcardError {
    /// Opening or closing bracket without a partner.
    #[error("unbalanced bracket at position {position}")]
    Unbalanced {
        /// Byte offset of the offending bracket
        position: usize,
    },

    /// Opening bracket inside a placeholder.
    #[error("nested bracket at position {position}")]
    Nested {
        /// Byte offset of the nested bracket
        position: usize,
    },

    /// Placeholder with no name.
    #[error("empty wildcard name at position {position}")]
    EmptyName {
        /// Byte offset of the opening bracket
        position: usize,
    },

    /// Placeholder uses a reserved name.
    #[error("wildcard name `{name}` is reserved")]
    Reserved {
        /// The reserved name
        name: String,
    },

    /// Same name declared twice where duplicates are rejected.
    #[error("wildcard `{name}` is declared more than once")]
    Duplicate {
        /// The duplicated name
        name: String,
    },

    /// Two placeholders with no literal between them.
    #[error("wildcards at position {position} are adjacent without a separator")]
    Adjacent {
        /// Byte offset of the second placeholder
        position: usize,
    },

    /// Placeholder sharing a path fragment with literal text.
    #[error("wildcard must occupy a whole path segment: `{segment}`")]
    PartialSegment {
        /// The offending segment
        segment: String,
    },

    /// Template without any placeholder where one is required.
    #[error("template requires at least one wildcard")]
    Missing,

    /// Concrete string does not follow the template.
    #[error("value does not match template at position {position}")]
    Mismatch {
        /// Byte offset in the concrete string
        position: usize,
    },

    /// Placeholder that the owning resource path does not declare.
    #[error("wildcard `{name}` is not declared by the resource path")]
    Undeclared {
        /// The undeclared name
        name: String,
    },
}

/// Validation rules applied on top of the bracket syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rules<'a> {
    /// Names that may not be declared.
    pub reserved: &'a [&'a str],
    /// Reject a name declared more than once.
    pub reject_duplicates: bool,
}

impl Rules<'static> {
    /// Rules for resource paths.
    pub const PATH: Self = Self { reserved: &[REVISION], reject_duplicates: true };

    /// Rules for endpoint URLs and data values.
    pub const TEMPLATE: Self = Self { reserved: &[], reject_duplicates: false };
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Literal(&'a str),
    Wildcard { name: String, position: usize },
}

/// Splits a template into literal and placeholder tokens.
fn tokenize(template: &str) -> Result<Vec<Token<'_>>, WildcardError> {
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut open: Option<usize> = None;

    for (i, c) in template.char_indices() {
        match c {
            '{' => {
                if open.is_some() {
                    return Err(WildcardError::Nested { position: i });
                }
                if literal_start < i {
                    tokens.push(Token::Literal(&template[literal_start..i]));
                }
                open = Some(i);
            },
            '}' => {
                let Some(start) = open.take() else {
                    return Err(WildcardError::Unbalanced { position: i });
                };
                let name: String =
                    template[start + 1..i].chars().filter(|c| !c.is_whitespace()).collect();
                if name.is_empty() {
                    return Err(WildcardError::EmptyName { position: start });
                }
                tokens.push(Token::Wildcard { name, position: start });
                literal_start = i + 1;
            },
            _ => {},
        }
    }

    if let Some(start) = open {
        return Err(WildcardError::Unbalanced { position: start });
    }
    if literal_start < template.len() {
        tokens.push(Token::Literal(&template[literal_start..]));
    }

    Ok(tokens)
}

/// Returns true if the string contains a `{…}` placeholder.
pub fn is_present(s: &str) -> bool {
    s.find('{').is_some_and(|open| s[open..].contains('}'))
}

/// Validates bracket syntax and naming rules.
///
/// # Errors
///
/// Returns the first violation found scanning left to right.
pub fn validate(template: &str, rules: &Rules<'_>) -> Result<(), WildcardError> {
    let tokens = tokenize(template)?;
    let mut seen = HashSet::new();
    let mut previous_was_wildcard = false;

    for token in &tokens {
        match token {
            Token::Literal(_) => previous_was_wildcard = false,
            Token::Wildcard { name, position } => {
                if previous_was_wildcard {
                    return Err(WildcardError::Adjacent { position: *position });
                }
                previous_was_wildcard = true;

                if rules.reserved.contains(&name.as_str()) {
                    return Err(WildcardError::Reserved { name: name.clone() });
                }
                if name != ANONYMOUS && !seen.insert(name.as_str()) && rules.reject_duplicates {
                    return Err(WildcardError::Duplicate { name: name.clone() });
                }
            },
        }
    }

    Ok(())
}

/// Validates a URL or path template.
///
/// On top of [`validate`], every placeholder must occupy a whole
/// `/`-separated fragment: `/{id}` is legal, `/user-{id}` is not.
///
/// # Errors
///
/// Returns the first syntax, naming or segment violation.
pub fn validate_url(template: &str, rules: &Rules<'_>) -> Result<(), WildcardError> {
    validate(template, rules)?;

    for segment in template.split('/') {
        if !segment.contains(['{', '}']) {
            continue;
        }
        let tokens = tokenize(segment)?;
        if !matches!(tokens.as_slice(), [Token::Wildcard { .. }]) {
            return Err(WildcardError::PartialSegment { segment: segment.to_string() });
        }
    }

    Ok(())
}

/// Returns the declared names in first-seen order without duplicates.
///
/// The anonymous name is skipped.
///
/// # Errors
///
/// Returns an error if the template is malformed.
pub fn extract(template: &str) -> Result<Vec<String>, WildcardError> {
    let mut names: Vec<String> = Vec::new();
    for token in tokenize(template)? {
        if let Token::Wildcard { name, .. } = token {
            if name != ANONYMOUS && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Captures placeholder values by walking template and concrete string
/// together.
///
/// Literals must match exactly. A placeholder captures everything up to the
/// next literal of the template (or the end of the string), so several
/// placeholders can share a segment as long as literals separate them. The
/// first capture wins when a name repeats.
///
/// # Errors
///
/// Returns `Mismatch` when the concrete string does not follow the template.
pub fn extract_value(
    template: &str,
    concrete: &str,
) -> Result<HashMap<String, String>, WildcardError> {
    let tokens = tokenize(template)?;
    let mut values = HashMap::new();
    let mut cursor = 0;

    for (index, token) in tokens.iter().enumerate() {
        match token {
            Token::Literal(literal) => {
                if !concrete[cursor..].starts_with(literal) {
                    return Err(WildcardError::Mismatch { position: cursor });
                }
                cursor += literal.len();
            },
            Token::Wildcard { name, .. } => {
                let end = match tokens.get(index + 1) {
                    Some(Token::Literal(boundary)) => concrete[cursor..]
                        .find(boundary)
                        .map(|offset| cursor + offset)
                        .ok_or(WildcardError::Mismatch { position: cursor })?,
                    Some(Token::Wildcard { position, .. }) => {
                        return Err(WildcardError::Adjacent { position: *position });
                    },
                    None => concrete.len(),
                };
                if name != ANONYMOUS {
                    values.entry(name.clone()).or_insert_with(|| concrete[cursor..end].to_string());
                }
                cursor = end;
            },
        }
    }

    if cursor != concrete.len() {
        return Err(WildcardError::Mismatch { position: cursor });
    }

    Ok(values)
}

/// Substitutes placeholders with the given values.
///
/// Names without a value are left in place in normalized form.
///
/// # Errors
///
/// Returns an error if the template is malformed.
pub fn replace<S: std::hash::BuildHasher>(
    template: &str,
    values: &HashMap<String, String, S>,
) -> Result<String, WildcardError> {
    let tokens = tokenize(template)?;
    let mut output = String::with_capacity(template.len());

    for token in tokens {
        match token {
            Token::Literal(literal) => output.push_str(literal),
            Token::Wildcard { name, .. } => match values.get(&name) {
                Some(value) => output.push_str(value),
                None => {
                    output.push('{');
                    output.push_str(&name);
                    output.push('}');
                },
            },
        }
    }

    Ok(output)
}

/// Strips whitespace inside placeholders: `{ id }` becomes `{id}`.
pub fn normalize(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    let mut inside = false;
    for c in s.chars() {
        match c {
            '{' => inside = true,
            '}' => inside = false,
            c if inside && c.is_whitespace() => continue,
            _ => {},
        }
        output.push(c);
    }
    output
}

/// Collapses every placeholder to `{*}`.
///
/// Two templates with the same canonical form route identical URIs, which is
/// what resource conflict detection compares.
pub fn canonical(s: &str) -> String {
    match tokenize(s) {
        Ok(tokens) => tokens
            .into_iter()
            .map(|token| match token {
                Token::Literal(literal) => literal.to_string(),
                Token::Wildcard { .. } => format!("{{{ANONYMOUS}}}"),
            })
            .collect(),
        Err(_) => normalize(s),
    }
}

/// Returns true if a path segment is a single whole-segment placeholder.
pub fn is_wildcard_segment(segment: &str) -> bool {
    segment.len() >= 2 && segment.starts_with('{') && segment.ends_with('}')
}
