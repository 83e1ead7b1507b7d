//! RFC 6570 URI template matching.
//!
//! Backends advertise resources as plain URIs or as templates such as
//! `file:///logs/{name}` or `db://{table}/rows{?limit,offset}`. Routing only
//! needs to answer "could this URI have been produced by this template?", so
//! each template is compiled once into an anchored regular expression.

use std::fmt;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UriTemplateError {
    #[error("unterminated expression in URI template '{template}'")]
    Unterminated { template: String },

    #[error("empty expression in URI template '{template}'")]
    EmptyExpression { template: String },

    #[error("invalid URI template '{template}': {reason}")]
    Invalid { template: String, reason: String },
}

/// A parsed URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    raw: String,
    variables: Vec<String>,
    pattern: Regex,
}

impl UriTemplate {
    pub fn parse(raw: &str) -> Result<Self, UriTemplateError> {
        let mut pattern = String::from("^");
        let mut variables = Vec::new();
        let mut rest = raw;

        while let Some(open) = rest.find('{') {
            pattern.push_str(&regex::escape(&rest[..open]));
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| UriTemplateError::Unterminated {
                template: raw.to_string(),
            })?;
            let expr = &after[..close];
            if expr.is_empty() {
                return Err(UriTemplateError::EmptyExpression {
                    template: raw.to_string(),
                });
            }

            let (operator, var_list) = match expr.chars().next() {
                Some(op @ ('+' | '#' | '.' | '/' | ';' | '?' | '&')) => (Some(op), &expr[1..]),
                _ => (None, expr),
            };

            let names: Vec<String> = var_list
                .split(',')
                .map(|v| {
                    v.trim_end_matches('*')
                        .split(':')
                        .next()
                        .unwrap_or_default()
                        .to_string()
                })
                .collect();
            if names.iter().any(String::is_empty) {
                return Err(UriTemplateError::EmptyExpression {
                    template: raw.to_string(),
                });
            }

            pattern.push_str(expression_pattern(operator, names.len()));
            variables.extend(names);
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(UriTemplateError::Invalid {
                template: raw.to_string(),
                reason: "unmatched '}'".into(),
            });
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        let pattern = Regex::new(&pattern).map_err(|e| UriTemplateError::Invalid {
            template: raw.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            raw: raw.to_string(),
            variables,
            pattern,
        })
    }

    /// Whether `uri` is an expansion of this template.
    pub fn matches(&self, uri: &str) -> bool {
        self.pattern.is_match(uri)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Regex fragment matching any expansion of one expression.
fn expression_pattern(operator: Option<char>, var_count: usize) -> &'static str {
    match operator {
        // Simple expansion percent-encodes reserved characters.
        None => "[^/?#]*",
        Some('+') => "[^?#]*",
        Some('#') => "(?:#.*)?",
        Some('.') => "(?:\\.[^/?#]*)*",
        Some('/') if var_count > 1 => "(?:/[^/?#]*)*",
        Some('/') => "(?:/[^?#]*)?",
        Some(';') => "(?:;[^/?#]*)*",
        Some('?') => "(?:\\?[^#]*)?",
        Some('&') => "(?:&[^#]*)*",
        Some(_) => "[^/?#]*",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
