//! Minimal selector grammar over snapshot elements.
//!
//! A selector is a whitespace-separated list of clauses, each
//! `field op value` where `op` is `=` (exact) or `~` (contains,
//! case-insensitive). Values may be quoted with single or double quotes to
//! include spaces. Examples:
//!
//! ```text
//! role=button
//! role=button text~'continue'
//! role=textbox name~'email'
//! ```

use std::fmt;

use crate::models::Element;

/// Field a clause matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorField {
    Role,
    Text,
    Name,
    Href,
    Value,
}

impl SelectorField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "role" => Some(Self::Role),
            "text" => Some(Self::Text),
            "name" => Some(Self::Name),
            "href" => Some(Self::Href),
            "value" => Some(Self::Value),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::Text => "text",
            Self::Name => "name",
            Self::Href => "href",
            Self::Value => "value",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOp {
    /// `=` exact match.
    Exact,
    /// `~` case-insensitive substring match.
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorClause {
    pub field: SelectorField,
    pub op: SelectorOp,
    pub value: String,
}

impl SelectorClause {
    fn matches(&self, element: &Element) -> bool {
        let field_value = match self.field {
            SelectorField::Role => Some(element.role.as_str()),
            SelectorField::Text => element.text.as_deref(),
            SelectorField::Name => element.name.as_deref(),
            SelectorField::Href => element.href.as_deref(),
            SelectorField::Value => element.value.as_deref(),
        };
        let Some(actual) = field_value else {
            return false;
        };
        match self.op {
            SelectorOp::Exact => actual == self.value,
            SelectorOp::Contains => actual.to_lowercase().contains(&self.value.to_lowercase()),
        }
    }
}

/// A parsed selector expression. All clauses must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub clauses: Vec<SelectorClause>,
    source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid selector '{source_text}': {message}")]
pub struct SelectorParseError {
    pub source_text: String,
    pub message: String,
}

impl Selector {
    /// Parse a selector expression. Fails on empty input, unknown fields,
    /// missing operators, and unterminated quotes.
    pub fn parse(input: &str) -> Result<Self, SelectorParseError> {
        let err = |message: String| SelectorParseError {
            source_text: input.to_string(),
            message,
        };

        let tokens = tokenize(input).map_err(|m| err(m))?;
        if tokens.is_empty() {
            return Err(err("empty selector".to_string()));
        }

        let mut clauses = Vec::with_capacity(tokens.len());
        for token in tokens {
            let (field_str, op, value) = split_clause(&token).ok_or_else(|| {
                err(format!("clause '{token}' is not of the form field=value or field~value"))
            })?;
            let field = SelectorField::parse(field_str)
                .ok_or_else(|| err(format!("unknown field '{field_str}'")))?;
            if value.is_empty() {
                return Err(err(format!("empty value for field '{field_str}'")));
            }
            clauses.push(SelectorClause {
                field,
                op,
                value,
            });
        }

        Ok(Self {
            clauses,
            source: input.to_string(),
        })
    }

    /// True when every clause matches the element.
    pub fn matches(&self, element: &Element) -> bool {
        self.clauses.iter().all(|c| c.matches(element))
    }

    /// First matching element in snapshot order.
    pub fn first_match<'a>(&self, elements: &'a [Element]) -> Option<&'a Element> {
        elements.iter().find(|e| self.matches(e))
    }

    /// All matching elements in snapshot order.
    pub fn all_matches<'a>(&self, elements: &'a [Element]) -> Vec<&'a Element> {
        elements.iter().filter(|e| self.matches(e)).collect()
    }

    /// The original selector text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Split into clause tokens, honoring quotes inside values.
fn tokenize(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Split a clause token at the first `=` or `~`.
fn split_clause(token: &str) -> Option<(&str, SelectorOp, String)> {
    let idx = token.find(['=', '~'])?;
    let (field, rest) = token.split_at(idx);
    let op = match rest.as_bytes()[0] {
        b'=' => SelectorOp::Exact,
        _ => SelectorOp::Contains,
    };
    Some((field, op, rest[1..].to_string()))
}
