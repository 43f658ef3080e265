//! Single-pass template parser with caching
//!
//! The substitution language is data, not code: `{{name}}` and
//! `{{name||default}}` only. Templates are tokenized once into
//! [`Token`]s, cached, and evaluated against a plain JSON mapping.
//!
//! - A string that is exactly one reference resolves to the referenced JSON
//!   value (type preserved).
//! - Anything else is string interpolation.
//! - A reference with no value (absent or null) and no default is an error,
//!   never an empty string.

use std::ops::Range;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::TemplateError;

/// Identifier accepted as a reference name (and as input/output key)
pub static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid name regex"));

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const DEFAULT_SEP: &str = "||";

/// Token representing a parsed template fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Literal text (range in the original string)
    Literal(Range<usize>),
    /// `{{name}}` or `{{name||default}}`
    Reference {
        name: String,
        default: Option<String>,
    },
}

/// A reference found in a template (for static validation)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub default: Option<String>,
}

/// Cached templates kept at most; manifests are untrusted, so the cache is bounded
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Template parser with a bounded parse cache
pub struct TemplateResolver {
    cache: DashMap<String, Arc<[Token]>>,
    capacity: usize,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateResolver {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Parse a template into tokens (cached on success)
    pub fn tokenize(&self, template: &str) -> Result<Arc<[Token]>, TemplateError> {
        if let Some(cached) = self.cache.get(template) {
            return Ok(Arc::clone(&cached));
        }

        let tokens: Arc<[Token]> = parse(template)?.into();
        // Full: start over rather than track recency
        if self.cache.len() >= self.capacity {
            self.cache.clear();
        }
        self.cache.insert(template.to_string(), Arc::clone(&tokens));
        Ok(tokens)
    }

    /// Resolve a string template against a scope
    pub fn resolve_str(
        &self,
        template: &str,
        scope: &Map<String, Value>,
    ) -> Result<Value, TemplateError> {
        if !template.contains(OPEN) {
            return Ok(Value::String(template.to_string()));
        }

        let tokens = self.tokenize(template)?;

        // Whole-string reference keeps the JSON type
        if let [Token::Reference { name, default }] = &tokens[..] {
            return lookup(name, default.as_deref(), scope);
        }

        let mut result = String::with_capacity(template.len() + 64);
        for token in tokens.iter() {
            match token {
                Token::Literal(range) => result.push_str(&template[range.clone()]),
                Token::Reference { name, default } => {
                    match lookup(name, default.as_deref(), scope)? {
                        Value::String(s) => result.push_str(&s),
                        other => result.push_str(&other.to_string()),
                    }
                }
            }
        }

        Ok(Value::String(result))
    }

    /// Resolve every string inside a JSON value (arrays/objects recursively)
    pub fn resolve_value(
        &self,
        value: &Value,
        scope: &Map<String, Value>,
    ) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => self.resolve_str(s, scope),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => self.resolve_args(map, scope).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve a step's argument map
    pub fn resolve_args(
        &self,
        args: &Map<String, Value>,
        scope: &Map<String, Value>,
    ) -> Result<Map<String, Value>, TemplateError> {
        args.iter()
            .map(|(k, v)| -> Result<(String, Value), TemplateError> {
                Ok((k.clone(), self.resolve_value(v, scope)?))
            })
            .collect()
    }

    /// Collect every reference in a JSON value (for static validation)
    pub fn extract_refs(&self, value: &Value) -> Result<Vec<Reference>, TemplateError> {
        let mut refs = Vec::new();
        self.collect_refs(value, &mut refs)?;
        Ok(refs)
    }

    fn collect_refs(&self, value: &Value, refs: &mut Vec<Reference>) -> Result<(), TemplateError> {
        match value {
            Value::String(s) if s.contains(OPEN) => {
                for token in self.tokenize(s)?.iter() {
                    if let Token::Reference { name, default } = token {
                        refs.push(Reference {
                            name: name.clone(),
                            default: default.clone(),
                        });
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.collect_refs(item, refs)?;
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    self.collect_refs(item, refs)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn lookup(name: &str, default: Option<&str>, scope: &Map<String, Value>) -> Result<Value, TemplateError> {
    match scope.get(name) {
        Some(Value::Null) | None => default
            .map(|d| Value::String(d.to_string()))
            .ok_or_else(|| TemplateError::Unresolved {
                name: name.to_string(),
            }),
        Some(value) => Ok(value.clone()),
    }
}

/// Parse a template without touching the cache
pub fn parse(template: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = template[cursor..].find(OPEN) {
        let open = cursor + rel;
        if open > cursor {
            tokens.push(Token::Literal(cursor..open));
        }

        let body_start = open + OPEN.len();
        let close = template[body_start..]
            .find(CLOSE)
            .map(|i| body_start + i)
            .ok_or_else(|| TemplateError::Parse {
                position: open,
                details: "unclosed '{{'".to_string(),
            })?;

        let body = &template[body_start..close];
        if body.contains(OPEN) {
            return Err(TemplateError::Parse {
                position: open,
                details: "nested '{{' is not supported".to_string(),
            });
        }

        let (name, default) = match body.split_once(DEFAULT_SEP) {
            Some((name, default)) => (name.trim(), Some(default.trim().to_string())),
            None => (body.trim(), None),
        };

        if !NAME_RE.is_match(name) {
            return Err(TemplateError::Parse {
                position: open,
                details: format!("'{}' is not a valid reference name", name),
            });
        }

        tokens.push(Token::Reference {
            name: name.to_string(),
            default,
        });
        cursor = close + CLOSE.len();
    }

    if cursor < template.len() {
        tokens.push(Token::Literal(cursor..template.len()));
    }

    Ok(tokens)
}

/// Global template resolver instance
pub static TEMPLATE_RESOLVER: Lazy<TemplateResolver> = Lazy::new(TemplateResolver::new);
