//! Module filters and their evaluation engine.
//!
//! A filter narrows which calls a module observes: HTTP methods, content
//! type substrings, response status codes and an optional JSON-path
//! predicate. Absent rules match everything. JSON-path predicates are
//! compiled once at registration and evaluated against the already-parsed
//! body value; the raw bytes are only re-parsed when no parsed value is
//! available.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use serde_json_path::JsonPath;
use thiserror::Error;
use tracing::debug;

use crate::module::{RequestRecord, ResponseRecord};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid json query {query:?}: {reason}")]
    InvalidQuery { query: String, reason: String },
}

/// Raw filter rules as they arrive over the control channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub content_types: Vec<String>,
    #[serde(default)]
    pub status_codes: Vec<u16>,
    #[serde(default)]
    pub json_query: Option<String>,
}

/// A compiled filter. Immutable after compilation.
#[derive(Debug)]
pub struct Filter {
    methods: Vec<String>,
    content_types: Vec<String>,
    status_codes: Vec<u16>,
    query: Option<CompiledQuery>,
}

#[derive(Debug)]
struct CompiledQuery {
    source: String,
    path: JsonPath,
}

/// Per-module filter configuration: independent request and response
/// filters, either of which may be absent.
#[derive(Debug, Default)]
pub struct FilterConfig {
    pub request_filter: Option<Filter>,
    pub response_filter: Option<Filter>,
}

impl FilterConfig {
    /// Compile a filter config from registration-time configuration.
    ///
    /// Looks for `request_filter` / `response_filter` objects in the
    /// module config map; JSON-path predicates are compiled here so that
    /// registration fails fast on malformed queries.
    pub fn from_module_config(
        config: &serde_json::Map<String, Value>,
    ) -> Result<Self, FilterError> {
        let parse = |key: &str| -> Result<Option<Filter>, FilterError> {
            match config.get(key) {
                Some(raw) => {
                    let spec: FilterSpec =
                        serde_json::from_value(raw.clone()).unwrap_or_default();
                    Ok(Some(Filter::compile(spec)?))
                }
                None => Ok(None),
            }
        };

        Ok(Self {
            request_filter: parse("request_filter")?,
            response_filter: parse("response_filter")?,
        })
    }
}

impl Filter {
    /// Compile a filter spec, parsing its JSON-path predicate if present.
    pub fn compile(spec: FilterSpec) -> Result<Self, FilterError> {
        let query = match spec.json_query {
            Some(source) if !source.is_empty() => {
                let path =
                    JsonPath::parse(&source).map_err(|e| FilterError::InvalidQuery {
                        query: source.clone(),
                        reason: e.to_string(),
                    })?;
                Some(CompiledQuery { source, path })
            }
            _ => None,
        };

        Ok(Self {
            methods: spec.methods,
            content_types: spec.content_types,
            status_codes: spec.status_codes,
            query,
        })
    }

    /// Evaluate the filter against a request record.
    pub fn matches_request(&self, record: &RequestRecord) -> bool {
        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(record.method.as_str()))
        {
            return false;
        }

        if !self.matches_content_type(&record.content_type) {
            return false;
        }

        if self.query.is_some() && record.content_type.contains("json") {
            return self.evaluate_query(record.body.as_ref(), &record.body_bytes);
        }

        true
    }

    /// Evaluate the filter against a response record.
    pub fn matches_response(&self, record: &ResponseRecord) -> bool {
        if !self.status_codes.is_empty()
            && !self.status_codes.contains(&record.status.as_u16())
        {
            return false;
        }

        if !self.matches_content_type(&record.content_type) {
            return false;
        }

        if self.query.is_some() && record.content_type.contains("json") {
            return self.evaluate_query(record.body.as_ref(), &record.body_bytes);
        }

        true
    }

    fn matches_content_type(&self, content_type: &str) -> bool {
        self.content_types.is_empty()
            || self
                .content_types
                .iter()
                .any(|ct| content_type.contains(ct.as_str()))
    }

    /// Run the compiled query; the filter matches iff it yields any truthy
    /// node (non-null, non-false).
    fn evaluate_query(&self, parsed: Option<&Value>, raw: &Bytes) -> bool {
        let Some(query) = &self.query else {
            return true;
        };

        let reparsed;
        let value = match parsed {
            Some(v) => v,
            None => match serde_json::from_slice::<Value>(raw) {
                Ok(v) => {
                    reparsed = v;
                    &reparsed
                }
                Err(err) => {
                    debug!(query = %query.source, error = %err, "body not parseable for json query");
                    return false;
                }
            },
        };

        query
            .path
            .query(value)
            .all()
            .into_iter()
            .any(|node| !matches!(node, Value::Null | Value::Bool(false)))
    }
}
