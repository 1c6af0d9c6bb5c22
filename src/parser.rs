//! Parser registry: turns raw object bytes into [`Record`](crate::model::Record)s.
//!
//! A tagged `enum LogParser` rather than a string-keyed plugin registry —
//! callers select a parser by log-type string only at the registry lookup
//! boundary, and an unknown type there is the one place that raises
//! [`IngestError::Configuration`]. Inside a parser, dispatch is a plain match.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::ingest_error::IngestError;
use crate::model::{FieldType, FieldValue, Record};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value for field {field}: {message}")]
    InvalidValue { field: String, message: String },
    #[error("value did not match any configured timestamp format: {0}")]
    UnrecognizedTimestamp(String),
}

/// Pipe-delimited (or any single-byte-delimiter) positional parser, the
/// firewall-log shape: fixed field order, an ordered list of timestamp
/// formats tried in turn, IP and enum-membership validation.
#[derive(Debug, Clone)]
pub struct DelimitedConfig {
    pub delimiter: char,
    /// Positional index -> canonical field name.
    pub field_order: Vec<String>,
    pub timestamp_field: String,
    /// `time` crate format descriptions, tried in order; first match wins.
    pub timestamp_formats: Vec<String>,
    pub ip_fields: Vec<String>,
    pub action_field: Option<String>,
    pub allowed_actions: Vec<String>,
    pub required_fields: Vec<String>,
}

/// Schema-driven JSON parser: optional field pruning/rewriting per a
/// declared schema, required-field and type-tag enforcement.
#[derive(Debug, Clone)]
pub struct JsonConfig {
    pub schema: Option<HashMap<String, FieldType>>,
    pub required_fields: Vec<String>,
    pub timestamp_field: String,
}

#[derive(Debug, Clone)]
pub enum LogParser {
    Delimited(DelimitedConfig),
    Json(JsonConfig),
}

fn parse_timestamp(value: &str, formats: &[String]) -> Result<String, ParseError> {
    for fmt in formats {
        let Ok(descriptor) = time::format_description::parse(fmt) else { continue };
        if let Ok(parsed) = time::PrimitiveDateTime::parse(value, &descriptor) {
            let utc = parsed.assume_utc();
            if let Ok(formatted) = utc.format(&time::format_description::well_known::Rfc3339) {
                return Ok(formatted);
            }
        }
    }
    Err(ParseError::UnrecognizedTimestamp(value.to_string()))
}

fn parse_delimited(bytes: &[u8], config: &DelimitedConfig) -> Result<Vec<Record>, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let mut records = Vec::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.split(config.delimiter).collect();
        let mut fields = HashMap::new();

        for (idx, name) in config.field_order.iter().enumerate() {
            let Some(raw) = parts.get(idx) else { continue };
            fields.insert(name.clone(), FieldValue::String((*raw).to_string()));
        }

        let timestamp_raw = fields
            .get(&config.timestamp_field)
            .map(|v| match v {
                FieldValue::String(s) => s.clone(),
                _ => String::new(),
            })
            .ok_or_else(|| ParseError::MissingField(config.timestamp_field.clone()))?;
        let timestamp = parse_timestamp(&timestamp_raw, &config.timestamp_formats)?;

        for ip_field in &config.ip_fields {
            if let Some(FieldValue::String(raw)) = fields.get(ip_field) {
                IpAddr::from_str(raw).map_err(|_| ParseError::InvalidValue {
                    field: ip_field.clone(),
                    message: format!("'{raw}' is not a valid IPv4 or IPv6 address"),
                })?;
            }
        }

        if let Some(action_field) = &config.action_field {
            if let Some(FieldValue::String(action)) = fields.get(action_field) {
                if !config.allowed_actions.iter().any(|a| a == action) {
                    return Err(ParseError::InvalidValue {
                        field: action_field.clone(),
                        message: format!("'{action}' is not one of the allowed actions"),
                    });
                }
            }
        }

        for required in &config.required_fields {
            if !fields.contains_key(required) {
                return Err(ParseError::MissingField(required.clone()));
            }
        }

        records.push(Record { timestamp, fields, injected_timestamp: false });
    }

    Ok(records)
}

fn coerce(value: &serde_json::Value, field_type: FieldType, field: &str) -> Result<FieldValue, ParseError> {
    let invalid = || ParseError::InvalidValue { field: field.to_string(), message: format!("expected {field_type:?}") };
    match field_type {
        FieldType::DateTime | FieldType::String => {
            Ok(FieldValue::String(value.as_str().ok_or_else(invalid)?.to_string()))
        }
        FieldType::Int => Ok(FieldValue::Int(value.as_i64().ok_or_else(invalid)? as i32)),
        FieldType::Long => Ok(FieldValue::Long(value.as_i64().ok_or_else(invalid)?)),
        FieldType::Bool => Ok(FieldValue::Bool(value.as_bool().ok_or_else(invalid)?)),
        FieldType::Float => Ok(FieldValue::Float(value.as_f64().ok_or_else(invalid)?)),
    }
}

fn json_value_to_field(value: &serde_json::Value) -> FieldValue {
    match value {
        serde_json::Value::String(s) => FieldValue::String(s.clone()),
        serde_json::Value::Bool(b) => FieldValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                FieldValue::Long(i)
            } else {
                FieldValue::Float(n.as_f64().unwrap_or_default())
            }
        }
        other => FieldValue::String(other.to_string()),
    }
}

fn parse_json(bytes: &[u8], config: &JsonConfig) -> Result<Vec<Record>, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;
    let mut records = Vec::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| ParseError::Malformed(e.to_string()))?;
        let object = value.as_object().ok_or_else(|| ParseError::Malformed("top-level value is not an object".into()))?;

        let mut fields = HashMap::new();
        for (key, val) in object {
            if key == &config.timestamp_field {
                continue;
            }
            let coerced = match &config.schema {
                Some(schema) => match schema.get(key) {
                    Some(field_type) => coerce(val, *field_type, key)?,
                    None => continue, // schema prunes unknown fields
                },
                None => json_value_to_field(val),
            };
            fields.insert(key.clone(), coerced);
        }

        for required in &config.required_fields {
            if !fields.contains_key(required) && required != &config.timestamp_field {
                return Err(ParseError::MissingField(required.clone()));
            }
        }

        let timestamp = object
            .get(&config.timestamp_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ParseError::MissingField(config.timestamp_field.clone()))?
            .to_string();

        records.push(Record { timestamp, fields, injected_timestamp: false });
    }

    Ok(records)
}

impl LogParser {
    pub fn parse(&self, bytes: &[u8]) -> Result<Vec<Record>, ParseError> {
        match self {
            LogParser::Delimited(config) => parse_delimited(bytes, config),
            LogParser::Json(config) => parse_json(bytes, config),
        }
    }

    pub fn validate(&self, record: &Record) -> bool {
        match self {
            LogParser::Delimited(config) => {
                config.required_fields.iter().all(|f| record.fields.contains_key(f)) && !record.timestamp.is_empty()
            }
            LogParser::Json(config) => {
                config
                    .required_fields
                    .iter()
                    .all(|f| f == &config.timestamp_field || record.fields.contains_key(f))
                    && !record.timestamp.is_empty()
            }
        }
    }
}

/// Resolves a log-type string to a configured [`LogParser`]. Unknown types
/// are a configuration error, raised at the lookup boundary rather than
/// deep inside parsing.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, LogParser>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, log_type: impl Into<String>, parser: LogParser) {
        self.parsers.insert(log_type.into(), parser);
    }

    pub fn get(&self, log_type: &str) -> Result<&LogParser, IngestError> {
        self.parsers
            .get(log_type)
            .ok_or_else(|| IngestError::Configuration { message: format!("unsupported log type: {log_type}") })
    }
}
