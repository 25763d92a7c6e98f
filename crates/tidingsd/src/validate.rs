//! Content validators
//!
//! Validators are configured by name and run on every publish before the
//! message reaches a topic actor. The set of implementations is closed:
//!
//! - `payload_limit`: `{ max_bytes }`
//! - `deny_list`: `{ words: [...], case_insensitive: true }`

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// What a validator sees
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    pub principal: &'a str,
    pub topic: &'a str,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&mut self, config: &serde_json::Value) -> Result<()>;

    fn evaluate(&self, input: &ValidationInput<'_>) -> Verdict;
}

fn parse<T: for<'de> Deserialize<'de> + Default>(name: &str, value: &serde_json::Value) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| Error::Config(format!("validator {}: {}", name, e)))
}

/// Rejects payloads above a size
#[derive(Debug, Default)]
pub struct PayloadLimit {
    max_bytes: usize,
}

#[derive(Deserialize, Default)]
struct PayloadLimitConfig {
    max_bytes: usize,
}

impl Validator for PayloadLimit {
    fn name(&self) -> &'static str {
        "payload_limit"
    }

    fn initialize(&mut self, config: &serde_json::Value) -> Result<()> {
        let config: PayloadLimitConfig = parse(self.name(), config)?;
        if config.max_bytes == 0 {
            return Err(Error::Config("validator payload_limit: max_bytes must be positive".into()));
        }
        self.max_bytes = config.max_bytes;
        Ok(())
    }

    fn evaluate(&self, input: &ValidationInput<'_>) -> Verdict {
        if input.payload.len() > self.max_bytes {
            Verdict::Reject(format!(
                "payload of {} bytes exceeds {}",
                input.payload.len(),
                self.max_bytes
            ))
        } else {
            Verdict::Accept
        }
    }
}

/// Rejects payloads containing listed words
#[derive(Debug, Default)]
pub struct DenyList {
    words: Vec<String>,
    case_insensitive: bool,
}

#[derive(Deserialize)]
#[serde(default)]
struct DenyListConfig {
    words: Vec<String>,
    case_insensitive: bool,
}

impl Default for DenyListConfig {
    fn default() -> Self {
        Self {
            words: Vec::new(),
            case_insensitive: true,
        }
    }
}

impl Validator for DenyList {
    fn name(&self) -> &'static str {
        "deny_list"
    }

    fn initialize(&mut self, config: &serde_json::Value) -> Result<()> {
        let config: DenyListConfig = parse(self.name(), config)?;
        let fold = config.case_insensitive;
        self.case_insensitive = fold;
        self.words = config
            .words
            .into_iter()
            .filter(|w| !w.is_empty())
            .map(|w| if fold { w.to_lowercase() } else { w })
            .collect();
        Ok(())
    }

    fn evaluate(&self, input: &ValidationInput<'_>) -> Verdict {
        let text = String::from_utf8_lossy(input.payload);
        let text = if self.case_insensitive {
            text.to_lowercase()
        } else {
            text.into_owned()
        };
        match self.words.iter().find(|w| text.contains(w.as_str())) {
            Some(word) => Verdict::Reject(format!("contains denied word '{}'", word)),
            None => Verdict::Accept,
        }
    }
}

/// Configured validators, evaluated in name order
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidatorRegistry {
    pub fn from_config(config: &BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let mut validators = Vec::with_capacity(config.len());
        for (name, settings) in config {
            let mut validator: Box<dyn Validator> = match name.as_str() {
                "payload_limit" => Box::new(PayloadLimit::default()),
                "deny_list" => Box::new(DenyList::default()),
                other => return Err(Error::Config(format!("unknown validator '{}'", other))),
            };
            validator.initialize(settings)?;
            validators.push(validator);
        }
        Ok(Self { validators })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// First rejection wins
    pub fn check(&self, input: &ValidationInput<'_>) -> Result<()> {
        for validator in &self.validators {
            if let Verdict::Reject(reason) = validator.evaluate(input) {
                return Err(Error::Validation(format!("{}: {}", validator.name(), reason)));
            }
        }
        Ok(())
    }
}
