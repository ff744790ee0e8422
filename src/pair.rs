//! Configuration pairs and the default pair loaded at startup

use crate::error::PlaygroundError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A gateway process config plus the API definition it serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationPair {
    /// Gateway process config (JSON text)
    pub conf: String,
    /// API definition (JSON text)
    pub def: String,
}

impl ConfigurationPair {
    pub fn new(conf: impl Into<String>, def: impl Into<String>) -> Self {
        Self {
            conf: conf.into(),
            def: def.into(),
        }
    }

    /// Check both halves are well-formed JSON. Nothing beyond syntax is checked.
    pub fn validate(&self) -> Result<(), PlaygroundError> {
        if serde_json::from_str::<serde::de::IgnoredAny>(&self.conf).is_err() {
            return Err(PlaygroundError::InvalidInput(
                "the gateway config is not valid JSON".to_string(),
            ));
        }
        if serde_json::from_str::<serde::de::IgnoredAny>(&self.def).is_err() {
            return Err(PlaygroundError::InvalidInput(
                "the API definition is not valid JSON".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode a submitted pair from a request body.
    ///
    /// JSON bodies (`{"conf": ..., "def": ...}`) are accepted when the content
    /// type says so, everything else is treated as an urlencoded form with
    /// `conf` and `def` fields. Missing fields decode as empty strings and are
    /// rejected by [`validate`](Self::validate).
    pub fn from_body(content_type: Option<&str>, body: &[u8]) -> Result<Self, PlaygroundError> {
        let is_json = content_type
            .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
            .unwrap_or(false);

        if is_json {
            return serde_json::from_slice(body).map_err(|e| {
                PlaygroundError::InvalidInput(format!("invalid request body: {}", e))
            });
        }

        let body = std::str::from_utf8(body)
            .map_err(|_| PlaygroundError::InvalidInput("request body is not UTF-8".to_string()))?;

        let mut conf = None;
        let mut def = None;
        for (key, value) in parse_form(body)? {
            match key.as_str() {
                "conf" if conf.is_none() => conf = Some(value),
                "def" if def.is_none() => def = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            conf: conf.unwrap_or_default(),
            def: def.unwrap_or_default(),
        })
    }
}

/// Parse an `application/x-www-form-urlencoded` body
fn parse_form(body: &str) -> Result<Vec<(String, String)>, PlaygroundError> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode_form_component(key)?, decode_form_component(value)?))
        })
        .collect()
}

fn decode_form_component(raw: &str) -> Result<String, PlaygroundError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| PlaygroundError::InvalidInput("malformed form encoding".to_string()))
}

/// The pair served when nothing else was submitted. Read once, never mutated.
#[derive(Debug, Clone)]
pub struct DefaultPair {
    pair: ConfigurationPair,
}

impl DefaultPair {
    pub fn new(pair: ConfigurationPair) -> Self {
        Self { pair }
    }

    /// Load the default pair from its two files
    pub fn load(conf_path: impl AsRef<Path>, def_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conf_path = conf_path.as_ref();
        let def_path = def_path.as_ref();
        let conf = std::fs::read_to_string(conf_path)
            .with_context(|| format!("Failed to read default config {}", conf_path.display()))?;
        let def = std::fs::read_to_string(def_path)
            .with_context(|| format!("Failed to read default definition {}", def_path.display()))?;

        let pair = ConfigurationPair { conf, def };
        pair.validate().context("Default configuration pair is invalid")?;
        Ok(Self { pair })
    }

    pub fn pair(&self) -> &ConfigurationPair {
        &self.pair
    }

    /// Default gateway process config, used when a share lacks one
    pub fn conf(&self) -> &str {
        &self.pair.conf
    }
}
