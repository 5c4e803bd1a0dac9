//! Tool name disambiguation
//!
//! Tool names are prefixed on the way out so they cannot collide with the
//! backend's built-in tools, and restored on the way back in. Restoration is
//! a text substitution so it also works on partial stream lines that would
//! not parse as JSON.

use crate::error::{Result, TransportError};
use lazy_static::lazy_static;
use regex::bytes::Regex;
use serde_json::Value;
use std::borrow::Cow;

pub const DEFAULT_TOOL_PREFIX: &str = "mcp_";

lazy_static! {
    static ref DEFAULT_INBOUND: Regex = Regex::new(&inbound_pattern(DEFAULT_TOOL_PREFIX)).unwrap();
}

fn inbound_pattern(prefix: &str) -> String {
    format!(r#""name"(\s*):(\s*)"{}"#, regex::escape(prefix))
}

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOutcome {
    Unchanged,
    Rewritten,
}

#[derive(Debug, Clone)]
pub struct ToolNamePrefixer {
    prefix: String,
    inbound: Regex,
}

impl ToolNamePrefixer {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let inbound = Regex::new(&inbound_pattern(&prefix))
            .map_err(|e| TransportError::Configuration(format!("invalid tool prefix: {}", e)))?;
        Ok(Self { prefix, inbound })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix declared tool names and the names in `functionCall` /
    /// `functionResponse` history parts.
    pub fn prefix_request(&self, request: &mut Value) -> PrefixOutcome {
        if self.prefix.is_empty() {
            return PrefixOutcome::Unchanged;
        }

        let mut outcome = PrefixOutcome::Unchanged;

        let declarations = request
            .get_mut("tools")
            .and_then(Value::as_array_mut)
            .into_iter()
            .flatten()
            .filter_map(|tool| tool.get_mut("functionDeclarations"))
            .filter_map(Value::as_array_mut)
            .flatten();
        for declaration in declarations {
            self.prefix_name(declaration, &mut outcome);
        }

        let calls = request
            .get_mut("contents")
            .and_then(Value::as_array_mut)
            .into_iter()
            .flatten()
            .filter_map(|content| content.get_mut("parts"))
            .filter_map(Value::as_array_mut)
            .flatten();
        for part in calls {
            for key in ["functionCall", "functionResponse"] {
                if let Some(call) = part.get_mut(key) {
                    self.prefix_name(call, &mut outcome);
                }
            }
        }

        outcome
    }

    fn prefix_name(&self, holder: &mut Value, outcome: &mut PrefixOutcome) {
        let Some(Value::String(name)) = holder.get_mut("name") else {
            return;
        };
        if name.is_empty() || name.starts_with(&self.prefix) {
            return;
        }
        name.insert_str(0, &self.prefix);
        *outcome = PrefixOutcome::Rewritten;
    }

    /// Strip the prefix from every `"name": "<prefix>..."` in `text`.
    pub fn restore<'a>(&self, text: &'a [u8]) -> Cow<'a, [u8]> {
        if self.prefix.is_empty() {
            return Cow::Borrowed(text);
        }
        self.inbound.replace_all(text, &br#""name"${1}:${2}""#[..])
    }
}

impl Default for ToolNamePrefixer {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_TOOL_PREFIX.to_string(),
            inbound: DEFAULT_INBOUND.clone(),
        }
    }
}
