//! Gemini-style requests into backend envelopes
//!
//! `POST .../models/{model}:generateContent` (or `:streamGenerateContent`)
//! becomes `POST /v1internal:generateContent` with the original body nested
//! under `request`, next to the project, model, and request id. Everything
//! else is left alone.

use crate::tool_names::{PrefixOutcome, ToolNamePrefixer};
use bytes::Bytes;
use cloudshim_schema::normalize;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

/// Project used when neither configuration nor the stored token names one
pub const DEFAULT_PROJECT_ID: &str = "rising-fact-p41fc";

/// `userAgent` field of the envelope
pub const ENVELOPE_USER_AGENT: &str = "antigravity";

pub const STREAM_GENERATE_PATH: &str = "/v1internal:streamGenerateContent";
pub const GENERATE_PATH: &str = "/v1internal:generateContent";

/// Ceiling for `generationConfig.maxOutputTokens`
pub const MAX_OUTPUT_TOKENS: u64 = 64_000;

pub const DEFAULT_TOP_P: f64 = 0.95;

/// Tier suffix to thinking budget, checked in order
pub const THINKING_TIERS: &[(&str, u32)] = &[
    ("-thinking-low", 8_192),
    ("-thinking-medium", 16_384),
    ("-thinking-high", 32_768),
];

/// Budget for `*-thinking` models named without a tier
pub const DEFAULT_THINKING_BUDGET: u32 = 16_384;

/// Gemini models route these by name and take a level instead of a budget
pub const GEMINI_THINKING_LEVELS: &[&str] = &["low", "medium", "high"];

const UNSUPPORTED_GENERATION_KEYS: &[&str] = &[
    "responseLogprobs",
    "logprobs",
    "presencePenalty",
    "frequencyPenalty",
    "seed",
    "audioTimestamp",
    "responseModalities",
    "speechConfig",
    "mediaResolution",
    "enableEnhancedCivicAnswers",
    "routingConfig",
];

lazy_static! {
    static ref GENERATE_CONTENT_PATH: Regex =
        Regex::new(r"(?:^|/)models/([^/:]+):(generateContent|streamGenerateContent)$").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Thinking {
    Budget(u32),
    Level(&'static str),
}

/// Where a requested model name actually goes
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRoute {
    pub model: String,
    pub thinking: Option<Thinking>,
    /// Extended-thinking models that need the interleaved-thinking beta
    pub reasoning_tier: bool,
}

pub fn resolve_model(requested: &str) -> ModelRoute {
    for (suffix, budget) in THINKING_TIERS {
        if let Some(base) = requested.strip_suffix(suffix) {
            return ModelRoute {
                model: format!("{}-thinking", base),
                thinking: Some(Thinking::Budget(*budget)),
                reasoning_tier: true,
            };
        }
    }

    if requested.ends_with("-thinking") {
        return ModelRoute {
            model: requested.to_string(),
            thinking: Some(Thinking::Budget(DEFAULT_THINKING_BUDGET)),
            reasoning_tier: true,
        };
    }

    if requested.starts_with("gemini-") {
        let level = GEMINI_THINKING_LEVELS.iter().find(|level| {
            requested
                .strip_suffix(*level)
                .is_some_and(|rest| rest.ends_with('-'))
        });
        if let Some(&level) = level {
            return ModelRoute {
                model: requested.to_string(),
                thinking: Some(Thinking::Level(level)),
                reasoning_tier: false,
            };
        }
    }

    ModelRoute {
        model: requested.to_string(),
        thinking: None,
        reasoning_tier: false,
    }
}

/// Model name and streaming flag of a generate path, if it is one
pub fn match_generate_path(path: &str) -> Option<(String, bool)> {
    let captures = GENERATE_CONTENT_PATH.captures(path)?;
    let model = captures.get(1)?.as_str().to_string();
    let stream = captures.get(2)?.as_str() == "streamGenerateContent";
    Some((model, stream))
}

/// Body of a wrapped request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedPayload {
    pub project: String,
    pub model: String,
    pub request: Value,
    pub request_id: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    /// Send the request exactly as the caller built it
    Passthrough,
    Wrapped {
        body: Bytes,
        path: String,
        query: Vec<(String, String)>,
        model: String,
        stream: bool,
        reasoning_tier: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RequestRewriter {
    prefixer: ToolNamePrefixer,
}

impl RequestRewriter {
    pub fn new(prefixer: ToolNamePrefixer) -> Self {
        Self { prefixer }
    }

    pub fn prefixer(&self) -> &ToolNamePrefixer {
        &self.prefixer
    }

    /// Rewrite a request body for the backend. Bodies that cannot be
    /// rewritten are passed through and logged, never rejected.
    pub fn wrap(&self, body: &[u8], path: &str, project: &str, request_id: &str) -> Rewrite {
        let Some((requested_model, stream)) = match_generate_path(path) else {
            return Rewrite::Passthrough;
        };

        let mut request = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(request)) => request,
            Ok(_) => {
                warn!(path, "request body is not a JSON object, sending unchanged");
                return Rewrite::Passthrough;
            }
            Err(e) => {
                warn!(path, error = %e, "request body is not valid JSON, sending unchanged");
                return Rewrite::Passthrough;
            }
        };

        let route = resolve_model(&requested_model);

        strip_system_role(&mut request);
        normalize_tool_schemas(&mut request);
        apply_generation_config(&mut request, route.thinking.as_ref());

        let mut request = Value::Object(request);
        if self.prefixer.prefix_request(&mut request) == PrefixOutcome::Rewritten {
            debug!(prefix = self.prefixer.prefix(), "prefixed tool names");
        }

        let payload = WrappedPayload {
            project: project.to_string(),
            model: route.model.clone(),
            request,
            request_id: request_id.to_string(),
            user_agent: ENVELOPE_USER_AGENT.to_string(),
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(path, error = %e, "failed to serialize wrapped request, sending unchanged");
                return Rewrite::Passthrough;
            }
        };

        let (path, query) = if stream {
            (
                STREAM_GENERATE_PATH,
                vec![("alt".to_string(), "sse".to_string())],
            )
        } else {
            (GENERATE_PATH, Vec::new())
        };

        debug!(
            requested = %requested_model,
            model = %route.model,
            stream,
            "wrapped generate request"
        );

        Rewrite::Wrapped {
            body: Bytes::from(body),
            path: path.to_string(),
            query,
            model: route.model,
            stream,
            reasoning_tier: route.reasoning_tier,
        }
    }
}

fn strip_system_role(request: &mut Map<String, Value>) {
    if let Some(Value::Object(system)) = request.get_mut("systemInstruction") {
        system.remove("role");
    }
}

fn normalize_tool_schemas(request: &mut Map<String, Value>) {
    let declarations = request
        .get_mut("tools")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(|tool| tool.get_mut("functionDeclarations"))
        .filter_map(Value::as_array_mut)
        .flatten()
        .filter_map(Value::as_object_mut);

    for declaration in declarations {
        if let Some(schema) = declaration.remove("parametersJsonSchema") {
            declaration.insert("parameters".to_string(), schema);
        }
        if let Some(schema) = declaration.get_mut("parameters") {
            *schema = normalize(schema, true);
        }
    }
}

fn apply_generation_config(request: &mut Map<String, Value>, thinking: Option<&Thinking>) {
    let config = request
        .entry("generationConfig")
        .or_insert_with(|| Value::Object(Map::new()));
    if !config.is_object() {
        *config = Value::Object(Map::new());
    }
    let Some(config) = config.as_object_mut() else {
        return;
    };

    for key in UNSUPPORTED_GENERATION_KEYS {
        config.remove(*key);
    }

    match thinking {
        Some(Thinking::Budget(budget)) => {
            config.insert(
                "thinkingConfig".to_string(),
                json!({ "includeThoughts": true, "thinkingBudget": budget }),
            );
        }
        Some(Thinking::Level(level)) => {
            config.insert(
                "thinkingConfig".to_string(),
                json!({ "includeThoughts": true, "thinkingLevel": level }),
            );
        }
        None => {}
    }

    let budget = config
        .get("thinkingConfig")
        .and_then(|thinking| thinking.get("thinkingBudget"))
        .and_then(Value::as_u64);
    let max_tokens = match config.get("maxOutputTokens").and_then(Value::as_u64) {
        // the budget must fit inside the output allowance
        Some(max) if budget.is_some_and(|budget| max <= budget) => Some(MAX_OUTPUT_TOKENS),
        Some(max) => Some(max.min(MAX_OUTPUT_TOKENS)),
        None if budget.is_some() => Some(MAX_OUTPUT_TOKENS),
        None => None,
    };
    if let Some(max) = max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(max));
    }

    if !config.contains_key("topP") {
        config.insert("topP".to_string(), json!(DEFAULT_TOP_P));
    }
}
