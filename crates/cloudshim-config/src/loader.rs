use crate::schema::ShimConfig;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Jsonc,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;

        match ext {
            "jsonc" => Some(Self::Jsonc),
            "json" => Some(Self::Json),
            "yml" | "yaml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: ShimConfig,
    pub path: Option<PathBuf>,
    pub format: Option<ConfigFormat>,
}

/// Explicit path, else the first discovered file, else built-in defaults.
pub fn load_config(config_path: Option<&Path>) -> Result<ShimConfig> {
    resolve_config(config_path).map(|r| r.config)
}

pub fn resolve_config(config_path: Option<&Path>) -> Result<ResolvedConfig> {
    if let Some(path) = config_path {
        return load_config_from_file(path);
    }

    match find_config_file() {
        Some(path) => load_config_from_file(&path),
        None => Ok(ResolvedConfig {
            config: ShimConfig::default(),
            path: None,
            format: None,
        }),
    }
}

pub fn load_config_from_file(path: &Path) -> Result<ResolvedConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let format = ConfigFormat::from_path(path)
        .ok_or_else(|| anyhow!("Unknown config format for: {}", path.display()))?;

    let config = parse_config_content(&content, format)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(ResolvedConfig {
        config: expand_env_vars(config),
        path: Some(path.to_path_buf()),
        format: Some(format),
    })
}

fn parse_config_content(content: &str, format: ConfigFormat) -> Result<ShimConfig> {
    match format {
        ConfigFormat::Jsonc => json5::from_str(content).context("Failed to parse JSONC"),
        ConfigFormat::Json => serde_json::from_str(content).context("Failed to parse JSON"),
        ConfigFormat::Yaml => serde_yaml_ng::from_str(content).context("Failed to parse YAML"),
    }
}

const CONFIG_CANDIDATES: &[&str] = &[
    "cloudshim.jsonc",
    "cloudshim.json",
    "cloudshim.yml",
    "cloudshim.yaml",
    ".cloudshim.jsonc",
    ".cloudshim.json",
    ".cloudshim.yml",
    ".cloudshim.yaml",
];

pub fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_CANDIDATES.iter().map(PathBuf::from);
    let global = env::var("HOME").ok().into_iter().flat_map(|home| {
        CONFIG_CANDIDATES.iter().map(move |candidate| {
            PathBuf::from(&home)
                .join(".config")
                .join("cloudshim")
                .join(candidate)
        })
    });

    local.chain(global).find(|path| path.exists())
}

fn expand_env_vars(mut config: ShimConfig) -> ShimConfig {
    let transport = &mut config.transport;
    transport.endpoints = transport
        .endpoints
        .iter()
        .map(|endpoint| expand_env_string(endpoint))
        .collect();
    transport.project_id = transport.project_id.as_deref().map(expand_env_string);
    transport.proxy = transport.proxy.as_deref().map(expand_env_string);

    let oauth = &mut config.oauth;
    oauth.client_id = expand_env_string(&oauth.client_id);
    oauth.client_secret = expand_env_string(&oauth.client_secret);
    oauth.token_url = oauth.token_url.as_deref().map(expand_env_string);
    oauth.token_path = oauth
        .token_path
        .as_ref()
        .map(|path| PathBuf::from(expand_env_string(&path.to_string_lossy())));

    config
}

fn expand_env_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            match env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
            continue;
        }

        // peek so the delimiter after $VAR is kept
        let mut var_name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                var_name.push(c);
                chars.next();
            } else {
                break;
            }
        }

        if var_name.is_empty() {
            result.push('$');
        } else if let Ok(value) = env::var(&var_name) {
            result.push_str(&value);
        } else {
            result.push('$');
            result.push_str(&var_name);
        }
    }

    result
}
