//! Cloudshim - probe CLI for the cloud code transport

use anyhow::{Context, Result};
use clap::Parser;
use cloudshim_auth::{
    token_age_seconds, CredentialManager, CredentialStore, FileTokenStore, GoogleOAuthRefresher,
    TokenState,
};
use cloudshim_config::{resolve_config, ShimConfig};
use cloudshim_telemetry::init_subscriber;
use cloudshim_transport::{CloudTransport, HttpResponse, HttpTransport, OutgoingRequest};
use colored::Colorize;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod commands;

use commands::{Cli, Commands};

/// Base URL the SDK would target; only the path matters once rewritten.
const SDK_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let resolved = resolve_config(cli.config.as_deref())?;
    let mut telemetry = resolved.config.telemetry.clone();
    telemetry.json_output |= cli.json_logs;
    if let Err(e) = init_subscriber(&telemetry) {
        eprintln!("{}: {}", "Warning".yellow().bold(), e);
    }
    if let Some(path) = &resolved.path {
        tracing::debug!(path = %path.display(), "loaded config");
    }

    match &cli.command {
        Commands::Send {
            model,
            stream,
            file,
        } => run_send(&resolved.config, model, *stream, file).await,
        Commands::Token => run_token(&resolved.config).await,
    }
}

async fn run_send(config: &ShimConfig, model: &str, stream: bool, file: &Path) -> Result<()> {
    let body = read_request_body(file)?;
    let (_, credentials) = credential_manager(config)?;
    let transport = CloudTransport::from_settings(&config.transport, Some(credentials))
        .context("Failed to build transport")?;

    let action = if stream {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    let request = OutgoingRequest::post_json(
        SDK_BASE_URL,
        format!("/v1beta/models/{}:{}", model, action),
        &body,
    )?;

    let response = transport.send(request).await?;
    let status = response.status();
    let status_text = if status.is_success() {
        status.to_string().green()
    } else {
        status.to_string().red()
    };
    eprintln!("{} {}", "Status:".cyan().bold(), status_text);

    print_body(response).await?;

    if !status.is_success() {
        anyhow::bail!("backend answered {}", status);
    }
    Ok(())
}

async fn print_body(response: HttpResponse) -> Result<()> {
    if response.is_streaming() {
        let mut stream = response.into_stream();
        let mut stdout = std::io::stdout();
        while let Some(chunk) = stream.next().await {
            stdout.write_all(&chunk?)?;
            stdout.flush()?;
        }
        return Ok(());
    }

    let mut response = response;
    let text = response.text().await?;
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}

async fn run_token(config: &ShimConfig) -> Result<()> {
    let (path, manager) = credential_manager(config)?;
    println!("{}: {}", "Token file".cyan(), path.display());

    let Some(state) = manager.stored_state().await else {
        println!("{}", "No stored token".yellow());
        return Ok(());
    };

    print_token_state(&state);

    let mut headers = HeaderMap::new();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", state.access_token()))
        .context("Stored token is not a valid header value")?;
    headers.insert(AUTHORIZATION, bearer);
    let refresh = if manager.should_refresh(&headers).await {
        "yes".yellow()
    } else {
        "no".green()
    };
    println!("{}: {}", "Refresh needed".cyan(), refresh);
    Ok(())
}

fn print_token_state(state: &TokenState) {
    let now = chrono::Utc::now().timestamp();
    let expiry = match state.expires_at {
        Some(expires_at) => {
            let at = chrono::DateTime::from_timestamp(expires_at, 0)
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| expires_at.to_string());
            if expires_at > now {
                format!("{} (in {}s)", at, expires_at - now).normal()
            } else {
                format!("{} (expired)", at).red()
            }
        }
        None => "unknown".dimmed(),
    };
    println!("{}: {}", "Expires".cyan(), expiry);

    let age = match token_age_seconds(state.access_token()) {
        Some(age) => format!("{:.0}s", age).normal(),
        None => "unknown (opaque token)".dimmed(),
    };
    println!("{}: {}", "Token age".cyan(), age);

    let refresh_token = if state.refresh_token.is_some() {
        "present".green()
    } else {
        "missing".red()
    };
    println!("{}: {}", "Refresh token".cyan(), refresh_token);

    if let Some(email) = &state.email {
        println!("{}: {}", "Account".cyan(), email);
    }
    if let Some(project_id) = &state.project_id {
        println!("{}: {}", "Project".cyan(), project_id);
    }
}

fn credential_manager(config: &ShimConfig) -> Result<(PathBuf, Arc<CredentialManager>)> {
    let path = match &config.oauth.token_path {
        Some(path) => path.clone(),
        None => FileTokenStore::default_path()?,
    };
    let store: Arc<dyn CredentialStore> = Arc::new(FileTokenStore::new(&path));

    let mut refresher =
        GoogleOAuthRefresher::new(&config.oauth.client_id, &config.oauth.client_secret);
    if let Some(token_url) = &config.oauth.token_url {
        refresher = refresher.with_token_url(token_url);
    }

    let manager = CredentialManager::new(store, Arc::new(refresher));
    Ok((path, Arc::new(manager)))
}

fn read_request_body(file: &Path) -> Result<Value> {
    let content = if file == Path::new("-") {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("Failed to read request body from stdin")?;
        content
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read request body: {}", file.display()))?
    };

    serde_json::from_str(&content)
        .with_context(|| format!("Request body is not valid JSON: {}", file.display()))
}
