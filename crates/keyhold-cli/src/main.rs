//! CLI entry point for keyhold.
//!
//! This binary provides the `keyhold` command: sign in, inspect and verify
//! the stored credential, and run commands with short-lived proxy values in
//! place of real secrets.

mod cli;
mod config;
mod helpers;

use std::collections::HashMap;
use std::process::{ExitCode, ExitStatus};

use anyhow::{Context, Result, bail};
use chrono::DateTime;
use clap::Parser;
use keyhold_auth::FlowVariant;
use keyhold_session::SecretBroker;
use keyhold_transport::AuthMode;
use keyhold_vault::ApiKeyMetadata;
use zeroize::Zeroizing;

use crate::cli::{Cli, Commands};
use crate::config::KeyholdConfig;
use crate::helpers::{build_transport, build_verifier, init_tracing, open_vault};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing("info", cli.json);

    let config = KeyholdConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Login { device, browser } => cmd_login(&config, device, browser).await,
        Commands::Logout => cmd_logout(&config).await,
        Commands::Status => cmd_status(&config),
        Commands::Verify => cmd_verify(&config).await,
        Commands::Exec {
            secrets,
            approval,
            reason,
            command,
        } => cmd_exec(&config, &secrets, approval, reason, &command).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: login
// ---------------------------------------------------------------------------

async fn cmd_login(config: &KeyholdConfig, device: bool, browser: bool) -> Result<ExitCode> {
    let variant = match (device, browser) {
        (_, true) => FlowVariant::Redirect,
        (true, _) => FlowVariant::Device,
        _ => FlowVariant::default(),
    };
    let vault = open_vault(config)?;

    match config.mode() {
        AuthMode::OAuth => {
            let transport = build_transport(config, vault, variant, true)?;
            let flow = transport
                .flow()
                .context("OAuth flow is not available for this configuration")?;
            let record = flow.authenticate().await.context("login failed")?;
            println!(
                "Logged in to {} (token valid for {} minutes).",
                config.auth_url(),
                record.expires_in_seconds / 60
            );
        }
        AuthMode::ApiKey => {
            let key = config
                .api_key
                .clone()
                .context("api-key mode needs KEYHOLD_API_KEY")?;
            let verdict = build_verifier(config)?
                .verify_api_key(&key)
                .await
                .context("API key verification failed")?;
            if !verdict.valid {
                bail!("the API key was rejected by {}", config.auth_url());
            }
            let stored = vault.store_api_key(
                Zeroizing::new(key),
                ApiKeyMetadata {
                    org_id: verdict.org_id,
                    user_id: verdict.user_id,
                    environment: verdict.environment,
                    expires_at: verdict.expires_at,
                    ..Default::default()
                },
            )?;
            println!(
                "API key verified and recorded (org {}, environment {}).",
                stored.org_id.as_deref().unwrap_or("-"),
                stored.environment.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Subcommand: logout
// ---------------------------------------------------------------------------

async fn cmd_logout(config: &KeyholdConfig) -> Result<ExitCode> {
    let vault = open_vault(config)?;
    let transport = build_transport(config, vault, FlowVariant::default(), false)?;
    transport.logout().await.context("logout failed")?;
    println!("Logged out; stored credentials cleared.");
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

fn cmd_status(config: &KeyholdConfig) -> Result<ExitCode> {
    let vault = open_vault(config)?;
    let mode = config.mode();

    println!();
    println!("  keyhold v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  Mode:      {mode}");
    println!("  Storage:   {}", vault.backend_name());
    println!("  Auth:      {}", config.auth_url());
    println!("  Resource:  {}", config.resource_url());

    match mode {
        AuthMode::OAuth => match vault.retrieve()? {
            None => println!("  Session:   not logged in"),
            Some(record) => {
                let expires = record
                    .expires_at_ms()
                    .and_then(DateTime::from_timestamp_millis)
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".into());
                let state = if vault.is_expired(&record) {
                    "expired"
                } else {
                    "active"
                };
                println!("  Session:   {state} (expires {expires})");
                println!(
                    "  Refresh:   {}",
                    if record.refresh_token.is_some() {
                        "available"
                    } else {
                        "none"
                    }
                );
            }
        },
        AuthMode::ApiKey => match vault.retrieve_api_key()? {
            None => println!("  API key:   not recorded (run `keyhold login`)"),
            Some(key) => {
                println!(
                    "  API key:   recorded {} (org {}, environment {})",
                    key.created_at.to_rfc3339(),
                    key.org_id.as_deref().unwrap_or("-"),
                    key.environment.as_deref().unwrap_or("-")
                );
            }
        },
    }
    println!();
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Subcommand: verify
// ---------------------------------------------------------------------------

async fn cmd_verify(config: &KeyholdConfig) -> Result<ExitCode> {
    let verifier = build_verifier(config)?;

    let (valid, report) = match config.mode() {
        AuthMode::ApiKey => {
            let key = config
                .api_key
                .as_deref()
                .context("api-key mode needs KEYHOLD_API_KEY")?;
            let verdict = verifier.verify_api_key(key).await?;
            (verdict.valid, serde_json::to_string_pretty(&verdict)?)
        }
        AuthMode::OAuth => {
            let vault = open_vault(config)?;
            let transport = build_transport(config, vault, FlowVariant::default(), false)?;
            let flow = transport
                .flow()
                .context("OAuth flow is not available for this configuration")?;
            let record = flow
                .ensure_token()
                .await
                .context("no usable session; run `keyhold login`")?;
            let verdict = verifier.verify_token(&record.access_token).await?;
            (verdict.valid, serde_json::to_string_pretty(&verdict)?)
        }
    };

    println!("{report}");
    if valid {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("credential rejected by {}", config.auth_url());
        Ok(ExitCode::FAILURE)
    }
}

// ---------------------------------------------------------------------------
// Subcommand: exec
// ---------------------------------------------------------------------------

async fn cmd_exec(
    config: &KeyholdConfig,
    secrets: &[String],
    approval: bool,
    reason: Option<String>,
    command: &[String],
) -> Result<ExitCode> {
    let (program, args) = command.split_first().context("no command given")?;
    let vault = open_vault(config)?;
    let transport = build_transport(config, vault, FlowVariant::default(), true)?;
    let broker = SecretBroker::new(transport);
    let options = config.broker_options(approval, reason);

    let outcome = broker
        .use_secrets(secrets, &options, |proxies| run_child(program, args, proxies))
        .await
        .context("secret access failed")?;
    let status = outcome.with_context(|| format!("failed to run `{program}`"))?;

    Ok(status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from))
}

/// Run `program` with one environment variable per proxy value and wait for
/// it. Ctrl-C stops the child so the caller can still revoke.
async fn run_child(
    program: &str,
    args: &[String],
    proxies: HashMap<String, String>,
) -> std::io::Result<ExitStatus> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .envs(&proxies)
        .spawn()?;
    tracing::info!(program, secrets = proxies.len(), "command started");
    drop(proxies);

    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::signal::ctrl_c() => None,
    };
    match finished {
        Some(status) => status,
        None => {
            tracing::warn!(program, "interrupted; stopping command");
            let _ = child.start_kill();
            child.wait().await
        }
    }
}
