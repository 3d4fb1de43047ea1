//! Shared setup for the subcommands: tracing, the vault, the transport.

use std::sync::Arc;

use anyhow::{Context, Result};
use keyhold_auth::{CredentialVerifier, DevicePrompt, FlowVariant, UserPrompt};
use keyhold_endpoint::PinnedEndpoint;
use keyhold_transport::Transport;
use keyhold_vault::{CredentialVault, LegacyCredentials};
use tracing_subscriber::EnvFilter;

use crate::config::KeyholdConfig;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Prints login instructions on stderr so stdout stays clean for `exec`.
pub struct TerminalPrompt;

impl UserPrompt for TerminalPrompt {
    fn show_device_code(&self, prompt: &DevicePrompt) {
        eprintln!();
        eprintln!("  To sign in, open {}", prompt.verification_uri);
        eprintln!("  and enter the code: {}", prompt.user_code);
        if let Some(complete) = &prompt.verification_uri_complete {
            eprintln!("  (or open {complete})");
        }
        eprintln!(
            "  The code expires in {} minutes.",
            prompt.expires_in_secs.div_ceil(60)
        );
        eprintln!();
    }

    fn open_authorization_url(&self, url: &str) {
        eprintln!();
        eprintln!("  Open this URL in your browser to sign in:");
        eprintln!("  {url}");
        eprintln!();
    }
}

// ---------------------------------------------------------------------------
// Vault and transport
// ---------------------------------------------------------------------------

/// Open the vault on the best available backend and migrate any legacy
/// plaintext credentials into it.
pub fn open_vault(config: &KeyholdConfig) -> Result<Arc<CredentialVault>> {
    let vault = CredentialVault::from_capabilities(&config.host_capabilities())
        .context("no credential storage available")?;

    let legacy = LegacyCredentials::at(config.legacy_file());
    match vault.migrate_legacy(&legacy) {
        Ok(report) if !report.is_noop() => tracing::info!(
            token = report.token_migrated,
            api_key = report.api_key_migrated,
            removed = report.legacy_removed,
            "migrated legacy credentials"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "legacy credential migration failed"),
    }
    Ok(Arc::new(vault))
}

/// A transport for the configured mode. With `interactive` false an expired
/// OAuth session is reported instead of starting a login flow.
pub fn build_transport(
    config: &KeyholdConfig,
    vault: Arc<CredentialVault>,
    variant: FlowVariant,
    interactive: bool,
) -> Result<Arc<Transport>> {
    let mut client = config.client_config(variant)?;
    client.interactive = interactive;
    let transport = Transport::new(client, vault, Arc::new(TerminalPrompt))
        .context("failed to set up the transport")?;
    Ok(Arc::new(transport))
}

/// Verifier against the authorization server.
pub fn build_verifier(config: &KeyholdConfig) -> Result<CredentialVerifier> {
    let endpoint = PinnedEndpoint::new(
        config.auth_url(),
        &config.endpoint_options(),
        &config.tls_options(),
    )
    .context("invalid auth URL")?;
    let mut verifier = CredentialVerifier::new(endpoint)?;
    if let Some(client_id) = &config.client_id {
        verifier = verifier.with_client_id(client_id);
    }
    Ok(verifier)
}
