//! CLI argument definitions for keyhold.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// keyhold -- short-lived, approval-gated access to secrets.
#[derive(Parser)]
#[command(
    name = "keyhold",
    version,
    about = "keyhold -- short-lived, approval-gated access to secrets",
    long_about = "Authenticates against a keyhold server with OAuth or an API key and hands \
                  commands revocable proxy values instead of real secrets."
)]
pub struct Cli {
    /// Path to the configuration file (default: ./keyhold.toml if present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in (OAuth) or verify and store an API key (key mode).
    Login {
        /// Use the device-code flow.
        #[arg(long, conflicts_with = "browser")]
        device: bool,

        /// Use the browser redirect flow.
        #[arg(long)]
        browser: bool,
    },

    /// Revoke tokens and clear stored credentials.
    Logout,

    /// Show the configured mode and stored credential state.
    Status,

    /// Ask the server whether the current credential is valid.
    Verify,

    /// Run a command with proxy values for the named secrets in its
    /// environment, then revoke them.
    Exec {
        /// Secret to expose; the environment variable has the same name.
        #[arg(long = "secret", short = 's', required = true, value_name = "NAME")]
        secrets: Vec<String>,

        /// Wait for an approver before activating.
        #[arg(long)]
        approval: bool,

        /// Reason shown to the approver.
        #[arg(long)]
        reason: Option<String>,

        /// The command and its arguments.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_collects_secrets_and_trailing_command() {
        let cli = Cli::try_parse_from([
            "keyhold", "exec", "-s", "STRIPE_KEY", "--secret", "DB_PASSWORD", "--approval", "--",
            "deploy", "--prod",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec {
                secrets,
                approval,
                command,
                ..
            } => {
                assert_eq!(secrets, vec!["STRIPE_KEY", "DB_PASSWORD"]);
                assert!(approval);
                assert_eq!(command, vec!["deploy", "--prod"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn exec_requires_a_secret_and_a_command() {
        assert!(Cli::try_parse_from(["keyhold", "exec", "--", "env"]).is_err());
        assert!(Cli::try_parse_from(["keyhold", "exec", "-s", "A"]).is_err());
    }

    #[test]
    fn login_flags_conflict() {
        assert!(Cli::try_parse_from(["keyhold", "login", "--device", "--browser"]).is_err());
        assert!(Cli::try_parse_from(["keyhold", "--json", "login", "--browser"]).is_ok());
    }
}
