//! Approval-gated, time-boxed access to secrets.
//!
//! A [`SecretBroker`] never hands out a secret. It asks the resource server
//! for access to named secrets, waits for an approver when one is required,
//! and receives a [`TemporarySecretGrant`] per secret: a proxy value the
//! server swaps for the real secret on use. Grants die with their
//! [`AccessSession`], which is revoked on explicit cleanup, on TTL expiry, or
//! when a [`SecretBroker::use_secret`] callback finishes for any reason.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyhold_session::{BrokerOptions, SecretBroker};
//! # use keyhold_transport::Transport;
//!
//! # async fn example(transport: Arc<Transport>) -> keyhold_session::Result<()> {
//! let broker = SecretBroker::new(transport);
//! let options = BrokerOptions::default().with_approval().with_reason("nightly deploy");
//!
//! let status = broker
//!     .use_secret("STRIPE_KEY", &options, |proxy| async move {
//!         // hand `proxy` to the tool that needs the key
//!         proxy.len()
//!     })
//!     .await?;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod approval;
pub mod broker;
pub mod error;
pub mod session;
pub mod wire;

pub use approval::{
    ApprovalChannel, ApprovalWaiter, DEFAULT_POLL_INTERVAL, PollingApprovals, WebSocketApprovals,
    events_url,
};
pub use broker::{BrokerOptions, DEFAULT_APPROVAL_TIMEOUT, DEFAULT_SESSION_TTL, SecretBroker};
pub use error::{Result, SessionError};
pub use session::{AccessSession, SessionState, TemporarySecretGrant};
pub use wire::ApprovalStatus;
