//! CI Join Library
//!
//! Lets a machine running inside a CI job join a cluster by presenting the
//! job's OIDC identity token instead of a pre-shared secret.
//!
//! # Features
//!
//! - **Policies**: named, expiring join policies with ordered allow rules
//! - **Providers**: CircleCI and GitHub Actions token validation via JWKS
//! - **Credentials**: opaque bearer credentials bound to the machine's keys
//! - **Audit**: one structured event per join decision
//!
//! Matching primitives live in the `join-core` crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod join;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(e.to_string()))
}
