// remora: Mounts a remote provider's namespace and mediates file I/O
// through pluggable storage helpers.
//
// This binary wires the client core and keeps the session alive until
// interrupted; the filesystem adapter attaches to the running context.

use remora::comm::pool::{HandshakeResponder, HandshakeVerdict};
use remora::config::ClientConfig;
use remora::context::Context;
use remora_proto::{CertificateConfirmation, HandshakeStatus};
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "remora starting");

    let config = match remora::config::load_config() {
        Ok(config) => {
            info!(provider = %config.provider.hostname, "config loaded");
            config
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("FATAL: failed to start runtime: {}", e);
            std::process::exit(2);
        }
    };

    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

async fn run(config: ClientConfig) -> i32 {
    let responder = default_responder(&config);
    let context = match Context::new(&config, responder).await {
        Ok(context) => context,
        Err(e) => {
            error!(error = %e, "failed to establish session");
            return e.exit_code();
        }
    };

    // The core now serves the filesystem adapter; run until interrupted.
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handling failed");
        context.shutdown().await;
        return 2;
    }
    info!("interrupt received, unmounting");
    context.shutdown().await;
    0
}

/// Handshake response policy for unattended runs: certificate confirmation
/// is granted only when the config says so, with the local username.
fn default_responder(config: &ClientConfig) -> HandshakeResponder {
    let confirm = config.auth.confirm_certificate;
    Arc::new(move |response| match response.status {
        HandshakeStatus::CertConfirmationRequired if confirm => {
            let username = std::env::var("USER").unwrap_or_default();
            info!(username = %username, "confirming certificate identity");
            HandshakeVerdict::ConfirmCertificate(CertificateConfirmation { username })
        }
        HandshakeStatus::CertConfirmationRequired => {
            warn!("certificate confirmation required but not granted by config");
            HandshakeVerdict::Abort
        }
        _ => HandshakeVerdict::Proceed,
    })
}
