// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use integration_auth::config::{IntegrationProperties, LOG_FORMAT_ENV};
use integration_auth::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    // Install the ring crypto provider for rustls before any TLS operation
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let properties = match IntegrationProperties::from_env() {
        Ok(properties) => properties,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let state = match AppState::from_properties(&properties) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Failed to build authentication proxy");
            return ExitCode::FAILURE;
        }
    };

    info!(
        users = properties.integrations.len(),
        services = state.clients.len(),
        "Authentication proxy ready"
    );

    let mut failed = 0usize;
    for (user_id, outcome) in state.authenticate_all().await {
        match outcome {
            Ok(()) => info!(user_id = %user_id, "Integration user ready"),
            Err(e) => {
                failed += 1;
                error!(
                    user_id = %user_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Integration user could not authenticate"
                );
            }
        }
    }

    // Users left unauthenticated recover through re-authentication on their
    // first 401.
    if failed > 0 {
        warn!(failed, "Some integration users are not authenticated");
    }

    ExitCode::SUCCESS
}

/// Initialize logging from `RUST_LOG` (default `info`) and `LOG_FORMAT`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
