// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Tunnel Registry - Authentication Module
// Handles token-based authentication for the daemon API

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use tunnel_registry_common::AUTH_TOKEN_HEADER;

/// Paths reachable without a token
const PUBLIC_PATHS: &[&str] = &["/health"];

/// Obfuscate a token for logging (show only last 4 characters)
/// Example: "abc123def456" -> "********f456"
pub fn obfuscate_token(token: &str) -> String {
    if token.len() < 4 {
        // If token is very short, just mask everything
        "*".repeat(token.len())
    } else {
        let visible_chars = 4;
        let mask_len = token.len() - visible_chars;
        format!("{}{}", "*".repeat(mask_len), &token[mask_len..])
    }
}

/// Generate a new authentication token
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Load or generate authentication token from file
/// Returns (token, was_newly_generated)
pub fn load_or_generate_token(token_path: &Path) -> Result<(String, bool)> {
    // If token file exists, load it
    if token_path.exists() {
        let token = fs::read_to_string(token_path)
            .context("Failed to read authentication token file")?
            .trim()
            .to_string();

        if token.is_empty() {
            warn!("Token file exists but is empty, regenerating");
        } else {
            info!("Loaded authentication token from: {}", token_path.display());
            return Ok((token, false));
        }
    }

    // Generate new token
    let token = generate_token();
    save_token(token_path, &token)?;

    info!("Generated new authentication token");
    info!("Token saved to: {}", token_path.display());
    info!("");
    info!("⚠️  IMPORTANT: Clients must provide this token to connect!");
    info!("   Token: {} (full token in {})", obfuscate_token(&token), token_path.display());
    info!("   Add it as auth_token in cli.toml or send the {} header", AUTH_TOKEN_HEADER);

    Ok((token, true))
}

/// Save authentication token to file
fn save_token(token_path: &Path, token: &str) -> Result<()> {
    // Ensure parent directory exists
    if let Some(parent) = token_path.parent() {
        fs::create_dir_all(parent).context("Failed to create token directory")?;
    }

    // Write token to file
    fs::write(token_path, token).context("Failed to write token file")?;

    // Set restrictive permissions (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(0o600);
        fs::set_permissions(token_path, permissions)
            .context("Failed to set token file permissions")?;
    }

    Ok(())
}

/// Authentication middleware state
#[derive(Clone)]
pub struct AuthState {
    token: Zeroizing<String>,
}

impl AuthState {
    pub fn new(token: String) -> Self {
        Self {
            token: Zeroizing::new(token),
        }
    }
}

/// Authentication middleware for Axum
///
/// Checks the X-Tunnel-Token header against the configured token and
/// returns 401 Unauthorized if it is missing or wrong. The health probe
/// stays open.
pub async fn auth_middleware(
    axum::extract::State(auth_state): axum::extract::State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if PUBLIC_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    // Get the provided token from headers
    let provided_token = request
        .headers()
        .get(AUTH_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    // Validate token
    match provided_token {
        Some(token) if token == auth_state.token.as_str() => {
            // Too chatty at debug when clients poll frequently; keep at trace.
            tracing::trace!("Authentication successful");
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Authentication failed: invalid token");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Authentication failed: missing token");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
