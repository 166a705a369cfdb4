//! Participant identity extraction.
//!
//! Identity is issued by an external provider and treated as opaque and
//! pre-validated. A join carries either the identity itself or a bearer token
//! whose subject claim names the participant. Token signatures are NOT
//! verified here; the token only transports the name.

use crate::types::ParticipantId;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use thiserror::Error;

/// Maximum accepted bearer token size in bytes.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Claims consulted for the participant name, in priority order.
const IDENTITY_CLAIMS: [&str; 2] = ["sub", "id"];

/// Identity could not be established for a join.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Neither an identity nor a token was supplied.
    #[error("no identity supplied")]
    Missing,

    /// Token exceeds the maximum accepted size.
    #[error("token too large")]
    TokenTooLarge,

    /// Token is not a three-part JWT with a JSON payload.
    #[error("malformed token")]
    MalformedToken,

    /// Token payload has no usable subject claim.
    #[error("token has no subject claim")]
    MissingClaim,

    /// Resolved identity failed validation.
    #[error("invalid identity: {0}")]
    Invalid(#[from] crate::error::InvalidIdError),
}

/// Resolve the identity for a join.
///
/// An explicit `identity` wins. Otherwise the `sub` (or `id`) claim is read
/// from the token payload.
///
/// # Errors
///
/// Returns `IdentityError` if no identity can be derived.
pub fn resolve_identity(
    identity: Option<&str>,
    token: Option<&str>,
) -> Result<ParticipantId, IdentityError> {
    if let Some(identity) = identity {
        return Ok(ParticipantId::parse(identity)?);
    }
    match token {
        Some(token) => identity_from_token(token),
        None => Err(IdentityError::Missing),
    }
}

/// Read the subject claim from an unverified JWT.
///
/// # Errors
///
/// Returns `IdentityError` if the token is oversized, malformed or has no
/// subject claim.
pub fn identity_from_token(token: &str) -> Result<ParticipantId, IdentityError> {
    if token.len() > MAX_TOKEN_SIZE_BYTES {
        tracing::debug!(
            target: "common.identity",
            token_size = token.len(),
            max_size = MAX_TOKEN_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(IdentityError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        tracing::debug!(target: "common.identity", "Token rejected: invalid JWT format");
        return Err(IdentityError::MalformedToken);
    };

    let payload_bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
        tracing::debug!(target: "common.identity", error = %e, "Failed to decode token payload base64");
        IdentityError::MalformedToken
    })?;

    let claims: serde_json::Value = serde_json::from_slice(&payload_bytes).map_err(|e| {
        tracing::debug!(target: "common.identity", error = %e, "Failed to parse token payload JSON");
        IdentityError::MalformedToken
    })?;

    let subject = IDENTITY_CLAIMS
        .iter()
        .find_map(|claim| claims.get(claim).and_then(claim_as_string))
        .ok_or(IdentityError::MissingClaim)?;

    Ok(ParticipantId::parse(subject)?)
}

// Numeric ids are accepted as their decimal form.
fn claim_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
