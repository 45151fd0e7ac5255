//! Error types for Balise.
//!
//! This module defines the error hierarchy using `thiserror`. Every error
//! kind is a distinct variant with a stable identity so callers can match
//! on it, and all variants can be propagated with the `?` operator.
//!
//! # Error Categories
//!
//! - **Config errors**: invalid SCM provider settings, missing keys
//! - **Auth errors**: OAuth exchange/refresh failures, token problems
//! - **Resource errors**: missing repositories, branches, tags, commits
//! - **Webhook errors**: registration and signature verification
//! - **Version errors**: immutability violations, duplicates
//! - **Archive errors**: source archive download and format problems
//! - **Storage errors**: object-store failures
//! - **Sync errors**: mirror-run failures that abort a whole run

use thiserror::Error;

/// A specialized Result type for Balise operations.
pub type Result<T> = std::result::Result<T, BaliseError>;

/// The main error type for Balise.
#[derive(Error, Debug)]
pub enum BaliseError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Unknown SCM provider kind string.
    #[error("Invalid SCM provider kind: {kind}")]
    InvalidProviderKind {
        /// The unrecognized kind string
        kind: String,
    },

    /// OAuth client id missing for an OAuth-based provider.
    #[error("Missing OAuth client id for provider kind {kind}")]
    MissingClientId {
        /// The provider kind
        kind: String,
    },

    /// OAuth client secret missing for an OAuth-based provider.
    #[error("Missing OAuth client secret for provider kind {kind}")]
    MissingClientSecret {
        /// The provider kind
        kind: String,
    },

    /// OAuth callback URL missing for an OAuth-based provider.
    #[error("Missing OAuth callback URL for provider kind {kind}")]
    MissingCallbackUrl {
        /// The provider kind
        kind: String,
    },

    /// Provider kind is known but not supported by this build.
    #[error("SCM provider not supported: {kind}")]
    ProviderNotSupported {
        /// The provider kind
        kind: String,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// The configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// Missing required configuration.
    #[error("Missing required configuration: {key}")]
    ConfigMissing {
        /// The missing configuration key
        key: String,
    },

    /// Configuration parsing error.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        /// Error message
        message: String,
        /// The underlying error (if any)
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // =========================================================================
    // Auth Errors
    // =========================================================================
    /// OAuth authorization-code exchange was rejected upstream.
    #[error("OAuth code exchange failed ({platform}): {message}")]
    AuthCodeExchangeFailed {
        /// The SCM platform
        platform: String,
        /// Upstream message body
        message: String,
    },

    /// Access-token refresh was rejected upstream.
    #[error("Token refresh failed ({platform}): {message}")]
    TokenRefreshFailed {
        /// The SCM platform
        platform: String,
        /// Upstream message body
        message: String,
    },

    /// The presented token is expired.
    #[error("Token expired")]
    TokenExpired,

    /// The presented token failed validation.
    #[error("Token invalid: {message}")]
    TokenInvalid {
        /// Why validation failed
        message: String,
    },

    /// The caller lacks a required scope.
    #[error("Insufficient scope: required {required}")]
    ScopeInsufficient {
        /// The scope the operation requires
        required: String,
    },

    /// The provider only supports personal access tokens.
    #[error("Provider {kind} requires a personal access token")]
    PatRequired {
        /// The provider kind
        kind: String,
    },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Repository does not exist or is invisible to the token.
    #[error("Repository not found: {owner}/{name}")]
    RepoNotFound {
        /// Repository owner / namespace
        owner: String,
        /// Repository name
        name: String,
    },

    /// Repository exists but access is forbidden.
    #[error("Repository access forbidden: {owner}/{name}")]
    RepoForbidden {
        /// Repository owner / namespace
        owner: String,
        /// Repository name
        name: String,
    },

    /// Branch does not exist.
    #[error("Branch not found: {branch}")]
    BranchNotFound {
        /// The missing branch
        branch: String,
    },

    /// Tag does not exist.
    #[error("Tag not found: {tag}")]
    TagNotFound {
        /// The missing tag
        tag: String,
    },

    /// Commit does not exist.
    #[error("Commit not found: {sha}")]
    CommitNotFound {
        /// The missing commit SHA
        sha: String,
    },

    // =========================================================================
    // Webhook Errors
    // =========================================================================
    /// Webhook does not exist upstream.
    #[error("Webhook not found: {id}")]
    WebhookNotFound {
        /// The webhook id
        id: String,
    },

    /// Webhook registration failed upstream.
    #[error("Webhook creation failed: {message}")]
    WebhookCreationFailed {
        /// Upstream message body
        message: String,
    },

    /// Delivery signature did not verify.
    #[error("Webhook signature invalid")]
    SignatureInvalid,

    /// Delivery payload could not be parsed.
    #[error("Webhook payload invalid: {message}")]
    PayloadInvalid {
        /// Why parsing failed
        message: String,
    },

    // =========================================================================
    // Version Errors
    // =========================================================================
    /// A version with this string already exists.
    #[error("Version already exists: {version}")]
    VersionAlreadyExists {
        /// The duplicate version string
        version: String,
    },

    /// A published tag no longer points at its recorded commit.
    #[error("Tag movement detected on {tag}: recorded {recorded_sha}, observed {observed_sha}")]
    TagMovementDetected {
        /// The tag name
        tag: String,
        /// The SHA recorded at publish time
        recorded_sha: String,
        /// The SHA currently observed upstream
        observed_sha: String,
    },

    /// Downloaded content does not hash to the recorded commit.
    #[error("Commit SHA mismatch: expected {expected}, got {actual}")]
    CommitShaMismatch {
        /// Expected SHA
        expected: String,
        /// Actual SHA
        actual: String,
    },

    // =========================================================================
    // Archive Errors
    // =========================================================================
    /// Source archive download failed.
    #[error("Archive download failed: {message}")]
    ArchiveDownloadFailed {
        /// Error message
        message: String,
    },

    /// Source archive is malformed or violates limits.
    #[error("Archive format invalid: {message}")]
    ArchiveFormatInvalid {
        /// Error message
        message: String,
    },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Object does not exist in the storage backend.
    #[error("Object not found: {path}")]
    ObjectNotFound {
        /// The logical object path
        path: String,
    },

    /// Storage backend I/O failure.
    #[error("Storage error at '{path}': {message}")]
    Storage {
        /// The logical object path
        path: String,
        /// Error message
        message: String,
    },

    // =========================================================================
    // Sync Errors
    // =========================================================================
    /// A whole mirror run failed (service discovery, bad filters, ...).
    #[error("Mirror sync failed: {message}")]
    SyncFailed {
        /// Error message
        message: String,
    },

    /// Checksum of a downloaded artifact does not match the SUMS entry.
    #[error("Checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The artifact filename
        filename: String,
        /// Expected lowercase hex digest
        expected: String,
        /// Actual lowercase hex digest
        actual: String,
    },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Too many requests.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Upstream API error with status and message body.
    #[error("API error ({platform}, status {status}): {message}")]
    Api {
        /// The upstream platform or service
        platform: String,
        /// HTTP status code returned upstream
        status: u16,
        /// Upstream message body
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Internal error (should not happen in normal operation).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl BaliseError {
    /// Creates an `Api` error from an upstream response.
    #[must_use]
    pub fn api(platform: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            platform: platform.into(),
            status,
            message: message.into(),
        }
    }

    /// Creates a `Storage` error.
    #[must_use]
    pub fn storage(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a `SyncFailed` error.
    #[must_use]
    pub fn sync(message: impl Into<String>) -> Self {
        Self::SyncFailed {
            message: message.into(),
        }
    }

    /// Creates an `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a `TokenInvalid` error.
    #[must_use]
    pub fn token_invalid(message: impl Into<String>) -> Self {
        Self::TokenInvalid {
            message: message.into(),
        }
    }

    /// Whether the error should abort a whole mirror run.
    ///
    /// Per-item failures (a single version or platform) are counted and
    /// logged; only run-level failures propagate.
    #[must_use]
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::SyncFailed { .. } | Self::ConfigValue { .. } | Self::ConfigMissing { .. }
        )
    }

    /// HTTP status the gateway maps this error to.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::TokenExpired | Self::TokenInvalid { .. } => 401,
            Self::ScopeInsufficient { .. } => 403,
            Self::RateLimitExceeded => 429,
            Self::RepoNotFound { .. }
            | Self::BranchNotFound { .. }
            | Self::TagNotFound { .. }
            | Self::CommitNotFound { .. }
            | Self::WebhookNotFound { .. }
            | Self::ObjectNotFound { .. } => 404,
            Self::RepoForbidden { .. } => 403,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for BaliseError {
    fn from(source: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON serialization error: {source}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_carries_status_and_body() {
        let err = BaliseError::api("github", 422, "Validation Failed");
        match err {
            BaliseError::Api { status, ref message, .. } => {
                assert_eq!(status, 422);
                assert_eq!(message, "Validation Failed");
            }
            _ => panic!("expected Api error"),
        }
    }

    #[test]
    fn gateway_status_mapping() {
        assert_eq!(BaliseError::TokenExpired.http_status(), 401);
        assert_eq!(
            BaliseError::ScopeInsufficient { required: "mirrors:manage".into() }.http_status(),
            403
        );
        assert_eq!(BaliseError::RateLimitExceeded.http_status(), 429);
        assert_eq!(BaliseError::internal("boom").http_status(), 500);
    }

    #[test]
    fn run_fatal_classification() {
        assert!(BaliseError::sync("bad filter").is_run_fatal());
        assert!(!BaliseError::ChecksumMismatch {
            filename: "x.zip".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .is_run_fatal());
    }
}
