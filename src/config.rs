//! Configuration for Balise.
//!
//! Configuration is layered, lowest to highest precedence:
//! built-in defaults, a YAML file (`balise.yaml`), then environment
//! variables with the `BALISE_` prefix. Every nested key has an explicit
//! environment binding. Secret-bearing string fields undergo `${VAR}`
//! expansion after parse.
//!
//! # Configuration File Format
//!
//! ```yaml
//! # balise.yaml
//!
//! server:
//!   host: 0.0.0.0
//!   port: 8080
//!   base_url: https://registry.example.com
//!   dev_mode: false
//!
//! auth:
//!   jwt_secret: ${BALISE_JWT_SECRET}
//!   token_lifetime_minutes: 60
//!
//! storage:
//!   backend: s3
//!   local:
//!     base_path: ./data
//!     serve_directly: false
//!   s3:
//!     endpoint: https://s3.example.com
//!     region: us-east-1
//!     bucket: balise
//!     auth_mode: static
//!     access_key_id: ${AWS_ACCESS_KEY_ID}
//!     secret_access_key: ${AWS_SECRET_ACCESS_KEY}
//!
//! mirror:
//!   scan_interval_minutes: 5
//!
//! smtp:
//!   host: smtp.example.com
//!   port: 465
//!   username: registry
//!   password: ${SMTP_PASSWORD}
//!   from: registry@example.com
//!   use_tls: true
//!
//! notifications:
//!   enabled: true
//!   warning_days: 7
//!   interval_hours: 24
//! ```

use crate::error::{BaliseError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// HTTP server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    /// Externally visible base URL, used for local-backend object URLs.
    pub base_url: String,
    /// Development mode relaxes the JWT secret requirement.
    pub dev_mode: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            base_url: "http://127.0.0.1:8080".to_string(),
            dev_mode: false,
        }
    }
}

/// Authentication options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthOptions {
    /// HMAC secret for JWT signing. Required outside dev mode.
    pub jwt_secret: Option<String>,
    /// Token lifetime in minutes; 0 means the 1 hour default.
    pub token_lifetime_minutes: i64,
    /// AES-256-GCM key (base64, 32 bytes) sealing SCM client secrets.
    pub secret_seal_key: Option<String>,
}

/// One token-bucket rate limit profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitProfile {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitProfile {
    fn default() -> Self {
        Self {
            requests_per_minute: 200,
            burst_size: 50,
        }
    }
}

/// Rate limit profiles recognised by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOptions {
    pub general: RateLimitProfile,
    pub auth: RateLimitProfile,
    pub upload: RateLimitProfile,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            general: RateLimitProfile {
                requests_per_minute: 200,
                burst_size: 50,
            },
            auth: RateLimitProfile {
                requests_per_minute: 10,
                burst_size: 5,
            },
            upload: RateLimitProfile {
                requests_per_minute: 30,
                burst_size: 5,
            },
        }
    }
}

/// Audit recording toggles. With the defaults, only authenticated,
/// non-GET, non-error actions are recorded.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuditOptions {
    pub log_read_operations: bool,
    pub log_failed_requests: bool,
}

/// Security header emission profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityHeaderOptions {
    pub hsts: String,
    pub frame_options: String,
    pub content_type_options: String,
    pub content_security_policy: String,
    pub referrer_policy: String,
    pub permissions_policy: String,
    pub cross_origin_opener_policy: String,
    pub cross_origin_resource_policy: String,
}

impl Default for SecurityHeaderOptions {
    fn default() -> Self {
        // The API profile: XSS protection is omitted (not applicable to
        // JSON) and the CSP denies everything.
        Self {
            hsts: "max-age=63072000; includeSubDomains".to_string(),
            frame_options: "DENY".to_string(),
            content_type_options: "nosniff".to_string(),
            content_security_policy: "default-src 'none'; frame-ancestors 'none'".to_string(),
            referrer_policy: "no-referrer".to_string(),
            permissions_policy: "camera=(), microphone=(), geolocation=()".to_string(),
            cross_origin_opener_policy: "same-origin".to_string(),
            cross_origin_resource_policy: "same-origin".to_string(),
        }
    }
}

/// Which storage backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Local,
    S3,
}

/// Local filesystem storage options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageOptions {
    pub base_path: String,
    /// When set, `get_url` returns `<base_url>/v1/files/<path>` instead of
    /// a `file://` URL.
    pub serve_directly: bool,
}

impl Default for LocalStorageOptions {
    fn default() -> Self {
        Self {
            base_path: "./data".to_string(),
            serve_directly: false,
        }
    }
}

/// S3 authentication modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum S3AuthMode {
    /// Ambient credential chain.
    #[default]
    Default,
    /// Static access key and secret.
    Static,
    /// Web-identity token file plus a role to assume.
    Oidc,
    /// Role to assume, with an optional external id.
    AssumeRole,
}

/// S3-compatible storage options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct S3StorageOptions {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub auth_mode: S3AuthMode,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub web_identity_token_file: Option<String>,
    pub role_arn: Option<String>,
    pub external_id: Option<String>,
    /// Force path-style addressing, needed by most S3-compatible stores.
    pub force_path_style: bool,
}

/// Storage options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageOptions {
    pub backend: StorageBackendKind,
    pub local: LocalStorageOptions,
    pub s3: S3StorageOptions,
}

/// Mirror engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorOptions {
    /// How often the scheduler scans for due configurations.
    pub scan_interval_minutes: i64,
    /// ASCII-armored GPG key verifying terraform release SUMS files.
    pub terraform_gpg_key: Option<String>,
    /// ASCII-armored GPG key verifying opentofu release SUMS files.
    pub opentofu_gpg_key: Option<String>,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            scan_interval_minutes: 5,
            terraform_gpg_key: None,
            opentofu_gpg_key: None,
        }
    }
}

impl MirrorOptions {
    /// Release-verification keys by product name.
    #[must_use]
    pub fn verify_keys(&self) -> std::collections::HashMap<String, String> {
        let mut keys = std::collections::HashMap::new();
        if let Some(key) = &self.terraform_gpg_key {
            keys.insert("terraform".to_string(), key.clone());
        }
        if let Some(key) = &self.opentofu_gpg_key {
            keys.insert("opentofu".to_string(), key.clone());
        }
        keys
    }
}

/// SMTP options for notification mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    /// Implicit TLS on 465 first; STARTTLS on 587 as fallback.
    pub use_tls: bool,
}

impl Default for SmtpOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 465,
            username: String::new(),
            password: String::new(),
            from: String::new(),
            use_tls: true,
        }
    }
}

/// API key expiry notification options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationOptions {
    pub enabled: bool,
    /// Days of warning before expiry; non-positive falls back to 7.
    pub warning_days: i64,
    /// Worker tick interval in hours; non-positive falls back to 24.
    pub interval_hours: i64,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_days: 7,
            interval_hours: 24,
        }
    }
}

/// Tag verifier options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagVerifyOptions {
    pub enabled: bool,
    pub interval_hours: i64,
}

impl Default for TagVerifyOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerOptions,
    pub auth: AuthOptions,
    pub rate_limit: RateLimitOptions,
    pub audit: AuditOptions,
    pub security_headers: SecurityHeaderOptions,
    pub storage: StorageOptions,
    pub mirror: MirrorOptions,
    pub smtp: SmtpOptions,
    pub notifications: NotificationOptions,
    pub tag_verify: TagVerifyOptions,
}

impl Config {
    /// Load configuration: defaults, then the YAML file (if present), then
    /// environment overrides, then `${VAR}` expansion of secrets.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path).map_err(|e| BaliseError::ConfigParse {
                    message: format!("failed to read {}", path.display()),
                    source: Some(Box::new(e)),
                })?;
                serde_yaml::from_str(&content).map_err(|e| BaliseError::ConfigParse {
                    message: format!("failed to parse {}", path.display()),
                    source: Some(Box::new(e)),
                })?
            }
            Some(path) => {
                tracing::debug!(path = %path.display(), "Configuration file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.expand_secrets();
        config.validate()?;
        Ok(config)
    }

    /// Apply `BALISE_*` environment overrides. Every nested key has an
    /// explicit binding here.
    pub fn apply_env_overrides(&mut self) {
        set_string(&mut self.server.host, "BALISE_SERVER_HOST");
        set_parse(&mut self.server.port, "BALISE_SERVER_PORT");
        set_string(&mut self.server.base_url, "BALISE_SERVER_BASE_URL");
        set_parse(&mut self.server.dev_mode, "BALISE_SERVER_DEV_MODE");

        set_opt_string(&mut self.auth.jwt_secret, "BALISE_AUTH_JWT_SECRET");
        set_parse(
            &mut self.auth.token_lifetime_minutes,
            "BALISE_AUTH_TOKEN_LIFETIME_MINUTES",
        );
        set_opt_string(&mut self.auth.secret_seal_key, "BALISE_AUTH_SECRET_SEAL_KEY");

        set_parse(
            &mut self.rate_limit.general.requests_per_minute,
            "BALISE_RATE_LIMIT_GENERAL_RPM",
        );
        set_parse(
            &mut self.rate_limit.general.burst_size,
            "BALISE_RATE_LIMIT_GENERAL_BURST",
        );
        set_parse(
            &mut self.rate_limit.auth.requests_per_minute,
            "BALISE_RATE_LIMIT_AUTH_RPM",
        );
        set_parse(
            &mut self.rate_limit.auth.burst_size,
            "BALISE_RATE_LIMIT_AUTH_BURST",
        );
        set_parse(
            &mut self.rate_limit.upload.requests_per_minute,
            "BALISE_RATE_LIMIT_UPLOAD_RPM",
        );
        set_parse(
            &mut self.rate_limit.upload.burst_size,
            "BALISE_RATE_LIMIT_UPLOAD_BURST",
        );

        set_parse(
            &mut self.audit.log_read_operations,
            "BALISE_AUDIT_LOG_READ_OPERATIONS",
        );
        set_parse(
            &mut self.audit.log_failed_requests,
            "BALISE_AUDIT_LOG_FAILED_REQUESTS",
        );

        if let Ok(backend) = std::env::var("BALISE_STORAGE_BACKEND") {
            match backend.as_str() {
                "local" => self.storage.backend = StorageBackendKind::Local,
                "s3" => self.storage.backend = StorageBackendKind::S3,
                other => tracing::warn!(backend = %other, "Unknown BALISE_STORAGE_BACKEND value ignored"),
            }
        }
        set_string(&mut self.storage.local.base_path, "BALISE_STORAGE_LOCAL_BASE_PATH");
        set_parse(
            &mut self.storage.local.serve_directly,
            "BALISE_STORAGE_LOCAL_SERVE_DIRECTLY",
        );
        set_opt_string(&mut self.storage.s3.endpoint, "BALISE_STORAGE_S3_ENDPOINT");
        set_string(&mut self.storage.s3.region, "BALISE_STORAGE_S3_REGION");
        set_string(&mut self.storage.s3.bucket, "BALISE_STORAGE_S3_BUCKET");
        if let Ok(mode) = std::env::var("BALISE_STORAGE_S3_AUTH_MODE") {
            match mode.as_str() {
                "default" => self.storage.s3.auth_mode = S3AuthMode::Default,
                "static" => self.storage.s3.auth_mode = S3AuthMode::Static,
                "oidc" => self.storage.s3.auth_mode = S3AuthMode::Oidc,
                "assume_role" => self.storage.s3.auth_mode = S3AuthMode::AssumeRole,
                other => tracing::warn!(mode = %other, "Unknown BALISE_STORAGE_S3_AUTH_MODE value ignored"),
            }
        }
        set_opt_string(&mut self.storage.s3.access_key_id, "BALISE_STORAGE_S3_ACCESS_KEY_ID");
        set_opt_string(
            &mut self.storage.s3.secret_access_key,
            "BALISE_STORAGE_S3_SECRET_ACCESS_KEY",
        );
        set_opt_string(
            &mut self.storage.s3.web_identity_token_file,
            "BALISE_STORAGE_S3_WEB_IDENTITY_TOKEN_FILE",
        );
        set_opt_string(&mut self.storage.s3.role_arn, "BALISE_STORAGE_S3_ROLE_ARN");
        set_opt_string(&mut self.storage.s3.external_id, "BALISE_STORAGE_S3_EXTERNAL_ID");
        set_parse(
            &mut self.storage.s3.force_path_style,
            "BALISE_STORAGE_S3_FORCE_PATH_STYLE",
        );

        set_parse(
            &mut self.mirror.scan_interval_minutes,
            "BALISE_MIRROR_SCAN_INTERVAL_MINUTES",
        );
        set_opt_string(&mut self.mirror.terraform_gpg_key, "BALISE_MIRROR_TERRAFORM_GPG_KEY");
        set_opt_string(&mut self.mirror.opentofu_gpg_key, "BALISE_MIRROR_OPENTOFU_GPG_KEY");

        set_string(&mut self.smtp.host, "BALISE_SMTP_HOST");
        set_parse(&mut self.smtp.port, "BALISE_SMTP_PORT");
        set_string(&mut self.smtp.username, "BALISE_SMTP_USERNAME");
        set_string(&mut self.smtp.password, "BALISE_SMTP_PASSWORD");
        set_string(&mut self.smtp.from, "BALISE_SMTP_FROM");
        set_parse(&mut self.smtp.use_tls, "BALISE_SMTP_USE_TLS");

        set_parse(&mut self.notifications.enabled, "BALISE_NOTIFICATIONS_ENABLED");
        set_parse(
            &mut self.notifications.warning_days,
            "BALISE_NOTIFICATIONS_WARNING_DAYS",
        );
        set_parse(
            &mut self.notifications.interval_hours,
            "BALISE_NOTIFICATIONS_INTERVAL_HOURS",
        );

        set_parse(&mut self.tag_verify.enabled, "BALISE_TAG_VERIFY_ENABLED");
        set_parse(&mut self.tag_verify.interval_hours, "BALISE_TAG_VERIFY_INTERVAL_HOURS");
    }

    /// Expand `${VAR}` references in secret-bearing fields.
    pub fn expand_secrets(&mut self) {
        if let Some(secret) = self.auth.jwt_secret.take() {
            self.auth.jwt_secret = Some(expand_env(&secret));
        }
        if let Some(key) = self.auth.secret_seal_key.take() {
            self.auth.secret_seal_key = Some(expand_env(&key));
        }
        if let Some(key) = self.storage.s3.access_key_id.take() {
            self.storage.s3.access_key_id = Some(expand_env(&key));
        }
        if let Some(secret) = self.storage.s3.secret_access_key.take() {
            self.storage.s3.secret_access_key = Some(expand_env(&secret));
        }
        self.smtp.password = expand_env(&self.smtp.password);
    }

    fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackendKind::S3 && self.storage.s3.bucket.is_empty() {
            return Err(BaliseError::ConfigMissing {
                key: "storage.s3.bucket".to_string(),
            });
        }
        if self.storage.s3.auth_mode == S3AuthMode::Static
            && self.storage.backend == StorageBackendKind::S3
            && (self.storage.s3.access_key_id.is_none() || self.storage.s3.secret_access_key.is_none())
        {
            return Err(BaliseError::ConfigMissing {
                key: "storage.s3.access_key_id/secret_access_key".to_string(),
            });
        }
        Ok(())
    }
}

/// Expand `${VAR}` references against the process environment. Unknown
/// variables expand to the empty string.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn set_string(target: &mut String, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn set_opt_string(target: &mut Option<String>, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *target = Some(value);
        }
    }
}

fn set_parse<T: std::str::FromStr>(target: &mut T, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        } else {
            tracing::warn!(var = %var, value = %value, "Ignoring unparseable environment override");
        }
    }
}
