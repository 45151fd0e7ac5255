//! API key expiry notification.
//!
//! Periodically finds keys expiring within the warning window that have
//! not yet been notified, mails the owning user a plain-text notice, and
//! marks the key notified only after a successful send. The database
//! flag is what makes delivery at-most-once across restarts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::{NotificationOptions, SmtpOptions};
use crate::error::Result;
use crate::notify::Mailer;
use crate::persist::{ApiKeyStore, UserStore};
use crate::types::ApiKey;

const DEFAULT_INTERVAL_HOURS: i64 = 24;
const DEFAULT_WARNING_DAYS: i64 = 7;

pub struct KeyExpiryNotifier {
    api_keys: Arc<dyn ApiKeyStore>,
    users: Arc<dyn UserStore>,
    mailer: Arc<dyn Mailer>,
    options: NotificationOptions,
    smtp: SmtpOptions,
}

impl KeyExpiryNotifier {
    #[must_use]
    pub fn new(
        api_keys: Arc<dyn ApiKeyStore>,
        users: Arc<dyn UserStore>,
        mailer: Arc<dyn Mailer>,
        options: NotificationOptions,
        smtp: SmtpOptions,
    ) -> Self {
        Self {
            api_keys,
            users,
            mailer,
            options,
            smtp,
        }
    }

    fn interval(&self) -> Duration {
        let hours = if self.options.interval_hours <= 0 {
            DEFAULT_INTERVAL_HOURS
        } else {
            self.options.interval_hours
        };
        Duration::from_secs(hours as u64 * 3600)
    }

    fn warning_days(&self) -> i64 {
        if self.options.warning_days <= 0 {
            DEFAULT_WARNING_DAYS
        } else {
            self.options.warning_days
        }
    }

    /// Tick loop; exits on cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval().as_secs(),
            "Key expiry notifier started"
        );
        let mut ticker = tokio::time::interval(self.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Key expiry notifier stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(sent) if sent > 0 => tracing::info!(sent, "Expiry notifications sent"),
                        Ok(_) => tracing::debug!("No expiry notifications due"),
                        Err(e) => tracing::error!(error = %e, "Expiry notification pass failed"),
                    }
                }
            }
        }
    }

    /// One notification pass; returns the number of mails sent.
    pub async fn run_once(&self) -> Result<u32> {
        if !self.options.enabled || self.smtp.host.is_empty() {
            tracing::info!("Expiry notifications disabled or SMTP host empty, skipping pass");
            return Ok(0);
        }

        let now = Utc::now();
        let cutoff = now + chrono::Duration::days(self.warning_days());
        let due = self.api_keys.expiring_unnotified(cutoff).await?;

        let mut sent = 0u32;
        for key in due {
            let Some(user_id) = key.user_id else {
                tracing::debug!(api_key_id = %key.id, "Skipping key without owning user");
                continue;
            };
            let Some(user) = self.users.get_user(user_id).await? else {
                tracing::debug!(api_key_id = %key.id, "Skipping key: owning user not found");
                continue;
            };
            if user.email.trim().is_empty() {
                tracing::debug!(api_key_id = %key.id, "Skipping key: owning user has no email");
                continue;
            }

            let body = compose_notice(&key, now);
            let subject = format!("API key '{}' is expiring", key.name);
            match self.mailer.send(&user.email, &subject, &body).await {
                Ok(()) => {
                    // Flag only after the mail went out: at-most-once.
                    self.api_keys.mark_notified(key.id, now).await?;
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!(api_key_id = %key.id, error = %e, "Expiry notification send failed");
                }
            }
        }
        Ok(sent)
    }
}

/// Days until expiry as shown to the user: 0 once expired, otherwise the
/// number of started days remaining.
#[must_use]
pub fn days_left(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let hours = (expires_at - now).num_hours();
    ((hours as f64 / 24.0).floor() as i64 + 1).max(0)
}

fn compose_notice(key: &ApiKey, now: DateTime<Utc>) -> String {
    let expires_at = key.expires_at.unwrap_or(now);
    let days = days_left(expires_at, now);
    let when = if days == 0 {
        "has expired".to_string()
    } else if days == 1 {
        "expires within a day".to_string()
    } else {
        format!("expires in {days} days")
    };
    format!(
        "Hello,\n\n\
         Your API key '{name}' ({prefix}...) {when}.\n\
         Expiry date: {expiry}\n\n\
         Create a replacement key before then to avoid interruption.\n\n\
         -- The registry\n",
        name = key.name,
        prefix = key.key_prefix,
        when = when,
        expiry = expires_at.format("%Y-%m-%d %H:%M UTC"),
    )
}
