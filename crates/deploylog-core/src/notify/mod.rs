//! Status notifications.
//!
//! The [`Notifier`] renders a subject and body from the configured templates
//! and hands the message to a [`Transport`], retrying transient failures with
//! exponential backoff. Notification is informational: a failed delivery is
//! logged and reported as `false`, it never aborts a pipeline run.
//!
//! # Template resolution
//!
//! - The subject template is looked up by status. A status without a
//!   template uses [`FALLBACK_SUBJECT`]; an unrecognized status is not an
//!   error.
//! - If substitution fails (for example an unsupported placeholder), the
//!   fallback subject is used instead.

pub mod retry;
pub mod spool;
pub mod template;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use retry::RetryPolicy;
pub use spool::SpoolTransport;
pub use template::{TemplateError, TemplateVars};

/// Subject used when a status has no template or its template fails.
pub const FALLBACK_SUBJECT: &str = "Deployment Validation - {status}";

/// Body used when no body template is configured or it fails to render.
pub const DEFAULT_BODY: &str =
    "Cluster: {cluster}\nInstance: {instance}\nStatus: {status}\n\n{message}";

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
        .expect("address regex is valid")
});

/// Check that `address` looks like a deliverable mail address.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_RE.is_match(address)
}

/// Delivery failures reported by a [`Transport`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeliveryError {
    /// A failure that may succeed when retried.
    #[error("transient delivery failure: {reason}")]
    Transient {
        /// What went wrong.
        reason: String,
    },

    /// A failure that retrying cannot fix (for example a malformed
    /// recipient list).
    #[error("permanent delivery failure: {reason}")]
    Permanent {
        /// What went wrong.
        reason: String,
    },
}

impl DeliveryError {
    /// Whether this error should be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Recipient addresses.
    pub recipients: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

/// Message delivery mechanism.
pub trait Transport: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &'static str;

    /// Deliver one message.
    fn deliver(&self, message: &Notification) -> Result<(), DeliveryError>;
}

/// Template and recipient settings for a [`Notifier`].
#[derive(Debug, Clone, Default)]
pub struct NotifierSettings {
    /// Recipient addresses.
    pub recipients: Vec<String>,
    /// Subject template per status value.
    pub subject_templates: BTreeMap<String, String>,
    /// Body template; empty means [`DEFAULT_BODY`].
    pub body_template: String,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

/// Renders and delivers status notifications.
pub struct Notifier {
    settings: NotifierSettings,
    transport: Box<dyn Transport>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("settings", &self.settings)
            .field("transport", &self.transport.name())
            .finish()
    }
}

impl Notifier {
    /// Create a notifier.
    #[must_use]
    pub fn new(settings: NotifierSettings, transport: Box<dyn Transport>) -> Self {
        Self {
            settings,
            transport,
        }
    }

    /// Build the subject line for a status.
    #[must_use]
    pub fn subject(&self, status: &str, cluster: &str, instance: &str) -> String {
        let vars = TemplateVars {
            cluster,
            instance,
            status,
            message: "",
        };
        let template = self
            .settings
            .subject_templates
            .get(status)
            .map_or(FALLBACK_SUBJECT, String::as_str);

        template::render(template, &vars).unwrap_or_else(|e| {
            warn!(status, error = %e, "subject template failed, using fallback subject");
            fallback_subject(&vars)
        })
    }

    /// Build the message body.
    #[must_use]
    pub fn body(&self, status: &str, cluster: &str, instance: &str, message: &str) -> String {
        let vars = TemplateVars {
            cluster,
            instance,
            status,
            message,
        };
        let template = if self.settings.body_template.is_empty() {
            DEFAULT_BODY
        } else {
            self.settings.body_template.as_str()
        };

        template::render(template, &vars).unwrap_or_else(|e| {
            warn!(status, error = %e, "body template failed, using default body");
            template::render(DEFAULT_BODY, &vars).unwrap_or_else(|_| message.to_string())
        })
    }

    /// Render and deliver a status notification.
    ///
    /// Returns whether delivery ultimately succeeded.
    pub fn notify(&self, status: &str, cluster: &str, instance: &str, message: &str) -> bool {
        let notification = Notification {
            recipients: self.settings.recipients.clone(),
            subject: self.subject(status, cluster, instance),
            body: self.body(status, cluster, instance, message),
        };

        match self.deliver_with_retry(&notification) {
            Ok(attempts) => {
                info!(
                    transport = self.transport.name(),
                    attempts,
                    subject = %notification.subject,
                    "notification delivered"
                );
                true
            },
            Err(e) => {
                warn!(
                    transport = self.transport.name(),
                    error = %e,
                    subject = %notification.subject,
                    "notification failed"
                );
                false
            },
        }
    }

    /// Deliver with bounded retries.
    ///
    /// Returns the number of attempts used on success.
    pub fn deliver_with_retry(&self, notification: &Notification) -> Result<u32, DeliveryError> {
        let max_attempts = self.settings.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.deliver(notification) {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.settings.retry.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, error = %e, "transient delivery failure, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

fn fallback_subject(vars: &TemplateVars<'_>) -> String {
    template::render(FALLBACK_SUBJECT, vars)
        .unwrap_or_else(|_| format!("Deployment Validation - {}", vars.status))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Transport that fails a scripted number of times.
    struct ScriptedTransport {
        failures: Mutex<Vec<DeliveryError>>,
        calls: AtomicU32,
        delivered: Mutex<Vec<Notification>>,
    }

    impl ScriptedTransport {
        fn new(failures: Vec<DeliveryError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for std::sync::Arc<ScriptedTransport> {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn deliver(&self, message: &Notification) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                self.delivered.lock().unwrap().push(message.clone());
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    fn transient() -> DeliveryError {
        DeliveryError::Transient {
            reason: "relay busy".to_string(),
        }
    }

    fn notifier(
        failures: Vec<DeliveryError>,
    ) -> (Notifier, std::sync::Arc<ScriptedTransport>) {
        let transport = std::sync::Arc::new(ScriptedTransport::new(failures));
        let mut subject_templates = BTreeMap::new();
        subject_templates.insert("PASS".to_string(), "[{cluster}] {instance} PASS".to_string());
        subject_templates.insert("FAIL".to_string(), "[{cluster}] {owner} FAIL".to_string());
        let settings = NotifierSettings {
            recipients: vec!["ops@example.com".to_string()],
            subject_templates,
            body_template: String::new(),
            retry: RetryPolicy::immediate(3),
        };
        (
            Notifier::new(settings, Box::new(std::sync::Arc::clone(&transport))),
            transport,
        )
    }

    #[test]
    fn test_subject_uses_status_template() {
        let (notifier, _) = notifier(Vec::new());
        assert_eq!(notifier.subject("PASS", "mena", "FSMHO1U"), "[mena] FSMHO1U PASS");
    }

    #[test]
    fn test_unrecognized_status_uses_fallback_subject() {
        let (notifier, _) = notifier(Vec::new());
        assert_eq!(
            notifier.subject("UNKNOWN", "mena", "FSMHO1U"),
            "Deployment Validation - UNKNOWN"
        );
    }

    #[test]
    fn test_broken_template_uses_fallback_subject() {
        let (notifier, _) = notifier(Vec::new());
        assert_eq!(
            notifier.subject("FAIL", "mena", "FSMHO1U"),
            "Deployment Validation - FAIL"
        );
    }

    #[test]
    fn test_default_body() {
        let (notifier, _) = notifier(Vec::new());
        let body = notifier.body("PASS", "mena", "FSMHO1U", "all good");
        assert_eq!(
            body,
            "Cluster: mena\nInstance: FSMHO1U\nStatus: PASS\n\nall good"
        );
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let (notifier, transport) = notifier(vec![transient(), transient()]);

        assert!(notifier.notify("PASS", "mena", "FSMHO1U", "ok"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let (notifier, transport) = notifier(vec![transient(), transient(), transient()]);

        assert!(!notifier.notify("PASS", "mena", "FSMHO1U", "ok"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let (notifier, transport) = notifier(vec![DeliveryError::Permanent {
            reason: "bad recipients".to_string(),
        }]);

        assert!(!notifier.notify("FAIL", "mena", "FSMHO1U", "broken"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("release.ops+dl@example.co"));
        assert!(!is_valid_address("release ops@example.com"));
        assert!(!is_valid_address("ops@localhost"));
    }
}
