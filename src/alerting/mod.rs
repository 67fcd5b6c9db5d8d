//! Alert fan-out
//!
//! Every detected failure goes to two independent sinks: a notifier for
//! the person at the console and the durable audit log. A failing sink
//! is reported and never keeps the other one from running.

pub mod notifier;

pub use notifier::{
    notifier_for, ConsoleNotifier, DesktopNotifier, Notifier, NullNotifier, ToastNotifier,
};

use thiserror::Error;

use crate::models::AuthFailureEvent;
use crate::output::AuditLog;

/// Errors raised by alert sinks
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} failed: {detail}")]
    Command { program: String, detail: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which sinks accepted an alert
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub notified: bool,
    pub logged: bool,
}

/// Sends detected failures to the notifier and the audit log
pub struct AlertDispatcher {
    title: String,
    notifier: Box<dyn Notifier>,
    audit_log: Box<dyn AuditLog>,
}

impl AlertDispatcher {
    pub fn new(
        title: impl Into<String>,
        notifier: Box<dyn Notifier>,
        audit_log: Box<dyn AuditLog>,
    ) -> Self {
        AlertDispatcher {
            title: title.into(),
            notifier,
            audit_log,
        }
    }

    /// Hand an event to both sinks
    pub fn dispatch(&self, event: &AuthFailureEvent) -> DispatchOutcome {
        let message = event.summary();
        log::warn!("ALERT: {}", message);

        let notified = match self.notifier.notify(&self.title, &message) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Notification failed: {}", e);
                false
            }
        };

        let logged = match self.audit_log.append(&message) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Audit log write failed: {}", e);
                false
            }
        };

        DispatchOutcome { notified, logged }
    }

    /// Append a lifecycle message to the audit log only
    pub fn record(&self, message: &str) {
        if let Err(e) = self.audit_log.append(message) {
            log::error!("Audit log write failed: {}", e);
        }
    }
}
