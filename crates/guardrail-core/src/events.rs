//! Audit and alert events, and the sinks that receive them.
//!
//! Sinks are fire-and-forget: `record`/`notify` never return an error, and
//! the engine's correctness never depends on delivery. Storage, retention,
//! and multi-channel delivery live outside this controller.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::Scope;

/// What an audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RecommendationAccepted,
    LimitsApplied,
    DryRunSkippedApply,
    TenantSkipped,
    BreakerTransition,
    BreakerThresholdAdapted,
    EmergencyTransition,
    EmergencyRecoveryStep,
    EmergencyRecoveryAborted,
    ConfigReloaded,
    ConfigRejected,
}

/// Structured audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: u64,
    pub scope: Scope,
    pub action: AuditAction,
    pub reason: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl AuditEvent {
    pub fn new(timestamp: u64, scope: Scope, action: AuditAction, reason: impl Into<String>) -> Self {
        Self {
            timestamp,
            scope,
            action,
            reason: reason.into(),
            before: None,
            after: None,
        }
    }

    /// Attach before/after values.
    pub fn with_change(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}

/// Alert priority, P0 being the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertPriority {
    P0,
    P1,
    P2,
    P3,
}

/// Subsystem raising an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Analyzer,
    DecisionEngine,
    CircuitBreaker,
    EmergencyController,
    Reconciler,
}

/// Typed alert handed to the alerting subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub timestamp: u64,
    pub priority: AlertPriority,
    pub component: Component,
    pub scope: Scope,
    pub message: String,
}

/// Receives audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Receives alerts.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: AlertEvent);
}

/// Writes audit events and alerts to the tracing pipeline.
///
/// Audit events go to the `guardrail::audit` target and alerts to
/// `guardrail::alert`, so a subscriber can route them separately.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: AuditEvent) {
        info!(
            target: "guardrail::audit",
            timestamp = event.timestamp,
            scope = %event.scope,
            action = ?event.action,
            reason = %event.reason,
            before = event.before.as_deref().unwrap_or("-"),
            after = event.after.as_deref().unwrap_or("-"),
            "audit"
        );
    }
}

impl AlertSink for TracingSink {
    fn notify(&self, alert: AlertEvent) {
        match alert.priority {
            AlertPriority::P0 | AlertPriority::P1 => error!(
                target: "guardrail::alert",
                priority = ?alert.priority,
                component = ?alert.component,
                scope = %alert.scope,
                message = %alert.message,
                "alert"
            ),
            AlertPriority::P2 | AlertPriority::P3 => warn!(
                target: "guardrail::alert",
                priority = ?alert.priority,
                component = ?alert.component,
                scope = %alert.scope,
                message = %alert.message,
                "alert"
            ),
        }
    }
}

/// Keeps every event in memory. Used by tests and by embedders that want to
/// inspect what the controller did.
#[derive(Debug, Default)]
pub struct MemorySink {
    audit: Mutex<Vec<AuditEvent>>,
    alerts: Mutex<Vec<AlertEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Audit events with the given action.
    pub fn audit_with(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.audit_events()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.audit.lock() {
            events.push(event);
        }
    }
}

impl AlertSink for MemorySink {
    fn notify(&self, alert: AlertEvent) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects_events() {
        let sink = MemorySink::new();
        sink.record(
            AuditEvent::new(10, Scope::Global, AuditAction::ConfigReloaded, "file changed")
                .with_change(Some("a".into()), Some("b".into())),
        );
        sink.notify(AlertEvent {
            timestamp: 10,
            priority: AlertPriority::P1,
            component: Component::CircuitBreaker,
            scope: Scope::tenant("acme"),
            message: "tripped".into(),
        });

        assert_eq!(sink.audit_events().len(), 1);
        assert_eq!(sink.audit_with(AuditAction::ConfigReloaded)[0].after.as_deref(), Some("b"));
        assert!(sink.audit_with(AuditAction::TenantSkipped).is_empty());
        assert_eq!(sink.alerts()[0].priority, AlertPriority::P1);
    }

    #[test]
    fn priorities_order_by_urgency() {
        assert!(AlertPriority::P0 < AlertPriority::P3);
    }
}
