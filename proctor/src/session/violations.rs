//! Integrity violation detection and escalation.
//!
//! Host events (visibility, fullscreen, key presses) are classified against a
//! fixed policy; recorded violations go into an append-only log whose length
//! drives the one-shot escalation to forced submission. Pushing violations to
//! the audit collaborator is best-effort and never gates escalation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::session::collaborators::MonitoringApi;
use crate::session::protocol::{Violation, ViolationType};

/// Upper bound on violations waiting for audit delivery
const MAX_PENDING_AUDIT: usize = 256;

/// A key press as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCombo {
    pub key: String,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub meta: bool,
}

impl KeyCombo {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: false,
            shift: false,
            alt: false,
            meta: false,
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }
}

impl std::fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ctrl {
            write!(f, "Ctrl+")?;
        }
        if self.meta {
            write!(f, "Meta+")?;
        }
        if self.alt {
            write!(f, "Alt+")?;
        }
        if self.shift {
            write!(f, "Shift+")?;
        }
        write!(f, "{}", self.key)
    }
}

/// Browser-boundary events the core understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    VisibilityHidden,
    VisibilityVisible,
    FullscreenEntered,
    FullscreenExited,
    KeyDown(KeyCombo),
}

/// Modifier requirement of a forbidden combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modifier {
    None,
    /// Ctrl on Windows/Linux, Cmd on macOS
    Command,
    CommandShift,
    CommandAlt,
}

#[derive(Debug, Clone)]
struct ForbiddenCombo {
    label: &'static str,
    key: &'static str,
    modifier: Modifier,
}

impl ForbiddenCombo {
    const fn new(label: &'static str, key: &'static str, modifier: Modifier) -> Self {
        Self {
            label,
            key,
            modifier,
        }
    }

    fn matches(&self, combo: &KeyCombo) -> bool {
        if !combo.key.eq_ignore_ascii_case(self.key) {
            return false;
        }
        let command = combo.ctrl || combo.meta;
        match self.modifier {
            Modifier::None => !command && !combo.alt,
            Modifier::Command => command && !combo.shift && !combo.alt,
            Modifier::CommandShift => command && combo.shift,
            Modifier::CommandAlt => command && combo.alt,
        }
    }
}

/// Denylist of key combinations whose default action is always suppressed
static FORBIDDEN_COMBOS: Lazy<Vec<ForbiddenCombo>> = Lazy::new(|| {
    vec![
        ForbiddenCombo::new("copy", "c", Modifier::Command),
        ForbiddenCombo::new("cut", "x", Modifier::Command),
        ForbiddenCombo::new("paste", "v", Modifier::Command),
        ForbiddenCombo::new("select all", "a", Modifier::Command),
        ForbiddenCombo::new("view source", "u", Modifier::Command),
        ForbiddenCombo::new("save page", "s", Modifier::Command),
        ForbiddenCombo::new("print", "p", Modifier::Command),
        ForbiddenCombo::new("developer tools", "F12", Modifier::None),
        ForbiddenCombo::new("developer tools", "i", Modifier::CommandShift),
        ForbiddenCombo::new("developer tools", "i", Modifier::CommandAlt),
        ForbiddenCombo::new("developer console", "j", Modifier::CommandShift),
        ForbiddenCombo::new("element inspector", "c", Modifier::CommandShift),
    ]
});

/// Returns the label of the forbidden combination matched by `combo`, if any.
pub fn forbidden_combo(combo: &KeyCombo) -> Option<&'static str> {
    FORBIDDEN_COMBOS
        .iter()
        .find(|f| f.matches(combo))
        .map(|f| f.label)
}

/// What the host must know to classify an event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionContext {
    pub fullscreen_required: bool,
    /// A file picker or the document camera is open on purpose
    pub cooperative_overlay_open: bool,
}

/// Result of classifying one host event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub violation: Option<(ViolationType, String)>,
    /// The host must cancel the event's default action
    pub suppress_default: bool,
}

impl Classification {
    fn ignore() -> Self {
        Self {
            violation: None,
            suppress_default: false,
        }
    }
}

/// Classify a host event.
///
/// While a cooperative overlay is open, visibility and fullscreen changes are
/// expected and not recorded. Forbidden keys are suppressed in every case.
pub fn classify(event: &HostEvent, ctx: DetectionContext) -> Classification {
    match event {
        HostEvent::VisibilityHidden if !ctx.cooperative_overlay_open => Classification {
            violation: Some((
                ViolationType::TabSwitch,
                "exam tab was hidden".to_string(),
            )),
            suppress_default: false,
        },
        HostEvent::FullscreenExited
            if ctx.fullscreen_required && !ctx.cooperative_overlay_open =>
        {
            Classification {
                violation: Some((
                    ViolationType::FullscreenExit,
                    "left fullscreen mode".to_string(),
                )),
                suppress_default: false,
            }
        }
        HostEvent::KeyDown(combo) => match forbidden_combo(combo) {
            Some(label) => Classification {
                violation: Some((
                    ViolationType::ProhibitedKeys,
                    format!("{} ({})", label, combo),
                )),
                suppress_default: true,
            },
            None => Classification::ignore(),
        },
        _ => Classification::ignore(),
    }
}

/// Outcome of recording one violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationOutcome {
    /// Below threshold; `remaining` more violations are tolerated before the
    /// one that forces submission
    Warn { remaining: u32 },
    /// This violation reached the threshold
    Escalate,
    /// Threshold was already reached earlier
    AfterEscalation,
}

/// Append-only violation log with one-shot escalation
#[derive(Debug, Clone)]
pub struct ViolationMonitor {
    violations: Vec<Violation>,
    threshold: u32,
    escalated: bool,
}

impl ViolationMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            violations: Vec::new(),
            threshold: threshold.max(1),
            escalated: false,
        }
    }

    /// Append a violation and evaluate the threshold
    pub fn record(
        &mut self,
        violation_type: ViolationType,
        details: impl Into<String>,
        at: DateTime<Utc>,
    ) -> (Violation, ViolationOutcome) {
        let violation = Violation::new(violation_type, details, at);
        self.violations.push(violation.clone());
        let outcome = self.evaluate();
        debug!(
            violation_type = %violation_type,
            count = self.violations.len(),
            ?outcome,
            "violation recorded"
        );
        (violation, outcome)
    }

    /// Re-apply violations confirmed before a restart.
    ///
    /// Returns `Some(Escalate)` when the restored log already meets the threshold.
    pub fn restore(&mut self, prior: Vec<Violation>) -> Option<ViolationOutcome> {
        if prior.is_empty() {
            return None;
        }
        self.violations.extend(prior);
        match self.evaluate() {
            ViolationOutcome::Escalate => Some(ViolationOutcome::Escalate),
            _ => None,
        }
    }

    fn evaluate(&mut self) -> ViolationOutcome {
        let count = self.violations.len() as u32;
        if count >= self.threshold {
            if self.escalated {
                ViolationOutcome::AfterEscalation
            } else {
                self.escalated = true;
                ViolationOutcome::Escalate
            }
        } else {
            ViolationOutcome::Warn {
                remaining: self.threshold - count - 1,
            }
        }
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn has_escalated(&self) -> bool {
        self.escalated
    }
}

/// Best-effort queue of violations awaiting delivery to the audit collaborator
#[derive(Default)]
pub struct AuditOutbox {
    pending: StdMutex<VecDeque<Violation>>,
    /// Serializes flushes so delivery order matches detection order
    flush_lock: tokio::sync::Mutex<()>,
}

impl AuditOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, violation: Violation) {
        let mut pending = self.pending.lock().unwrap();
        if pending.len() >= MAX_PENDING_AUDIT {
            warn!("audit outbox full, dropping oldest pending violation");
            pending.pop_front();
        }
        pending.push_back(violation);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Push pending violations in order; stops at the first failure and keeps
    /// the rest for the next flush. Returns the number delivered.
    pub async fn flush(&self, monitoring: Arc<dyn MonitoringApi>, session_id: Option<String>) -> usize {
        let Some(session_id) = session_id else {
            debug!("no monitoring session, violations stay queued");
            return 0;
        };

        let _guard = self.flush_lock.lock().await;
        let mut delivered = 0;

        loop {
            let next = self.pending.lock().unwrap().pop_front();
            let Some(violation) = next else { break };

            match monitoring.push_violation(&session_id, &violation).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(error = %e, "failed to push violation, will retry");
                    self.pending.lock().unwrap().push_front(violation);
                    break;
                }
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::memory::InMemoryMonitoring;

    #[test]
    fn test_threshold_three_warns_then_escalates_once() {
        let mut monitor = ViolationMonitor::new(3);
        let now = Utc::now();

        let (_, first) = monitor.record(ViolationType::TabSwitch, "1", now);
        let (_, second) = monitor.record(ViolationType::TabSwitch, "2", now);
        let (_, third) = monitor.record(ViolationType::FullscreenExit, "3", now);
        let (_, fourth) = monitor.record(ViolationType::ProhibitedKeys, "4", now);

        assert_eq!(first, ViolationOutcome::Warn { remaining: 1 });
        assert_eq!(second, ViolationOutcome::Warn { remaining: 0 });
        assert_eq!(third, ViolationOutcome::Escalate);
        assert_eq!(fourth, ViolationOutcome::AfterEscalation);
        assert_eq!(monitor.len(), 4);
        assert!(monitor.has_escalated());
    }

    #[test]
    fn test_escalate_fires_exactly_once_for_any_sequence() {
        for threshold in 1..6u32 {
            let mut monitor = ViolationMonitor::new(threshold);
            let mut escalations = 0;
            let mut last_len = 0;
            for i in 0..10 {
                let (_, outcome) = monitor.record(ViolationType::TabSwitch, i.to_string(), Utc::now());
                assert!(monitor.len() > last_len);
                last_len = monitor.len();
                if outcome == ViolationOutcome::Escalate {
                    escalations += 1;
                    assert_eq!(monitor.len() as u32, threshold);
                }
            }
            assert_eq!(escalations, 1, "threshold {}", threshold);
        }
    }

    #[test]
    fn test_log_preserves_detection_order() {
        let mut monitor = ViolationMonitor::new(10);
        monitor.record(ViolationType::ProhibitedKeys, "a", Utc::now());
        monitor.record(ViolationType::TabSwitch, "b", Utc::now());
        let details: Vec<_> = monitor.violations().iter().map(|v| v.details.as_str()).collect();
        assert_eq!(details, vec!["a", "b"]);
    }

    #[test]
    fn test_restore_at_threshold_escalates() {
        let mut monitor = ViolationMonitor::new(2);
        let prior = vec![
            Violation::new(ViolationType::TabSwitch, "x", Utc::now()),
            Violation::new(ViolationType::TabSwitch, "y", Utc::now()),
        ];
        assert_eq!(monitor.restore(prior), Some(ViolationOutcome::Escalate));
        let (_, next) = monitor.record(ViolationType::TabSwitch, "z", Utc::now());
        assert_eq!(next, ViolationOutcome::AfterEscalation);
    }

    #[test]
    fn test_forbidden_keys_are_suppressed_and_recorded() {
        let ctx = DetectionContext::default();
        for combo in [
            KeyCombo::new("c").ctrl(),
            KeyCombo::new("V").meta(),
            KeyCombo::new("a").ctrl(),
            KeyCombo::new("u").ctrl(),
            KeyCombo::new("F12"),
            KeyCombo::new("i").ctrl().shift(),
            KeyCombo::new("i").meta().alt(),
        ] {
            let result = classify(&HostEvent::KeyDown(combo.clone()), ctx);
            assert!(result.suppress_default, "{} should be suppressed", combo);
            assert_eq!(
                result.violation.map(|(t, _)| t),
                Some(ViolationType::ProhibitedKeys)
            );
        }
    }

    #[test]
    fn test_plain_typing_is_allowed() {
        let ctx = DetectionContext::default();
        for combo in [KeyCombo::new("c"), KeyCombo::new("C").shift(), KeyCombo::new("Enter")] {
            assert_eq!(
                classify(&HostEvent::KeyDown(combo), ctx),
                Classification::ignore()
            );
        }
    }

    #[test]
    fn test_key_suppression_survives_cooperative_overlay() {
        let ctx = DetectionContext {
            fullscreen_required: true,
            cooperative_overlay_open: true,
        };
        let result = classify(&HostEvent::KeyDown(KeyCombo::new("v").ctrl()), ctx);
        assert!(result.suppress_default);
        assert!(result.violation.is_some());
    }

    #[test]
    fn test_overlay_suspends_visibility_and_fullscreen() {
        let ctx = DetectionContext {
            fullscreen_required: true,
            cooperative_overlay_open: true,
        };
        assert!(classify(&HostEvent::VisibilityHidden, ctx).violation.is_none());
        assert!(classify(&HostEvent::FullscreenExited, ctx).violation.is_none());
    }

    #[test]
    fn test_fullscreen_exit_only_counts_when_required() {
        let relaxed = DetectionContext::default();
        assert!(classify(&HostEvent::FullscreenExited, relaxed).violation.is_none());

        let strict = DetectionContext {
            fullscreen_required: true,
            cooperative_overlay_open: false,
        };
        assert_eq!(
            classify(&HostEvent::FullscreenExited, strict)
                .violation
                .map(|(t, _)| t),
            Some(ViolationType::FullscreenExit)
        );
        assert_eq!(
            classify(&HostEvent::VisibilityHidden, strict)
                .violation
                .map(|(t, _)| t),
            Some(ViolationType::TabSwitch)
        );
    }

    #[tokio::test]
    async fn test_outbox_keeps_failed_violations_in_order() {
        let monitoring = Arc::new(InMemoryMonitoring::new());
        let outbox = AuditOutbox::new();
        outbox.enqueue(Violation::new(ViolationType::TabSwitch, "first", Utc::now()));
        outbox.enqueue(Violation::new(ViolationType::TabSwitch, "second", Utc::now()));

        monitoring.fail_violation_pushes(true);
        let delivered = outbox
            .flush(monitoring.clone(), Some("mon-1".to_string()))
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(outbox.pending_len(), 2);

        monitoring.fail_violation_pushes(false);
        let delivered = outbox
            .flush(monitoring.clone(), Some("mon-1".to_string()))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(outbox.pending_len(), 0);

        let details: Vec<_> = monitoring
            .violations()
            .into_iter()
            .map(|v| v.details)
            .collect();
        assert_eq!(details, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_outbox_waits_for_monitoring_session() {
        let monitoring = Arc::new(InMemoryMonitoring::new());
        let outbox = AuditOutbox::new();
        outbox.enqueue(Violation::new(ViolationType::TabSwitch, "x", Utc::now()));
        assert_eq!(outbox.flush(monitoring, None).await, 0);
        assert_eq!(outbox.pending_len(), 1);
    }
}
