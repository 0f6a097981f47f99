//! External collaborator seams (spec §6, out-of-scope subsystems).
//!
//! CRM, billing, OAuth and the workflow engine are explicitly out of scope,
//! but the core's call sites into them need to be real and testable. Each
//! collaborator is a small trait with a default in-process implementation,
//! mirroring how the teacher keeps `PresenceTracker`/`TypingTracker` as
//! concrete, swappable, in-memory collaborators rather than inlining their
//! logic into route handlers.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptTransition {
    OptedOut,
    OptedIn,
}

/// Opt-in/opt-out keyword matching (§4.4 step 3).
pub trait OptKeywordHandler: Send + Sync {
    fn classify(&self, body: &str) -> Option<OptTransition>;
}

/// Default keyword list grounded in common WhatsApp BSP conventions; a real
/// deployment would likely make this per-workspace configurable, but the
/// spec treats this handler's internals as out of scope.
pub struct DefaultOptKeywordHandler {
    opt_out: HashSet<&'static str>,
    opt_in: HashSet<&'static str>,
}

impl DefaultOptKeywordHandler {
    pub fn new() -> Self {
        DefaultOptKeywordHandler {
            opt_out: ["stop", "unsubscribe", "cancel", "optout", "opt-out"]
                .into_iter()
                .collect(),
            opt_in: ["start", "subscribe", "optin", "opt-in"].into_iter().collect(),
        }
    }
}

impl Default for DefaultOptKeywordHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl OptKeywordHandler for DefaultOptKeywordHandler {
    fn classify(&self, body: &str) -> Option<OptTransition> {
        let normalized = body.trim().to_lowercase();
        if self.opt_out.contains(normalized.as_str()) {
            return Some(OptTransition::OptedOut);
        }
        if self.opt_in.contains(normalized.as_str()) {
            return Some(OptTransition::OptedIn);
        }
        None
    }
}

/// Workflow engine event emission (§4.4 step 9c, §4.5).
pub trait WorkflowSink: Send + Sync {
    fn message_received(&self, workspace_id: &str, message_id: &str);
    fn status_updated(&self, workspace_id: &str, message_id: &str, status: &str);
}

/// No-op sink that only logs via `tracing`; the real workflow subsystem is
/// out of scope per spec §1/§6.
pub struct LoggingWorkflowSink;

impl WorkflowSink for LoggingWorkflowSink {
    fn message_received(&self, workspace_id: &str, message_id: &str) {
        tracing::info!(workspace_id, message_id, "workflow.message_received");
    }

    fn status_updated(&self, workspace_id: &str, message_id: &str, status: &str) {
        tracing::info!(workspace_id, message_id, status, "workflow.status_updated");
    }
}

/// Billing status lookup for the outbound sender's billing gate (§4.7 step 4).
pub trait BillingGate: Send + Sync {
    /// Returns `Err` with a reason if the workspace is blocked from sending.
    fn check(&self, billing_status: &str, trial_allows_send: bool) -> Result<(), BillingBlock>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingBlock {
    TrialNoSend,
    PastDue,
    Suspended,
}

/// Reads the billing gate directly off the workspace row; billing itself
/// (invoicing, plan changes) is out of scope.
pub struct DefaultBillingGate;

impl BillingGate for DefaultBillingGate {
    fn check(&self, billing_status: &str, trial_allows_send: bool) -> Result<(), BillingBlock> {
        match billing_status {
            "trialing" if !trial_allows_send => Err(BillingBlock::TrialNoSend),
            "past_due" => Err(BillingBlock::PastDue),
            "suspended" => Err(BillingBlock::Suspended),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_an_opt_out() {
        let handler = DefaultOptKeywordHandler::new();
        assert_eq!(handler.classify("STOP"), Some(OptTransition::OptedOut));
        assert_eq!(handler.classify("  stop  "), Some(OptTransition::OptedOut));
    }

    #[test]
    fn ordinary_text_is_not_a_transition() {
        let handler = DefaultOptKeywordHandler::new();
        assert_eq!(handler.classify("Hi there"), None);
    }

    #[test]
    fn trialing_without_send_permission_blocks() {
        let gate = DefaultBillingGate;
        assert_eq!(gate.check("trialing", false), Err(BillingBlock::TrialNoSend));
        assert_eq!(gate.check("trialing", true), Ok(()));
    }
}
