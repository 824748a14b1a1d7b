use serde_json::Value;
use teller_contracts::{ConfirmationSummary, GatePhase, ParamKind, SummaryLine};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::proposal_action_id;
use crate::validator::ValidatedAction;

const HISTORY_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPolicy {
    Replace,
    Reject,
}

impl PendingPolicy {
    pub fn parse(value: &str) -> Self {
        match value {
            "reject" => PendingPolicy::Reject,
            _ => PendingPolicy::Replace,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub elide_threshold: usize,
    pub on_pending: PendingPolicy,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            elide_threshold: 10,
            on_pending: PendingPolicy::Replace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: GatePhase,
    pub to: GatePhase,
    pub action_id: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    /// Read-only: the gate was bypassed and the action may run immediately.
    Execute {
        action_id: String,
        validated: ValidatedAction,
    },
    /// Write: nothing runs until [`Gate::confirm`] is called with this id.
    AwaitConfirmation(ConfirmationSummary),
}

#[derive(Debug, Clone)]
struct Pending {
    summary: ConfirmationSummary,
    validated: ValidatedAction,
}

#[derive(Debug, Clone)]
enum State {
    Idle,
    PendingConfirmation(Box<Pending>),
    Executing { action_id: String },
}

/// Confirmation gate for one session. Write actions must pass through
/// `PendingConfirmation` and an explicit [`Gate::confirm`]; at most one write
/// is `Executing` at a time.
#[derive(Debug, Clone)]
pub struct Gate {
    cfg: GateConfig,
    session_id: String,
    state: State,
    history: Vec<Transition>,
}

impl Gate {
    pub fn new(cfg: GateConfig, session_id: &str) -> Self {
        Self {
            cfg,
            session_id: session_id.to_string(),
            state: State::Idle,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> GatePhase {
        match self.state {
            State::Idle => GatePhase::Idle,
            State::PendingConfirmation(_) => GatePhase::PendingConfirmation,
            State::Executing { .. } => GatePhase::Executing,
        }
    }

    pub fn pending_summary(&self) -> Option<&ConfirmationSummary> {
        match &self.state {
            State::PendingConfirmation(pending) => Some(&pending.summary),
            _ => None,
        }
    }

    pub fn executing_action(&self) -> Option<&str> {
        match &self.state {
            State::Executing { action_id } => Some(action_id),
            _ => None,
        }
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Whether this gate handed `action_id` to execution (within the retained
    /// history).
    pub fn confirmed(&self, action_id: &str) -> bool {
        self.history
            .iter()
            .any(|t| t.reason == "confirmed" && t.action_id == action_id)
    }

    pub fn submit(&mut self, validated: ValidatedAction) -> Result<GateDecision, PipelineError> {
        let proposal = Uuid::new_v4().simple().to_string();
        let action_id = proposal_action_id(&self.session_id, &validated.action, &proposal);

        if validated.read_only() {
            // A read beside a pending or executing write leaves the gate where it is.
            if matches!(self.state, State::Idle) {
                self.record(GatePhase::Idle, GatePhase::Executing, &action_id, "read_only");
            }
            return Ok(GateDecision::Execute {
                action_id,
                validated,
            });
        }

        match &self.state {
            State::Executing { .. } => return Err(PipelineError::SignerBusy),
            State::PendingConfirmation(previous) => match self.cfg.on_pending {
                PendingPolicy::Reject => return Err(PipelineError::ConfirmationPending),
                PendingPolicy::Replace => {
                    let previous_id = previous.summary.action_id.clone();
                    self.record(
                        GatePhase::PendingConfirmation,
                        GatePhase::Idle,
                        &previous_id,
                        "replaced",
                    );
                }
            },
            State::Idle => {}
        }

        let summary = render_summary(&action_id, &validated, self.cfg.elide_threshold);
        self.record(
            GatePhase::Idle,
            GatePhase::PendingConfirmation,
            &action_id,
            "write_requires_confirmation",
        );
        self.state = State::PendingConfirmation(Box::new(Pending {
            summary: summary.clone(),
            validated,
        }));
        Ok(GateDecision::AwaitConfirmation(summary))
    }

    /// Explicit approval. Returns the full, unelided action for execution.
    pub fn confirm(&mut self, action_id: &str) -> Result<ValidatedAction, PipelineError> {
        let pending = match &self.state {
            State::PendingConfirmation(pending) => pending,
            State::Executing { .. } => return Err(PipelineError::SignerBusy),
            State::Idle => return Err(PipelineError::NoPendingAction),
        };
        if pending.summary.action_id != action_id {
            return Err(PipelineError::ActionMismatch(action_id.to_string()));
        }
        let validated = pending.validated.clone();
        self.record(
            GatePhase::PendingConfirmation,
            GatePhase::Executing,
            action_id,
            "confirmed",
        );
        self.state = State::Executing {
            action_id: action_id.to_string(),
        };
        Ok(validated)
    }

    /// Explicit cancellation. No side effects beyond returning to `Idle`.
    pub fn cancel(&mut self) -> Result<ConfirmationSummary, PipelineError> {
        let summary = match &self.state {
            State::PendingConfirmation(pending) => pending.summary.clone(),
            _ => return Err(PipelineError::NoPendingAction),
        };
        self.record(
            GatePhase::PendingConfirmation,
            GatePhase::Idle,
            &summary.action_id,
            "cancelled",
        );
        self.state = State::Idle;
        Ok(summary)
    }

    /// Marks the executing write as finished (terminal outcome, or the user
    /// stopped waiting). A stale id is ignored.
    pub fn finish(&mut self, action_id: &str, reason: &'static str) {
        let matches = matches!(&self.state, State::Executing { action_id: current } if current == action_id);
        if matches {
            self.record(GatePhase::Executing, GatePhase::Idle, action_id, reason);
            self.state = State::Idle;
        }
    }

    fn record(&mut self, from: GatePhase, to: GatePhase, action_id: &str, reason: &'static str) {
        if self.history.len() >= HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(Transition {
            from,
            to,
            action_id: action_id.to_string(),
            reason,
        });
    }
}

pub fn render_summary(
    action_id: &str,
    validated: &ValidatedAction,
    elide_threshold: usize,
) -> ConfirmationSummary {
    let spec = validated.spec();
    let lines = spec
        .labels(&validated.action.parameters)
        .into_iter()
        .map(|line| SummaryLine {
            label: line.label.to_string(),
            value: display_value(line.kind, &line.value, elide_threshold),
        })
        .collect();
    ConfirmationSummary {
        action_id: action_id.to_string(),
        function: spec.name,
        title: spec.title.to_string(),
        lines,
    }
}

/// Display form of a parameter. Addresses and ids longer than the threshold
/// keep their first 6 and last 4 characters; amounts, names and ratios are
/// always shown whole. Never affects the executed value.
pub fn display_value(kind: ParamKind, value: &Value, elide_threshold: usize) -> String {
    let shortened = matches!(
        kind,
        ParamKind::Address | ParamKind::AddressList | ParamKind::AssetId
    );
    let render = |v: &Value| {
        let text = match v {
            Value::String(s) => s.trim().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if shortened {
            elide(&text, elide_threshold)
        } else {
            text
        }
    };
    match value {
        Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(", "),
        other => render(other),
    }
}

pub fn elide(text: &str, threshold: usize) -> String {
    let count = text.chars().count();
    if count <= threshold {
        return text.to_string();
    }
    let head: String = text.chars().take(6).collect();
    let tail: String = text.chars().skip(count.saturating_sub(4)).collect();
    format!("{head}...{tail}")
}
