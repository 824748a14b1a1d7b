use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use teller_contracts::{
    Action, ConfirmationSummary, FunctionName, GatePhase, SubmissionRecord, SubmissionStatus,
    SummaryLine,
};
use teller_kernel::gate::render_summary;
use teller_kernel::{
    build_prompt, parse_reply, required_lookups, validate, Gate, GateConfig, GateDecision, Intent,
    PipelineError, TournamentFacts, ValidatedAction, ValidationContext,
};
use tokio::sync::Mutex;

use crate::audit::{AuditJsonl, AuditRecord};
use crate::classifier::Classifier;
use crate::executor::{outcome_for, Executor, WriteOutcome};
use crate::ledger::{LedgerClient, LedgerError};
use crate::reconciler::{ReconciledState, Reconciler};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Chat {
        message: String,
    },
    Read {
        action_id: String,
        function: FunctionName,
        message: String,
        data: Value,
    },
    Confirm {
        summary: ConfirmationSummary,
    },
    Submitted {
        action_id: String,
        outcome: WriteOutcome,
    },
    Cancelled {
        action_id: String,
    },
}

impl Reply {
    pub fn message(&self) -> String {
        match self {
            Reply::Chat { message } | Reply::Read { message, .. } => message.clone(),
            Reply::Confirm { summary } => summary.title.clone(),
            Reply::Submitted { outcome, .. } => outcome.message().to_string(),
            Reply::Cancelled { .. } => "Transaction cancelled.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DryRun {
    Chat {
        message: String,
    },
    Valid {
        action: Action,
        read_only: bool,
        title: String,
        lines: Vec<SummaryLine>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub phase: GatePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<ConfirmationSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executing: Option<String>,
    pub history: Vec<Value>,
}

/// Utterance to outcome, one confirmation gate per session.
pub struct Pipeline {
    classifier: Arc<dyn Classifier>,
    ledger: Arc<dyn LedgerClient>,
    executor: Arc<Executor>,
    reconciler: Arc<Reconciler>,
    audit: Arc<AuditJsonl>,
    gate_cfg: GateConfig,
    sessions: Mutex<HashMap<String, Arc<Mutex<Gate>>>>,
}

impl Pipeline {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        ledger: Arc<dyn LedgerClient>,
        executor: Arc<Executor>,
        reconciler: Arc<Reconciler>,
        audit: Arc<AuditJsonl>,
        gate_cfg: GateConfig,
    ) -> Self {
        Self {
            classifier,
            ledger,
            executor,
            reconciler,
            audit,
            gate_cfg,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    async fn gate(&self, session_id: &str) -> Arc<Mutex<Gate>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Gate::new(self.gate_cfg.clone(), session_id))))
            .clone()
    }

    async fn interpret(&self, session_id: &str, utterance: &str) -> Result<Intent, PipelineError> {
        let result = match self.classifier.complete(&build_prompt(utterance)).await {
            Ok(raw) => parse_reply(&raw),
            Err(err) => Err(err.into()),
        };
        match &result {
            Ok(Intent::Chat(_)) => {
                tracing::debug!(session_id, "classifier answered conversationally");
                self.audit
                    .append(AuditRecord::new(session_id, "", "parse", "chat", "intent.chat"))
                    .await;
            }
            Ok(Intent::Action(action)) => {
                tracing::info!(session_id, function = %action.function, "intent parsed");
                self.audit
                    .append(
                        AuditRecord::new(session_id, "", "parse", "action", "intent.action")
                            .with_detail(json!({"function": action.function.as_str()})),
                    )
                    .await;
            }
            Err(err) => {
                tracing::warn!(session_id, code = err.code(), error = %err, "intent rejected");
                self.audit
                    .append(AuditRecord::new(session_id, "", "parse", "error", err.code()))
                    .await;
            }
        }
        result
    }

    /// Read lookups a validation needs. A missing tournament is left out so
    /// the validator can report it against the field.
    async fn context_for(&self, action: &Action) -> Result<ValidationContext, PipelineError> {
        let mut ctx = ValidationContext::default();
        for id in required_lookups(action) {
            match self.ledger.get_tournament_details(id).await {
                Ok(record) => {
                    ctx = ctx.with_tournament(
                        id,
                        TournamentFacts {
                            status: record.status,
                            split_ratios: record.split_ratios,
                        },
                    );
                }
                Err(LedgerError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(ctx)
    }

    async fn check(&self, session_id: &str, action: Action) -> Result<ValidatedAction, PipelineError> {
        let ctx = self.context_for(&action).await?;
        let function = action.function;
        validate(action, &ctx).map_err(|err| {
            tracing::info!(session_id, function = %function, field = %err.field, reason = %err.reason, "action rejected");
            PipelineError::from(err)
        })
    }

    pub async fn handle_utterance(
        &self,
        session_id: &str,
        utterance: &str,
    ) -> Result<Reply, PipelineError> {
        match self.interpret(session_id, utterance).await? {
            Intent::Chat(message) => Ok(Reply::Chat { message }),
            Intent::Action(action) => self.submit_action(session_id, action).await,
        }
    }

    /// Parser and validator only. Never touches the gate or the executor.
    pub async fn validate_only(&self, utterance: &str) -> Result<DryRun, PipelineError> {
        match self.interpret("validate-only", utterance).await? {
            Intent::Chat(message) => Ok(DryRun::Chat { message }),
            Intent::Action(action) => {
                let validated = self.check("validate-only", action).await?;
                Ok(dry_run(validated))
            }
        }
    }

    pub async fn validate_action(&self, action: Action) -> Result<DryRun, PipelineError> {
        let validated = self.check("validate-only", action).await?;
        Ok(dry_run(validated))
    }

    pub async fn submit_action(&self, session_id: &str, action: Action) -> Result<Reply, PipelineError> {
        let validated = match self.check(session_id, action).await {
            Ok(v) => v,
            Err(err) => {
                self.audit
                    .append(AuditRecord::new(session_id, "", "validate", "rejected", err.code()))
                    .await;
                return Err(err);
            }
        };

        let gate = self.gate(session_id).await;
        let decision = {
            let mut gate = gate.lock().await;
            self.sync(&mut gate).await;
            gate.submit(validated)
        };
        match decision {
            Err(err) => {
                tracing::info!(session_id, code = err.code(), "gate refused action");
                Err(err)
            }
            Ok(GateDecision::Execute {
                action_id,
                validated,
            }) => {
                self.audit
                    .append(AuditRecord::new(session_id, &action_id, "gate", "bypassed", "gate.read_only"))
                    .await;
                let read = self.executor.execute_read(&validated).await?;
                Ok(Reply::Read {
                    action_id,
                    function: validated.action.function,
                    message: read.message,
                    data: read.data,
                })
            }
            Ok(GateDecision::AwaitConfirmation(summary)) => {
                tracing::info!(session_id, action_id = %summary.action_id, function = %summary.function, "awaiting confirmation");
                self.audit
                    .append(
                        AuditRecord::new(session_id, &summary.action_id, "gate", "pending", "gate.pending")
                            .with_detail(serde_json::to_value(&summary).unwrap_or(Value::Null)),
                    )
                    .await;
                Ok(Reply::Confirm { summary })
            }
        }
    }

    /// Approves the session's pending write. Confirming an id this session
    /// already handed to execution returns that submission instead.
    pub async fn confirm(&self, session_id: &str, action_id: &str) -> Result<Reply, PipelineError> {
        let gate = self.gate(session_id).await;
        let validated = {
            let mut gate = gate.lock().await;
            self.sync(&mut gate).await;
            if gate.confirmed(action_id) {
                if let Some(existing) = self.executor.submission_for_action(action_id).await {
                    return Ok(Reply::Submitted {
                        action_id: action_id.to_string(),
                        outcome: outcome_for(existing, Vec::new())?,
                    });
                }
            }
            gate.confirm(action_id)?
        };
        tracing::info!(session_id, action_id, "action confirmed");
        self.audit
            .append(AuditRecord::new(session_id, action_id, "gate", "confirmed", "gate.confirmed"))
            .await;

        let result = self
            .executor
            .submit_write(session_id, action_id, &validated)
            .await;

        let mut gate = gate.lock().await;
        match &result {
            Ok(WriteOutcome::Pending { .. }) => {}
            Ok(WriteOutcome::Settled { .. }) => gate.finish(action_id, "settled"),
            Err(err) => {
                tracing::warn!(session_id, action_id, code = err.code(), "execution failed");
                gate.finish(action_id, err.code());
            }
        }
        result.map(|outcome| Reply::Submitted {
            action_id: action_id.to_string(),
            outcome,
        })
    }

    pub async fn cancel(&self, session_id: &str) -> Result<Reply, PipelineError> {
        let gate = self.gate(session_id).await;
        let summary = gate.lock().await.cancel()?;
        tracing::info!(session_id, action_id = %summary.action_id, "action cancelled");
        self.audit
            .append(AuditRecord::new(session_id, &summary.action_id, "gate", "cancelled", "gate.cancelled"))
            .await;
        Ok(Reply::Cancelled {
            action_id: summary.action_id,
        })
    }

    /// Stops the UI wait on a submission and frees the session's gate.
    pub async fn abandon(&self, tx_hash: &str) -> Result<Option<Value>, PipelineError> {
        let Some(record) = self.executor.abandon(tx_hash).await? else {
            return Ok(None);
        };
        let gates: Vec<Arc<Mutex<Gate>>> = self.sessions.lock().await.values().cloned().collect();
        for gate in gates {
            gate.lock().await.finish(&record.action_id, "abandoned");
        }
        self.audit
            .append(AuditRecord::new("", &record.action_id, "execute", "abandoned", "ledger.abandoned"))
            .await;
        Ok(Some(serde_json::to_value(&record).unwrap_or(Value::Null)))
    }

    /// Settles detached submissions, then rebuilds the asset read model.
    pub async fn reconcile(
        &self,
    ) -> Result<(ReconciledState, Vec<SubmissionRecord>), PipelineError> {
        let settled = self.executor.settle_in_flight().await?;
        let state = self.reconciler.reconcile().await?;
        self.audit
            .append(
                AuditRecord::new("", "", "reconcile", "complete", "reconcile.complete").with_detail(
                    json!({
                        "assets": state.assets.len(),
                        "gaps": state.gaps.keys().collect::<Vec<_>>(),
                        "settled": settled.iter().map(|r| r.tx_hash.as_str()).collect::<Vec<_>>(),
                    }),
                ),
            )
            .await;
        Ok((state, settled))
    }

    pub async fn session(&self, session_id: &str) -> SessionView {
        let gate = self.gate(session_id).await;
        let mut gate = gate.lock().await;
        self.sync(&mut gate).await;
        SessionView {
            session_id: session_id.to_string(),
            phase: gate.phase(),
            pending: gate.pending_summary().cloned(),
            executing: gate.executing_action().map(str::to_string),
            history: gate
                .history()
                .iter()
                .map(|t| {
                    json!({
                        "from": t.from,
                        "to": t.to,
                        "action_id": t.action_id,
                        "reason": t.reason,
                    })
                })
                .collect(),
        }
    }

    /// Releases a gate whose detached submission has since settled.
    async fn sync(&self, gate: &mut Gate) {
        let Some(action_id) = gate.executing_action().map(str::to_string) else {
            return;
        };
        if let Some(record) = self.executor.submission_for_action(&action_id).await {
            if record.status != SubmissionStatus::InFlight || record.abandoned {
                gate.finish(&action_id, record.status.as_str());
            }
        }
    }
}

fn dry_run(validated: ValidatedAction) -> DryRun {
    let read_only = validated.read_only();
    let summary = render_summary("dry-run", &validated, usize::MAX);
    DryRun::Valid {
        action: validated.action,
        read_only,
        title: summary.title,
        lines: summary.lines,
    }
}
