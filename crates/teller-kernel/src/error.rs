use thiserror::Error;

/// First failing parameter of an action, reported fail-fast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Parse(String),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("signing rejected: {0}")]
    SigningRejected(String),
    #[error("ledger revert: {0}")]
    LedgerRevert(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("reconciliation gap for asset {id}: {detail}")]
    ReconciliationGap { id: u64, detail: String },
    #[error("no action is awaiting confirmation")]
    NoPendingAction,
    #[error("action {0} is not the action awaiting confirmation")]
    ActionMismatch(String),
    #[error("another action is already awaiting confirmation")]
    ConfirmationPending,
    #[error("a previous submission is still settling")]
    SignerBusy,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Parse(_) => "intent.parse_error",
            PipelineError::UnknownFunction(_) => "intent.unknown_function",
            PipelineError::Validation(_) => "action.validation_error",
            PipelineError::SigningRejected(_) => "signing.rejected",
            PipelineError::LedgerRevert(_) => "ledger.revert",
            PipelineError::Provider(_) => "ledger.provider_error",
            PipelineError::ReconciliationGap { .. } => "reconcile.gap",
            PipelineError::NoPendingAction => "gate.no_pending_action",
            PipelineError::ActionMismatch(_) => "gate.action_mismatch",
            PipelineError::ConfirmationPending => "gate.confirmation_pending",
            PipelineError::SignerBusy => "gate.signer_busy",
        }
    }

    /// True for failures that happened before anything reached the ledger, so
    /// the user may simply issue the request again.
    pub fn is_pre_submission(&self) -> bool {
        matches!(
            self,
            PipelineError::Parse(_)
                | PipelineError::UnknownFunction(_)
                | PipelineError::Validation(_)
                | PipelineError::SigningRejected(_)
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Parse(detail) => format!("Error: {detail}. Please try again."),
            PipelineError::UnknownFunction(name) => {
                format!("Error: unsupported request {name:?}. Please try again.")
            }
            PipelineError::Validation(err) => format!("Invalid {}: {}.", err.field, err.reason),
            PipelineError::SigningRejected(_) => {
                "Transaction was not signed. Nothing was submitted.".to_string()
            }
            PipelineError::LedgerRevert(reason) => format!("Transaction failed: {reason}"),
            PipelineError::Provider(detail) => format!(
                "Ledger unavailable: {detail}. Check the transaction status before submitting again."
            ),
            PipelineError::ReconciliationGap { id, .. } => {
                format!("Asset {id} could not be refreshed and was skipped.")
            }
            PipelineError::NoPendingAction => "Nothing is waiting for confirmation.".to_string(),
            PipelineError::ActionMismatch(_) => {
                "That action is no longer waiting for confirmation.".to_string()
            }
            PipelineError::ConfirmationPending => {
                "Confirm or cancel the pending transaction first.".to_string()
            }
            PipelineError::SignerBusy => {
                "A previous transaction is still settling. Please wait for it to finish."
                    .to_string()
            }
        }
    }
}
