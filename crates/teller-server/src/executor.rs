use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use teller_contracts::{FunctionName, ReceiptStatus, SubmissionRecord, SubmissionStatus};
use teller_kernel::gate::elide;
use teller_kernel::{LedgerCall, PipelineError, ValidatedAction};
use tokio::sync::{oneshot, Mutex};

use crate::audit::{AuditJsonl, AuditRecord};
use crate::ledger::{wait_for_receipt, LedgerClient, SigningIdentity};
use crate::reconciler::Reconciler;
use crate::store::StoreBackend;

#[derive(Debug, Clone, Serialize)]
pub struct ReadOutcome {
    pub message: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    Settled {
        message: String,
        record: SubmissionRecord,
        refreshed_assets: Vec<u64>,
    },
    /// The UI wait elapsed first. Settlement continues in the background.
    Pending {
        message: String,
        record: SubmissionRecord,
    },
}

impl WriteOutcome {
    pub fn record(&self) -> &SubmissionRecord {
        match self {
            WriteOutcome::Settled { record, .. } | WriteOutcome::Pending { record, .. } => record,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            WriteOutcome::Settled { message, .. } | WriteOutcome::Pending { message, .. } => message,
        }
    }
}

pub struct Executor {
    ledger: Arc<dyn LedgerClient>,
    signer: Arc<dyn SigningIdentity>,
    store: Arc<Mutex<StoreBackend>>,
    reconciler: Arc<Reconciler>,
    audit: Arc<AuditJsonl>,
    signer_lock: Arc<Mutex<()>>,
    ui_wait: Duration,
    settlement_timeout: Duration,
    token_symbol: String,
}

pub struct ExecutorSettings {
    pub ui_wait: Duration,
    pub settlement_timeout: Duration,
    pub token_symbol: String,
}

impl Executor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        signer: Arc<dyn SigningIdentity>,
        store: Arc<Mutex<StoreBackend>>,
        reconciler: Arc<Reconciler>,
        audit: Arc<AuditJsonl>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            ledger,
            signer,
            store,
            reconciler,
            audit,
            signer_lock: Arc::new(Mutex::new(())),
            ui_wait: settings.ui_wait,
            settlement_timeout: settings.settlement_timeout,
            token_symbol: settings.token_symbol,
        }
    }

    pub fn current_address(&self) -> &str {
        self.signer.current_address()
    }

    /// Direct call/response against the ledger. No signing identity involved.
    pub async fn execute_read(&self, validated: &ValidatedAction) -> Result<ReadOutcome, PipelineError> {
        match &validated.call {
            LedgerCall::BalanceOf { address } => {
                let own = address.is_none();
                let address = address
                    .clone()
                    .unwrap_or_else(|| self.signer.current_address().to_string());
                let balance = self.ledger.balance_of(&address).await?.normalize();
                let message = if own {
                    format!("Your balance is: {balance} {} tokens", self.token_symbol)
                } else {
                    format!(
                        "Balance of {} is: {balance} {} tokens",
                        elide(&address, 10),
                        self.token_symbol
                    )
                };
                Ok(ReadOutcome {
                    message,
                    data: Value::String(balance.to_string()),
                })
            }
            LedgerCall::TransactionHistory { asset_id } => {
                let history = self.ledger.get_transaction_history(*asset_id).await?;
                let data = serde_json::to_value(&history).unwrap_or(Value::Null);
                Ok(ReadOutcome {
                    message: format!(
                        "Transaction History for Token ID {asset_id}: {}",
                        pretty(&data)
                    ),
                    data,
                })
            }
            LedgerCall::TokenDetails { asset_id } => {
                let content_hash = self.ledger.content_hash(*asset_id).await?;
                let details = self.ledger.get_details(*asset_id).await?;
                Ok(ReadOutcome {
                    message: format!(
                        "Token Details for Token ID {asset_id}:\n- IPFS Hash: {content_hash}\n- Price: {}\n- For Sale: {}",
                        details.price,
                        if details.for_sale { "Yes" } else { "No" }
                    ),
                    data: json!({
                        "contentHash": content_hash,
                        "price": details.price,
                        "forSale": details.for_sale,
                        "category": details.category,
                    }),
                })
            }
            LedgerCall::TournamentDetails { tournament_id } => {
                let record = self.ledger.get_tournament_details(*tournament_id).await?;
                let data = serde_json::to_value(&record).unwrap_or(Value::Null);
                Ok(ReadOutcome {
                    message: format!(
                        "Tournament Details for Tournament ID {tournament_id}: {}",
                        pretty(&data)
                    ),
                    data,
                })
            }
            other => Err(PipelineError::Provider(format!(
                "{} is not a read call",
                other.method()
            ))),
        }
    }

    /// Signs and submits a confirmed write, then waits up to the UI bound for
    /// settlement. Re-confirming an action id returns its existing submission.
    pub async fn submit_write(
        &self,
        session_id: &str,
        action_id: &str,
        validated: &ValidatedAction,
    ) -> Result<WriteOutcome, PipelineError> {
        if let Some(existing) = self.store.lock().await.find_by_action(action_id) {
            tracing::info!(action_id, tx_hash = %existing.tx_hash, "action already submitted");
            return outcome_for(existing, Vec::new());
        }

        let guard = self
            .signer_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| PipelineError::SignerBusy)?;

        let function = validated.action.function;
        let tx_hash = match self.signer.sign_and_submit(&validated.call).await {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                let err = PipelineError::from(err);
                tracing::warn!(action_id, code = err.code(), error = %err, "submission failed");
                self.audit
                    .append(AuditRecord::new(
                        session_id,
                        action_id,
                        "execute",
                        "not_submitted",
                        err.code(),
                    ))
                    .await;
                return Err(err);
            }
        };

        let now = Utc::now().to_rfc3339();
        let record = SubmissionRecord {
            tx_hash: tx_hash.clone(),
            action_id: action_id.to_string(),
            function,
            touched_assets: validated.call.touched_assets(),
            touched_tournaments: validated.call.touched_tournaments(),
            status: SubmissionStatus::InFlight,
            abandoned: false,
            revert_reason: None,
            submitted_at: now.clone(),
            updated_at: now,
        };
        if let Err(e) = self.store.lock().await.save_submission(&record) {
            tracing::error!(tx_hash = %tx_hash, error = %e, "submission record not persisted");
        }
        tracing::info!(action_id, tx_hash = %tx_hash, function = %function, "transaction submitted");
        self.audit
            .append(
                AuditRecord::new(session_id, action_id, "execute", "submitted", "ledger.submitted")
                    .with_detail(json!({"tx_hash": tx_hash, "function": function.as_str()})),
            )
            .await;

        let settlement = Settlement {
            ledger: self.ledger.clone(),
            store: self.store.clone(),
            reconciler: self.reconciler.clone(),
            audit: self.audit.clone(),
            timeout: self.settlement_timeout,
            session_id: session_id.to_string(),
        };
        let (done_tx, done_rx) = oneshot::channel();
        let watched = record.clone();
        tokio::spawn(async move {
            let result = settlement.run(watched).await;
            drop(guard);
            let _ = done_tx.send(result);
        });

        match tokio::time::timeout(self.ui_wait, done_rx).await {
            Ok(Ok((record, refreshed))) => outcome_for(record, refreshed),
            Ok(Err(_)) => Err(PipelineError::Provider(
                "settlement watch ended without a result".to_string(),
            )),
            Err(_) => {
                tracing::info!(tx_hash = %tx_hash, "ui wait elapsed; settlement continues detached");
                Ok(WriteOutcome::Pending {
                    message: format!(
                        "Transaction submitted ({}); still waiting for it to settle.",
                        elide(&tx_hash, 10)
                    ),
                    record,
                })
            }
        }
    }

    pub async fn submission(&self, tx_hash: &str) -> Option<SubmissionRecord> {
        self.store.lock().await.get_submission(tx_hash)
    }

    pub async fn submission_for_action(&self, action_id: &str) -> Option<SubmissionRecord> {
        self.store.lock().await.find_by_action(action_id)
    }

    pub async fn settle_in_flight(&self) -> Result<Vec<SubmissionRecord>, PipelineError> {
        self.reconciler.settle_in_flight(&self.store).await
    }

    /// Stops waiting on a submission for display purposes. The submission
    /// itself is untouched and is still reconciled if it settles.
    pub async fn abandon(&self, tx_hash: &str) -> Result<Option<SubmissionRecord>, PipelineError> {
        let mut store = self.store.lock().await;
        let Some(current) = store.get_submission(tx_hash) else {
            return Ok(None);
        };
        if current.status.is_terminal() || current.abandoned {
            return Ok(Some(current));
        }
        let now = Utc::now().to_rfc3339();
        let record = store
            .update_submission(tx_hash, |r| {
                r.abandoned = true;
                r.updated_at = now;
            })
            .map_err(PipelineError::Provider)?;
        tracing::info!(tx_hash, "submission abandoned by user");
        Ok(record)
    }
}

struct Settlement {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<Mutex<StoreBackend>>,
    reconciler: Arc<Reconciler>,
    audit: Arc<AuditJsonl>,
    timeout: Duration,
    session_id: String,
}

impl Settlement {
    async fn run(self, submitted: SubmissionRecord) -> (SubmissionRecord, Vec<u64>) {
        let waited = wait_for_receipt(self.ledger.as_ref(), &submitted.tx_hash, self.timeout).await;

        let (status, revert_reason, code) = match waited {
            Ok(receipt) if receipt.status == ReceiptStatus::Success => {
                (SubmissionStatus::Settled, None, "ledger.settled")
            }
            Ok(receipt) => (
                SubmissionStatus::Reverted,
                Some(
                    receipt
                        .revert_reason
                        .unwrap_or_else(|| "execution reverted".to_string()),
                ),
                "ledger.revert",
            ),
            Err(err) => {
                tracing::warn!(tx_hash = %submitted.tx_hash, error = %err, "settlement not observed");
                (SubmissionStatus::Unknown, None, "ledger.provider_error")
            }
        };
        let now = Utc::now().to_rfc3339();
        let settle = |record: &mut SubmissionRecord| {
            record.status = status;
            if revert_reason.is_some() {
                record.revert_reason = revert_reason.clone();
            }
            record.updated_at = now.clone();
        };
        // The stored record may carry an `abandoned` flag set while we waited.
        let stored = self
            .store
            .lock()
            .await
            .update_submission(&submitted.tx_hash, &settle);
        let record = match stored {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::error!(tx_hash = %submitted.tx_hash, "settled submission missing from store");
                let mut record = submitted;
                settle(&mut record);
                record
            }
            Err(e) => {
                tracing::error!(tx_hash = %submitted.tx_hash, error = %e, "settlement not persisted");
                let mut record = submitted;
                settle(&mut record);
                record
            }
        };

        let mut refreshed = Vec::new();
        if record.status == SubmissionStatus::Settled {
            if record.function == FunctionName::MintNft {
                if let Err(err) = self.reconciler.reconcile().await {
                    tracing::warn!(error = %err, "post-mint reconciliation failed");
                }
            } else if !record.touched_assets.is_empty() {
                self.reconciler.refresh(&record.touched_assets).await;
                refreshed = record.touched_assets.clone();
            }
        }

        tracing::info!(
            tx_hash = %record.tx_hash,
            status = record.status.as_str(),
            abandoned = record.abandoned,
            "settlement finished"
        );
        self.audit
            .append(
                AuditRecord::new(
                    &self.session_id,
                    &record.action_id,
                    "settle",
                    record.status.as_str(),
                    code,
                )
                .with_detail(json!({
                    "tx_hash": record.tx_hash,
                    "revert_reason": record.revert_reason,
                })),
            )
            .await;
        (record, refreshed)
    }
}

pub fn outcome_for(
    record: SubmissionRecord,
    refreshed: Vec<u64>,
) -> Result<WriteOutcome, PipelineError> {
    match record.status {
        SubmissionStatus::Settled => Ok(WriteOutcome::Settled {
            message: format!("Transaction successful! Hash: {}", record.tx_hash),
            record,
            refreshed_assets: refreshed,
        }),
        SubmissionStatus::InFlight => Ok(WriteOutcome::Pending {
            message: format!(
                "Transaction submitted ({}); still waiting for it to settle.",
                elide(&record.tx_hash, 10)
            ),
            record,
        }),
        SubmissionStatus::Reverted => Err(PipelineError::LedgerRevert(
            record
                .revert_reason
                .unwrap_or_else(|| "execution reverted".to_string()),
        )),
        SubmissionStatus::Unknown => Err(PipelineError::Provider(format!(
            "no settlement observed for {}; check its status before submitting again",
            record.tx_hash
        ))),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
