//! Read models rebuilt from the ledger. Mint events are only used to discover
//! ids and their immutable mint-time facts; owner, price, sale status and
//! category always come from a fresh per-id lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use teller_contracts::{
    AssetMinted, AssetToken, FunctionName, LedgerEventKind, ReceiptStatus, SubmissionRecord,
    SubmissionStatus, TournamentRecord, TournamentStatus, TransactionRecord,
};
use teller_kernel::PipelineError;
use tokio::sync::{watch, Mutex};

use crate::ledger::{LedgerClient, LedgerError};
use crate::store::StoreBackend;

pub const ALL_BUCKET: &str = "all";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciledState {
    pub assets: BTreeMap<u64, AssetToken>,
    /// `"all"` plus one bucket per category. Ids ascend within a bucket.
    pub groups: BTreeMap<String, Vec<u64>>,
    /// Block order of the last mint event folded in.
    pub cursor: Option<u64>,
    pub gaps: BTreeMap<u64, String>,
    pub complete: bool,
}

impl ReconciledState {
    fn regroup(&mut self) {
        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        groups.insert(ALL_BUCKET.to_string(), Vec::new());
        for (id, token) in &self.assets {
            groups.entry(ALL_BUCKET.to_string()).or_default().push(*id);
            if token.category != ALL_BUCKET {
                groups.entry(token.category.clone()).or_default().push(*id);
            }
        }
        self.groups = groups;
    }

    pub fn in_category(&self, category: &str) -> Vec<AssetToken> {
        self.groups
            .get(category)
            .into_iter()
            .flatten()
            .filter_map(|id| self.assets.get(id).cloned())
            .collect()
    }
}

pub struct Reconciler {
    ledger: Arc<dyn LedgerClient>,
    page_size: usize,
    max_concurrency: usize,
    tournament_probe_limit: u64,
    snapshot: watch::Sender<ReconciledState>,
    run: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        page_size: usize,
        max_concurrency: usize,
        tournament_probe_limit: u64,
    ) -> Self {
        let (snapshot, _) = watch::channel(ReconciledState::default());
        Self {
            ledger,
            page_size: page_size.max(1),
            max_concurrency: max_concurrency.max(1),
            tournament_probe_limit,
            snapshot,
            run: Mutex::new(()),
        }
    }

    /// Receives every partial and final snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ReconciledState> {
        self.snapshot.subscribe()
    }

    pub fn current(&self) -> ReconciledState {
        self.snapshot.borrow().clone()
    }

    /// Full rebuild: page through mint events, refreshing each discovered id.
    pub async fn reconcile(&self) -> Result<ReconciledState, PipelineError> {
        let _run = self.run.lock().await;
        let mut state = ReconciledState::default();
        loop {
            let page = self
                .ledger
                .query_events(LedgerEventKind::AssetMinted, state.cursor, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            state.cursor = Some(last.block_order);
            let short_page = page.len() < self.page_size;

            let mints: Vec<AssetMinted> = page
                .iter()
                .filter_map(|event| {
                    let mint = event.asset_minted();
                    if mint.is_none() {
                        tracing::warn!(block_order = event.block_order, "undecodable mint event skipped");
                    }
                    mint
                })
                .collect();
            self.fold(&mut state, mints).await;
            state.regroup();
            self.snapshot.send_replace(state.clone());

            if short_page {
                break;
            }
        }
        state.regroup();
        state.complete = true;
        self.snapshot.send_replace(state.clone());
        tracing::info!(
            assets = state.assets.len(),
            gaps = state.gaps.len(),
            "reconciliation complete"
        );
        Ok(state)
    }

    /// Re-fetches only `ids` into the current snapshot. Unknown ids are ignored.
    pub async fn refresh(&self, ids: &[u64]) -> ReconciledState {
        let _run = self.run.lock().await;
        let mut state = self.current();
        let mints: Vec<AssetMinted> = ids
            .iter()
            .filter_map(|id| state.assets.get(id))
            .map(|token| AssetMinted {
                owner: token.owner.clone(),
                asset_id: token.id,
                content_uri: token.content_uri.clone(),
                content_hash: token.content_hash.clone(),
                price: token.price.clone(),
                category_id: token.category.clone(),
            })
            .collect();
        if mints.is_empty() {
            return state;
        }
        self.fold(&mut state, mints).await;
        state.regroup();
        self.snapshot.send_replace(state.clone());
        state
    }

    async fn fold(&self, state: &mut ReconciledState, mints: Vec<AssetMinted>) {
        let ledger = self.ledger.clone();
        let results: Vec<(u64, Result<AssetToken, LedgerError>)> = stream::iter(mints)
            .map(|mint| {
                let ledger = ledger.clone();
                async move { (mint.asset_id, current_token(ledger.as_ref(), mint).await) }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(token) => {
                    state.gaps.remove(&id);
                    state.assets.insert(id, token);
                }
                Err(err) => {
                    let gap = PipelineError::ReconciliationGap {
                        id,
                        detail: err.to_string(),
                    };
                    tracing::warn!(asset_id = id, error = %err, code = gap.code(), "asset skipped");
                    state.assets.remove(&id);
                    state.gaps.insert(id, err.to_string());
                }
            }
        }
    }

    /// Probes tournament ids from 1 until the first missing id.
    pub async fn tournaments(
        &self,
        status: Option<TournamentStatus>,
    ) -> Result<Vec<TournamentRecord>, PipelineError> {
        let mut out = Vec::new();
        for id in 1..=self.tournament_probe_limit {
            match self.ledger.get_tournament_details(id).await {
                Ok(record) => out.push(record),
                Err(LedgerError::NotFound(_)) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(out
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect())
    }

    /// History across every reconciled asset, newest first.
    pub async fn transactions(&self) -> Result<Vec<TransactionRecord>, PipelineError> {
        let mut state = self.current();
        if !state.complete {
            state = self.reconcile().await?;
        }
        let ledger = self.ledger.clone();
        let histories: Vec<Vec<TransactionRecord>> = stream::iter(state.assets.keys().copied())
            .map(|id| {
                let ledger = ledger.clone();
                async move {
                    match ledger.get_transaction_history(id).await {
                        Ok(history) => history,
                        Err(err) => {
                            tracing::warn!(asset_id = id, error = %err, "history lookup skipped");
                            Vec::new()
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        let mut all: Vec<TransactionRecord> = histories.into_iter().flatten().collect();
        all.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(a.asset_id.cmp(&b.asset_id))
                .then(a.to.cmp(&b.to))
        });
        Ok(all)
    }

    /// Revisits submissions whose outcome was never observed and records the
    /// ledger's verdict. Returns the records that changed.
    pub async fn settle_in_flight(
        &self,
        store: &Mutex<StoreBackend>,
    ) -> Result<Vec<SubmissionRecord>, PipelineError> {
        let pending = store.lock().await.unsettled().map_err(PipelineError::Provider)?;
        let mut changed = Vec::new();
        let mut touched = Vec::new();
        let mut minted = false;
        for pending_record in pending {
            let receipt = match self.ledger.receipt(&pending_record.tx_hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(tx_hash = %pending_record.tx_hash, error = %err, "receipt lookup failed");
                    continue;
                }
            };
            let now = Utc::now().to_rfc3339();
            let updated = store
                .lock()
                .await
                .update_submission(&pending_record.tx_hash, |record| {
                    match receipt.status {
                        ReceiptStatus::Success => record.status = SubmissionStatus::Settled,
                        ReceiptStatus::Reverted => {
                            record.status = SubmissionStatus::Reverted;
                            record.revert_reason = receipt.revert_reason;
                        }
                    }
                    record.updated_at = now;
                })
                .map_err(PipelineError::Provider)?;
            let Some(record) = updated else {
                continue;
            };
            if record.status == SubmissionStatus::Settled {
                touched.extend(record.touched_assets.iter().copied());
                minted |= record.function == FunctionName::MintNft;
            }
            tracing::info!(tx_hash = %record.tx_hash, status = record.status.as_str(), "detached submission settled");
            changed.push(record);
        }
        if minted {
            self.reconcile().await?;
        } else if !touched.is_empty() {
            self.refresh(&touched).await;
        }
        Ok(changed)
    }
}

async fn current_token(
    ledger: &dyn LedgerClient,
    mint: AssetMinted,
) -> Result<AssetToken, LedgerError> {
    let (owner, details) = futures::try_join!(
        ledger.owner_of(mint.asset_id),
        ledger.get_details(mint.asset_id)
    )?;
    Ok(AssetToken {
        id: mint.asset_id,
        owner,
        content_uri: mint.content_uri,
        content_hash: mint.content_hash,
        price: details.price,
        category: if details.category.is_empty() {
            mint.category_id
        } else {
            details.category
        },
        for_sale: details.for_sale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use rust_decimal::Decimal;
    use teller_kernel::LedgerCall;

    const ALICE: &str = "0x00000000000000000000000000000000000000a1";
    const BOB: &str = "0x00000000000000000000000000000000000000b2";

    async fn ledger_with(categories: &[&str]) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        for category in categories {
            ledger
                .submit(
                    ALICE,
                    &LedgerCall::Mint {
                        content_uri: format!("ipfs://{category}"),
                        content_hash: format!("Qm{category}"),
                        price: Decimal::from(5),
                        category: category.to_string(),
                    },
                )
                .await;
        }
        ledger
    }

    fn reconciler(ledger: &MemoryLedger, page_size: usize) -> Reconciler {
        Reconciler::new(Arc::new(ledger.clone()), page_size, 4, 16)
    }

    #[tokio::test]
    async fn groups_by_category_with_an_all_bucket() {
        let ledger = ledger_with(&["action", "rpg"]).await;
        let state = reconciler(&ledger, 100).reconcile().await.unwrap();
        let expected: BTreeMap<String, Vec<u64>> = [
            ("action".to_string(), vec![1]),
            ("all".to_string(), vec![1, 2]),
            ("rpg".to_string(), vec![2]),
        ]
        .into_iter()
        .collect();
        assert_eq!(state.groups, expected);
        assert!(state.complete);
    }

    #[tokio::test]
    async fn repeated_runs_are_identical() {
        let ledger = ledger_with(&["action", "rpg", "action", "puzzle", "all"]).await;
        let reconciler = reconciler(&ledger, 2);
        let first = reconciler.reconcile().await.unwrap();
        let second = reconciler.reconcile().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn buckets_cover_every_id_without_duplicates() {
        let ledger = ledger_with(&["action", "rpg", "action", "all", "puzzle"]).await;
        let state = reconciler(&ledger, 2).reconcile().await.unwrap();
        let all = &state.groups[ALL_BUCKET];
        assert_eq!(all, &vec![1, 2, 3, 4, 5]);
        let mut union: Vec<u64> = state.groups.values().flatten().copied().collect();
        union.sort_unstable();
        union.dedup();
        assert_eq!(&union, all);
        for ids in state.groups.values() {
            let mut sorted = ids.clone();
            sorted.dedup();
            assert_eq!(&sorted, ids);
        }
    }

    #[tokio::test]
    async fn owner_reflects_current_lookup_not_mint_event() {
        let ledger = ledger_with(&["rpg"]).await;
        ledger.fund(BOB, Decimal::from(10)).await;
        ledger.submit(BOB, &LedgerCall::Trade { asset_id: 1 }).await;

        let state = reconciler(&ledger, 10).reconcile().await.unwrap();
        assert_eq!(state.assets[&1].owner, BOB);
        assert!(!state.assets[&1].for_sale);
    }

    #[tokio::test]
    async fn partial_snapshots_are_published_per_page() {
        let ledger = ledger_with(&["a", "b", "c"]).await;
        let reconciler = reconciler(&ledger, 1);
        let mut rx = reconciler.subscribe();
        reconciler.reconcile().await.unwrap();
        assert!(rx.has_changed().unwrap());
        let last = rx.borrow_and_update().clone();
        assert!(last.complete);
        assert_eq!(last.assets.len(), 3);
    }

    #[tokio::test]
    async fn refresh_updates_only_requested_ids() {
        let ledger = ledger_with(&["rpg", "rpg"]).await;
        let reconciler = reconciler(&ledger, 10);
        reconciler.reconcile().await.unwrap();

        ledger.fund(BOB, Decimal::from(20)).await;
        ledger.submit(BOB, &LedgerCall::Trade { asset_id: 1 }).await;
        ledger.submit(BOB, &LedgerCall::Trade { asset_id: 2 }).await;

        let state = reconciler.refresh(&[1, 99]).await;
        assert_eq!(state.assets[&1].owner, BOB);
        assert_eq!(state.assets[&2].owner, ALICE);
    }

    #[tokio::test]
    async fn tournaments_probe_until_first_gap() {
        let ledger = MemoryLedger::new();
        ledger.fund(ALICE, Decimal::from(100)).await;
        for name in ["Spring", "Summer"] {
            ledger
                .submit(
                    ALICE,
                    &LedgerCall::CreateTournament {
                        name: name.to_string(),
                        prize_pool: Decimal::from(10),
                        split_ratios: vec![100],
                    },
                )
                .await;
        }
        ledger
            .submit(
                ALICE,
                &LedgerCall::DistributePrize {
                    tournament_id: 1,
                    winners: vec![BOB.to_string()],
                    total_prize: Decimal::from(10),
                },
            )
            .await;

        let reconciler = reconciler(&ledger, 10);
        assert_eq!(reconciler.tournaments(None).await.unwrap().len(), 2);
        let active = reconciler
            .tournaments(Some(TournamentStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "Summer");
    }

    #[tokio::test]
    async fn transactions_are_newest_first() {
        let ledger = ledger_with(&["rpg", "action"]).await;
        ledger.fund(BOB, Decimal::from(10)).await;
        ledger.submit(BOB, &LedgerCall::Trade { asset_id: 1 }).await;

        let txs = reconciler(&ledger, 10).transactions().await.unwrap();
        assert_eq!(txs.len(), 3);
        assert!(txs.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert_eq!(txs[0].to, BOB);
    }
}
