use std::collections::{BTreeMap, HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use teller_config::Config;
use teller_contracts::{
    AssetDetails, LedgerEvent, LedgerEventKind, Receipt, ReceiptStatus, TournamentRecord,
    TournamentStatus, TransactionRecord,
};
use teller_kernel::{LedgerCall, PipelineError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
const RECEIPT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("signing rejected: {0}")]
    SigningRejected(String),
    #[error("execution reverted: {0}")]
    Revert(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider error: {0}")]
    Provider(String),
}

impl From<LedgerError> for PipelineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::SigningRejected(reason) => PipelineError::SigningRejected(reason),
            LedgerError::Revert(reason) => PipelineError::LedgerRevert(reason),
            LedgerError::NotFound(detail) | LedgerError::Provider(detail) => {
                PipelineError::Provider(detail)
            }
        }
    }
}

/// Read surface of the ledger program plus receipt and event-log access.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn owner_of(&self, asset_id: u64) -> Result<String, LedgerError>;
    async fn get_details(&self, asset_id: u64) -> Result<AssetDetails, LedgerError>;
    async fn content_hash(&self, asset_id: u64) -> Result<String, LedgerError>;
    async fn get_transaction_history(
        &self,
        asset_id: u64,
    ) -> Result<Vec<TransactionRecord>, LedgerError>;
    async fn get_tournament_details(&self, id: u64) -> Result<TournamentRecord, LedgerError>;
    async fn balance_of(&self, address: &str) -> Result<Decimal, LedgerError>;
    /// Events of `kind` with `block_order` strictly greater than `after`, in
    /// ledger order, at most `limit` of them.
    async fn query_events(
        &self,
        kind: LedgerEventKind,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, LedgerError>;
    async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, LedgerError>;
}

/// The single signing identity. Submitting returns the transaction hash; the
/// outcome is observed through [`LedgerClient::receipt`].
#[async_trait]
pub trait SigningIdentity: Send + Sync {
    fn current_address(&self) -> &str;
    async fn sign_and_submit(&self, call: &LedgerCall) -> Result<String, LedgerError>;
}

pub async fn wait_for_receipt(
    client: &dyn LedgerClient,
    tx_hash: &str,
    bound: Duration,
) -> Result<Receipt, LedgerError> {
    let deadline = Instant::now() + bound;
    loop {
        if let Some(receipt) = client.receipt(tx_hash).await? {
            return Ok(receipt);
        }
        if Instant::now() >= deadline {
            return Err(LedgerError::Provider(format!(
                "no receipt for {tx_hash} within {}ms",
                bound.as_millis()
            )));
        }
        sleep(RECEIPT_POLL.min(bound)).await;
    }
}

pub fn from_config(
    cfg: &Config,
) -> Result<(Arc<dyn LedgerClient>, Arc<dyn SigningIdentity>), String> {
    match cfg.ledger.mode.as_str() {
        "http" => {
            let timeout = Duration::from_millis(cfg.ledger.timeout_ms);
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| e.to_string())?;
            let endpoint = cfg
                .ledger
                .endpoint
                .clone()
                .ok_or_else(|| "ledger.endpoint is required for http ledger".to_string())?;
            let signer_endpoint = cfg.ledger.signer_endpoint.clone().ok_or_else(|| {
                "ledger.signer_endpoint is required for http ledger".to_string()
            })?;
            let address = cfg
                .ledger
                .address
                .clone()
                .ok_or_else(|| "ledger.address is required for http ledger".to_string())?;
            Ok((
                Arc::new(HttpLedgerClient::new(client.clone(), endpoint)),
                Arc::new(HttpSigner::new(client, signer_endpoint, address)),
            ))
        }
        _ => {
            let address = cfg
                .ledger
                .address
                .clone()
                .unwrap_or_else(|| DEFAULT_MEMORY_ADDRESS.to_string());
            let ledger = MemoryLedger::seeded(&address);
            let signer = MemorySigner::new(ledger.clone(), &address);
            Ok((Arc::new(ledger), Arc::new(signer)))
        }
    }
}

pub const DEFAULT_MEMORY_ADDRESS: &str = "0x00000000000000000000000000000000000000a1";

pub struct HttpLedgerClient {
    client: Client,
    endpoint: String,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// JSON-RPC code for an execution revert.
const RPC_REVERT: i64 = 3;

impl HttpLedgerClient {
    pub fn new(client: Client, endpoint: String) -> Self {
        Self {
            client,
            endpoint,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Option<Value>, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Provider(format!("{method}: {e}")))?;
        if !response.status().is_success() {
            return Err(LedgerError::Provider(format!(
                "{method}: http {}",
                response.status()
            )));
        }
        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Provider(format!("{method}: invalid response: {e}")))?;
        if let Some(err) = body.error {
            return Err(if err.code == RPC_REVERT {
                LedgerError::Revert(err.message)
            } else {
                LedgerError::Provider(format!("{method}: {} ({})", err.message, err.code))
            });
        }
        Ok(body.result.filter(|v| !v.is_null()))
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        what: String,
    ) -> Result<T, LedgerError> {
        let value = self
            .call(method, params)
            .await?
            .ok_or(LedgerError::NotFound(what))?;
        serde_json::from_value(value)
            .map_err(|e| LedgerError::Provider(format!("{method}: unexpected result: {e}")))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn owner_of(&self, asset_id: u64) -> Result<String, LedgerError> {
        self.fetch("ownerOf", json!({"assetId": asset_id}), format!("asset {asset_id}"))
            .await
    }

    async fn get_details(&self, asset_id: u64) -> Result<AssetDetails, LedgerError> {
        self.fetch(
            "getDetails",
            json!({"assetId": asset_id}),
            format!("asset {asset_id}"),
        )
        .await
    }

    async fn content_hash(&self, asset_id: u64) -> Result<String, LedgerError> {
        self.fetch(
            "getContentHash",
            json!({"assetId": asset_id}),
            format!("asset {asset_id}"),
        )
        .await
    }

    async fn get_transaction_history(
        &self,
        asset_id: u64,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        self.fetch(
            "getTransactionHistory",
            json!({"assetId": asset_id}),
            format!("asset {asset_id}"),
        )
        .await
    }

    async fn get_tournament_details(&self, id: u64) -> Result<TournamentRecord, LedgerError> {
        self.fetch(
            "getTournamentDetails",
            json!({"id": id}),
            format!("tournament {id}"),
        )
        .await
    }

    async fn balance_of(&self, address: &str) -> Result<Decimal, LedgerError> {
        let raw: Value = self
            .fetch("balanceOf", json!({"address": address}), address.to_string())
            .await?;
        let text = match &raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Decimal::from_str(&text)
            .map_err(|e| LedgerError::Provider(format!("balanceOf: bad amount {text:?}: {e}")))
    }

    async fn query_events(
        &self,
        kind: LedgerEventKind,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let events: Option<Vec<LedgerEvent>> = self
            .call(
                "queryEvents",
                json!({"type": kind, "after": after, "limit": limit}),
            )
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| LedgerError::Provider(format!("queryEvents: unexpected result: {e}")))?;
        Ok(events.unwrap_or_default())
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, LedgerError> {
        self.call("getReceipt", json!({"txHash": tx_hash}))
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| LedgerError::Provider(format!("getReceipt: unexpected result: {e}")))
    }
}

/// Remote signing identity. Submissions are never retried here.
pub struct HttpSigner {
    client: Client,
    endpoint: String,
    address: String,
}

#[derive(Deserialize)]
struct SignerReply {
    tx_hash: String,
}

impl HttpSigner {
    pub fn new(client: Client, endpoint: String, address: String) -> Self {
        Self {
            client,
            endpoint,
            address,
        }
    }
}

#[async_trait]
impl SigningIdentity for HttpSigner {
    fn current_address(&self) -> &str {
        &self.address
    }

    async fn sign_and_submit(&self, call: &LedgerCall) -> Result<String, LedgerError> {
        let request = json!({
            "from": self.address,
            "method": call.method(),
            "args": call.args(),
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Provider(format!("signer: {e}")))?;
        match response.status() {
            status if status.is_success() => {
                let reply: SignerReply = response
                    .json()
                    .await
                    .map_err(|e| LedgerError::Provider(format!("signer: invalid reply: {e}")))?;
                Ok(reply.tx_hash)
            }
            StatusCode::FORBIDDEN => {
                let reason = response.text().await.unwrap_or_default();
                Err(LedgerError::SigningRejected(if reason.is_empty() {
                    "declined by identity holder".to_string()
                } else {
                    reason
                }))
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                Err(LedgerError::Revert(response.text().await.unwrap_or_default()))
            }
            status => Err(LedgerError::Provider(format!("signer: http {status}"))),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryAsset {
    owner: String,
    content_uri: String,
    content_hash: String,
    price: Decimal,
    for_sale: bool,
    category: String,
}

#[derive(Debug, Clone)]
struct MemoryTournament {
    organizer: String,
    name: String,
    prize_pool: Decimal,
    players: Vec<String>,
    status: TournamentStatus,
    winners: Vec<String>,
    split_ratios: Vec<u32>,
}

#[derive(Debug, Default)]
struct MemoryProgram {
    balances: HashMap<String, Decimal>,
    assets: BTreeMap<u64, MemoryAsset>,
    history: BTreeMap<u64, Vec<TransactionRecord>>,
    tournaments: BTreeMap<u64, MemoryTournament>,
    campaigns: BTreeMap<u64, Decimal>,
    events: Vec<LedgerEvent>,
    receipts: HashMap<String, Receipt>,
    held: VecDeque<(String, String, LedgerCall)>,
    hold_receipts: bool,
    block: u64,
    nonce: u64,
}

/// Deterministic in-process ledger program. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Mutex<MemoryProgram>>,
}

const GENESIS_TIMESTAMP: i64 = 1_700_000_000;

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger with `address` funded and crowdfunding campaign 1 open.
    pub fn seeded(address: &str) -> Self {
        let mut program = MemoryProgram::default();
        program
            .balances
            .insert(address.to_string(), Decimal::from(1000));
        program.campaigns.insert(1, Decimal::ZERO);
        Self {
            inner: Arc::new(Mutex::new(program)),
        }
    }

    pub async fn fund(&self, address: &str, amount: Decimal) {
        let mut program = self.inner.lock().await;
        *program.balances.entry(address.to_string()).or_default() += amount;
    }

    pub async fn open_campaign(&self, id: u64) {
        self.inner.lock().await.campaigns.entry(id).or_default();
    }

    pub async fn campaign_raised(&self, id: u64) -> Option<Decimal> {
        self.inner.lock().await.campaigns.get(&id).copied()
    }

    /// While held, submissions are accepted but neither applied nor receipted
    /// until [`MemoryLedger::release_receipts`].
    pub async fn hold_receipts(&self, hold: bool) {
        self.inner.lock().await.hold_receipts = hold;
    }

    pub async fn release_receipts(&self) {
        let mut program = self.inner.lock().await;
        program.hold_receipts = false;
        while let Some((tx_hash, from, call)) = program.held.pop_front() {
            program.settle(tx_hash, &from, &call);
        }
    }

    /// Submits `call` from `from` and returns its transaction hash.
    pub async fn submit(&self, from: &str, call: &LedgerCall) -> String {
        let mut program = self.inner.lock().await;
        program.nonce += 1;
        let tx_hash = tx_hash(program.nonce, from, call);
        if program.hold_receipts {
            program
                .held
                .push_back((tx_hash.clone(), from.to_string(), call.clone()));
        } else {
            program.settle(tx_hash.clone(), from, call);
        }
        tx_hash
    }
}

fn tx_hash(nonce: u64, from: &str, call: &LedgerCall) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(from.as_bytes());
    hasher.update(call.method().as_bytes());
    hasher.update(call.args().to_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("0x{hex}")
}

impl MemoryProgram {
    fn settle(&mut self, tx_hash: String, from: &str, call: &LedgerCall) {
        self.block += 1;
        let block_order = self.block;
        let receipt = match self.apply(from, call, block_order) {
            Ok(()) => Receipt {
                tx_hash: tx_hash.clone(),
                block_order,
                status: ReceiptStatus::Success,
                revert_reason: None,
            },
            Err(reason) => Receipt {
                tx_hash: tx_hash.clone(),
                block_order,
                status: ReceiptStatus::Reverted,
                revert_reason: Some(reason.to_string()),
            },
        };
        self.receipts.insert(tx_hash, receipt);
    }

    fn timestamp(&self, block_order: u64) -> i64 {
        GENESIS_TIMESTAMP + block_order as i64
    }

    fn balance(&self, address: &str) -> Decimal {
        self.balances.get(address).copied().unwrap_or_default()
    }

    fn debit(&mut self, address: &str, amount: Decimal) -> Result<(), &'static str> {
        if self.balance(address) < amount {
            return Err("Insufficient balance");
        }
        *self.balances.entry(address.to_string()).or_default() -= amount;
        Ok(())
    }

    /// Balance `address` would hold after receiving `amount`.
    fn credited(&self, address: &str, amount: Decimal) -> Result<Decimal, &'static str> {
        self.balance(address)
            .checked_add(amount)
            .ok_or("Balance overflow")
    }

    /// All-or-nothing: every check runs before any state is touched.
    fn apply(&mut self, from: &str, call: &LedgerCall, block_order: u64) -> Result<(), &'static str> {
        match call {
            LedgerCall::Trade { asset_id } => {
                let asset = self.assets.get(asset_id).ok_or("NFT does not exist")?.clone();
                if !asset.for_sale {
                    return Err("NFT not for sale");
                }
                if asset.owner == from {
                    return Err("Cannot buy your own NFT");
                }
                let seller_balance = self.credited(&asset.owner, asset.price)?;
                self.debit(from, asset.price)?;
                self.balances.insert(asset.owner.clone(), seller_balance);
                let timestamp = self.timestamp(block_order);
                self.history.entry(*asset_id).or_default().push(TransactionRecord {
                    from: asset.owner.clone(),
                    to: from.to_string(),
                    asset_id: *asset_id,
                    price: asset.price.to_string(),
                    timestamp,
                });
                if let Some(stored) = self.assets.get_mut(asset_id) {
                    stored.owner = from.to_string();
                    stored.for_sale = false;
                }
                Ok(())
            }
            LedgerCall::Mint {
                content_uri,
                content_hash,
                price,
                category,
            } => {
                let asset_id = self.assets.keys().next_back().copied().unwrap_or(0) + 1;
                self.assets.insert(
                    asset_id,
                    MemoryAsset {
                        owner: from.to_string(),
                        content_uri: content_uri.clone(),
                        content_hash: content_hash.clone(),
                        price: *price,
                        for_sale: true,
                        category: category.clone(),
                    },
                );
                let timestamp = self.timestamp(block_order);
                self.history.entry(asset_id).or_default().push(TransactionRecord {
                    from: ZERO_ADDRESS.to_string(),
                    to: from.to_string(),
                    asset_id,
                    price: price.to_string(),
                    timestamp,
                });
                self.events.push(LedgerEvent {
                    kind: LedgerEventKind::AssetMinted,
                    block_order,
                    args: json!({
                        "owner": from,
                        "assetId": asset_id,
                        "contentURI": content_uri,
                        "contentHash": content_hash,
                        "price": price.to_string(),
                        "categoryId": category,
                    }),
                });
                Ok(())
            }
            LedgerCall::CreateTournament {
                name,
                prize_pool,
                split_ratios,
            } => {
                if split_ratios.iter().sum::<u32>() != 100 {
                    return Err("Split ratios must total 100");
                }
                self.debit(from, *prize_pool)?;
                let id = self.tournaments.keys().next_back().copied().unwrap_or(0) + 1;
                self.tournaments.insert(
                    id,
                    MemoryTournament {
                        organizer: from.to_string(),
                        name: name.clone(),
                        prize_pool: *prize_pool,
                        players: Vec::new(),
                        status: TournamentStatus::Active,
                        winners: Vec::new(),
                        split_ratios: split_ratios.clone(),
                    },
                );
                Ok(())
            }
            LedgerCall::JoinTournament { tournament_id } => {
                let tournament = self
                    .tournaments
                    .get_mut(tournament_id)
                    .ok_or("Tournament does not exist")?;
                if tournament.status == TournamentStatus::Closed {
                    return Err("Tournament is closed");
                }
                if tournament.players.iter().any(|p| p == from) {
                    return Err("Already joined");
                }
                tournament.players.push(from.to_string());
                Ok(())
            }
            LedgerCall::DistributePrize {
                tournament_id,
                winners,
                total_prize,
            } => {
                let tournament = self
                    .tournaments
                    .get(tournament_id)
                    .ok_or("Tournament does not exist")?
                    .clone();
                if tournament.organizer != from {
                    return Err("Only the organizer can distribute prizes");
                }
                if tournament.status == TournamentStatus::Closed {
                    return Err("Tournament is closed");
                }
                if winners.len() != tournament.split_ratios.len() {
                    return Err("Winners and split ratios mismatch");
                }
                if *total_prize > tournament.prize_pool {
                    return Err("Prize exceeds pool");
                }
                let mut payouts: BTreeMap<&str, Decimal> = BTreeMap::new();
                for (winner, ratio) in winners.iter().zip(&tournament.split_ratios) {
                    let share = total_prize
                        .checked_mul(Decimal::from(*ratio))
                        .and_then(|v| v.checked_div(Decimal::from(100)))
                        .ok_or("Prize share overflow")?;
                    let current = match payouts.get(winner.as_str()) {
                        Some(pending) => *pending,
                        None => self.balance(winner),
                    };
                    let next = current.checked_add(share).ok_or("Balance overflow")?;
                    payouts.insert(winner.as_str(), next);
                }
                for (winner, balance) in payouts {
                    self.balances.insert(winner.to_string(), balance);
                }
                if let Some(stored) = self.tournaments.get_mut(tournament_id) {
                    stored.status = TournamentStatus::Closed;
                    stored.winners = winners.clone();
                    stored.prize_pool -= *total_prize;
                }
                Ok(())
            }
            LedgerCall::Donate {
                crowdfunding_id,
                amount,
            } => {
                if !self.campaigns.contains_key(crowdfunding_id) {
                    return Err("Campaign does not exist");
                }
                let raised = self.campaigns[crowdfunding_id]
                    .checked_add(*amount)
                    .ok_or("Campaign total overflow")?;
                self.debit(from, *amount)?;
                self.campaigns.insert(*crowdfunding_id, raised);
                Ok(())
            }
            LedgerCall::BalanceOf { .. }
            | LedgerCall::TransactionHistory { .. }
            | LedgerCall::TokenDetails { .. }
            | LedgerCall::TournamentDetails { .. } => Err("Not a transaction"),
        }
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn owner_of(&self, asset_id: u64) -> Result<String, LedgerError> {
        let program = self.inner.lock().await;
        program
            .assets
            .get(&asset_id)
            .map(|a| a.owner.clone())
            .ok_or_else(|| LedgerError::NotFound(format!("asset {asset_id}")))
    }

    async fn get_details(&self, asset_id: u64) -> Result<AssetDetails, LedgerError> {
        let program = self.inner.lock().await;
        program
            .assets
            .get(&asset_id)
            .map(|a| AssetDetails {
                price: a.price.to_string(),
                for_sale: a.for_sale,
                category: a.category.clone(),
            })
            .ok_or_else(|| LedgerError::NotFound(format!("asset {asset_id}")))
    }

    async fn content_hash(&self, asset_id: u64) -> Result<String, LedgerError> {
        let program = self.inner.lock().await;
        program
            .assets
            .get(&asset_id)
            .map(|a| a.content_hash.clone())
            .ok_or_else(|| LedgerError::NotFound(format!("asset {asset_id}")))
    }

    async fn get_transaction_history(
        &self,
        asset_id: u64,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let program = self.inner.lock().await;
        if !program.assets.contains_key(&asset_id) {
            return Err(LedgerError::NotFound(format!("asset {asset_id}")));
        }
        Ok(program.history.get(&asset_id).cloned().unwrap_or_default())
    }

    async fn get_tournament_details(&self, id: u64) -> Result<TournamentRecord, LedgerError> {
        let program = self.inner.lock().await;
        program
            .tournaments
            .get(&id)
            .map(|t| TournamentRecord {
                id,
                name: t.name.clone(),
                prize_pool: t.prize_pool.to_string(),
                players: t.players.clone(),
                status: t.status,
                winners: t.winners.clone(),
                split_ratios: t.split_ratios.clone(),
            })
            .ok_or_else(|| LedgerError::NotFound(format!("tournament {id}")))
    }

    async fn balance_of(&self, address: &str) -> Result<Decimal, LedgerError> {
        Ok(self.inner.lock().await.balance(address))
    }

    async fn query_events(
        &self,
        kind: LedgerEventKind,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let program = self.inner.lock().await;
        Ok(program
            .events
            .iter()
            .filter(|e| e.kind == kind && after.map_or(true, |a| e.block_order > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, LedgerError> {
        Ok(self.inner.lock().await.receipts.get(tx_hash).cloned())
    }
}

/// Signing identity backed by a [`MemoryLedger`]. Can be told to decline.
pub struct MemorySigner {
    ledger: MemoryLedger,
    address: String,
    declining: AtomicBool,
}

impl MemorySigner {
    pub fn new(ledger: MemoryLedger, address: &str) -> Self {
        Self {
            ledger,
            address: address.to_string(),
            declining: AtomicBool::new(false),
        }
    }

    pub fn set_declining(&self, declining: bool) {
        self.declining.store(declining, Ordering::SeqCst);
    }
}

#[async_trait]
impl SigningIdentity for MemorySigner {
    fn current_address(&self) -> &str {
        &self.address
    }

    async fn sign_and_submit(&self, call: &LedgerCall) -> Result<String, LedgerError> {
        if self.declining.load(Ordering::SeqCst) {
            return Err(LedgerError::SigningRejected(
                "declined by identity holder".to_string(),
            ));
        }
        Ok(self.ledger.submit(&self.address, call).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "0x00000000000000000000000000000000000000a1";
    const BOB: &str = "0x00000000000000000000000000000000000000b2";

    fn mint(category: &str) -> LedgerCall {
        LedgerCall::Mint {
            content_uri: format!("ipfs://{category}"),
            content_hash: format!("Qm{category}"),
            price: Decimal::from(10),
            category: category.to_string(),
        }
    }

    async fn status(ledger: &MemoryLedger, tx: &str) -> Receipt {
        ledger.receipt(tx).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn trade_moves_ownership_and_funds() {
        let ledger = MemoryLedger::new();
        ledger.fund(BOB, Decimal::from(25)).await;
        ledger.submit(ALICE, &mint("rpg")).await;

        let tx = ledger.submit(BOB, &LedgerCall::Trade { asset_id: 1 }).await;
        assert_eq!(status(&ledger, &tx).await.status, ReceiptStatus::Success);
        assert_eq!(ledger.owner_of(1).await.unwrap(), BOB);
        assert!(!ledger.get_details(1).await.unwrap().for_sale);
        assert_eq!(ledger.balance_of(BOB).await.unwrap(), Decimal::from(15));
        assert_eq!(ledger.balance_of(ALICE).await.unwrap(), Decimal::from(10));
        assert_eq!(ledger.get_transaction_history(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn trade_reverts_leave_state_untouched() {
        let ledger = MemoryLedger::new();
        ledger.submit(ALICE, &mint("rpg")).await;

        let poor = ledger.submit(BOB, &LedgerCall::Trade { asset_id: 1 }).await;
        let receipt = status(&ledger, &poor).await;
        assert_eq!(receipt.status, ReceiptStatus::Reverted);
        assert_eq!(receipt.revert_reason.as_deref(), Some("Insufficient balance"));
        assert_eq!(ledger.owner_of(1).await.unwrap(), ALICE);

        let own = ledger.submit(ALICE, &LedgerCall::Trade { asset_id: 1 }).await;
        assert_eq!(
            status(&ledger, &own).await.revert_reason.as_deref(),
            Some("Cannot buy your own NFT")
        );
    }

    #[tokio::test]
    async fn events_page_by_block_order() {
        let ledger = MemoryLedger::new();
        for category in ["action", "rpg", "puzzle"] {
            ledger.submit(ALICE, &mint(category)).await;
        }
        let first = ledger
            .query_events(LedgerEventKind::AssetMinted, None, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        let rest = ledger
            .query_events(LedgerEventKind::AssetMinted, Some(first[1].block_order), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].asset_minted().unwrap().category_id, "puzzle");
    }

    #[tokio::test]
    async fn only_the_organizer_distributes() {
        let ledger = MemoryLedger::new();
        ledger.fund(ALICE, Decimal::from(100)).await;
        ledger
            .submit(
                ALICE,
                &LedgerCall::CreateTournament {
                    name: "Cup".to_string(),
                    prize_pool: Decimal::from(100),
                    split_ratios: vec![70, 30],
                },
            )
            .await;
        let distribute = LedgerCall::DistributePrize {
            tournament_id: 1,
            winners: vec![BOB.to_string(), ALICE.to_string()],
            total_prize: Decimal::from(100),
        };
        let denied = ledger.submit(BOB, &distribute).await;
        assert_eq!(
            status(&ledger, &denied).await.revert_reason.as_deref(),
            Some("Only the organizer can distribute prizes")
        );

        let paid = ledger.submit(ALICE, &distribute).await;
        assert_eq!(status(&ledger, &paid).await.status, ReceiptStatus::Success);
        assert_eq!(ledger.balance_of(BOB).await.unwrap(), Decimal::from(70));
        let record = ledger.get_tournament_details(1).await.unwrap();
        assert_eq!(record.status, TournamentStatus::Closed);
        assert_eq!(record.winners.len(), 2);
    }

    async fn open_cup(ledger: &MemoryLedger, pool: Decimal, split_ratios: Vec<u32>) {
        ledger.fund(ALICE, pool).await;
        ledger
            .submit(
                ALICE,
                &LedgerCall::CreateTournament {
                    name: "Cup".to_string(),
                    prize_pool: pool,
                    split_ratios,
                },
            )
            .await;
    }

    #[tokio::test]
    async fn overflowing_payouts_revert_without_paying_anyone() {
        let ledger = MemoryLedger::new();
        open_cup(&ledger, Decimal::MAX, vec![50, 50]).await;
        let tx = ledger
            .submit(
                ALICE,
                &LedgerCall::DistributePrize {
                    tournament_id: 1,
                    winners: vec![BOB.to_string(), ALICE.to_string()],
                    total_prize: Decimal::MAX,
                },
            )
            .await;
        let receipt = status(&ledger, &tx).await;
        assert_eq!(receipt.status, ReceiptStatus::Reverted);
        assert_eq!(receipt.revert_reason.as_deref(), Some("Prize share overflow"));
        assert_eq!(ledger.balance_of(BOB).await.unwrap(), Decimal::ZERO);
        let record = ledger.get_tournament_details(1).await.unwrap();
        assert_eq!(record.status, TournamentStatus::Active);

        let rich = MemoryLedger::new();
        rich.fund(BOB, Decimal::MAX).await;
        open_cup(&rich, Decimal::from(100), vec![100]).await;
        let tx = rich
            .submit(
                ALICE,
                &LedgerCall::DistributePrize {
                    tournament_id: 1,
                    winners: vec![BOB.to_string()],
                    total_prize: Decimal::from(100),
                },
            )
            .await;
        assert_eq!(
            status(&rich, &tx).await.revert_reason.as_deref(),
            Some("Balance overflow")
        );
        assert_eq!(rich.balance_of(BOB).await.unwrap(), Decimal::MAX);
    }

    #[tokio::test]
    async fn held_submissions_settle_on_release() {
        let ledger = MemoryLedger::new();
        ledger.hold_receipts(true).await;
        let tx = ledger.submit(ALICE, &mint("rpg")).await;
        assert!(ledger.receipt(&tx).await.unwrap().is_none());
        assert!(ledger.owner_of(1).await.is_err());

        let err = wait_for_receipt(&ledger, &tx, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Provider(_)));

        ledger.release_receipts().await;
        assert_eq!(status(&ledger, &tx).await.status, ReceiptStatus::Success);
        assert_eq!(ledger.owner_of(1).await.unwrap(), ALICE);
    }

    #[tokio::test]
    async fn declining_signer_submits_nothing() {
        let ledger = MemoryLedger::new();
        let signer = MemorySigner::new(ledger.clone(), ALICE);
        signer.set_declining(true);
        let err = signer.sign_and_submit(&mint("rpg")).await.unwrap_err();
        assert!(matches!(err, LedgerError::SigningRejected(_)));
        assert!(ledger
            .query_events(LedgerEventKind::AssetMinted, None, 10)
            .await
            .unwrap()
            .is_empty());
    }
}
