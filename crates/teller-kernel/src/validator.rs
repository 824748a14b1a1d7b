use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use teller_contracts::{Action, FunctionName, ParamKind, TournamentStatus};

use crate::error::ValidationError;
use crate::registry::{self, FunctionSpec};

/// Ledger facts a few functions need before they can be checked. Gathered by
/// the caller through read lookups; the validator itself does no I/O.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub tournaments: BTreeMap<u64, TournamentFacts>,
}

#[derive(Debug, Clone)]
pub struct TournamentFacts {
    pub status: TournamentStatus,
    pub split_ratios: Vec<u32>,
}

impl ValidationContext {
    pub fn with_tournament(mut self, id: u64, facts: TournamentFacts) -> Self {
        self.tournaments.insert(id, facts);
        self
    }
}

/// A validated action. `action` is exactly what the parser produced; `call`
/// is its typed decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedAction {
    pub action: Action,
    pub call: LedgerCall,
}

impl ValidatedAction {
    pub fn spec(&self) -> &'static FunctionSpec {
        registry::lookup(self.action.function)
    }

    pub fn read_only(&self) -> bool {
        self.spec().read_only
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCall {
    BalanceOf {
        address: Option<String>,
    },
    TransactionHistory {
        asset_id: u64,
    },
    TokenDetails {
        asset_id: u64,
    },
    TournamentDetails {
        tournament_id: u64,
    },
    Trade {
        asset_id: u64,
    },
    JoinTournament {
        tournament_id: u64,
    },
    Donate {
        crowdfunding_id: u64,
        amount: Decimal,
    },
    Mint {
        content_uri: String,
        content_hash: String,
        price: Decimal,
        category: String,
    },
    CreateTournament {
        name: String,
        prize_pool: Decimal,
        split_ratios: Vec<u32>,
    },
    DistributePrize {
        tournament_id: u64,
        winners: Vec<String>,
        total_prize: Decimal,
    },
}

impl LedgerCall {
    /// Ledger program method this call submits. Only meaningful for writes.
    pub fn method(&self) -> &'static str {
        match self {
            LedgerCall::BalanceOf { .. } => "balanceOf",
            LedgerCall::TransactionHistory { .. } => "getTransactionHistory",
            LedgerCall::TokenDetails { .. } => "getDetails",
            LedgerCall::TournamentDetails { .. } => "getTournamentDetails",
            LedgerCall::Trade { .. } => "trade",
            LedgerCall::JoinTournament { .. } => "joinTournament",
            LedgerCall::Donate { .. } => "donate",
            LedgerCall::Mint { .. } => "mint",
            LedgerCall::CreateTournament { .. } => "createTournament",
            LedgerCall::DistributePrize { .. } => "distributePrize",
        }
    }

    /// Positional-by-name arguments for the ledger program.
    pub fn args(&self) -> Value {
        match self {
            LedgerCall::BalanceOf { address } => json!({ "address": address }),
            LedgerCall::TransactionHistory { asset_id }
            | LedgerCall::TokenDetails { asset_id }
            | LedgerCall::Trade { asset_id } => json!({ "assetId": asset_id }),
            LedgerCall::TournamentDetails { tournament_id }
            | LedgerCall::JoinTournament { tournament_id } => json!({ "id": tournament_id }),
            LedgerCall::Donate {
                crowdfunding_id,
                amount,
            } => json!({ "crowdfundingId": crowdfunding_id, "amount": amount.to_string() }),
            LedgerCall::Mint {
                content_uri,
                content_hash,
                price,
                category,
            } => json!({
                "contentURI": content_uri,
                "contentHash": content_hash,
                "price": price.to_string(),
                "categoryId": category,
            }),
            LedgerCall::CreateTournament {
                name,
                prize_pool,
                split_ratios,
            } => json!({
                "name": name,
                "prizePool": prize_pool.to_string(),
                "splitRatios": split_ratios,
            }),
            LedgerCall::DistributePrize {
                tournament_id,
                winners,
                total_prize,
            } => json!({
                "id": tournament_id,
                "winners": winners,
                "totalPrize": total_prize.to_string(),
            }),
        }
    }

    pub fn touched_assets(&self) -> Vec<u64> {
        match self {
            LedgerCall::Trade { asset_id } => vec![*asset_id],
            _ => Vec::new(),
        }
    }

    pub fn touched_tournaments(&self) -> Vec<u64> {
        match self {
            LedgerCall::JoinTournament { tournament_id }
            | LedgerCall::DistributePrize { tournament_id, .. } => vec![*tournament_id],
            _ => Vec::new(),
        }
    }
}

/// Tournament ids whose facts must be in the [`ValidationContext`] before
/// `action` can be validated.
pub fn required_lookups(action: &Action) -> Vec<u64> {
    match action.function {
        FunctionName::JoinTournament | FunctionName::DistributePrize => action
            .parameters
            .get("tournamentId")
            .and_then(|v| asset_id("tournamentId", v).ok())
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

pub fn validate(action: Action, ctx: &ValidationContext) -> Result<ValidatedAction, ValidationError> {
    let spec = registry::lookup(action.function);
    for param in spec.params {
        match action.parameters.get(param.name) {
            None | Some(Value::Null) if param.required => {
                return Err(ValidationError::new(param.name, "is required"));
            }
            None | Some(Value::Null) => {}
            Some(value) => check_kind(param.name, param.kind, value)?,
        }
    }
    let call = decode(&action, ctx)?;
    Ok(ValidatedAction { action, call })
}

fn check_kind(field: &str, kind: ParamKind, value: &Value) -> Result<(), ValidationError> {
    match kind {
        ParamKind::AssetId => asset_id(field, value).map(|_| ()),
        ParamKind::Amount => amount(field, value).map(|_| ()),
        ParamKind::Address => address(field, value).map(|_| ()),
        ParamKind::AddressList => address_list(field, value).map(|_| ()),
        ParamKind::RatioList => ratio_list(field, value).map(|_| ()),
        ParamKind::Text => text(field, value).map(|_| ()),
    }
}

fn decode(action: &Action, ctx: &ValidationContext) -> Result<LedgerCall, ValidationError> {
    let p = &action.parameters;
    let req = |name: &str| {
        p.get(name)
            .ok_or_else(|| ValidationError::new(name, "is required"))
    };
    let call = match action.function {
        FunctionName::GetUserBalance => LedgerCall::BalanceOf {
            address: match p.get("address") {
                None | Some(Value::Null) => None,
                Some(v) => Some(address("address", v)?),
            },
        },
        FunctionName::GetTransactionHistory => LedgerCall::TransactionHistory {
            asset_id: asset_id("tokenId", req("tokenId")?)?,
        },
        FunctionName::GetTokenDetails => LedgerCall::TokenDetails {
            asset_id: asset_id("tokenId", req("tokenId")?)?,
        },
        FunctionName::GetTournamentDetails => LedgerCall::TournamentDetails {
            tournament_id: asset_id("tournamentId", req("tournamentId")?)?,
        },
        FunctionName::TradeNft => LedgerCall::Trade {
            asset_id: asset_id("tokenId", req("tokenId")?)?,
        },
        FunctionName::JoinTournament => {
            let tournament_id = asset_id("tournamentId", req("tournamentId")?)?;
            if let Some(facts) = ctx.tournaments.get(&tournament_id) {
                if facts.status == TournamentStatus::Closed {
                    return Err(ValidationError::new("tournamentId", "tournament is closed"));
                }
            }
            LedgerCall::JoinTournament { tournament_id }
        }
        FunctionName::Donate => LedgerCall::Donate {
            crowdfunding_id: asset_id("crowdfundingId", req("crowdfundingId")?)?,
            amount: amount("amount", req("amount")?)?,
        },
        FunctionName::MintNft => LedgerCall::Mint {
            content_uri: text("tokenURI", req("tokenURI")?)?,
            content_hash: text("contentHash", req("contentHash")?)?,
            price: amount("price", req("price")?)?,
            category: text("category", req("category")?)?,
        },
        FunctionName::CreateTournament => LedgerCall::CreateTournament {
            name: text("name", req("name")?)?,
            prize_pool: amount("prizePool", req("prizePool")?)?,
            split_ratios: ratio_list("splitRatios", req("splitRatios")?)?,
        },
        FunctionName::DistributePrize => {
            let tournament_id = asset_id("tournamentId", req("tournamentId")?)?;
            let winners = address_list("winners", req("winners")?)?;
            let total_prize = amount("totalPrize", req("totalPrize")?)?;
            let facts = ctx
                .tournaments
                .get(&tournament_id)
                .ok_or_else(|| ValidationError::new("tournamentId", "tournament not found"))?;
            if facts.status == TournamentStatus::Closed {
                return Err(ValidationError::new("tournamentId", "tournament is closed"));
            }
            if winners.len() != facts.split_ratios.len() {
                return Err(ValidationError::new(
                    "winners",
                    format!(
                        "expected {} winners to match the split ratios, got {}",
                        facts.split_ratios.len(),
                        winners.len()
                    ),
                ));
            }
            LedgerCall::DistributePrize {
                tournament_id,
                winners,
                total_prize,
            }
        }
    };
    Ok(call)
}

pub fn asset_id(field: &str, value: &Value) -> Result<u64, ValidationError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(id) if id > 0 => Ok(id),
        _ => Err(ValidationError::new(field, "must be a positive whole number")),
    }
}

pub fn amount(field: &str, value: &Value) -> Result<Decimal, ValidationError> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return Err(ValidationError::new(field, "must be a decimal amount")),
    };
    let parsed = Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| ValidationError::new(field, "must be a decimal amount"))?;
    if parsed.is_sign_negative() && !parsed.is_zero() {
        return Err(ValidationError::new(field, "must not be negative"));
    }
    Ok(parsed.normalize())
}

pub fn is_address(candidate: &str) -> bool {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    ADDRESS
        .get_or_init(|| Regex::new("^0x[0-9a-fA-F]{40}$").unwrap_or_else(|e| panic!("{e}")))
        .is_match(candidate)
}

fn address(field: &str, value: &Value) -> Result<String, ValidationError> {
    match value {
        Value::String(s) if is_address(s.trim()) => Ok(s.trim().to_string()),
        _ => Err(ValidationError::new(
            field,
            "must be a 0x-prefixed 40 hex character address",
        )),
    }
}

/// Accepts a JSON array or a comma separated string.
fn list_items(field: &str, value: &Value) -> Result<Vec<Value>, ValidationError> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(|part| Value::String(part.trim().to_string()))
            .filter(|v| v.as_str() != Some(""))
            .collect(),
        _ => return Err(ValidationError::new(field, "must be a list")),
    };
    if items.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(items)
}

fn address_list(field: &str, value: &Value) -> Result<Vec<String>, ValidationError> {
    let mut out = Vec::new();
    for (idx, item) in list_items(field, value)?.iter().enumerate() {
        out.push(address(&format!("{field}[{idx}]"), item)?);
    }
    Ok(out)
}

fn ratio_list(field: &str, value: &Value) -> Result<Vec<u32>, ValidationError> {
    let mut out = Vec::new();
    for (idx, item) in list_items(field, value)?.iter().enumerate() {
        let ratio = asset_id(&format!("{field}[{idx}]"), item)?;
        let ratio = u32::try_from(ratio)
            .ok()
            .filter(|r| *r <= 100)
            .ok_or_else(|| ValidationError::new(field, "each ratio must be at most 100"))?;
        out.push(ratio);
    }
    let total: u32 = out.iter().sum();
    if total != 100 {
        return Err(ValidationError::new(
            field,
            format!("ratios must sum to 100, got {total}"),
        ));
    }
    Ok(out)
}

fn text(field: &str, value: &Value) -> Result<String, ValidationError> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ValidationError::new(field, "must be non-empty text")),
    }
}

/// Parameters as a map, for callers building actions outside the parser.
pub fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
