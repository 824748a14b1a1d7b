use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub const API_VERSION: &str = "1.0.0";

/// One published JSON Schema, by short name (`action` is
/// `contracts/v1/action.schema.json`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedSchema {
    pub name: &'static str,
    pub sha256: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub contracts_set_sha256: &'static str,
    pub schemas: Vec<PublishedSchema>,
}

include!(concat!(env!("OUT_DIR"), "/published_schemas.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        contracts_set_sha256: PUBLISHED_SET_SHA256,
        schemas: PUBLISHED_SCHEMAS
            .iter()
            .map(|&(name, sha256)| PublishedSchema { name, sha256 })
            .collect(),
    }
}

/// Every ledger function the assistant can act on. The wire names match the
/// ledger program's method names, which is also what the classifier is told to
/// emit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FunctionName {
    #[serde(rename = "getUserBalance")]
    GetUserBalance,
    #[serde(rename = "getTransactionHistory")]
    GetTransactionHistory,
    #[serde(rename = "getTokenDetails")]
    GetTokenDetails,
    #[serde(rename = "getTournamentDetails")]
    GetTournamentDetails,
    #[serde(rename = "tradeNFT")]
    TradeNft,
    #[serde(rename = "joinTournament")]
    JoinTournament,
    #[serde(rename = "donate")]
    Donate,
    #[serde(rename = "mintNFT")]
    MintNft,
    #[serde(rename = "createTournament")]
    CreateTournament,
    #[serde(rename = "distributePrize")]
    DistributePrize,
}

impl FunctionName {
    pub const ALL: [FunctionName; 10] = [
        FunctionName::GetUserBalance,
        FunctionName::GetTransactionHistory,
        FunctionName::GetTokenDetails,
        FunctionName::GetTournamentDetails,
        FunctionName::TradeNft,
        FunctionName::JoinTournament,
        FunctionName::Donate,
        FunctionName::MintNft,
        FunctionName::CreateTournament,
        FunctionName::DistributePrize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FunctionName::GetUserBalance => "getUserBalance",
            FunctionName::GetTransactionHistory => "getTransactionHistory",
            FunctionName::GetTokenDetails => "getTokenDetails",
            FunctionName::GetTournamentDetails => "getTournamentDetails",
            FunctionName::TradeNft => "tradeNFT",
            FunctionName::JoinTournament => "joinTournament",
            FunctionName::Donate => "donate",
            FunctionName::MintNft => "mintNFT",
            FunctionName::CreateTournament => "createTournament",
            FunctionName::DistributePrize => "distributePrize",
        }
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFunction(pub String);

impl fmt::Display for UnknownFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown function {:?}", self.0)
    }
}

impl std::error::Error for UnknownFunction {}

impl FromStr for FunctionName {
    type Err = UnknownFunction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FunctionName::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownFunction(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Action {
    pub function: FunctionName,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    AssetId,
    Amount,
    Address,
    AddressList,
    RatioList,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionCatalogEntry {
    pub name: FunctionName,
    pub title: String,
    pub description: String,
    pub read_only: bool,
    pub parameters: Vec<ParameterDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetToken {
    pub id: u64,
    pub owner: String,
    #[serde(rename = "contentURI")]
    pub content_uri: String,
    pub content_hash: String,
    pub price: String,
    pub category: String,
    pub for_sale: bool,
}

/// Mutable per-asset fields as returned by `getDetails`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetDetails {
    pub price: String,
    pub for_sale: bool,
    pub category: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TournamentStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TournamentRecord {
    pub id: u64,
    pub name: String,
    pub prize_pool: String,
    #[serde(default)]
    pub players: Vec<String>,
    pub status: TournamentStatus,
    #[serde(default)]
    pub winners: Vec<String>,
    pub split_ratios: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub from: String,
    pub to: String,
    pub asset_id: u64,
    pub price: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LedgerEventKind {
    AssetMinted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    #[serde(rename = "type")]
    pub kind: LedgerEventKind,
    pub block_order: u64,
    pub args: Value,
}

/// Decoded arguments of an `AssetMinted` event. Values are the mint-time
/// snapshot only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetMinted {
    pub owner: String,
    pub asset_id: u64,
    #[serde(rename = "contentURI")]
    pub content_uri: String,
    pub content_hash: String,
    pub price: String,
    pub category_id: String,
}

impl LedgerEvent {
    pub fn asset_minted(&self) -> Option<AssetMinted> {
        match self.kind {
            LedgerEventKind::AssetMinted => serde_json::from_value(self.args.clone()).ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_order: u64,
    pub status: ReceiptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    InFlight,
    Settled,
    Reverted,
    Unknown,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::InFlight => "in_flight",
            SubmissionStatus::Settled => "settled",
            SubmissionStatus::Reverted => "reverted",
            SubmissionStatus::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_flight" => Some(SubmissionStatus::InFlight),
            "settled" => Some(SubmissionStatus::Settled),
            "reverted" => Some(SubmissionStatus::Reverted),
            "unknown" => Some(SubmissionStatus::Unknown),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionStatus::Settled | SubmissionStatus::Reverted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub tx_hash: String,
    pub action_id: String,
    pub function: FunctionName,
    #[serde(default)]
    pub touched_assets: Vec<u64>,
    #[serde(default)]
    pub touched_tournaments: Vec<u64>,
    pub status: SubmissionStatus,
    pub abandoned: bool,
    #[serde(default)]
    pub revert_reason: Option<String>,
    pub submitted_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    Idle,
    PendingConfirmation,
    Executing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SummaryLine {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfirmationSummary {
    pub action_id: String,
    pub function: FunctionName,
    pub title: String,
    pub lines: Vec<SummaryLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn schema_files_are_valid_json_schema() {
        let dir = repo_path("contracts/v1");
        let entries = std::fs::read_dir(dir).unwrap();
        for entry in entries {
            let path = entry.unwrap().path();
            if !path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(".schema.json"))
                .unwrap_or(false)
            {
                continue;
            }
            let text = std::fs::read_to_string(&path).unwrap();
            let schema: Value = serde_json::from_str(&text).unwrap();
            let _validator = jsonschema::validator_for(&schema)
                .unwrap_or_else(|err| panic!("invalid schema {}: {err}", path.display()));
        }
    }

    #[test]
    fn manifest_lists_every_published_schema() {
        let manifest = contracts_manifest_v1();
        assert_eq!(manifest.contracts_set_sha256.len(), 64);
        let names: Vec<&str> = manifest.schemas.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["action", "classifier_reply", "confirmation_summary", "error", "submission"]
        );
        assert!(manifest.schemas.iter().all(|s| s.sha256.len() == 64));
    }

    #[test]
    fn action_schema_lists_every_function() {
        let schema = load_schema("action.schema.json");
        let validator = jsonschema::validator_for(&schema).unwrap();
        for function in FunctionName::ALL {
            let action = Action {
                function,
                parameters: Map::new(),
            };
            let instance = serde_json::to_value(&action).unwrap();
            assert!(validator.is_valid(&instance), "{function} rejected");
        }
        assert!(!validator.is_valid(&json!({"function": "chat", "parameters": {}})));
    }

    #[test]
    fn classifier_reply_schema_separates_chat_from_actions() {
        let schema = load_schema("classifier_reply.schema.json");
        let validator = jsonschema::validator_for(&schema).unwrap();
        assert!(validator.is_valid(&json!({"function": "chat", "response": "hi"})));
        assert!(validator.is_valid(&json!({"function": "tradeNFT", "parameters": {"tokenId": 5}})));
        assert!(!validator.is_valid(&json!({"function": "chat"})));
    }

    #[test]
    fn function_names_round_trip_through_wire_names() {
        for function in FunctionName::ALL {
            let wire = serde_json::to_value(function).unwrap();
            assert_eq!(wire, Value::String(function.as_str().to_string()));
            assert_eq!(function.as_str().parse::<FunctionName>().unwrap(), function);
        }
        assert!("launchRocket".parse::<FunctionName>().is_err());
    }

    #[test]
    fn asset_minted_decodes_from_event_args() {
        let event = LedgerEvent {
            kind: LedgerEventKind::AssetMinted,
            block_order: 7,
            args: json!({
                "owner": "0x00000000000000000000000000000000000000aa",
                "assetId": 3,
                "contentURI": "ipfs://game/sword",
                "contentHash": "Qm123",
                "price": "1.5",
                "categoryId": "rpg"
            }),
        };
        let minted = event.asset_minted().unwrap();
        assert_eq!(minted.asset_id, 3);
        assert_eq!(minted.category_id, "rpg");
    }

    fn load_schema(name: &str) -> Value {
        let text = std::fs::read_to_string(repo_path(&format!("contracts/v1/{name}"))).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    fn repo_path(relative: &str) -> PathBuf {
        let mut base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        base.push("../..");
        base.push(relative);
        base
    }
}
