//! The single table of supported ledger functions. Prompt construction,
//! validation, confirmation summaries, the HTTP catalog and the CLI all read
//! from [`REGISTRY`].

use serde_json::{Map, Value};
use teller_contracts::{
    FunctionCatalogEntry, FunctionName, ParamKind, ParameterDescriptor, UnknownFunction,
};

pub type LabelFormatter = fn(&FunctionSpec, &Map<String, Value>) -> Vec<LabelledValue>;

/// One confirmation line before display formatting. `kind` decides whether
/// the value may be shortened on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelledValue {
    pub label: &'static str,
    pub kind: ParamKind,
    pub value: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

pub struct FunctionSpec {
    pub name: FunctionName,
    pub title: &'static str,
    pub description: &'static str,
    pub read_only: bool,
    pub params: &'static [ParamSpec],
    pub label_formatter: LabelFormatter,
}

impl FunctionSpec {
    pub fn labels(&self, parameters: &Map<String, Value>) -> Vec<LabelledValue> {
        (self.label_formatter)(self, parameters)
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn catalog_entry(&self) -> FunctionCatalogEntry {
        FunctionCatalogEntry {
            name: self.name,
            title: self.title.to_string(),
            description: self.description.to_string(),
            read_only: self.read_only,
            parameters: self
                .params
                .iter()
                .map(|p| ParameterDescriptor {
                    name: p.name.to_string(),
                    kind: p.kind,
                    required: p.required,
                })
                .collect(),
        }
    }
}

const fn required(name: &'static str, label: &'static str, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name,
        label,
        kind,
        required: true,
    }
}

const TOKEN_ID: ParamSpec = required("tokenId", "Token ID", ParamKind::AssetId);
const TOURNAMENT_ID: ParamSpec = required("tournamentId", "Tournament ID", ParamKind::AssetId);

pub static REGISTRY: [FunctionSpec; 10] = [
    FunctionSpec {
        name: FunctionName::GetUserBalance,
        title: "Get User Balance",
        description: "Show the token balance of the connected wallet, or of another address",
        read_only: true,
        params: &[ParamSpec {
            name: "address",
            label: "Address",
            kind: ParamKind::Address,
            required: false,
        }],
        label_formatter: labelled_params,
    },
    FunctionSpec {
        name: FunctionName::GetTransactionHistory,
        title: "Get Transaction History",
        description: "List every recorded transfer of one token",
        read_only: true,
        params: &[TOKEN_ID],
        label_formatter: labelled_params,
    },
    FunctionSpec {
        name: FunctionName::GetTokenDetails,
        title: "Get Token Details",
        description: "Show content hash, price and sale status of one token",
        read_only: true,
        params: &[TOKEN_ID],
        label_formatter: labelled_params,
    },
    FunctionSpec {
        name: FunctionName::GetTournamentDetails,
        title: "Get Tournament Details",
        description: "Show name, prize pool, players and status of one tournament",
        read_only: true,
        params: &[TOURNAMENT_ID],
        label_formatter: labelled_params,
    },
    FunctionSpec {
        name: FunctionName::TradeNft,
        title: "Trade NFT",
        description: "Buy a token that is listed for sale",
        read_only: false,
        params: &[TOKEN_ID],
        label_formatter: labelled_params,
    },
    FunctionSpec {
        name: FunctionName::JoinTournament,
        title: "Join Tournament",
        description: "Register the connected wallet as a player of an active tournament",
        read_only: false,
        params: &[TOURNAMENT_ID],
        label_formatter: labelled_params,
    },
    FunctionSpec {
        name: FunctionName::Donate,
        title: "Donate",
        description: "Contribute tokens to a crowdfunding campaign",
        read_only: false,
        params: &[
            required("crowdfundingId", "Crowdfunding ID", ParamKind::AssetId),
            required("amount", "Amount", ParamKind::Amount),
        ],
        label_formatter: labelled_params,
    },
    FunctionSpec {
        name: FunctionName::MintNft,
        title: "Mint NFT",
        description: "Mint a new game asset token with a sale price and category",
        read_only: false,
        params: &[
            required("tokenURI", "Token URI", ParamKind::Text),
            required("contentHash", "Content Hash", ParamKind::Text),
            required("price", "Price", ParamKind::Amount),
            required("category", "Category", ParamKind::Text),
        ],
        label_formatter: labelled_params,
    },
    FunctionSpec {
        name: FunctionName::CreateTournament,
        title: "Create Tournament",
        description: "Open a tournament with a prize pool split between winners by percentage",
        read_only: false,
        params: &[
            required("name", "Name", ParamKind::Text),
            required("prizePool", "Prize Pool", ParamKind::Amount),
            required("splitRatios", "Split Ratios", ParamKind::RatioList),
        ],
        label_formatter: tournament_labels,
    },
    FunctionSpec {
        name: FunctionName::DistributePrize,
        title: "Distribute Prize",
        description: "Close a tournament and pay its winners in split-ratio order",
        read_only: false,
        params: &[
            TOURNAMENT_ID,
            required("winners", "Winners", ParamKind::AddressList),
            required("totalPrize", "Total Prize", ParamKind::Amount),
        ],
        label_formatter: labelled_params,
    },
];

pub fn lookup(name: FunctionName) -> &'static FunctionSpec {
    REGISTRY
        .iter()
        .find(|spec| spec.name == name)
        .unwrap_or_else(|| unreachable!("every FunctionName has a registry entry"))
}

pub fn lookup_name(name: &str) -> Result<&'static FunctionSpec, UnknownFunction> {
    REGISTRY
        .iter()
        .find(|spec| spec.name.as_str() == name)
        .ok_or_else(|| UnknownFunction(name.to_string()))
}

pub fn catalog() -> Vec<FunctionCatalogEntry> {
    REGISTRY.iter().map(FunctionSpec::catalog_entry).collect()
}

/// Human wording for a parameter kind, as shown to the classifier.
pub fn kind_description(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::AssetId => "positive integer id",
        ParamKind::Amount => "non-negative decimal amount",
        ParamKind::Address => "0x-prefixed 40 hex character address",
        ParamKind::AddressList => "list of addresses",
        ParamKind::RatioList => "list of whole percentages summing to 100",
        ParamKind::Text => "text",
    }
}

fn labelled_params(spec: &FunctionSpec, parameters: &Map<String, Value>) -> Vec<LabelledValue> {
    spec.params
        .iter()
        .filter_map(|p| {
            parameters.get(p.name).map(|v| LabelledValue {
                label: p.label,
                kind: p.kind,
                value: v.clone(),
            })
        })
        .collect()
}

fn tournament_labels(spec: &FunctionSpec, parameters: &Map<String, Value>) -> Vec<LabelledValue> {
    let mut labels = labelled_params(spec, parameters);
    for line in labels.iter_mut() {
        if line.kind != ParamKind::RatioList {
            continue;
        }
        if let Value::Array(items) = &line.value {
            let joined = items
                .iter()
                .map(|v| match v {
                    Value::String(s) => format!("{}%", s.trim()),
                    other => format!("{other}%"),
                })
                .collect::<Vec<_>>()
                .join(" / ");
            line.value = Value::String(joined);
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_function_name_has_exactly_one_entry() {
        for name in FunctionName::ALL {
            assert_eq!(REGISTRY.iter().filter(|s| s.name == name).count(), 1);
            assert_eq!(lookup(name).name, name);
        }
    }

    #[test]
    fn reads_are_the_getters() {
        for spec in REGISTRY.iter() {
            assert_eq!(spec.read_only, spec.name.as_str().starts_with("get"));
        }
    }

    #[test]
    fn lookup_by_unknown_name_fails() {
        assert!(lookup_name("chat").is_err());
        assert!(lookup_name("tradeNFT").is_ok());
    }

    #[test]
    fn trade_labels_show_token_id() {
        let params = json!({"tokenId": 5}).as_object().cloned().unwrap();
        assert_eq!(
            lookup(FunctionName::TradeNft).labels(&params),
            vec![LabelledValue {
                label: "Token ID",
                kind: ParamKind::AssetId,
                value: json!(5),
            }]
        );
    }

    #[test]
    fn tournament_ratios_are_rendered_as_percentages() {
        let params = json!({"name": "Cup", "prizePool": "10", "splitRatios": [50, 30, 20]})
            .as_object()
            .cloned()
            .unwrap();
        let labels = lookup(FunctionName::CreateTournament).labels(&params);
        assert_eq!(labels[2].label, "Split Ratios");
        assert_eq!(labels[2].kind, ParamKind::RatioList);
        assert_eq!(labels[2].value, json!("50% / 30% / 20%"));
    }
}
