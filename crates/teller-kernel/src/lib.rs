pub mod error;
pub mod gate;
pub mod intent;
pub mod registry;
pub mod validator;

pub use error::{PipelineError, ValidationError};
pub use gate::{Gate, GateConfig, GateDecision, PendingPolicy, Transition};
pub use intent::{build_prompt, parse_reply, Intent};
pub use registry::{lookup, lookup_name, FunctionSpec, LabelledValue, ParamSpec, REGISTRY};
pub use validator::{
    required_lookups, validate, LedgerCall, TournamentFacts, ValidatedAction, ValidationContext,
};

use serde_json::Value;
use sha2::{Digest, Sha256};
use teller_contracts::Action;

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Id of one proposal of `action` in one session. Canonical over parameter
/// order; `proposal` is drawn fresh each time the gate sees a request, so the
/// same words from two sessions, or from one session twice, never share an id.
pub fn proposal_action_id(session_id: &str, action: &Action, proposal: &str) -> String {
    let body = serde_json::json!({
        "function": action.function.as_str(),
        "parameters": action.parameters,
    });
    let digest = jcs_sha256_hex(&body).unwrap_or_else(|_| sha256_hex(body.to_string().as_bytes()));
    hash_id("act", &[session_id, digest.as_str(), proposal])
}

fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{short}")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
