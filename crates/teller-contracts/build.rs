use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

/// Schemas teller publishes under `contracts/v1`, in digest order.
const PUBLISHED: &[&str] = &[
    "action",
    "classifier_reply",
    "confirmation_summary",
    "error",
    "submission",
];

fn main() {
    let manifest_dir =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let contracts_dir = manifest_dir.join("../../contracts/v1");
    println!("cargo:rerun-if-changed={}", contracts_dir.display());

    let mut set_digest = Sha256::new();
    let mut table = String::from("pub const PUBLISHED_SCHEMAS: &[(&str, &str)] = &[\n");
    for name in PUBLISHED {
        let path = contracts_dir.join(format!("{name}.schema.json"));
        println!("cargo:rerun-if-changed={}", path.display());
        let bytes = fs::read(&path)
            .unwrap_or_else(|e| panic!("published schema {name} missing at {}: {e}", path.display()));
        check_schema_header(name, &bytes);

        set_digest.update(name.as_bytes());
        set_digest.update([0]);
        set_digest.update(&bytes);
        let schema_sha: String = Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        table.push_str(&format!("    ({name:?}, {schema_sha:?}),\n"));
    }
    table.push_str("];\n");

    for entry in fs::read_dir(&contracts_dir).expect("read contracts/v1").flatten() {
        let file = entry.file_name().to_string_lossy().to_string();
        if let Some(name) = file.strip_suffix(".schema.json") {
            if !PUBLISHED.contains(&name) {
                println!("cargo:warning=contracts/v1/{file} is not published");
            }
        }
    }

    let set_sha: String = set_digest
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    let out = format!("pub const PUBLISHED_SET_SHA256: &str = {set_sha:?};\n{table}");
    let out_path = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));
    fs::write(out_path.join("published_schemas.rs"), out).expect("write published_schemas.rs");
}

/// Every published schema is UTF-8 and declares `$schema`.
fn check_schema_header(name: &str, bytes: &[u8]) {
    let text = std::str::from_utf8(bytes)
        .unwrap_or_else(|e| panic!("schema {name} is not valid utf-8: {e}"));
    if !text.contains("\"$schema\"") {
        panic!("schema {name} does not declare $schema");
    }
}
