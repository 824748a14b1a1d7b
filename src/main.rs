use std::process::ExitCode;
use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::{Map, Value};
use teller_contracts::{Action, ConfirmationSummary, ParamKind};
use teller_kernel::{PipelineError, REGISTRY};
use teller_server::pipeline::{DryRun, Pipeline, Reply};
use teller_server::{build_pipeline, serve, verify_audit_chain, Services};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const CLI_SESSION: &str = "cli";

fn cli() -> Command {
    let confirm_flag = Arg::new("yes")
        .long("yes")
        .short('y')
        .action(ArgAction::SetTrue)
        .help("Confirm a pending write without prompting");

    let mut cmd = Command::new("teller")
        .about("Natural-language requests against a game-asset ledger")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .default_value("./config/example-config.yaml")
                .help("Path to the YAML configuration"),
        )
        .subcommand(Command::new("serve").about("Run the HTTP API"))
        .subcommand(
            Command::new("validate-only")
                .about("Parse and validate an utterance without submitting anything")
                .arg(Arg::new("utterance").required(true).num_args(1..)),
        )
        .subcommand(
            Command::new("ask")
                .about("Run an utterance through the full pipeline")
                .arg(Arg::new("utterance").required(true).num_args(1..))
                .arg(confirm_flag.clone()),
        )
        .subcommand(
            Command::new("verify-audit")
                .about("Check the hash chain of an audit log")
                .arg(Arg::new("path").long("path").help("Defaults to audit.jsonl_path")),
        );

    for spec in REGISTRY.iter() {
        let mut sub = Command::new(spec.name.as_str()).about(spec.description);
        for param in spec.params {
            sub = sub.arg(
                Arg::new(param.name)
                    .long(param.name)
                    .required(param.required)
                    .value_name(param.label)
                    .help(kind_help(param.kind)),
            );
        }
        if !spec.read_only {
            sub = sub.arg(confirm_flag.clone()).arg(
                Arg::new("dry-run")
                    .long("dry-run")
                    .action(ArgAction::SetTrue)
                    .help("Validate only"),
            );
        }
        cmd = cmd.subcommand(sub);
    }
    cmd
}

fn kind_help(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::AssetId => "positive whole number",
        ParamKind::Amount => "token amount",
        ParamKind::Address => "0x-prefixed 20-byte address",
        ParamKind::AddressList => "comma-separated addresses",
        ParamKind::RatioList => "comma-separated percentages totalling 100",
        ParamKind::Text => "text",
    }
}

/// Command-line strings become the JSON shapes a classifier would emit.
fn param_value(kind: ParamKind, raw: &str) -> Value {
    let number_or_text = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(s.trim().to_string()))
    };
    match kind {
        ParamKind::AssetId | ParamKind::Amount => number_or_text(raw),
        ParamKind::AddressList => Value::Array(
            raw.split(',')
                .map(|s| Value::String(s.trim().to_string()))
                .collect(),
        ),
        ParamKind::RatioList => Value::Array(raw.split(',').map(number_or_text).collect()),
        ParamKind::Address | ParamKind::Text => Value::String(raw.to_string()),
    }
}

fn exit_code(err: &PipelineError) -> u8 {
    match err {
        PipelineError::Parse(_) | PipelineError::UnknownFunction(_) => 3,
        PipelineError::Validation(_) => 4,
        PipelineError::SigningRejected(_) => 5,
        PipelineError::LedgerRevert(_) => 6,
        PipelineError::Provider(_) | PipelineError::ReconciliationGap { .. } => 7,
        PipelineError::NoPendingAction
        | PipelineError::ActionMismatch(_)
        | PipelineError::ConfirmationPending
        | PipelineError::SignerBusy => 1,
    }
}

fn fail(err: PipelineError) -> ExitCode {
    eprintln!("{}", err.user_message());
    ExitCode::from(exit_code(&err))
}

fn print_summary(summary: &ConfirmationSummary) {
    println!("{}", summary.title);
    for line in &summary.lines {
        println!("- {}: {}", line.label, line.value);
    }
}

async fn ask_yes_no(prompt: &str) -> bool {
    eprint!("{prompt} [y/N] ");
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    match stdin.read_line(&mut line).await {
        Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

/// Prints a reply and drives a pending confirmation to completion.
async fn finish(pipeline: &Pipeline, reply: Reply, assume_yes: bool) -> ExitCode {
    let summary = match reply {
        Reply::Confirm { summary } => summary,
        other => {
            println!("{}", other.message());
            return ExitCode::SUCCESS;
        }
    };
    print_summary(&summary);
    if !assume_yes && !ask_yes_no("Submit this transaction?").await {
        return match pipeline.cancel(CLI_SESSION).await {
            Ok(cancelled) => {
                println!("{}", cancelled.message());
                ExitCode::SUCCESS
            }
            Err(err) => fail(err),
        };
    }
    match pipeline.confirm(CLI_SESSION, &summary.action_id).await {
        Ok(reply) => {
            println!("{}", reply.message());
            ExitCode::SUCCESS
        }
        Err(err) => fail(err),
    }
}

fn print_dry_run(dry_run: &DryRun) {
    match dry_run {
        DryRun::Chat { message } => println!("{message}"),
        DryRun::Valid {
            action,
            read_only,
            title,
            lines,
        } => {
            println!("{title} ({})", if *read_only { "read" } else { "write" });
            for line in lines {
                println!("- {}: {}", line.label, line.value);
            }
            match serde_json::to_string(action) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!(error = %e, "action not printable"),
            }
        }
    }
}

fn utterance(matches: &ArgMatches) -> String {
    matches
        .get_many::<String>("utterance")
        .map(|words| words.cloned().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

async fn pipeline_for(cfg: &teller_config::Config) -> Result<Arc<Pipeline>, String> {
    build_pipeline(cfg, Services::from_config(cfg)?).await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = match cli().try_get_matches() {
        Ok(m) => m,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| "./config/example-config.yaml".to_string());
    let cfg = match teller_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::from(1);
        }
    };

    let Some((name, sub)) = matches.subcommand() else {
        return ExitCode::from(2);
    };

    match name {
        "serve" => match serve(cfg).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("server exited with error: {e}");
                ExitCode::from(1)
            }
        },
        "verify-audit" => {
            let path = sub
                .get_one::<String>("path")
                .cloned()
                .unwrap_or_else(|| cfg.audit.jsonl_path.clone());
            match verify_audit_chain(&path) {
                Ok(report) => {
                    println!("{report}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{e}");
                    ExitCode::from(1)
                }
            }
        }
        _ => {
            let pipeline = match pipeline_for(&cfg).await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("startup failed: {e}");
                    return ExitCode::from(1);
                }
            };
            run_pipeline_command(&pipeline, name, sub).await
        }
    }
}

async fn run_pipeline_command(pipeline: &Pipeline, name: &str, sub: &ArgMatches) -> ExitCode {
    match name {
        "validate-only" => match pipeline.validate_only(&utterance(sub)).await {
            Ok(dry_run) => {
                print_dry_run(&dry_run);
                ExitCode::SUCCESS
            }
            Err(err) => fail(err),
        },
        "ask" => {
            let assume_yes = sub.get_flag("yes");
            match pipeline.handle_utterance(CLI_SESSION, &utterance(sub)).await {
                Ok(reply) => finish(pipeline, reply, assume_yes).await,
                Err(err) => fail(err),
            }
        }
        function => {
            let Some(spec) = REGISTRY.iter().find(|s| s.name.as_str() == function) else {
                return fail(PipelineError::UnknownFunction(function.to_string()));
            };
            let mut parameters = Map::new();
            for param in spec.params {
                if let Some(raw) = sub.get_one::<String>(param.name) {
                    parameters.insert(param.name.to_string(), param_value(param.kind, raw));
                }
            }
            let action = Action {
                function: spec.name,
                parameters,
            };
            let write = !spec.read_only;
            if write && sub.get_flag("dry-run") {
                return match pipeline.validate_action(action).await {
                    Ok(dry_run) => {
                        print_dry_run(&dry_run);
                        ExitCode::SUCCESS
                    }
                    Err(err) => fail(err),
                };
            }
            let assume_yes = write && sub.get_flag("yes");
            match pipeline.submit_action(CLI_SESSION, action).await {
                Ok(reply) => finish(pipeline, reply, assume_yes).await,
                Err(err) => fail(err),
            }
        }
    }
}
