//! xp-recon: operator tool for the XP ledger.
//!
//! Usage:
//!   xp-recon reconcile --db xp.db [--user ID | --all] [--apply] [--confirm-reductions]
//!   xp-recon import    --db xp.db --events completions.jsonl
//!   xp-recon show      --db xp.db --user ID
//!
//! Common flags: --data-dir ./data (config), output is JSON on stdout.
//! Every repair goes through `reconcile`; there is no direct write command.

use anyhow::{bail, Context, Result};
use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use xp_ledger_core::{
    clock::SystemClock,
    config::EngineConfig,
    error::XpError,
    event::CompletionEvent,
    reconciliation::{ReconcileMode, ReconcileScope},
    service::XpService,
    store::XpStore,
};

#[derive(serde::Serialize)]
struct ImportSummary {
    lines: usize,
    awarded: usize,
    duplicates: usize,
    deferred: usize,
    rejected: Vec<RejectedLine>,
}

#[derive(serde::Serialize)]
struct RejectedLine {
    line: usize,
    error: String,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    let db = flag_value(&args, "--db").unwrap_or("xp.db");
    let data_dir = flag_value(&args, "--data-dir").unwrap_or("./data");

    let config = if Path::new(data_dir).exists() {
        EngineConfig::load(data_dir)?
    } else {
        log::warn!("data dir {data_dir} not found; using built-in defaults");
        EngineConfig::default_test()
    };

    let store = Arc::new(XpStore::open(db)?);
    store.migrate()?;
    log::info!("ledger database {}", store.path().unwrap_or(":memory:"));
    let service = XpService::build(&config, store, Arc::new(SystemClock))?;

    match command {
        "reconcile" => run_reconcile(&service, &args),
        "import" => {
            let path = flag_value(&args, "--events").context("import needs --events FILE")?;
            run_import(&service, path)
        }
        "show" => {
            let user = flag_value(&args, "--user").context("show needs --user ID")?;
            print_json(&service.get_user_summary(user)?)
        }
        other => {
            eprintln!("unknown command '{other}'");
            eprintln!("commands: reconcile | import | show");
            std::process::exit(2);
        }
    }
}

fn run_reconcile(service: &XpService, args: &[String]) -> Result<()> {
    let apply = has_flag(args, "--apply");
    let confirm = has_flag(args, "--confirm-reductions");
    if confirm && !apply {
        bail!("--confirm-reductions only makes sense with --apply");
    }

    let scope = match (flag_value(args, "--user"), has_flag(args, "--all")) {
        (Some(_), true) => bail!("--user and --all are mutually exclusive"),
        (Some(user), false) => ReconcileScope::User(user.to_string()),
        (None, true) => ReconcileScope::All,
        (None, false) => ReconcileScope::Stale,
    };
    let mode = ReconcileMode::from_dry_run(!apply);

    let report = service.reconcile_with(&scope, mode, confirm)?;
    print_json(&report)?;

    if !report.is_consistent() {
        // Non-zero exit so schedulers notice outstanding drift.
        if let Err(e) = report.into_result() {
            eprintln!("{e}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_import(service: &XpService, path: &str) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Cannot read {path}"))?;
    let mut summary = ImportSummary {
        lines: 0,
        awarded: 0,
        duplicates: 0,
        deferred: 0,
        rejected: Vec::new(),
    };

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        summary.lines += 1;

        let event: CompletionEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                summary.rejected.push(RejectedLine { line: idx + 1, error: e.to_string() });
                continue;
            }
        };

        match service.award(&event) {
            Ok(result) if result.duplicate => summary.duplicates += 1,
            Ok(_) => summary.awarded += 1,
            Err(e @ XpError::PartialAwardFailure { .. }) => {
                log::warn!("line {}: {e}", idx + 1);
                summary.deferred += 1;
            }
            Err(e) if e.is_validation() => {
                summary.rejected.push(RejectedLine { line: idx + 1, error: e.to_string() });
            }
            Err(e) => return Err(e.into()),
        }
    }

    print_json(&summary)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", serde_json::to_string_pretty(value)?)?;
    stdout.flush()?;
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
