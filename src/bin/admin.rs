use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use sqlx::postgres::PgPoolOptions;

use compliance_ledger::config::LedgerConfig;
use compliance_ledger::infra::connect_sqlite;
use compliance_ledger::metrics::MetricsRegistry;
use compliance_ledger::server::{build_service, connect_backends};
use compliance_ledger::service::ComplianceService;
use compliance_ledger::{DeliveryOutcome, InvoiceId, TenantId};

fn print_help() {
    eprintln!(
        "\
compliance-ledger-admin

USAGE:
  compliance-ledger-admin <command> [args] [options]

COMMANDS:
  migrate                                        Run database migrations
  process-pending                                Run one full recovery pass
  process-new                                    Deliver invoices that have no record yet
  retry-invoice <invoice-id>                     Manually retry one invoice
  audit-chain <tenant-id> [--halt]               Walk a tenant's chain and report violations
  resume-tenant <tenant-id>                      Lift an integrity halt
  certificate-status <tenant-id>                 Show certificate presence and expiry
  upload-certificate <tenant-id> <file> <passphrase-env>
                                                 Store a PKCS#12 container; the passphrase
                                                 is read from the named environment variable
  stats <tenant-id>                              Record counts by status
  delivery-status <invoice-id>                   Status of one invoice's record

COMMON OPTIONS:
  --database-url <url>             (defaults to env DATABASE_URL; sqlite: URLs supported)

ENV:
  LEDGER_VAULT_KEYS, LEDGER_CHAIN_SECRET, AUTHORITY_MODE, AUTHORITY_ENDPOINT, RECOVERY_*
"
    );
}

/// Positional arguments plus `--database-url` and boolean flags.
struct ParsedArgs {
    positional: Vec<String>,
    database_url: Option<String>,
    halt: bool,
}

fn parse_args(mut args: VecDeque<String>) -> anyhow::Result<Option<ParsedArgs>> {
    let mut parsed = ParsedArgs {
        positional: Vec::new(),
        database_url: None,
        halt: false,
    };
    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => {
                parsed.database_url = Some(
                    args.pop_front()
                        .ok_or_else(|| anyhow::anyhow!("missing value for --database-url"))?,
                );
            }
            "--halt" => parsed.halt = true,
            "-h" | "--help" => return Ok(None),
            other if other.starts_with("--") => anyhow::bail!("unexpected argument: {other}"),
            _ => parsed.positional.push(arg),
        }
    }
    Ok(Some(parsed))
}

impl ParsedArgs {
    fn expect_positional(&self, names: &[&str]) -> anyhow::Result<()> {
        if self.positional.len() != names.len() {
            anyhow::bail!(
                "expected {} argument(s): {}",
                names.len(),
                names
                    .iter()
                    .map(|n| format!("<{n}>"))
                    .collect::<Vec<_>>()
                    .join(" ")
            );
        }
        Ok(())
    }

    fn tenant_id(&self, index: usize) -> anyhow::Result<TenantId> {
        let raw = &self.positional[index];
        raw.parse()
            .map_err(|e| anyhow::anyhow!("invalid tenant id {raw:?}: {e}"))
    }

    fn invoice_id(&self, index: usize) -> anyhow::Result<InvoiceId> {
        let raw = &self.positional[index];
        raw.parse()
            .map_err(|e| anyhow::anyhow!("invalid invoice id {raw:?}: {e}"))
    }
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

async fn open_service(database_url: Option<String>) -> anyhow::Result<ComplianceService> {
    let mut config = LedgerConfig::from_env()?;
    if database_url.is_some() {
        config.database_url = database_url;
    }
    let backends = connect_backends(&config).await?;
    Ok(build_service(
        &config,
        backends,
        Arc::new(MetricsRegistry::new()),
        None,
    )?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome(outcome: &DeliveryOutcome) {
    match outcome.record() {
        Some(record) => println!(
            "{}: invoice {} status={} retry_count={}{}",
            outcome.label(),
            record.invoice_id,
            record.status,
            record.retry_count,
            record
                .error_message
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        ),
        None => match outcome {
            DeliveryOutcome::NotEligible(reason) => println!("{}: {reason}", outcome.label()),
            _ => println!("{}", outcome.label()),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let Some(parsed) = parse_args(args)? else {
        print_help();
        return Ok(());
    };

    match command.as_str() {
        "migrate" => {
            parsed.expect_positional(&[])?;
            let database_url = require_database_url(parsed.database_url)?;
            if database_url.starts_with("sqlite:") {
                // Opening the pool runs the SQLite migrations.
                connect_sqlite(&database_url, 1).await?;
            } else {
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect(&database_url)
                    .await?;
                compliance_ledger::migrations::run_postgres(&pool).await?;
            }
            println!("ok: migrations applied");
            Ok(())
        }
        "process-pending" => {
            parsed.expect_positional(&[])?;
            let service = open_service(parsed.database_url).await?;
            let report = service.process_all_pending().await?;
            print_json(&report)
        }
        "process-new" => {
            parsed.expect_positional(&[])?;
            let service = open_service(parsed.database_url).await?;
            let report = service.process_new_invoices().await?;
            print_json(&report)
        }
        "retry-invoice" => {
            parsed.expect_positional(&["invoice-id"])?;
            let invoice_id = parsed.invoice_id(0)?;
            let service = open_service(parsed.database_url).await?;
            let outcome = service.retry_invoice(&invoice_id).await?;
            print_outcome(&outcome);
            Ok(())
        }
        "audit-chain" => {
            parsed.expect_positional(&["tenant-id"])?;
            let tenant_id = parsed.tenant_id(0)?;
            let service = open_service(parsed.database_url).await?;
            let report = service.audit_chain(&tenant_id, parsed.halt).await?;
            print_json(&report)?;
            if !report.is_intact() {
                anyhow::bail!(
                    "chain for tenant {tenant_id} has {} violation(s)",
                    report.violations.len()
                );
            }
            Ok(())
        }
        "resume-tenant" => {
            parsed.expect_positional(&["tenant-id"])?;
            let tenant_id = parsed.tenant_id(0)?;
            let service = open_service(parsed.database_url).await?;
            if service.resume_tenant(&tenant_id).await? {
                println!("ok: tenant {tenant_id} resumed");
            } else {
                println!("tenant {tenant_id} was not halted");
            }
            Ok(())
        }
        "certificate-status" => {
            parsed.expect_positional(&["tenant-id"])?;
            let tenant_id = parsed.tenant_id(0)?;
            let service = open_service(parsed.database_url).await?;
            let status = service.certificate_status(&tenant_id).await?;
            print_json(&status)
        }
        "upload-certificate" => {
            parsed.expect_positional(&["tenant-id", "file", "passphrase-env"])?;
            let tenant_id = parsed.tenant_id(0)?;
            let path = &parsed.positional[1];
            let passphrase_env = &parsed.positional[2];
            let passphrase = std::env::var(passphrase_env)
                .map_err(|_| anyhow::anyhow!("{passphrase_env} is not set"))?;
            let container = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))?;

            let service = open_service(parsed.database_url).await?;
            let metadata = service
                .upload_certificate(&tenant_id, &container, &passphrase)
                .await?;
            print_json(&metadata)
        }
        "stats" => {
            parsed.expect_positional(&["tenant-id"])?;
            let tenant_id = parsed.tenant_id(0)?;
            let service = open_service(parsed.database_url).await?;
            let stats = service.delivery_stats(&tenant_id).await?;
            print_json(&stats)
        }
        "delivery-status" => {
            parsed.expect_positional(&["invoice-id"])?;
            let invoice_id = parsed.invoice_id(0)?;
            let service = open_service(parsed.database_url).await?;
            match service.delivery_status(&invoice_id).await? {
                Some(view) => print_json(&view),
                None => {
                    println!("no record for invoice {invoice_id}");
                    Ok(())
                }
            }
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
