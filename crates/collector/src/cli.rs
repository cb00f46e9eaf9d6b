use anyhow::Result;
use common::snapshots::SnapshotStore;
use common::types::SnapshotDetails;

use crate::chain::BalanceFetcher;
use crate::monitor::{CycleOutcome, MonitoringService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    FetchOnce,
    Cleanup { days: Option<u32> },
    Latest,
    TestConnections,
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "fetch-once" => Ok(Command::FetchOnce),
        "cleanup" => {
            let days = args
                .next()
                .map(|d| {
                    d.parse::<u32>()
                        .map_err(|_| format!("usage: collector cleanup [days]; got '{d}'"))
                })
                .transpose()?;
            Ok(Command::Cleanup { days })
        }
        "latest" => Ok(Command::Latest),
        "test-connections" => Ok(Command::TestConnections),
        other => Err(format!("unknown command: {other}")),
    }
}

/// One-shot commands. `Command::Run` is handled by the caller.
pub async fn run_command<F>(
    monitor: &MonitoringService<F>,
    store: &SnapshotStore,
    cmd: Command,
    retention_days: u32,
) -> Result<()>
where
    F: BalanceFetcher + 'static,
{
    match cmd {
        Command::Run => Ok(()),
        Command::FetchOnce => fetch_once(monitor).await,
        Command::Cleanup { days } => {
            let days = days.unwrap_or(retention_days);
            let deleted = monitor.cleanup_old_data(days).await?;
            println!("Deleted {deleted} snapshots older than {days} days");
            Ok(())
        }
        Command::Latest => {
            let rows = store.latest_balances().await?;
            println!("Latest balances:");
            for row in &rows {
                println!("{}", format_latest_row(row));
            }
            Ok(())
        }
        Command::TestConnections => {
            for (network, connected) in monitor.test_all_connections().await {
                println!(
                    "{network:<10} {}",
                    if connected { "ok" } else { "UNREACHABLE" }
                );
            }
            Ok(())
        }
    }
}

async fn fetch_once<F: BalanceFetcher + 'static>(monitor: &MonitoringService<F>) -> Result<()> {
    match monitor.fetch_and_store_balances().await {
        CycleOutcome::Skipped => println!("A collection cycle is already running"),
        CycleOutcome::Completed(report) => {
            println!(
                "fetched={} stored={} skipped={} fallbacks={} duration_ms={}",
                report.fetched, report.stored, report.skipped, report.fallbacks, report.duration_ms
            );
            if let Some(err) = report.error {
                anyhow::bail!("collection cycle failed: {err}");
            }
        }
    }
    Ok(())
}

pub fn format_latest_row(row: &SnapshotDetails) -> String {
    let block = row
        .block_number
        .map_or_else(|| "-".to_string(), |b| b.to_string());
    format!(
        "{:<44} {:<8} {:>30}  block={block}  at={}",
        row.wallet_address,
        row.network_name,
        row.balance,
        row.timestamp.format("%Y-%m-%d %H:%M:%S")
    )
}
