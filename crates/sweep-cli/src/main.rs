use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use sweep_reconcile::{
    load_org_mapping, CoverageAudit, Credentials, Platforms, ReconcileConfig,
    ReconciliationDriver, RunSummary, StateSource,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sweep")]
#[command(about = "Remove scan targets whose source repositories are archived")]
struct Cli {
    /// Organization mapping file (JSON, or YAML by extension).
    #[arg(long, global = true, env = "SWEEP_ORG_MAPPING")]
    mapping: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Cross-reference every mapped organization and remove archived targets.
    Reconcile(ReconcileArgs),
    /// List active repositories of a hosting organization that no scan target covers.
    Coverage {
        #[arg(long, env = "SWEEP_HOSTING_ORG")]
        hosting_org: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Default, Args)]
struct ReconcileArgs {
    /// Classify only; record would-remove instead of deleting.
    #[arg(long)]
    dry_run: bool,
    /// Restrict the run to these mapping names.
    #[arg(long = "org")]
    orgs: Vec<String>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// `batched` (GraphQL lookup) or `listing` (full repository listing).
    #[arg(long)]
    state_source: Option<String>,
    /// Print the full run summary as JSON.
    #[arg(long)]
    json: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if std::env::var("SWEEP_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work and stopping");
            trigger.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &RunSummary) {
    let c = &summary.counters;
    println!(
        "reconcile complete: run_id={} dry_run={} orgs={} failed_orgs={} targets={} archived={} removed={} already_absent={} would_remove={} active={} unresolved={} failed={}",
        summary.run_id,
        summary.dry_run,
        summary.orgs.len(),
        c.orgs_failed,
        c.targets_seen,
        c.confirmed_archived,
        c.removed,
        c.already_absent,
        c.would_remove,
        c.confirmed_active,
        c.unresolved,
        c.failed
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let mut config = ReconcileConfig::from_env()?;
    if let Some(path) = cli.mapping {
        config.org_mapping_path = path;
    }
    let credentials = Credentials::from_env()?;
    let mapping = Arc::new(load_org_mapping(&config.org_mapping_path).await?);
    let cancel = cancel_on_ctrl_c();

    match cli
        .command
        .unwrap_or_else(|| Commands::Reconcile(ReconcileArgs::default()))
    {
        Commands::Reconcile(args) => {
            config.dry_run |= args.dry_run;
            config.only_orgs = args.orgs;
            if let Some(concurrency) = args.concurrency {
                config.concurrency = concurrency;
            }
            if let Some(raw) = args.state_source.as_deref() {
                config.state_source = raw.parse::<StateSource>()?;
            }

            let platforms = Platforms::connect(&config, credentials)?;
            let summary = ReconciliationDriver::new(mapping, config.run_options(), platforms)
                .with_cancellation(cancel)
                .run()
                .await;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Coverage { hosting_org, json } => {
            let platforms = Platforms::connect(&config, credentials)?;
            let report = CoverageAudit::new(mapping, config.run_options().target_query, platforms)
                .with_cancellation(cancel)
                .run(&hosting_org)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for name in &report.uncovered {
                    println!("{name}");
                }
                info!(
                    hosting_org = %report.hosting_org,
                    active = report.active_repos,
                    covered = report.covered,
                    uncovered = report.uncovered.len(),
                    failed_orgs = report.failed_orgs.len(),
                    "coverage audit complete"
                );
            }
        }
    }

    Ok(())
}
