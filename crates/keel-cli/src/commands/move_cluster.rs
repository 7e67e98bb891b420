//! Move command - Relocate Cluster API objects to another management cluster
//!
//! 1. Discover the movable kinds installed on the source (core CAPI + provider CRDs)
//! 2. Build and validate the object graph, compute creation waves
//! 3. Pause the source, create on the target wave by wave
//! 4. Delete from the source in reverse order, unpause the copies
//!
//! `--dry-run` stops after step 2 and prints the plan. Ctrl-C stops the run at
//! the next wave boundary and unpauses whatever is still on the source.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel_common::kube_utils::create_client;
use keel_move::{discover_movable_kinds, KubeAccessor, MoveCoordinator, MoveOptions, MoveReport};

use super::load_config;
use crate::Result;

/// How the result is printed
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Yaml,
    Json,
}

/// Move cluster objects between management clusters
#[derive(Args, Debug)]
pub struct MoveArgs {
    /// Kubeconfig of the source management cluster (defaults to the current context)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the target management cluster
    #[arg(long = "to-kubeconfig")]
    pub to_kubeconfig: PathBuf,

    /// Namespace holding the cluster objects
    #[arg(short = 'n', long, default_value = "default")]
    pub namespace: String,

    /// Move objects from every namespace
    #[arg(short = 'A', long, conflicts_with = "namespace")]
    pub all_namespaces: bool,

    /// Only move this Cluster and the objects that belong to it
    #[arg(long)]
    pub cluster: Option<String>,

    /// Print the plan without changing either cluster
    #[arg(long)]
    pub dry_run: bool,

    /// Engine settings (retry, concurrency, deadlines) as YAML
    #[arg(long, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the number of objects created in parallel within a wave
    #[arg(long, env = "KEEL_WAVE_CONCURRENCY")]
    pub wave_concurrency: Option<usize>,

    /// Output format for the report
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}

impl MoveArgs {
    fn options(&self) -> MoveOptions {
        MoveOptions {
            namespace: if self.all_namespaces {
                String::new()
            } else {
                self.namespace.clone()
            },
            cluster: self.cluster.clone(),
            dry_run: self.dry_run,
        }
    }
}

/// Run the move command
pub async fn run(args: MoveArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(concurrency) = args.wave_concurrency {
        config.wave_concurrency = concurrency;
    }
    config.validate()?;

    let source_client = create_client(args.kubeconfig.as_deref()).await?;
    let target_client = create_client(Some(&args.to_kubeconfig)).await?;

    let registry = discover_movable_kinds(&source_client).await?;
    info!(kinds = registry.len(), "Discovered movable kinds on source");

    let source = Arc::new(KubeAccessor::new(source_client).with_registry(&registry));
    let target = Arc::new(KubeAccessor::new(target_client).with_registry(&registry));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next wave boundary");
            interrupt.cancel();
        }
    });

    let mut coordinator =
        MoveCoordinator::new(source, target, registry, config).with_cancellation(cancel);
    let report = coordinator.run(&args.options()).await?;

    println!("{}", render_report(&report, args.output)?);
    Ok(())
}

fn render_report(report: &MoveReport, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(report)?,
        OutputFormat::Json => serde_json::to_string_pretty(report)?,
        OutputFormat::Text if report.dry_run => {
            format!("Dry run, nothing was changed. Plan:\n{}", report.plan)
        }
        OutputFormat::Text => format!(
            "Moved {} object(s), deleted {} from the source (move {})\n{}",
            report.created.len(),
            report.deleted.len(),
            report.move_id,
            report.plan
        ),
    })
}
