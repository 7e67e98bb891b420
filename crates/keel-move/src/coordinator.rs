//! Move state machine
//!
//! ```text
//! Building → Validating → Pausing → Creating → Deleting → Unpausing → Done
//!     └──────────┴───────────┴──────────┴──────────┴───────────┴──→ Aborted
//! ```
//!
//! Each transition fires only when the previous step succeeded. Any failure
//! (or cancellation) moves to `Aborted`, clears the pause marker on whatever is
//! still paused on the source, and returns [`MoveError::Aborted`] naming the
//! stage reached and every object migrated so far. A dry run stops after
//! `Validating` and never writes to either cluster.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::accessor::{DeadlineAccessor, ResourceAccessor};
use crate::builder::{GraphBuilder, NamespaceScope};
use crate::config::MoveConfig;
use crate::error::MoveError;
use crate::graph::{ObjectGraph, ObjectIdentity};
use crate::pause::{pause_nodes, unpause_nodes};
use crate::registry::MovableKindRegistry;
use crate::relocate::Relocator;
use crate::sequence::MovePlan;
use crate::translation::TranslationTable;
use crate::validate::{validate, ValidationReport};

/// States of a move run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MovePhase {
    /// Discovering objects on the source
    Building,
    /// Checking the graph and computing waves
    Validating,
    /// Setting the pause marker on the source
    Pausing,
    /// Creating objects on the target, wave by wave
    Creating,
    /// Deleting objects from the source, last wave first
    Deleting,
    /// Clearing the pause marker on the moved objects
    Unpausing,
    /// Finished successfully
    Done,
    /// Stopped after a failure or cancellation
    Aborted,
}

impl MovePhase {
    /// Whether no further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, MovePhase::Done | MovePhase::Aborted)
    }
}

impl fmt::Display for MovePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What to move
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveOptions {
    /// Namespace to discover in; empty for all namespaces
    pub namespace: String,
    /// Restrict the move to one Cluster and what hangs off it
    pub cluster: Option<String>,
    /// Stop after validation and report the plan
    pub dry_run: bool,
}

/// Result of a successful run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveReport {
    /// Identifier of this run, also carried by its log span
    pub move_id: String,
    /// Whether this was a dry run
    pub dry_run: bool,
    /// The plan computed (and, unless dry run, executed)
    pub plan: MovePlan,
    /// Non-fatal graph diagnostics
    pub validation: ValidationReport,
    /// Objects created or adopted on the target
    pub created: Vec<ObjectIdentity>,
    /// Objects deleted from the source
    pub deleted: Vec<ObjectIdentity>,
}

/// State owned by one run and dropped with it
#[derive(Default)]
struct Run {
    graph: ObjectGraph,
    table: TranslationTable,
    paused: Vec<ObjectIdentity>,
    created: Vec<ObjectIdentity>,
    deleted: Vec<ObjectIdentity>,
}

impl Run {
    fn migrated(&self) -> Vec<ObjectIdentity> {
        self.graph
            .nodes()
            .iter()
            .filter(|(key, _)| self.table.contains(key))
            .map(|(_, node)| node.identity.clone())
            .collect()
    }
}

/// Drives one move between a source and a target cluster
pub struct MoveCoordinator {
    source: Arc<dyn ResourceAccessor>,
    target: Arc<dyn ResourceAccessor>,
    registry: MovableKindRegistry,
    config: MoveConfig,
    cancel: CancellationToken,
    phase: MovePhase,
    history: Vec<MovePhase>,
}

impl MoveCoordinator {
    /// Every accessor call made through the coordinator runs under
    /// `config.request_timeout`.
    pub fn new(
        source: Arc<dyn ResourceAccessor>,
        target: Arc<dyn ResourceAccessor>,
        registry: MovableKindRegistry,
        config: MoveConfig,
    ) -> Self {
        let deadline = config.request_timeout;
        Self {
            source: Arc::new(DeadlineAccessor::new(source, deadline)),
            target: Arc::new(DeadlineAccessor::new(target, deadline)),
            registry,
            config,
            cancel: CancellationToken::new(),
            phase: MovePhase::Building,
            history: Vec::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run at the next wave or step boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current phase
    pub fn phase(&self) -> MovePhase {
        self.phase
    }

    /// Every phase entered by the last run, in order
    pub fn history(&self) -> &[MovePhase] {
        &self.history
    }

    /// Execute a move
    pub async fn run(&mut self, options: &MoveOptions) -> Result<MoveReport, MoveError> {
        let move_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "move",
            move_id = %move_id,
            namespace = %options.namespace,
            dry_run = options.dry_run
        );
        self.history.clear();

        async {
            let mut run = Run::default();
            match self.drive(&move_id, options, &mut run).await {
                Ok(report) => Ok(report),
                Err(cause) => Err(self.abort(cause, run).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &mut self,
        move_id: &str,
        options: &MoveOptions,
        run: &mut Run,
    ) -> Result<MoveReport, MoveError> {
        self.transition(MovePhase::Building);
        self.config.validate()?;

        let builder = GraphBuilder::new(self.source.clone(), self.registry.clone())
            .with_concurrency(self.config.discovery_concurrency);
        run.graph = builder
            .build(&NamespaceScope::from_namespace(&options.namespace))
            .await?;

        if let Some(cluster) = &options.cluster {
            let namespace = (!options.namespace.is_empty()).then_some(options.namespace.as_str());
            if !run.graph.filter_by_cluster(namespace, cluster) {
                return Err(MoveError::Discovery(format!(
                    "cluster {} not found on the source",
                    cluster
                )));
            }
        }
        self.check_cancelled()?;

        self.transition(MovePhase::Validating);
        let validation = validate(&run.graph)?;
        let plan = MovePlan::from_graph(&run.graph)?;

        let mut report = MoveReport {
            move_id: move_id.to_string(),
            dry_run: options.dry_run,
            plan,
            validation,
            created: Vec::new(),
            deleted: Vec::new(),
        };

        if options.dry_run {
            info!(
                waves = report.plan.num_waves(),
                objects = report.plan.total_objects(),
                "Dry run, nothing changed"
            );
            self.transition(MovePhase::Done);
            return Ok(report);
        }
        self.check_cancelled()?;

        let movable: Vec<ObjectIdentity> = report
            .plan
            .all_uids_in_order()
            .iter()
            .filter_map(|key| run.graph.get(key))
            .filter(|n| n.leaves_source())
            .map(|n| n.identity.clone())
            .collect();

        self.transition(MovePhase::Pausing);
        let paused = pause_nodes(
            self.source.as_ref(),
            &movable,
            &self.config.retry,
            self.config.wave_concurrency,
        )
        .await;
        run.paused = paused.succeeded.clone();
        paused.into_result()?;
        self.check_cancelled()?;

        self.transition(MovePhase::Creating);
        let relocator = Relocator::new(
            self.source.clone(),
            self.target.clone(),
            self.config.retry.clone(),
            self.config.wave_concurrency,
        );
        relocator.ensure_namespaces(&run.graph).await?;
        for wave in report.plan.waves() {
            self.check_cancelled()?;
            info!(wave = wave.index, objects = wave.len(), "Creating wave on target");
            let created = relocator.create_wave(&run.graph, wave, &run.table).await?;
            run.created.extend(created);
        }
        relocator.ensure_fully_migrated(&run.graph, &run.table)?;
        self.check_cancelled()?;

        self.transition(MovePhase::Deleting);
        relocator
            .delete_source(
                &run.graph,
                &report.plan,
                &run.table,
                &self.cancel,
                &mut run.deleted,
            )
            .await?;
        // Source copies are gone, nothing left paused there
        run.paused.retain(|id| !run.deleted.contains(id));
        self.check_cancelled()?;

        self.transition(MovePhase::Unpausing);
        unpause_nodes(
            self.target.as_ref(),
            &movable,
            &self.config.retry,
            self.config.wave_concurrency,
        )
        .await
        .into_result()?;

        self.transition(MovePhase::Done);
        report.created = std::mem::take(&mut run.created);
        report.deleted = std::mem::take(&mut run.deleted);
        info!(
            created = report.created.len(),
            deleted = report.deleted.len(),
            "Move completed"
        );
        Ok(report)
    }

    async fn abort(&mut self, cause: MoveError, run: Run) -> MoveError {
        let stage = self.phase;
        self.transition(MovePhase::Aborted);
        warn!(stage = %stage, error = %cause, "Move aborted");

        let still_paused: Vec<ObjectIdentity> = run
            .paused
            .iter()
            .filter(|id| !run.deleted.contains(id))
            .cloned()
            .collect();
        if !still_paused.is_empty() {
            info!(objects = still_paused.len(), "Unpausing source objects after abort");
            let report = unpause_nodes(
                self.source.as_ref(),
                &still_paused,
                &self.config.retry,
                self.config.wave_concurrency,
            )
            .await;
            for failure in &report.failed {
                error!(
                    object = %failure.identity.display(),
                    error = %failure.message,
                    "Object is still paused on the source"
                );
            }
        }

        let migrated = run.migrated();
        MoveError::Aborted {
            stage,
            migrated,
            deleted: run.deleted,
            cause: Box::new(cause),
        }
    }

    fn transition(&mut self, next: MovePhase) {
        if self.phase != next {
            info!(from = %self.phase, to = %next, "Move phase changed");
        }
        self.phase = next;
        self.history.push(next);
    }

    fn check_cancelled(&self) -> Result<(), MoveError> {
        if self.cancel.is_cancelled() {
            warn!(phase = %self.phase, "Move cancelled");
            return Err(MoveError::Cancelled);
        }
        Ok(())
    }
}

/// Move every object of the kinds in `registry` found in `namespace` ("" for
/// all namespaces) with default settings. Returns the plan executed, or the
/// plan that would run when `dry_run` is set.
///
/// The registry must name every kind the objects reference: a Cluster whose
/// infrastructureRef points at a kind the registry lacks fails validation.
/// [`discover_movable_kinds`](crate::discover_movable_kinds) builds one from
/// the provider CRDs installed on the source.
pub async fn run_move(
    source: Arc<dyn ResourceAccessor>,
    target: Arc<dyn ResourceAccessor>,
    registry: MovableKindRegistry,
    namespace: &str,
    dry_run: bool,
) -> Result<MovePlan, MoveError> {
    let mut coordinator = MoveCoordinator::new(source, target, registry, MoveConfig::default());
    let options = MoveOptions {
        namespace: namespace.to_string(),
        cluster: None,
        dry_run,
    };
    Ok(coordinator.run(&options).await?.plan)
}
