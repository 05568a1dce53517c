//! Background collection of nodes no store can reach any more.
//!
//! A sweep marks everything reachable from every head and every committed
//! version without blocking writers. It then takes the reclamation gate
//! exclusively, re-marks whatever was committed meanwhile and drops the rest
//! along with its content and properties.
//!
//! Indirection is resolved by path, so a node seen through a layered
//! directory is always also reachable from the root of the store it lives in.
//! Walking every store's roots therefore covers cross-store reachability.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use crate::config::ReaperConfig;
use crate::fs::error::AvmResult;
use crate::storage::repository::AvmRepository;
use crate::storage::traits::PropertyOwner;
use crate::types::NodeId;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapStats {
    pub roots: usize,
    pub reachable: usize,
    pub reclaimed_nodes: usize,
    pub reclaimed_contents: usize,
    pub reclaimed_property_owners: usize,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct OrphanReaper {
    repo: Arc<AvmRepository>,
    config: ReaperConfig,
    running: Mutex<Option<Running>>,
}

impl OrphanReaper {
    pub fn new(repo: Arc<AvmRepository>, config: ReaperConfig) -> Self {
        Self { repo, config, running: Mutex::new(None) }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Spawns the periodic sweep. Calling it while running does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let (shutdown, mut stopped) = watch::channel(false);
        let repo = self.repo.clone();
        let yield_every = self.config.yield_every.max(1);
        let period = Duration::from_secs(self.config.interval_seconds.max(1));

        let task = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = sweep(&repo, yield_every).await {
                            tracing::warn!(error = %e, "Orphan sweep failed, retrying next interval");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            tracing::debug!("Orphan reaper stopped");
        });

        tracing::info!(interval_seconds = period.as_secs(), "Orphan reaper started");
        *running = Some(Running { shutdown, task });
    }

    /// Signals the background task and waits for an in-flight sweep to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Running { shutdown, task }) = running {
            let _ = shutdown.send(true);
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Orphan reaper task ended abnormally");
            }
        }
    }

    pub async fn sweep_once(&self) -> AvmResult<ReapStats> {
        sweep(&self.repo, self.config.yield_every.max(1)).await
    }
}

/// Every head root and committed version root of the registered stores.
fn current_roots(repo: &AvmRepository) -> Vec<NodeId> {
    let mut roots = Vec::new();
    for handle in repo.stores.all() {
        handle.read(|record| {
            roots.push(record.head_root);
            roots.extend(record.versions.iter().map(|v| v.root));
        });
    }
    roots.sort_unstable();
    roots.dedup();
    roots
}

struct Marker {
    marked: HashSet<NodeId>,
    /// Already marked nodes whose entries changed while marking.
    revisit: HashSet<NodeId>,
    visited: usize,
}

impl Marker {
    fn new() -> Self {
        Self { marked: HashSet::new(), revisit: HashSet::new(), visited: 0 }
    }

    /// Returns whether `id` still needs its children walked.
    fn claim(&mut self, id: NodeId) -> bool {
        if self.marked.contains(&id) {
            return self.revisit.remove(&id);
        }
        self.marked.insert(id)
    }

    fn children(repo: &AvmRepository, id: NodeId) -> Vec<NodeId> {
        repo.arena
            .get(id)
            .and_then(|node| node.entries().map(|e| e.values().map(|c| c.node_id).collect()))
            .unwrap_or_default()
    }

    /// Concurrent phase. Yields to the runtime every `yield_every` nodes.
    async fn mark_yielding(&mut self, repo: &AvmRepository, roots: &[NodeId], yield_every: usize) {
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !self.claim(id) {
                continue;
            }
            stack.extend(Self::children(repo, id));
            self.visited += 1;
            if self.visited % yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Exclusive phase, run with no transaction in flight.
    fn mark(&mut self, repo: &AvmRepository, roots: &[NodeId]) {
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if self.claim(id) {
                stack.extend(Self::children(repo, id));
            }
        }
    }
}

/// Nearest surviving predecessor for nodes whose ancestor is about to go.
fn relinks(repo: &AvmRepository, marked: &HashSet<NodeId>) -> Vec<(NodeId, Option<NodeId>)> {
    let mut out = Vec::new();
    for id in marked {
        let Some(node) = repo.arena.get(*id) else {
            continue;
        };
        let Some(first) = node.ancestor.filter(|a| !marked.contains(a)) else {
            continue;
        };
        let mut cursor = Some(first);
        let mut hops = 0;
        while let Some(candidate) = cursor {
            if marked.contains(&candidate) || hops > repo.config.max_path_depth {
                break;
            }
            cursor = repo.arena.get(candidate).and_then(|n| n.ancestor);
            hops += 1;
        }
        out.push((*id, cursor.filter(|c| marked.contains(c))));
    }
    out
}

pub(crate) async fn sweep(repo: &AvmRepository, yield_every: usize) -> AvmResult<ReapStats> {
    let started = std::time::Instant::now();
    repo.arena.begin_tracking();
    let roots = current_roots(repo);
    let mut marker = Marker::new();
    marker.mark_yielding(repo, &roots, yield_every).await;

    let _gate = repo.gate.write().await;
    marker.revisit = repo.arena.take_touched();
    let latest = current_roots(repo);
    marker.mark(repo, &latest);
    let revisit: Vec<NodeId> =
        marker.revisit.iter().copied().filter(|id| marker.marked.contains(id)).collect();
    marker.mark(repo, &revisit);

    let marked = marker.marked;
    let garbage: Vec<NodeId> =
        repo.arena.ids().into_iter().filter(|id| !marked.contains(id)).collect();
    let mut stats = ReapStats { roots: latest.len(), reachable: marked.len(), ..ReapStats::default() };

    if !garbage.is_empty() {
        repo.arena.relink_ancestors(&relinks(repo, &marked));
        stats.reclaimed_nodes = repo.arena.remove_all(&garbage);
        repo.cache.invalidate_all();
    }

    let live_content: HashSet<_> = repo
        .arena
        .ids()
        .into_iter()
        .filter_map(|id| repo.arena.get(id))
        .filter_map(|node| node.content().map(|c| c.content_id))
        .collect();
    for content_id in repo.blobs.list().await? {
        if !live_content.contains(&content_id) && repo.blobs.delete(content_id).await? {
            stats.reclaimed_contents += 1;
        }
    }

    let live_stores: HashSet<_> = repo.stores.all().iter().map(|h| h.id).collect();
    for owner in repo.properties.owners().await? {
        let orphaned = match owner {
            PropertyOwner::Node(id) => !repo.arena.contains(id),
            PropertyOwner::Store(id) => !live_stores.contains(&id),
        };
        if orphaned {
            repo.properties.delete_all(owner).await?;
            stats.reclaimed_property_owners += 1;
        }
    }
    drop(_gate);

    if let Some(metrics) = &repo.metrics {
        metrics.reaper_sweeps_total.inc();
        metrics.reaper_reclaimed_total.inc_by(stats.reclaimed_nodes as f64);
        metrics.nodes.set(repo.arena.len() as f64);
    }
    tracing::info!(
        roots = stats.roots,
        reachable = stats.reachable,
        reclaimed_nodes = stats.reclaimed_nodes,
        reclaimed_contents = stats.reclaimed_contents,
        reclaimed_property_owners = stats.reclaimed_property_owners,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Orphan sweep finished"
    );
    Ok(stats)
}
