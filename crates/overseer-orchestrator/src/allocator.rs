use crate::metrics::MetricsSnapshot;
use crate::types::{Task, Worker};
use crate::worker::WorkerBackend;
use overseer_core::{AllocationStrategy, OverseerError, OverseerResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Tracks registered workers, their weights and loads, and produces worker
/// assignments for subtasks.
///
/// Iteration order is the worker-id order (`BTreeMap`), which is also the
/// deterministic tie-break for every strategy.
pub struct WorkerRegistry {
    workers: BTreeMap<String, Worker>,
    backends: HashMap<String, Arc<dyn WorkerBackend>>,
    strategy: AllocationStrategy,
    high_priority_cutoff: u8,
    default_max_load: usize,
    rng: StdRng,
}

impl WorkerRegistry {
    /// Create a registry using the given strategy.
    ///
    /// `seed` makes the weighted strategy reproducible; when absent the RNG
    /// is seeded from the OS.
    pub fn new(
        strategy: AllocationStrategy,
        high_priority_cutoff: u8,
        default_max_load: usize,
        seed: Option<u64>,
    ) -> Self {
        Self {
            workers: BTreeMap::new(),
            backends: HashMap::new(),
            strategy,
            high_priority_cutoff,
            default_max_load,
            rng: seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64),
        }
    }

    /// Register a worker. Replaces any existing worker with the same id.
    pub fn add_worker(
        &mut self,
        id: impl Into<String>,
        weight: f64,
        capabilities: Option<BTreeSet<String>>,
        backend: Arc<dyn WorkerBackend>,
    ) -> OverseerResult<()> {
        let id = id.into();
        if weight <= 0.0 || !weight.is_finite() {
            return Err(OverseerError::Config(format!(
                "worker {id} weight must be positive, got {weight}"
            )));
        }
        info!(worker = %id, weight, "registering worker");
        self.workers.insert(
            id.clone(),
            Worker {
                id: id.clone(),
                weight,
                capabilities,
                current_load: 0,
                max_load: self.default_max_load,
            },
        );
        self.backends.insert(id, backend);
        Ok(())
    }

    /// Remove a worker. In-flight invocations on it are unaffected; it simply
    /// receives no further assignments.
    pub fn remove_worker(&mut self, id: &str) -> bool {
        self.backends.remove(id);
        self.workers.remove(id).is_some()
    }

    /// Change a worker's allocation weight, effective for the next assignment.
    pub fn adjust_weight(&mut self, id: &str, weight: f64) -> OverseerResult<()> {
        if weight <= 0.0 || !weight.is_finite() {
            return Err(OverseerError::Config(format!(
                "worker {id} weight must be positive, got {weight}"
            )));
        }
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| OverseerError::Orchestrator(format!("unknown worker: {id}")))?;
        debug!(worker = %id, old = worker.weight, new = weight, "adjusting weight");
        worker.weight = weight;
        Ok(())
    }

    /// Pick a worker for the task and count the assignment against its load.
    ///
    /// Fails with [`OverseerError::NoEligibleWorker`] when no capability set
    /// matches, or [`OverseerError::NoCapacity`] when every eligible worker
    /// is at its load ceiling.
    pub fn assign(&mut self, task: &Task) -> OverseerResult<String> {
        let eligible: Vec<&Worker> = self
            .workers
            .values()
            .filter(|w| w.is_eligible(task))
            .collect();
        if eligible.is_empty() {
            return Err(OverseerError::NoEligibleWorker { task_id: task.id });
        }

        let available: Vec<&Worker> = eligible
            .iter()
            .copied()
            .filter(|w| w.has_capacity())
            .collect();
        if available.is_empty() {
            return Err(OverseerError::NoCapacity);
        }

        let chosen = match self.strategy {
            AllocationStrategy::Balanced => Self::pick_balanced(&available),
            AllocationStrategy::Priority => {
                if task.priority > self.high_priority_cutoff {
                    let tier = self.top_weight_tier();
                    let tiered: Vec<&Worker> = available
                        .iter()
                        .copied()
                        .filter(|w| tier.contains(&w.id))
                        .collect();
                    if tiered.is_empty() {
                        // Weight tiering is an optimization, not an admission
                        // rule; fall back rather than starve the task.
                        Self::pick_balanced(&available)
                    } else {
                        Self::pick_balanced(&tiered)
                    }
                } else {
                    Self::pick_balanced(&available)
                }
            }
            AllocationStrategy::Weighted => {
                let total: f64 = available.iter().map(|w| w.weight).sum();
                let mut roll = self.rng.random_range(0.0..total);
                let mut picked = available[available.len() - 1].id.clone();
                for worker in &available {
                    if roll < worker.weight {
                        picked = worker.id.clone();
                        break;
                    }
                    roll -= worker.weight;
                }
                picked
            }
        };

        debug!(worker = %chosen, task_id = %task.id, priority = task.priority, "assigned");
        if let Some(worker) = self.workers.get_mut(&chosen) {
            worker.current_load += 1;
        }
        Ok(chosen)
    }

    /// Lowest load-per-weight ratio; ties broken by id (the slice is already
    /// in id order).
    fn pick_balanced(candidates: &[&Worker]) -> String {
        let mut best = candidates[0];
        for worker in &candidates[1..] {
            if worker.load_ratio() < best.load_ratio() {
                best = worker;
            }
        }
        best.id.clone()
    }

    /// Ids of workers whose weight ranks in the top third of all registered
    /// workers.
    fn top_weight_tier(&self) -> BTreeSet<String> {
        let mut ranked: Vec<&Worker> = self.workers.values().collect();
        ranked.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        let tier_size = ranked.len().div_ceil(3);
        ranked
            .iter()
            .take(tier_size)
            .map(|w| w.id.clone())
            .collect()
    }

    /// Release one unit of load after an invocation completes.
    pub fn release(&mut self, id: &str) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.current_load = worker.current_load.saturating_sub(1);
        }
    }

    /// Backend handle for an assigned worker.
    pub fn backend(&self, id: &str) -> Option<Arc<dyn WorkerBackend>> {
        self.backends.get(id).cloned()
    }

    /// Current per-worker loads.
    pub fn loads(&self) -> HashMap<String, usize> {
        self.workers
            .iter()
            .map(|(id, w)| (id.clone(), w.current_load))
            .collect()
    }

    /// Snapshot of the registered worker records.
    pub fn workers(&self) -> Vec<Worker> {
        self.workers.values().cloned().collect()
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Recompute weights from recent per-worker success rates.
    ///
    /// A worker's new weight is its success rate floored at 0.1, so a failing
    /// worker keeps a trickle of work and can climb back. Workers without
    /// recorded invocations keep their current weight. Takes effect for the
    /// next assignment only; running invocations are never preempted.
    pub fn optimize_resources(&mut self, snapshot: &MetricsSnapshot) {
        for (id, worker) in &mut self.workers {
            if let Some(rate) = snapshot
                .per_worker
                .get(id)
                .and_then(|stats| stats.success_rate())
            {
                let new_weight = rate.max(0.1);
                if (new_weight - worker.weight).abs() > f64::EPSILON {
                    info!(worker = %id, old = worker.weight, new = new_weight, "reweighting from metrics");
                    worker.weight = new_weight;
                }
            }
        }
    }
}
