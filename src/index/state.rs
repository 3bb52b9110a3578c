//! In-memory tables behind the job index and the eligibility query.
//!
//! Everything here is synchronous and I/O free; `JobIndex` wraps it in a
//! lock and pairs every mutation with its durable write.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::spec::{ConstraintSpec, DependencySpec, FullSpec, JobSpec};
use crate::core::types::{JobId, Timestamp};
use crate::storage::StoredJobs;

/// How "first in queue" treats a queue head that is already running.
///
/// The two modes give different guarantees for the same queue `Q = [j1, j2]`:
///
/// - `RunToCompletion` keeps mutual exclusion: at most one member of a queue
///   is eligible or running at any moment. `j2` becomes eligible only after
///   `j1` is deleted.
/// - `Pipelined` keeps strict hand-out order but not exclusion: once `j1` is
///   marked running, `j2` is the queue's first non-running member and is
///   eligible right away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// The earliest-created member of the whole queue is its head, running
    /// or not. A running head blocks its queue until the job is deleted.
    #[default]
    RunToCompletion,

    /// The head is the earliest-created member that is not running, so the
    /// next job is handed out as soon as the previous one is dispatched.
    Pipelined,
}

#[derive(Debug, Default)]
pub(crate) struct IndexState {
    pub(crate) job_specs: Vec<JobSpec>,
    pub(crate) constraints_by_job: HashMap<JobId, Vec<ConstraintSpec>>,
    pub(crate) dependencies_by_job: HashMap<JobId, Vec<DependencySpec>>,
}

impl IndexState {
    pub(crate) fn from_stored(stored: StoredJobs) -> Self {
        let mut state = Self {
            job_specs: stored.job_specs,
            ..Self::default()
        };
        for constraint in stored.constraint_specs {
            state
                .constraints_by_job
                .entry(constraint.job_id.clone())
                .or_default()
                .push(constraint);
        }
        for dependency in stored.dependency_specs {
            state
                .dependencies_by_job
                .entry(dependency.job_id.clone())
                .or_default()
                .push(dependency);
        }
        state
    }

    pub(crate) fn insert(&mut self, full_specs: Vec<FullSpec>) {
        for full in full_specs {
            let id = full.job_spec.id.clone();
            if !full.constraint_specs.is_empty() {
                self.constraints_by_job
                    .entry(id.clone())
                    .or_default()
                    .extend(full.constraint_specs);
            }
            if !full.dependency_specs.is_empty() {
                self.dependencies_by_job
                    .entry(id)
                    .or_default()
                    .extend(full.dependency_specs);
            }
            self.job_specs.push(full.job_spec);
        }
    }

    pub(crate) fn get(&self, id: &JobId) -> Option<&JobSpec> {
        self.job_specs.iter().find(|j| &j.id == id)
    }

    pub(crate) fn contains(&self, id: &JobId) -> bool {
        self.get(id).is_some()
    }

    /// Swap the record with the same id for `spec`.
    pub(crate) fn replace(&mut self, spec: JobSpec) {
        if let Some(slot) = self.job_specs.iter_mut().find(|j| j.id == spec.id) {
            *slot = spec;
        }
    }

    /// Remove jobs, their own rows, and every edge that points at them.
    pub(crate) fn remove(&mut self, ids: &[JobId]) {
        let ids: HashSet<&JobId> = ids.iter().collect();
        self.job_specs.retain(|j| !ids.contains(&j.id));
        for id in &ids {
            self.constraints_by_job.remove(*id);
            self.dependencies_by_job.remove(*id);
        }
        for dependencies in self.dependencies_by_job.values_mut() {
            dependencies.retain(|d| !ids.contains(&d.depends_on_job_id));
        }
        self.dependencies_by_job.retain(|_, deps| !deps.is_empty());
    }

    /// Jobs that may be dispatched at `now`, oldest first.
    pub(crate) fn pending_jobs(&self, now: Timestamp, ordering: QueueOrdering) -> Vec<JobSpec> {
        if let Some(migration) = self.migration_job() {
            return if !migration.is_running && migration.is_due(now) {
                vec![migration.clone()]
            } else {
                Vec::new()
            };
        }

        let heads = self.queue_heads(ordering);
        let present: HashSet<&JobId> = self.job_specs.iter().map(|j| &j.id).collect();

        let mut eligible: Vec<JobSpec> = self
            .job_specs
            .iter()
            .filter(|j| !j.is_running)
            .filter(|j| match &j.queue_key {
                Some(queue) => heads.get(queue.as_str()) == Some(&&j.id),
                None => true,
            })
            .filter(|j| !self.is_blocked(&j.id, &present))
            .filter(|j| j.is_due(now))
            .cloned()
            .collect();

        eligible.sort_by_key(|j| j.create_time);
        eligible
    }

    /// Earliest-created job in the migration queue.
    fn migration_job(&self) -> Option<&JobSpec> {
        self.job_specs
            .iter()
            .filter(|j| j.is_migration())
            .min_by_key(|j| j.create_time)
    }

    /// Head job id of every queue.
    fn queue_heads(&self, ordering: QueueOrdering) -> HashMap<&str, &JobId> {
        let mut heads: HashMap<&str, &JobSpec> = HashMap::new();
        for job in &self.job_specs {
            let Some(queue) = job.queue_key.as_deref() else {
                continue;
            };
            if ordering == QueueOrdering::Pipelined && job.is_running {
                continue;
            }
            // Ties keep the earlier row so the head is stable.
            heads
                .entry(queue)
                .and_modify(|head| {
                    if job.create_time < head.create_time {
                        *head = job;
                    }
                })
                .or_insert(job);
        }
        heads.into_iter().map(|(queue, job)| (queue, &job.id)).collect()
    }

    fn is_blocked(&self, id: &JobId, present: &HashSet<&JobId>) -> bool {
        self.dependencies_by_job
            .get(id)
            .is_some_and(|deps| deps.iter().any(|d| present.contains(&d.depends_on_job_id)))
    }

    /// Edges whose `depends_on_job_id` is one of `ids`.
    fn direct_dependents(&self, ids: &HashSet<JobId>) -> Vec<DependencySpec> {
        let mut layer: Vec<DependencySpec> = self
            .dependencies_by_job
            .values()
            .flatten()
            .filter(|d| ids.contains(&d.depends_on_job_id))
            .cloned()
            .collect();
        // HashMap iteration order is arbitrary; keep layers deterministic.
        layer.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        layer
    }

    /// Every edge that directly or transitively depends on `id`, layer by layer.
    pub(crate) fn dependents_of(&self, id: &JobId) -> Vec<DependencySpec> {
        let mut seen: HashSet<JobId> = HashSet::from([id.clone()]);
        let mut frontier = seen.clone();
        let mut all = Vec::new();

        loop {
            let layer = self.direct_dependents(&frontier);
            if layer.is_empty() {
                break;
            }
            frontier = layer
                .iter()
                .map(|d| d.job_id.clone())
                .filter(|job_id| seen.insert(job_id.clone()))
                .collect();
            all.extend(layer);
            if frontier.is_empty() {
                break;
            }
        }
        all
    }

    /// Find a job that would sit on a dependency cycle if `new_specs` were inserted.
    ///
    /// Edges to ids that are neither stored nor being inserted are ignored;
    /// they never block anything.
    pub(crate) fn find_cycle(&self, new_specs: &[FullSpec]) -> Option<JobId> {
        let mut nodes: HashSet<&JobId> = self.job_specs.iter().map(|j| &j.id).collect();
        nodes.extend(new_specs.iter().map(|f| f.id()));

        let edges = self
            .dependencies_by_job
            .values()
            .flatten()
            .chain(new_specs.iter().flat_map(|f| f.dependency_specs.iter()))
            .filter(|d| nodes.contains(&d.job_id) && nodes.contains(&d.depends_on_job_id));

        // Kahn's algorithm
        let mut in_degree: HashMap<&JobId, usize> = nodes.iter().map(|id| (*id, 0)).collect();
        let mut reverse_deps: HashMap<&JobId, Vec<&JobId>> = HashMap::new();
        for edge in edges {
            *in_degree.entry(&edge.job_id).or_default() += 1;
            reverse_deps
                .entry(&edge.depends_on_job_id)
                .or_default()
                .push(&edge.job_id);
        }

        let mut queue: VecDeque<&JobId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        while let Some(id) = queue.pop_front() {
            if let Some(downstream) = reverse_deps.get(id) {
                for next in downstream {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*next);
                        }
                    }
                }
            }
        }

        in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.clone())
            .min()
    }
}
