//! # Resource Model
//!
//! Worker descriptors, capability constraints and the matching rules the
//! scheduler applies before dispatching a task implementation.
//!
//! Matching is additive: a worker satisfies a constraint set iff every
//! declared attribute is pointwise at or above the requirement. Capacity
//! (free cores, GPUs, memory) is tracked separately from capability so a
//! busy-but-capable worker stays a valid future target.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::config::{HostEntry, ProcessorEntry, ProcessorKind, WorkerEntry};

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Additive attribute predicates a task implementation requires
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Constraints {
    /// Required processor architecture, if any
    pub processor_architecture: Option<String>,
    /// Minimum CPU cores reserved while the task runs
    pub processor_core_count: u32,
    /// Minimum GPUs reserved while the task runs
    pub gpu_count: u32,
    /// Minimum physical memory, GB
    pub memory_physical_gb: f64,
    /// Minimum virtual memory, GB
    pub memory_virtual_gb: f64,
    /// Minimum per-element storage, GB
    pub storage_elem_gb: f64,
    /// Exact operating system type, if any
    pub operating_system_type: Option<String>,
    /// Software packages the host must provide (superset match)
    pub app_software: BTreeSet<String>,
    /// Exact batch queue the worker must accept, if any
    pub host_queue: Option<String>,
}

impl Constraints {
    /// A one-core constraint set, the implicit default for plain methods
    pub fn one_core() -> Self {
        Self {
            processor_core_count: 1,
            ..Self::default()
        }
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.processor_core_count = cores;
        self
    }

    pub fn with_gpus(mut self, gpus: u32) -> Self {
        self.gpu_count = gpus;
        self
    }

    pub fn with_memory_gb(mut self, gb: f64) -> Self {
        self.memory_physical_gb = gb;
        self
    }

    pub fn with_architecture(mut self, arch: impl Into<String>) -> Self {
        self.processor_architecture = Some(arch.into());
        self
    }

    pub fn with_software(mut self, pkg: impl Into<String>) -> Self {
        self.app_software.insert(pkg.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.host_queue = Some(queue.into());
        self
    }

    /// Multiply per-node amounts by processes-per-node (MPI layouts)
    pub fn scale_up_by(&self, ppn: u32) -> Self {
        let ppn = ppn.max(1);
        Self {
            processor_core_count: self.processor_core_count * ppn,
            gpu_count: self.gpu_count * ppn,
            memory_physical_gb: self.memory_physical_gb * ppn as f64,
            memory_virtual_gb: self.memory_virtual_gb * ppn as f64,
            storage_elem_gb: self.storage_elem_gb,
            ..self.clone()
        }
    }
}

/// A distinct constraint set per implementation of one core element
///
/// The scheduler picks the best-matching implementation for the worker at
/// hand; `best_match` returns the index of the cheapest satisfiable
/// variant (fewest reserved cores, then fewest GPUs).
#[derive(Debug, Clone, Default)]
pub struct MultiConstraints {
    pub variants: Vec<Constraints>,
}

impl MultiConstraints {
    pub fn single(constraints: Constraints) -> Self {
        Self {
            variants: vec![constraints],
        }
    }

    pub fn best_match(&self, profile: &ResourceProfile) -> Option<usize> {
        self.variants
            .iter()
            .enumerate()
            .filter(|(_, c)| profile.satisfies(c))
            .min_by_key(|(_, c)| (c.processor_core_count, c.gpu_count))
            .map(|(i, _)| i)
    }
}

// ============================================================================
// RESOURCE PROFILE
// ============================================================================

/// Everything a worker is capable of, independent of current load
#[derive(Debug, Clone, Default)]
pub struct ResourceProfile {
    pub processors: Vec<ProcessorEntry>,
    pub total_cores: u32,
    pub gpu_count: u32,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub operating_system: Option<String>,
    pub software: BTreeSet<String>,
    pub queues: BTreeSet<String>,
    pub images: BTreeSet<String>,
}

impl ResourceProfile {
    /// Combine the topology entry for a worker with its host hardware
    pub fn from_config(worker: &WorkerEntry, host: Option<&HostEntry>) -> Self {
        let mut profile = Self {
            queues: worker.queues.iter().cloned().collect(),
            images: worker.images.iter().cloned().collect(),
            ..Self::default()
        };

        if let Some(host) = host {
            profile.processors = host.processors.clone();
            profile.total_cores = host
                .processors
                .iter()
                .filter(|p| p.kind == ProcessorKind::Cpu)
                .map(|p| p.cores)
                .sum();
            profile.gpu_count = host
                .processors
                .iter()
                .filter(|p| p.kind == ProcessorKind::Gpu)
                .map(|p| p.cores)
                .sum();
            profile.memory_gb = host.memory_gb;
            profile.storage_gb = host.storage_gb;
            profile.operating_system = host.operating_system.clone();
            profile.software = host.software.iter().cloned().collect();
        }

        profile
    }

    /// Pointwise capability check against a constraint set
    pub fn satisfies(&self, c: &Constraints) -> bool {
        if let Some(arch) = &c.processor_architecture {
            if !self
                .processors
                .iter()
                .any(|p| p.architecture.eq_ignore_ascii_case(arch))
            {
                return false;
            }
        }
        if self.total_cores < c.processor_core_count {
            return false;
        }
        if self.gpu_count < c.gpu_count {
            return false;
        }
        if self.memory_gb < c.memory_physical_gb {
            return false;
        }
        if self.memory_gb < c.memory_virtual_gb {
            return false;
        }
        if self.storage_gb < c.storage_elem_gb {
            return false;
        }
        if let Some(os) = &c.operating_system_type {
            match &self.operating_system {
                Some(mine) if mine.eq_ignore_ascii_case(os) => {}
                _ => return false,
            }
        }
        if !c.app_software.is_subset(&self.software) {
            return false;
        }
        if let Some(queue) = &c.host_queue {
            if !self.queues.contains(queue) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Mutable load state of a worker; guarded by the per-resource lock
#[derive(Debug, Clone)]
struct Capacity {
    cores_free: u32,
    gpus_free: u32,
    memory_free_gb: f64,
    /// Tasks dispatched to this worker and not yet terminal
    running: usize,
    /// Tasks the scheduler has earmarked but not yet dispatched
    queued: usize,
}

/// A compute resource the scheduler can dispatch to
///
/// Capability (`profile`) is immutable after construction; load state is
/// behind a mutex because lifecycle events and the scheduler touch it
/// from different threads.
#[derive(Debug)]
pub struct Worker {
    pub name: String,
    pub host: String,
    pub working_dir: String,
    pub profile: ResourceProfile,
    state: Mutex<Capacity>,
}

pub type WorkerRef = Arc<Worker>;

impl Worker {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        working_dir: impl Into<String>,
        profile: ResourceProfile,
    ) -> WorkerRef {
        let state = Capacity {
            cores_free: profile.total_cores,
            gpus_free: profile.gpu_count,
            memory_free_gb: profile.memory_gb,
            running: 0,
            queued: 0,
        };
        Arc::new(Self {
            name: name.into(),
            host: host.into(),
            working_dir: working_dir.into(),
            profile,
            state: Mutex::new(state),
        })
    }

    pub fn from_config(worker: &WorkerEntry, host: Option<&HostEntry>) -> WorkerRef {
        Self::new(
            &worker.name,
            &worker.host,
            &worker.working_dir,
            ResourceProfile::from_config(worker, host),
        )
    }

    /// Atomically reserve the amounts a constraint set needs
    ///
    /// Returns false without side effects when free capacity is short.
    pub fn try_reserve(&self, c: &Constraints) -> bool {
        let mut state = self.state.lock().expect("worker lock");
        if state.cores_free < c.processor_core_count
            || state.gpus_free < c.gpu_count
            || state.memory_free_gb < c.memory_physical_gb
        {
            return false;
        }
        state.cores_free -= c.processor_core_count;
        state.gpus_free -= c.gpu_count;
        state.memory_free_gb -= c.memory_physical_gb;
        state.running += 1;
        true
    }

    /// Return the amounts reserved by `try_reserve`
    pub fn release(&self, c: &Constraints) {
        let mut state = self.state.lock().expect("worker lock");
        state.cores_free =
            (state.cores_free + c.processor_core_count).min(self.profile.total_cores);
        state.gpus_free = (state.gpus_free + c.gpu_count).min(self.profile.gpu_count);
        state.memory_free_gb =
            (state.memory_free_gb + c.memory_physical_gb).min(self.profile.memory_gb);
        state.running = state.running.saturating_sub(1);
    }

    pub fn queued_inc(&self) {
        self.state.lock().expect("worker lock").queued += 1;
    }

    pub fn queued_dec(&self) {
        let mut state = self.state.lock().expect("worker lock");
        state.queued = state.queued.saturating_sub(1);
    }

    /// Queued plus running tasks; the load-balancing score input
    pub fn load(&self) -> usize {
        let state = self.state.lock().expect("worker lock");
        state.running + state.queued
    }

    pub fn cores_free(&self) -> u32 {
        self.state.lock().expect("worker lock").cores_free
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(cores: u32, memory_gb: f64) -> ResourceProfile {
        ResourceProfile {
            processors: vec![ProcessorEntry {
                name: "main".into(),
                architecture: "x86_64".into(),
                speed_ghz: 2.4,
                cores,
                kind: ProcessorKind::Cpu,
            }],
            total_cores: cores,
            gpu_count: 0,
            memory_gb,
            storage_gb: 100.0,
            operating_system: Some("Linux".into()),
            software: ["python3".to_string()].into_iter().collect(),
            queues: ["batch".to_string()].into_iter().collect(),
            images: BTreeSet::new(),
        }
    }

    #[test]
    fn satisfies_pointwise() {
        let p = profile(8, 64.0);
        assert!(p.satisfies(&Constraints::one_core()));
        assert!(p.satisfies(&Constraints::one_core().with_cores(8).with_memory_gb(64.0)));
        assert!(!p.satisfies(&Constraints::one_core().with_cores(9)));
        assert!(!p.satisfies(&Constraints::one_core().with_memory_gb(65.0)));
    }

    #[test]
    fn satisfies_checks_architecture_and_os() {
        let p = profile(4, 16.0);
        assert!(p.satisfies(&Constraints::one_core().with_architecture("x86_64")));
        assert!(p.satisfies(&Constraints::one_core().with_architecture("X86_64")));
        assert!(!p.satisfies(&Constraints::one_core().with_architecture("aarch64")));

        let mut c = Constraints::one_core();
        c.operating_system_type = Some("Linux".into());
        assert!(p.satisfies(&c));
        c.operating_system_type = Some("Windows".into());
        assert!(!p.satisfies(&c));
    }

    #[test]
    fn satisfies_software_superset_and_queue() {
        let p = profile(4, 16.0);
        assert!(p.satisfies(&Constraints::one_core().with_software("python3")));
        assert!(!p.satisfies(&Constraints::one_core().with_software("fortran")));
        assert!(p.satisfies(&Constraints::one_core().with_queue("batch")));
        assert!(!p.satisfies(&Constraints::one_core().with_queue("debug")));
    }

    #[test]
    fn scale_up_multiplies_per_node_amounts() {
        let c = Constraints::one_core().with_cores(2).with_memory_gb(4.0);
        let scaled = c.scale_up_by(4);
        assert_eq!(scaled.processor_core_count, 8);
        assert_eq!(scaled.memory_physical_gb, 16.0);
        // Per-element storage is not per-node
        assert_eq!(scaled.storage_elem_gb, c.storage_elem_gb);
    }

    #[test]
    fn multi_constraints_picks_cheapest_satisfiable() {
        let p = profile(4, 16.0);
        let multi = MultiConstraints {
            variants: vec![
                Constraints::one_core().with_cores(8), // too big
                Constraints::one_core().with_cores(2),
                Constraints::one_core().with_cores(4),
            ],
        };
        assert_eq!(multi.best_match(&p), Some(1));

        let impossible = MultiConstraints {
            variants: vec![Constraints::one_core().with_cores(64)],
        };
        assert_eq!(impossible.best_match(&p), None);
    }

    #[test]
    fn reserve_and_release_capacity() {
        let w = Worker::new("w1", "h1", "/tmp/w1", profile(4, 16.0));
        let c = Constraints::one_core().with_cores(3).with_memory_gb(8.0);

        assert!(w.try_reserve(&c));
        assert_eq!(w.cores_free(), 1);
        assert_eq!(w.load(), 1);

        // Second reservation exceeds free cores
        assert!(!w.try_reserve(&c));

        w.release(&c);
        assert_eq!(w.cores_free(), 4);
        assert_eq!(w.load(), 0);
    }

    #[test]
    fn queued_counts_feed_load() {
        let w = Worker::new("w1", "h1", "/tmp/w1", profile(4, 16.0));
        w.queued_inc();
        w.queued_inc();
        assert_eq!(w.load(), 2);
        w.queued_dec();
        assert_eq!(w.load(), 1);
    }
}
