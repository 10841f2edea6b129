//! Scheduler-wide tunables.
//!
//! Grouped into one struct rather than free constants, the way the teacher
//! groups allocator tunables into `MallocState` instead of scattering them.

/// Whether a child's next virtual finish time is based on the global clock
/// (short-term) or on the child's own previous finish time (long-term).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FairnessMode {
    ShortTerm,
    LongTerm,
}

/// Which execution-time estimate feeds the virtual-time functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTimeModel {
    Average,
    Best,
    Worst,
}

/// Tunables shared by the alpha/beta lock and the GFQ qdisc tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Base used by the virtual-time functions (§4.5).
    pub fairness_mode: FairnessMode,
    /// Which timing sample feeds virtual execution time (§4.5).
    pub time_model: ExecutionTimeModel,
    /// Spin iterations before a deprioritized thread may retry its CAS (§4.6, ~70 cycles).
    pub spin_budget: u32,
    /// Per-group holder cap before further acquisitions wait (`MAX_COUNT`, §4.6).
    pub max_group: u32,
    /// Bound on token-CAS retries while clearing a stale "has data" bit (§4.5 step 3).
    pub dequeue_retry_bound: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fairness_mode: FairnessMode::ShortTerm,
            time_model: ExecutionTimeModel::Average,
            spin_budget: 70,
            max_group: (1u32 << 31) - 2,
            dequeue_retry_bound: 8,
        }
    }
}
