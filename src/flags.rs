/// Collector configuration. One instance lives on the heap for the process
/// lifetime; phases read it, nothing writes it after setup.
#[derive(Clone, Debug)]
pub struct Flags {
    /// Master switch for compaction.
    pub compact: bool,
    pub compact_code_space: bool,
    pub compact_maps: bool,
    /// Allow evacuating old-space pages while a mutator stack is present.
    pub compact_with_stack: bool,
    pub compact_code_space_with_stack: bool,

    // Test and fuzzer modes.
    pub compact_on_every_full_gc: bool,
    pub stress_compaction: bool,
    pub stress_compaction_random: bool,
    pub manual_evacuation_candidates_selection: bool,

    /// Disables compaction when the embedder asked to reduce memory.
    pub gc_experiment_less_compaction: bool,

    pub parallel_compaction: bool,
    pub parallel_marking: bool,
    pub concurrent_marking: bool,
    pub concurrent_sweeping: bool,
    pub concurrent_sparkplug: bool,
    pub parallel_pointer_update: bool,

    /// Fixpoint rounds before falling back to the linear ephemeron
    /// algorithm.
    pub ephemeron_fixpoint_iterations: usize,

    pub minor_mc: bool,
    pub minor_mc_sweeping: bool,
    pub minor_mc_trace_fragmentation: bool,

    pub flush_bytecode: bool,
    pub flush_baseline_code: bool,

    pub page_promotion: bool,
    /// Percentage of page area that must be live for whole-page promotion.
    pub page_promotion_threshold: usize,

    pub crash_on_aborted_evacuation: bool,

    /// Heap verification after marking / evacuation (always on in debug
    /// builds).
    pub verify_heap: bool,

    /// Promote internalizable strings into the shared old space.
    pub shared_string_table: bool,

    // Diagnostics only; routed through `log`.
    pub trace_gc: bool,
    pub trace_fragmentation: bool,
    pub trace_fragmentation_verbose: bool,
    pub trace_evacuation: bool,

    /// Memory-reducing mode: fixed candidate-selection thresholds, no
    /// whole-page promotion.
    pub reduce_memory: bool,
    /// Softer memory mode with its own evacuation quota.
    pub optimize_for_memory: bool,

    pub nursery_size: usize,
    pub worker_threads: usize,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            compact: true,
            compact_code_space: false,
            compact_maps: false,
            compact_with_stack: true,
            compact_code_space_with_stack: false,
            compact_on_every_full_gc: false,
            stress_compaction: false,
            stress_compaction_random: false,
            manual_evacuation_candidates_selection: false,
            gc_experiment_less_compaction: false,
            parallel_compaction: true,
            parallel_marking: true,
            concurrent_marking: false,
            concurrent_sweeping: true,
            concurrent_sparkplug: false,
            parallel_pointer_update: true,
            ephemeron_fixpoint_iterations: 10,
            minor_mc: true,
            minor_mc_sweeping: true,
            minor_mc_trace_fragmentation: false,
            flush_bytecode: true,
            flush_baseline_code: false,
            page_promotion: true,
            page_promotion_threshold: 70,
            crash_on_aborted_evacuation: false,
            verify_heap: cfg!(debug_assertions),
            shared_string_table: false,
            trace_gc: false,
            trace_fragmentation: false,
            trace_fragmentation_verbose: false,
            trace_evacuation: false,
            reduce_memory: false,
            optimize_for_memory: false,
            nursery_size: 4 * 1024 * 1024,
            worker_threads: 4,
        }
    }
}

impl Flags {
    /// Compaction is still wanted once memory-pressure experiments are
    /// taken into account.
    pub fn should_compact(&self) -> bool {
        self.compact && !(self.gc_experiment_less_compaction && self.reduce_memory)
    }
}
