//! Process-global sampling of hash table telemetry.
//!
//! A small, configurable fraction of tables registers with a global
//! registry at their first heap allocation. Sampled tables feed a handful
//! of relaxed atomic counters (probe lengths, erase counts, capacity, a
//! hash checksum) on their hot-path operations; everything else about
//! their behavior is unchanged, except that a sampled table never returns
//! to inline storage, since the registration outlives the allocation.
//!
//! Sampling is off by default. Turn it on with [`set_sampling_enabled`]
//! and pick a rate with [`set_sampling_stride`]; a stride of `n` samples
//! roughly one in `n` tables, decided by a per-thread countdown so the
//! check costs a thread-local decrement on the allocation path.
//!
//! Consumers read the registry with [`for_each_sample`]. Handles are
//! reference-counted; a sample disappears from the registry sweep once
//! its table is gone.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

static ENABLED: AtomicBool = AtomicBool::new(false);
static STRIDE: AtomicU64 = AtomicU64::new(1 << 10);

fn registry() -> &'static Mutex<Vec<Weak<TableStats>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Weak<TableStats>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

std::thread_local! {
    // None until the thread's first eligible allocation; initialized to a
    // full stride so enabling sampling does not instantly sample every
    // thread's next table.
    static COUNTDOWN: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Enables or disables sampling of newly allocated tables. Existing
/// samples keep recording either way.
pub fn set_sampling_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Sets the sampling stride: roughly one in `stride` tables is sampled.
/// A stride of 1 samples every table.
pub fn set_sampling_stride(stride: u64) {
    STRIDE.store(stride.max(1), Ordering::Relaxed);
}

/// Resets the calling thread's sampling countdown so the next eligible
/// table allocation re-draws it from the current stride. Mainly useful in
/// tests that flip the sampling configuration.
pub fn reset_thread_sample_countdown() {
    COUNTDOWN.with(|countdown| countdown.set(None));
}

/// Telemetry recorded by one sampled table.
///
/// All counters are updated with relaxed atomics; readers get a
/// consistent-enough snapshot for profiling purposes, not a linearizable
/// one.
#[derive(Debug)]
pub struct TableStats {
    slot_size: usize,
    slot_align: usize,
    soo_capacity: usize,

    size: AtomicUsize,
    capacity: AtomicUsize,
    max_reserve: AtomicUsize,
    num_erases: AtomicU64,
    num_rehashes: AtomicU64,
    total_probe_length: AtomicU64,
    max_probe_length: AtomicU64,
    hashes_bitwise_xor: AtomicU64,
}

impl TableStats {
    fn new(slot_size: usize, slot_align: usize, soo_capacity: usize) -> Self {
        TableStats {
            slot_size,
            slot_align,
            soo_capacity,
            size: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            max_reserve: AtomicUsize::new(0),
            num_erases: AtomicU64::new(0),
            num_rehashes: AtomicU64::new(0),
            total_probe_length: AtomicU64::new(0),
            max_probe_length: AtomicU64::new(0),
            hashes_bitwise_xor: AtomicU64::new(0),
        }
    }

    /// Size in bytes of one element slot.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Alignment in bytes of one element slot.
    pub fn slot_align(&self) -> usize {
        self.slot_align
    }

    /// Inline capacity of the sampled table's type (0 when the type does
    /// not qualify for inline storage).
    pub fn soo_capacity(&self) -> usize {
        self.soo_capacity
    }

    /// Current element count.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Slot count of the most recent allocation.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Largest element count ever requested via `reserve`.
    pub fn max_reserve(&self) -> usize {
        self.max_reserve.load(Ordering::Relaxed)
    }

    /// Number of erase operations.
    pub fn num_erases(&self) -> u64 {
        self.num_erases.load(Ordering::Relaxed)
    }

    /// Number of in-place rebuilds.
    pub fn num_rehashes(&self) -> u64 {
        self.num_rehashes.load(Ordering::Relaxed)
    }

    /// Sum of probe lengths (in groups) over all inserts.
    pub fn total_probe_length(&self) -> u64 {
        self.total_probe_length.load(Ordering::Relaxed)
    }

    /// Longest insert probe (in groups) observed.
    pub fn max_probe_length(&self) -> u64 {
        self.max_probe_length.load(Ordering::Relaxed)
    }

    /// XOR of every inserted element's hash. Useful for spotting
    /// degenerate hash functions in aggregate dashboards.
    pub fn hashes_bitwise_xor(&self) -> u64 {
        self.hashes_bitwise_xor.load(Ordering::Relaxed)
    }

    pub(crate) fn record_insert(&self, hash: u64, probe_len: usize) {
        self.size.fetch_add(1, Ordering::Relaxed);
        self.hashes_bitwise_xor.fetch_xor(hash, Ordering::Relaxed);
        self.total_probe_length
            .fetch_add(probe_len as u64, Ordering::Relaxed);
        self.max_probe_length
            .fetch_max(probe_len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_erase(&self) {
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.num_erases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resize(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub(crate) fn record_rehash(&self) {
        self.num_rehashes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reserve(&self, requested: usize) {
        self.max_reserve.fetch_max(requested, Ordering::Relaxed);
    }
}

/// Decides whether the table allocating right now should be sampled, and
/// if so registers and returns its stats handle.
pub(crate) fn maybe_sample(
    slot_size: usize,
    slot_align: usize,
    soo_capacity: usize,
) -> Option<Arc<TableStats>> {
    if !ENABLED.load(Ordering::Relaxed) {
        return None;
    }
    let stride = STRIDE.load(Ordering::Relaxed).max(1);
    let due = COUNTDOWN.with(|countdown| {
        let remaining = match countdown.get() {
            Some(remaining) => remaining,
            None => stride - 1,
        };
        if remaining > 0 {
            countdown.set(Some(remaining - 1));
            false
        } else {
            countdown.set(Some(stride - 1));
            true
        }
    });
    if !due {
        return None;
    }

    let stats = Arc::new(TableStats::new(slot_size, slot_align, soo_capacity));
    let mut registry = registry().lock().unwrap();
    // Compact dead entries while we hold the lock anyway.
    registry.retain(|weak| weak.strong_count() > 0);
    registry.push(Arc::downgrade(&stats));
    Some(stats)
}

/// Calls `f` for every live sample currently in the registry.
pub fn for_each_sample(mut f: impl FnMut(&TableStats)) {
    let samples: Vec<Arc<TableStats>> = {
        let mut registry = registry().lock().unwrap();
        registry.retain(|weak| weak.strong_count() > 0);
        registry.iter().filter_map(Weak::upgrade).collect()
    };
    for sample in &samples {
        f(sample);
    }
}
