//! A high-performance open-addressed hash table with byte-wide metadata.
//!
//! Every slot in the table is shadowed by a one-byte control tag. A full
//! slot's tag carries the low 7 bits of the element's hash, so a lookup can
//! reject almost every unrelated slot by comparing tags, touching element
//! storage only for real candidates. Tags are scanned 16 at a time with
//! SSE2 compare/movemask sequences where available, with a scalar fallback
//! that computes identical masks.
//!
//! [`HashTable<V>`] stores values of type `V` and provides fast insertion,
//! lookup, and removal operations. This is a fairly low-level structure
//! that requires you to provide the hash value and an equality predicate
//! for each operation. Prefer the [`HashMap<K, V>`] or [`HashSet<V>`]
//! wrappers for a conventional interface unless you are implementing your
//! own map or set structure.
//!
//! ## Design
//!
//! The table keeps `capacity` slots, where `capacity` is always `2^k - 1`,
//! so probe arithmetic is a mask instead of a modulo. An element's hash is
//! split in two: the upper bits (mixed with a per-table seed) select the
//! starting group of a quadratic probe over 16-slot groups, and the low 7
//! bits are stored in the control byte. Probing advances by one group,
//! then two, then three, which touches every group exactly once per
//! cycle.
//!
//! The control array holds one byte per slot, a sentinel byte at index
//! `capacity`, and 15 trailing bytes cloning the leading control bytes.
//! The clones make a 16-byte load starting at any in-range offset see
//! exactly the tags it would see after wrapping, so the hot path has no
//! wrap branch. Every control-byte write goes to the byte and to its
//! clone; for most indices the two coincide and the write just lands
//! twice.
//!
//! All storage lives in one allocation, control bytes first, then the
//! slots:
//!
//! `[ Tags | Pad | Slots ]`
//!
//! Erasing an element leaves either an empty or a tombstone. Empties
//! terminate probe chains, so a slot may only be reset to empty when no
//! chain can run through it; that holds exactly when both the group at the
//! slot and the group one width before it contain empties close enough
//! that no fully-occupied 16-byte window ever covered the slot. Otherwise
//! the slot becomes a tombstone, which probes skip but inserts may reuse.
//! When tombstones accumulate, the table rebuilds in place: full tags are
//! provisionally marked deleted, then every element moves to its ideal
//! position with a cycle-breaking swap, with no extra allocation.
//!
//! The table keeps 1/8 of its slots empty (tables smaller than one group
//! pack tightly instead). The bookkeeping is a single word holding the
//! remaining insertion budget plus a sticky tombstone bit, so the insert
//! path decides "no resize needed" with one branch.
//!
//! Sufficiently small element types get a small-object mode. The empty
//! table starts with a single inline slot in the table header itself and
//! performs no heap allocation until a second element arrives. Shrinking
//! an almost-empty table hands the element back to the inline slot.
//!
//! Each table draws a seed from a process-global counter and mixes it into
//! the probe start. Two tables holding the same elements therefore place
//! and iterate them differently, and the order changes again on every
//! rehash, so nothing can accidentally depend on it. In debug builds the
//! seed machinery is joined by a generation counter that catches
//! iterators outliving a mutation through unsafe aliasing.
//!
//! ## Safety Invariants
//!
//! The implementation relies on the following key invariants:
//!
//! 1. **Tag truth**: a full control byte implies the slot holds an
//!    initialized `V`; an empty or deleted byte implies it does not.
//!    Every transition writes the slot first and the tag second (or
//!    destroys the element first and the tag second).
//! 2. **Probe reachability**: for every live element, walking its probe
//!    sequence from the seeded start reaches its slot before any empty
//!    byte. Erase preserves this by tombstoning any slot a chain might
//!    cross.
//! 3. **Clone coherence**: `ctrl[capacity]` is always the sentinel and
//!    the bytes after it always mirror the leading bytes, so 16-byte
//!    loads at offsets `0..=capacity` stay in bounds and consistent.
//! 4. **Counter coherence**: `populated` equals the number of full tags,
//!    and `populated + growth_left + tombstones` never exceeds the load
//!    limit for the capacity.
//!
//! [`HashMap<K, V>`]: crate::hash_map::HashMap
//! [`HashSet<V>`]: crate::hash_set::HashSet

use alloc::alloc::handle_alloc_error;
use alloc::boxed::Box;
use core::alloc::Layout;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::mem;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

use cfg_if::cfg_if;

use crate::control::DELETED;
use crate::control::EMPTY;
use crate::control::GROUP_WIDTH;
use crate::control::Group;
use crate::control::GrowthInfo;
use crate::control::ProbeSeq;
use crate::control::SENTINEL;
use crate::control::capacity_to_growth;
use crate::control::convert_deleted_to_empty_and_full_to_deleted;
use crate::control::hashtag;
use crate::control::is_full;
use crate::control::is_valid_capacity;
use crate::control::max_valid_capacity;
use crate::control::mirror_index;
use crate::control::next_capacity;
use crate::control::size_to_capacity;

/// Number of elements an inline-mode table can hold.
const SOO_CAPACITY: usize = 1;

// The inline slot spans two words, the footprint the heap-mode pointer
// bookkeeping needs anyway.
const SOO_SLOT_SIZE: usize = 16;
const SOO_SLOT_ALIGN: usize = 8;

/// Whether values of type `V` fit the inline slot. Inline-eligible types
/// never get a heap table of capacity [`SOO_CAPACITY`], which is what lets
/// `capacity == SOO_CAPACITY` identify inline mode.
#[inline(always)]
const fn soo_enabled<V>() -> bool {
    mem::size_of::<V>() <= SOO_SLOT_SIZE && mem::align_of::<V>() <= SOO_SLOT_ALIGN
}

#[repr(align(8))]
#[derive(Clone, Copy)]
struct SooSlot([MaybeUninit<u8>; SOO_SLOT_SIZE]);

impl SooSlot {
    const fn new() -> Self {
        SooSlot([MaybeUninit::uninit(); SOO_SLOT_SIZE])
    }
}

static SEED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-table seed, drawn from a process-global counter. The raw counter
/// values are sequential, so they go through a finalizer to decorrelate
/// neighboring draws.
#[derive(Clone, Copy)]
struct Seed(u64);

impl Seed {
    fn next() -> Self {
        let raw = SEED_COUNTER.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
        Seed(mix64(raw))
    }
}

#[inline(always)]
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    slots_offset: usize,
}

impl DataLayout {
    fn new<V>(capacity: usize) -> Self {
        if capacity == 0 {
            return DataLayout {
                layout: Layout::new::<()>(),
                slots_offset: 0,
            };
        }
        debug_assert!(is_valid_capacity(capacity));
        let ctrl_layout = Layout::from_size_align(capacity + GROUP_WIDTH, GROUP_WIDTH)
            .expect("allocation size overflow");
        let slots_layout =
            Layout::array::<MaybeUninit<V>>(capacity).expect("allocation size overflow");
        let (layout, slots_offset) = ctrl_layout
            .extend(slots_layout)
            .expect("allocation size overflow");
        DataLayout {
            layout,
            slots_offset,
        }
    }
}

/// A high-performance open-addressed hash table with SIMD tag scanning.
///
/// `HashTable<V>` stores values of type `V` and provides fast insertion,
/// lookup, and removal operations. Unlike standard hash maps, this
/// implementation requires you to provide the hash value and an equality
/// predicate for each operation.
///
/// ## Performance Characteristics
///
/// - **Memory**: 1 byte per slot overhead, plus the size of `V`; 1/8 of
///   the slots are kept empty.
pub struct HashTable<V> {
    layout: DataLayout,
    alloc: NonNull<u8>,
    soo: SooSlot,

    capacity: usize,
    populated: usize,
    growth: GrowthInfo,
    seed: Seed,

    #[cfg(debug_assertions)]
    generation: u32,

    #[cfg(feature = "std")]
    stats: Option<std::sync::Arc<crate::sampler::TableStats>>,

    _phantom: PhantomData<V>,
}

// SAFETY: the table uniquely owns its allocation and elements; moving it
// across threads moves ownership of the `V`s with it.
unsafe impl<V: Send> Send for HashTable<V> {}
// SAFETY: shared access only hands out shared references to elements.
unsafe impl<V: Sync> Sync for HashTable<V> {}

impl<V> Debug for HashTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HashTable")
            .field("populated", &self.populated)
            .field("capacity", &self.capacity())
            .field("buckets", &self.bucket_count())
            .field("growth_left", &self.growth.growth_left())
            .field("has_tombstones", &!self.growth.has_no_deleted())
            .field("inline", &self.is_soo())
            .finish()
    }
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for HashTable<V> {
    fn drop(&mut self) {
        // SAFETY: control bytes identify the live elements, and the
        // allocation is released with the layout it was created with.
        unsafe {
            self.drop_elements();
            if self.layout.layout.size() != 0 {
                alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
            }
        }
    }
}

impl<V> Clone for HashTable<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        if self.layout.layout.size() == 0 {
            // Inline or unallocated; nothing on the heap to duplicate.
            let mut new_table = Self::new();
            if self.is_soo() && self.populated == 1 {
                // SAFETY: a populated inline table holds an initialized
                // element in its inline slot.
                unsafe {
                    new_table.soo_slot_mut().write((*self.soo_slot()).clone());
                }
                new_table.populated = 1;
                new_table.growth.overwrite_empty_as_full();
            }
            return new_table;
        }

        // Same geometry and seed, so elements keep their positions and the
        // control bytes can be copied wholesale. Tombstones come along
        // too; dropping them would sever probe chains.
        // SAFETY: the layout was validated when the source allocated;
        // allocation failure is handled.
        let new_alloc = unsafe {
            let raw = alloc::alloc::alloc(self.layout.layout);
            if raw.is_null() {
                handle_alloc_error(self.layout.layout);
            }
            core::ptr::copy_nonoverlapping(self.alloc.as_ptr(), raw, self.capacity + GROUP_WIDTH);
            NonNull::new_unchecked(raw)
        };

        let mut new_table = HashTable {
            layout: self.layout,
            alloc: new_alloc,
            soo: SooSlot::new(),
            capacity: self.capacity,
            populated: self.populated,
            growth: self.growth,
            seed: self.seed,
            #[cfg(debug_assertions)]
            generation: 0,
            #[cfg(feature = "std")]
            stats: None,
            _phantom: PhantomData,
        };
        new_table.maybe_sample();

        // If a value's Clone panics partway through, the remaining full
        // tags in the new table would claim elements that were never
        // written. The guard strips those marks on unwind so the new
        // table's Drop only visits initialized slots.
        struct CloneGuard<'g, V> {
            table: &'g mut HashTable<V>,
            index: usize,
        }

        impl<V> Drop for CloneGuard<'_, V> {
            fn drop(&mut self) {
                for i in self.index..self.table.capacity {
                    // SAFETY: the guarded table is in heap mode and `i` is
                    // in range.
                    unsafe {
                        if is_full(self.table.ctrl(i)) {
                            self.table.set_ctrl(i, EMPTY);
                        }
                    }
                }
            }
        }

        // SAFETY: the source's full tags mark initialized slots; the new
        // table shares its geometry, so the same indices are in range.
        unsafe {
            let src_slots = self.slots_ptr().as_ref();
            let mut guard = CloneGuard {
                table: &mut new_table,
                index: 0,
            };
            while guard.index < guard.table.capacity {
                let i = guard.index;
                if is_full(guard.table.ctrl(i)) {
                    let value = src_slots.get_unchecked(i).assume_init_ref().clone();
                    guard
                        .table
                        .slots_ptr()
                        .as_mut()
                        .get_unchecked_mut(i)
                        .write(value);
                }
                guard.index += 1;
            }
            mem::forget(guard);
        }

        new_table
    }
}

impl<V> HashTable<V> {
    /// Creates a new, empty hash table.
    ///
    /// If `V` is small enough, the table starts with a single inline slot
    /// and performs no heap allocation until a second element is inserted.
    /// Otherwise it starts with capacity zero and allocates on first
    /// insert.
    pub fn new() -> Self {
        let capacity = if soo_enabled::<V>() { SOO_CAPACITY } else { 0 };
        Self {
            layout: DataLayout::new::<V>(0),
            alloc: NonNull::dangling(),
            soo: SooSlot::new(),
            capacity,
            populated: 0,
            growth: GrowthInfo::new(capacity),
            seed: Seed::next(),
            #[cfg(debug_assertions)]
            generation: 0,
            #[cfg(feature = "std")]
            stats: None,
            _phantom: PhantomData,
        }
    }

    /// Creates a new hash table that can hold at least `capacity` elements
    /// without resizing.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut table = Self::new();
        if capacity > table.capacity {
            Self::assert_size_fits(capacity);
            table.resize_to(size_to_capacity(capacity), &|_| {
                unreachable!("no elements to rehash")
            });
        }
        table
    }

    #[inline(always)]
    fn is_soo(&self) -> bool {
        soo_enabled::<V>() && self.capacity == SOO_CAPACITY
    }

    #[inline(always)]
    fn bump_generation(&mut self) {
        #[cfg(debug_assertions)]
        {
            self.generation = self.generation.wrapping_add(1);
        }
    }

    /// Rejects element counts the address space or the size accounting
    /// could not represent.
    #[inline]
    fn assert_size_fits(size: usize) {
        assert!(
            size <= capacity_to_growth(max_valid_capacity(mem::size_of::<V>())),
            "Hash table size overflow"
        );
    }

    #[inline(always)]
    fn ctrl_base(&self) -> *mut u8 {
        self.alloc.as_ptr()
    }

    /// Reads the control byte at `index`.
    ///
    /// # Safety
    ///
    /// The table must be in heap mode and `index` must be less than
    /// `capacity + GROUP_WIDTH`.
    #[inline(always)]
    unsafe fn ctrl(&self, index: usize) -> u8 {
        debug_assert!(index < self.capacity + GROUP_WIDTH);
        // SAFETY: caller keeps `index` within the control array.
        unsafe { *self.ctrl_base().add(index) }
    }

    /// Writes a control byte and its cloned copy.
    ///
    /// # Safety
    ///
    /// The table must be in heap mode and `index` must be less than
    /// `capacity`.
    #[inline(always)]
    unsafe fn set_ctrl(&mut self, index: usize, tag: u8) {
        debug_assert!(index < self.capacity);
        // SAFETY: caller keeps `index` within the slot range; the mirror
        // index lands in the control array by construction.
        unsafe {
            let mirror = mirror_index(index, self.capacity);
            *self.ctrl_base().add(index) = tag;
            *self.ctrl_base().add(mirror) = tag;
        }
    }

    /// Resets every control byte to empty and restores the sentinel.
    ///
    /// # Safety
    ///
    /// The table must be in heap mode.
    unsafe fn reset_ctrl(&mut self) {
        // SAFETY: heap mode guarantees `capacity + GROUP_WIDTH` control
        // bytes.
        unsafe {
            core::ptr::write_bytes(self.ctrl_base(), EMPTY, self.capacity + GROUP_WIDTH);
            *self.ctrl_base().add(self.capacity) = SENTINEL;
        }
    }

    fn slots_ptr(&self) -> NonNull<[MaybeUninit<V>]> {
        // SAFETY: in heap mode the offset and length come from the live
        // layout; otherwise the length is zero and the pointer is never
        // dereferenced.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.slots_offset).cast(),
                if self.layout.layout.size() == 0 {
                    0
                } else {
                    self.capacity
                },
            )
        }
    }

    /// Shared reference to the initialized element at `index`.
    ///
    /// # Safety
    ///
    /// Heap mode; `ctrl[index]` must be full.
    #[inline(always)]
    unsafe fn slot_ref(&self, index: usize) -> &V {
        // SAFETY: a full control byte guarantees the slot is initialized.
        unsafe {
            self.slots_ptr()
                .as_ref()
                .get_unchecked(index)
                .assume_init_ref()
        }
    }

    /// Mutable reference to the initialized element at `index`.
    ///
    /// # Safety
    ///
    /// Heap mode; `ctrl[index]` must be full.
    #[inline(always)]
    unsafe fn slot_mut(&mut self, index: usize) -> &mut V {
        // SAFETY: a full control byte guarantees the slot is initialized.
        unsafe {
            self.slots_ptr()
                .as_mut()
                .get_unchecked_mut(index)
                .assume_init_mut()
        }
    }

    /// Pointer to the inline slot.
    ///
    /// # Safety
    ///
    /// `V` must be inline-eligible; the pointee is initialized only while
    /// an inline-mode table has `populated == 1`.
    #[inline(always)]
    unsafe fn soo_slot(&self) -> *const V {
        debug_assert!(soo_enabled::<V>());
        self.soo.0.as_ptr() as *const V
    }

    /// Mutable pointer to the inline slot.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::soo_slot`].
    #[inline(always)]
    unsafe fn soo_slot_mut(&mut self) -> *mut V {
        debug_assert!(soo_enabled::<V>());
        self.soo.0.as_mut_ptr() as *mut V
    }

    /// Probe sequence for `hash` under the table's current seed.
    #[inline(always)]
    fn probe(&self, hash: u64) -> ProbeSeq {
        ProbeSeq::new(((hash >> 7) ^ self.seed.0) as usize, self.capacity)
    }

    /// Index (in groups) of `slot` along the probe sequence for `hash`.
    #[inline]
    fn probe_group_of(&self, hash: u64, slot: usize) -> usize {
        (slot.wrapping_sub(self.probe(hash).offset()) & self.capacity) / GROUP_WIDTH
    }

    /// Returns the number of elements in the table.
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Returns `true` if the table contains no elements.
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Returns the number of elements the table can hold before it must
    /// resize.
    pub fn capacity(&self) -> usize {
        if self.capacity == 0 {
            0
        } else if self.is_soo() {
            SOO_CAPACITY
        } else {
            capacity_to_growth(self.capacity)
        }
    }

    /// Returns the number of slots in the table's backing storage.
    pub fn bucket_count(&self) -> usize {
        self.capacity
    }

    /// Finds a value in the table by hash and equality predicate.
    ///
    /// Returns a reference to the value if found, or `None` if no matching
    /// value exists.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value to search for
    /// * `eq` - A predicate function that returns `true` for the desired
    ///   value
    #[inline]
    pub fn find(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&V> {
        let index = self.find_index(hash, eq)?;
        // SAFETY: `find_index` only returns live slots.
        Some(unsafe {
            if self.is_soo() {
                &*self.soo_slot()
            } else {
                self.slot_ref(index)
            }
        })
    }

    /// Finds a value and returns a mutable reference to it.
    #[inline]
    pub fn find_mut(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        let index = self.find_index(hash, eq)?;
        // SAFETY: `find_index` only returns live slots.
        Some(unsafe {
            if self.is_soo() {
                &mut *self.soo_slot_mut()
            } else {
                self.slot_mut(index)
            }
        })
    }

    /// Walks the probe sequence for `hash` and returns the index of the
    /// matching live slot, if any. In inline mode the index is always 0
    /// and refers to the inline slot.
    #[inline]
    fn find_index(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<usize> {
        if self.is_soo() {
            // SAFETY: the inline slot is initialized while populated == 1.
            if self.populated == 1 && eq(unsafe { &*self.soo_slot() }) {
                return Some(0);
            }
            return None;
        }
        if self.populated == 0 {
            return None;
        }

        let tag = hashtag(hash);
        let mut seq = self.probe(hash);
        loop {
            // SAFETY: probe offsets are masked to `capacity` and the
            // control array extends GROUP_WIDTH bytes past the sentinel.
            let group = unsafe { Group::load(self.ctrl_base().add(seq.offset())) };
            for bit in group.match_tag(tag) {
                let index = seq.offset_at(bit);
                // SAFETY: a matching tag is a full byte, so the slot is
                // initialized.
                if eq(unsafe { self.slot_ref(index) }) {
                    return Some(index);
                }
            }
            if group.match_empty().any() {
                return None;
            }
            seq.next();
            debug_assert!(
                seq.index() <= self.capacity,
                "probe sequence exhausted; hash and eq are inconsistent"
            );
        }
    }

    /// First empty or deleted slot along the probe sequence, with the
    /// probe length in groups. Used during rebuilds, where the lowest
    /// non-full byte is always the right target.
    ///
    /// # Safety
    ///
    /// Heap mode; at least one slot must be empty or deleted.
    #[inline]
    unsafe fn find_first_non_full(&self, hash: u64) -> (usize, usize) {
        let mut seq = self.probe(hash);
        loop {
            // SAFETY: probe offsets are masked to `capacity` and the
            // control array extends GROUP_WIDTH bytes past the sentinel.
            let group = unsafe { Group::load(self.ctrl_base().add(seq.offset())) };
            let candidates = group.match_empty_or_deleted();
            if candidates.any() {
                return (
                    seq.offset_at(candidates.lowest_set_bit()),
                    seq.index() / GROUP_WIDTH,
                );
            }
            seq.next();
            assert!(
                seq.index() <= self.capacity,
                "probe sequence exhausted; hash and eq are inconsistent"
            );
        }
    }

    /// Insertion target for a new element: within the first group along
    /// the probe sequence holding a non-full byte, the lowest tombstone if
    /// there is one, else the lowest empty. Preferring tombstones keeps
    /// erased slots in circulation instead of consuming the growth
    /// budget.
    ///
    /// # Safety
    ///
    /// Heap mode; at least one slot must be empty or deleted.
    #[inline]
    unsafe fn find_insertion_target(&self, hash: u64) -> (usize, usize) {
        let mut seq = self.probe(hash);
        loop {
            // SAFETY: probe offsets are masked to `capacity` and the
            // control array extends GROUP_WIDTH bytes past the sentinel.
            let group = unsafe { Group::load(self.ctrl_base().add(seq.offset())) };
            let candidates = group.match_empty_or_deleted();
            if candidates.any() {
                let tombstones = candidates & !group.match_empty();
                let bit = if tombstones.any() {
                    tombstones.lowest_set_bit()
                } else {
                    candidates.lowest_set_bit()
                };
                return (seq.offset_at(bit), seq.index() / GROUP_WIDTH);
            }
            seq.next();
            assert!(
                seq.index() <= self.capacity,
                "probe sequence exhausted; hash and eq are inconsistent"
            );
        }
    }

    /// Makes room for one element hashing to `hash` and returns its slot
    /// index plus the probe length, growing or compacting if required. In
    /// inline mode the returned index refers to the inline slot.
    fn prepare_insert_slot(&mut self, hash: u64, rehash: &dyn Fn(&V) -> u64) -> (usize, usize) {
        if self.is_soo() {
            if self.populated == 0 {
                return (0, 0);
            }
            // Second element; the inline slot moves to a real table.
            self.resize_to(next_capacity(SOO_CAPACITY), rehash);
        } else if self.capacity == 0 {
            // Inline-eligible types skip capacity 1 so that capacity is
            // never ambiguous about the storage mode.
            let initial = if soo_enabled::<V>() {
                next_capacity(SOO_CAPACITY)
            } else {
                1
            };
            self.resize_to(initial, rehash);
        } else if !self.growth.has_no_deleted_and_growth_left() {
            // The budget may be exhausted or tombstones may need reusing.
            return self.prepare_insert_slot_slow(hash, rehash);
        }

        // Fast path: growth available and no tombstones anywhere, so the
        // first non-full slot is an empty we are allowed to take.
        // SAFETY: the table is in heap mode with at least one usable slot.
        unsafe { self.find_insertion_target(hash) }
    }

    #[cold]
    fn prepare_insert_slot_slow(
        &mut self,
        hash: u64,
        rehash: &dyn Fn(&V) -> u64,
    ) -> (usize, usize) {
        if self.growth.has_no_growth_left_and_no_deleted() {
            // Nothing to reclaim; the table has to grow.
            self.rehash_and_grow(rehash);
        }

        // SAFETY: the table is in heap mode with at least one usable slot.
        let (index, probe_len) = unsafe { self.find_insertion_target(hash) };
        // SAFETY: `find_insertion_target` returns in-range indices.
        if unsafe { self.ctrl(index) } == EMPTY
            && self.growth.has_no_growth_left_assuming_may_have_deleted()
        {
            // Tombstones exist but the probe found an empty first; taking
            // it would overdraw the growth budget.
            self.rehash_and_grow(rehash);
            // SAFETY: the rebuild leaves growth budget available.
            unsafe { self.find_insertion_target(hash) }
        } else {
            (index, probe_len)
        }
    }

    /// Marks the slot at `index` full and updates the bookkeeping. The
    /// element must already be written.
    ///
    /// # Safety
    ///
    /// Heap mode; `ctrl[index]` is empty or deleted and the slot has just
    /// been initialized.
    #[inline]
    unsafe fn record_insert(&mut self, index: usize, hash: u64, probe_len: usize) {
        // SAFETY: per contract.
        unsafe {
            let prev = self.ctrl(index);
            self.growth.overwrite_control_as_full(prev);
            self.set_ctrl(index, hashtag(hash));
        }
        self.populated += 1;
        self.stats_record_insert(hash, probe_len);
    }

    /// Inserts a value known to be absent from the table.
    fn insert_unique(&mut self, hash: u64, value: V, rehash: &dyn Fn(&V) -> u64) {
        let (index, probe_len) = self.prepare_insert_slot(hash, rehash);
        // SAFETY: `prepare_insert_slot` staged a writable slot for the
        // current mode.
        unsafe {
            if self.is_soo() {
                self.soo_slot_mut().write(value);
                self.populated = 1;
                self.growth.overwrite_empty_as_full();
            } else {
                self.slots_ptr()
                    .as_mut()
                    .get_unchecked_mut(index)
                    .write(value);
                self.record_insert(index, hash, probe_len);
            }
        }
    }

    /// Gets an entry for the given hash and equality predicate.
    ///
    /// This method returns an `Entry` enum that allows for efficient
    /// insertion or modification of values.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value for the entry
    /// * `eq` - A predicate function that returns `true` for matching
    ///   values
    /// * `rehash` - Recomputes the hash of a stored value; used when the
    ///   table must grow or compact to admit the new element
    #[inline]
    pub fn entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Entry<'_, V> {
        if let Some(index) = self.find_index(hash, &eq) {
            return Entry::Occupied(OccupiedEntry { table: self, index });
        }
        let (index, probe_len) = self.prepare_insert_slot(hash, &rehash);
        Entry::Vacant(VacantEntry {
            table: self,
            hash,
            index,
            probe_len,
        })
    }

    /// Gets an entry for the given hash and equality predicate without
    /// ever resizing the table.
    ///
    /// Returns `Err(CapacityError)` if the value is absent and admitting
    /// it would require growing. Useful when the caller cannot recompute
    /// hashes of stored values, or wants to bound latency.
    pub fn try_entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
    ) -> Result<Entry<'_, V>, CapacityError> {
        if let Some(index) = self.find_index(hash, &eq) {
            return Ok(Entry::Occupied(OccupiedEntry { table: self, index }));
        }
        if self.is_soo() {
            if self.populated != 0 {
                return Err(CapacityError);
            }
            return Ok(Entry::Vacant(VacantEntry {
                table: self,
                hash,
                index: 0,
                probe_len: 0,
            }));
        }
        if self.capacity == 0 || self.growth.has_no_growth_left_and_no_deleted() {
            return Err(CapacityError);
        }
        // SAFETY: a non-full slot exists; either growth is available or a
        // tombstone is.
        let (index, probe_len) = unsafe { self.find_insertion_target(hash) };
        // SAFETY: `find_insertion_target` returns in-range indices.
        if unsafe { self.ctrl(index) } == EMPTY
            && self.growth.has_no_growth_left_assuming_may_have_deleted()
        {
            return Err(CapacityError);
        }
        Ok(Entry::Vacant(VacantEntry {
            table: self,
            hash,
            index,
            probe_len,
        }))
    }

    /// Removes and returns a value from the table.
    ///
    /// The value is identified by its hash and an equality predicate. If
    /// the value is found, it is removed from the table and returned.
    /// Otherwise, `None` is returned.
    pub fn remove(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<V> {
        let index = self.find_index(hash, eq)?;
        // SAFETY: `find_index` only returns live slots.
        Some(unsafe { self.remove_at(index) })
    }

    /// Moves the element at `index` out and erases its metadata.
    ///
    /// # Safety
    ///
    /// `index` must come from a lookup against the table's current
    /// geometry: a full slot, or 0 for a populated inline table.
    unsafe fn remove_at(&mut self, index: usize) -> V {
        self.bump_generation();
        // SAFETY: per contract.
        unsafe {
            if self.is_soo() {
                debug_assert_eq!(self.populated, 1);
                let value = self.soo_slot().read();
                self.populated = 0;
                self.growth.overwrite_full_as_empty();
                return value;
            }
            let value = self
                .slots_ptr()
                .as_ref()
                .get_unchecked(index)
                .assume_init_read();
            self.erase_meta_only(index);
            value
        }
    }

    /// Erases the metadata of a full slot whose element has already been
    /// moved out or dropped, choosing between an empty and a tombstone.
    ///
    /// # Safety
    ///
    /// Heap mode; `ctrl[index]` is full.
    unsafe fn erase_meta_only(&mut self, index: usize) {
        self.populated -= 1;
        self.stats_record_erase();

        // A table no larger than one group cannot truncate a probe chain
        // by erasing to empty; every probe window sees every slot.
        if self.capacity < GROUP_WIDTH {
            // SAFETY: heap mode per contract.
            unsafe { self.set_ctrl(index, EMPTY) };
            self.growth.overwrite_full_as_empty();
            return;
        }

        // SAFETY: group loads at offsets up to `capacity` stay within the
        // control array.
        let (empty_before, empty_after) = unsafe {
            let index_before = index.wrapping_sub(GROUP_WIDTH) & self.capacity;
            (
                Group::load(self.ctrl_base().add(index_before)).match_empty(),
                Group::load(self.ctrl_base().add(index)).match_empty(),
            )
        };
        // The slot can revert to empty only if no fully-occupied window of
        // GROUP_WIDTH bytes ever covered it; otherwise some probe chain
        // may still need to pass through here.
        let was_never_full = empty_before.any()
            && empty_after.any()
            && empty_after.trailing_zeros() + empty_before.leading_zeros() < GROUP_WIDTH;

        if was_never_full {
            // SAFETY: heap mode per contract.
            unsafe { self.set_ctrl(index, EMPTY) };
            self.growth.overwrite_full_as_empty();
        } else {
            // SAFETY: heap mode per contract.
            unsafe { self.set_ctrl(index, DELETED) };
            self.growth.overwrite_full_as_deleted();
        }
    }

    /// Removes all elements from the table.
    ///
    /// This operation preserves the table's allocated capacity. All values
    /// are properly dropped if they implement `Drop`.
    pub fn clear(&mut self) {
        self.bump_generation();
        // SAFETY: control bytes identify the live elements.
        unsafe {
            self.drop_elements();
            if self.is_soo() {
                self.growth.init(SOO_CAPACITY);
            } else if self.capacity > 0 {
                self.reset_ctrl();
                self.growth.init(capacity_to_growth(self.capacity));
            }
        }
        self.populated = 0;
    }

    /// Drops every live element without touching metadata.
    ///
    /// # Safety
    ///
    /// Every full control byte (or the populated inline slot) must hold an
    /// initialized element that has not been moved out.
    unsafe fn drop_elements(&mut self) {
        if !mem::needs_drop::<V>() || self.populated == 0 {
            return;
        }
        // SAFETY: per contract.
        unsafe {
            if self.is_soo() {
                self.soo_slot_mut().drop_in_place();
                return;
            }
            for index in 0..self.capacity {
                if is_full(self.ctrl(index)) {
                    self.slots_ptr()
                        .as_mut()
                        .get_unchecked_mut(index)
                        .assume_init_drop();
                }
            }
        }
    }

    /// Retains only the elements for which the predicate returns `true`.
    ///
    /// Removed elements are dropped in place; removal uses the same
    /// tombstone rules as [`Self::remove`], so the table does not resize.
    pub fn retain(&mut self, mut f: impl FnMut(&mut V) -> bool) {
        self.bump_generation();
        // SAFETY: full control bytes (or the populated inline slot) mark
        // initialized elements; each removed slot is destroyed exactly
        // once and immediately un-marked.
        unsafe {
            if self.is_soo() {
                if self.populated == 1 && !f(&mut *self.soo_slot_mut()) {
                    self.soo_slot_mut().drop_in_place();
                    self.populated = 0;
                    self.growth.overwrite_full_as_empty();
                }
                return;
            }
            for index in 0..self.capacity {
                if is_full(self.ctrl(index)) && !f(self.slot_mut(index)) {
                    self.slots_ptr()
                        .as_mut()
                        .get_unchecked_mut(index)
                        .assume_init_drop();
                    self.erase_meta_only(index);
                }
            }
        }
    }

    /// Moves every element of `other` that is absent from `self` into
    /// `self`. Duplicates stay in `other`.
    ///
    /// # Arguments
    ///
    /// * `hash` - Computes the hash of an element; must agree with the
    ///   hashing used to build `self`
    /// * `eq` - Element equality across the two tables
    pub fn merge_from(
        &mut self,
        other: &mut Self,
        hash: impl Fn(&V) -> u64,
        eq: impl Fn(&V, &V) -> bool,
    ) {
        if other.populated == 0 {
            return;
        }
        other.bump_generation();
        let rehash: &dyn Fn(&V) -> u64 = &hash;
        // SAFETY: full control bytes mark initialized slots; each moved
        // slot is read exactly once and its tag erased before the next
        // step.
        unsafe {
            if other.is_soo() {
                let elem = &*other.soo_slot();
                let h = hash(elem);
                if self.find_index(h, |x| eq(x, elem)).is_none() {
                    let value = other.soo_slot().read();
                    other.populated = 0;
                    other.growth.overwrite_full_as_empty();
                    self.insert_unique(h, value, rehash);
                }
                return;
            }
            for index in 0..other.capacity {
                if !is_full(other.ctrl(index)) {
                    continue;
                }
                let elem = other.slot_ref(index);
                let h = hash(elem);
                if self.find_index(h, |x| eq(x, elem)).is_some() {
                    continue;
                }
                let value = other
                    .slots_ptr()
                    .as_ref()
                    .get_unchecked(index)
                    .assume_init_read();
                other.erase_meta_only(index);
                self.insert_unique(h, value, rehash);
            }
        }
    }

    /// Reserves capacity for at least `additional` more elements.
    ///
    /// The table never shrinks from a reserve; requesting less than the
    /// current capacity provides is a no-op.
    ///
    /// # Arguments
    ///
    /// * `additional` - The number of additional elements the table should
    ///   be able to hold without resizing
    /// * `rehash` - Recomputes the hash of a stored value
    pub fn reserve(&mut self, additional: usize, rehash: impl Fn(&V) -> u64) {
        let required = self.populated.saturating_add(additional);
        Self::assert_size_fits(required);
        let target = size_to_capacity(required);
        if target > self.capacity {
            self.resize_to(target, &rehash);
            self.stats_record_reserve(required);
        }
    }

    /// Rebuilds the table for at least `min_size` elements.
    ///
    /// With `min_size == 0` and an empty table, the backing allocation is
    /// released (returning to the inline slot where `V` allows it). With
    /// `min_size == 0` and a non-empty table, the table shrinks to the
    /// smallest capacity that fits and rebuilds even if the capacity does
    /// not change, which clears tombstones and refreshes the iteration
    /// order. Larger `min_size` values grow the table; a `min_size` the
    /// current capacity already satisfies is a no-op.
    pub fn rehash(&mut self, min_size: usize, rehash: impl Fn(&V) -> u64) {
        self.rehash_impl(min_size, &rehash)
    }

    /// Shrinks the table as much as possible, releasing the allocation
    /// outright if it is empty. Equivalent to `rehash(0, ..)`.
    pub fn shrink_to_fit(&mut self, rehash: impl Fn(&V) -> u64) {
        self.rehash_impl(0, &rehash)
    }

    fn rehash_impl(&mut self, min_size: usize, rehash: &dyn Fn(&V) -> u64) {
        if min_size == 0 && self.populated == 0 {
            self.bump_generation();
            if self.layout.layout.size() != 0 {
                // SAFETY: a non-zero layout means a live heap allocation.
                unsafe { alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout) };
            }
            self.alloc = NonNull::dangling();
            self.layout = DataLayout::new::<V>(0);
            self.capacity = if soo_enabled::<V>() && !self.is_sampled() {
                SOO_CAPACITY
            } else {
                0
            };
            self.growth.init(self.capacity);
            self.seed = Seed::next();
            return;
        }

        let required = min_size.max(self.populated);
        Self::assert_size_fits(required);
        let target = size_to_capacity(required);
        if min_size != 0 && target <= self.capacity {
            return;
        }

        if soo_enabled::<V>() && target <= SOO_CAPACITY && !self.is_sampled() {
            if !self.is_soo() {
                // SAFETY: the contents fit the inline slot and the table
                // is an unsampled heap table.
                unsafe { self.shrink_to_soo() };
            }
            return;
        }
        // Sampled tables stay on the heap; the smallest heap capacity for
        // inline-eligible types is the next one up.
        let target = if soo_enabled::<V>() && target <= SOO_CAPACITY {
            next_capacity(SOO_CAPACITY)
        } else {
            target
        };

        if !self.is_soo()
            && target == self.capacity
            && self.capacity + 1 >= GROUP_WIDTH
            && !self.growth.has_no_deleted()
        {
            // Same capacity with tombstones to clear; rebuild in place.
            // SAFETY: size and tombstone preconditions checked above.
            unsafe { self.drop_deletes_in_place(rehash) };
        } else {
            self.resize_to(target, rehash);
        }
    }

    /// Grows the table, or compacts it in place when enough tombstones can
    /// be reclaimed instead.
    #[cold]
    fn rehash_and_grow(&mut self, rehash: &dyn Fn(&V) -> u64) {
        let capacity = self.capacity;
        if capacity > GROUP_WIDTH
            && !self.growth.has_no_deleted()
            && self.populated as u64 * 32 <= capacity as u64 * 25
        {
            // SAFETY: capacity and tombstone preconditions checked above.
            unsafe { self.drop_deletes_in_place(rehash) };
        } else {
            self.resize_to(next_capacity(capacity), rehash);
        }
    }

    /// Rebuilds the table into a fresh allocation of `new_capacity` slots,
    /// re-placing every element under a fresh seed.
    fn resize_to(&mut self, new_capacity: usize, rehash: &dyn Fn(&V) -> u64) {
        debug_assert!(is_valid_capacity(new_capacity));
        debug_assert!(new_capacity >= size_to_capacity(self.populated));
        debug_assert!(!(soo_enabled::<V>() && new_capacity == SOO_CAPACITY));
        assert!(
            new_capacity <= max_valid_capacity(mem::size_of::<V>()),
            "Hash table size overflow"
        );
        self.bump_generation();

        let new_layout = DataLayout::new::<V>(new_capacity);
        // SAFETY: the layout is non-zero for a valid capacity; allocation
        // failure is handled.
        let new_alloc = unsafe {
            let raw = alloc::alloc::alloc(new_layout.layout);
            if raw.is_null() {
                handle_alloc_error(new_layout.layout);
            }
            core::ptr::write_bytes(raw, EMPTY, new_capacity + GROUP_WIDTH);
            *raw.add(new_capacity) = SENTINEL;
            NonNull::new_unchecked(raw)
        };

        let old_layout = mem::replace(&mut self.layout, new_layout);
        let old_alloc = mem::replace(&mut self.alloc, new_alloc);
        let old_capacity = mem::replace(&mut self.capacity, new_capacity);
        let was_soo = soo_enabled::<V>() && old_capacity == SOO_CAPACITY;
        let first_allocation = old_layout.layout.size() == 0;

        self.seed = Seed::next();
        self.growth
            .init(capacity_to_growth(new_capacity) - self.populated);

        // SAFETY: this block moves every initialized element from the old
        // storage into the new allocation. Full control bytes (or the
        // populated inline slot) identify the sources; each is byte-copied
        // exactly once, which transfers ownership because Rust moves are
        // untyped memcpys. The old allocation is then released without
        // running destructors for the moved-out contents.
        unsafe {
            if was_soo {
                if self.populated == 1 {
                    let hash = rehash(&*self.soo_slot());
                    let (target, _) = self.find_first_non_full(hash);
                    core::ptr::copy_nonoverlapping(
                        self.soo.0.as_ptr() as *const MaybeUninit<V>,
                        self.slots_ptr().as_mut().as_mut_ptr().add(target),
                        1,
                    );
                    self.set_ctrl(target, hashtag(hash));
                }
            } else if old_capacity > 0 {
                let old_ctrl = old_alloc.as_ptr();
                let old_slots =
                    old_alloc.as_ptr().add(old_layout.slots_offset) as *mut MaybeUninit<V>;
                for index in 0..old_capacity {
                    if !is_full(*old_ctrl.add(index)) {
                        continue;
                    }
                    let hash = rehash(&*(old_slots.add(index) as *const V));
                    let (target, _) = self.find_first_non_full(hash);
                    core::ptr::copy_nonoverlapping(
                        old_slots.add(index),
                        self.slots_ptr().as_mut().as_mut_ptr().add(target),
                        1,
                    );
                    self.set_ctrl(target, hashtag(hash));
                }
                alloc::alloc::dealloc(old_alloc.as_ptr(), old_layout.layout);
            }
        }

        if first_allocation {
            self.maybe_sample();
        }
        self.stats_record_resize(new_capacity);
    }

    /// Moves a heap table whose contents fit the inline slot back to
    /// inline storage, releasing the allocation.
    ///
    /// # Safety
    ///
    /// Heap mode with an inline-eligible `V`, `populated <= SOO_CAPACITY`,
    /// and the table must not be sampled.
    #[cold]
    unsafe fn shrink_to_soo(&mut self) {
        debug_assert!(soo_enabled::<V>());
        debug_assert!(self.populated <= SOO_CAPACITY);
        debug_assert!(self.layout.layout.size() != 0);
        self.bump_generation();
        // SAFETY: the single live element (if any) is identified by its
        // full control byte; its bytes move into the inline slot before
        // the allocation is released.
        unsafe {
            if self.populated == 1 {
                let mut index = 0;
                while !is_full(self.ctrl(index)) {
                    index += 1;
                }
                core::ptr::copy_nonoverlapping(
                    self.slots_ptr().as_ref().as_ptr().add(index),
                    self.soo.0.as_mut_ptr() as *mut MaybeUninit<V>,
                    1,
                );
            }
            alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
        }
        self.alloc = NonNull::dangling();
        self.layout = DataLayout::new::<V>(0);
        self.capacity = SOO_CAPACITY;
        self.growth.init(SOO_CAPACITY - self.populated);
        self.seed = Seed::next();
    }

    /// Rebuilds the table inside its current allocation, turning
    /// tombstones back into empties. Every element is re-placed under a
    /// fresh seed; displacement cycles are resolved by swapping.
    ///
    /// # Safety
    ///
    /// Heap mode with `capacity + 1 >= GROUP_WIDTH` and at least one
    /// tombstone.
    #[cold]
    unsafe fn drop_deletes_in_place(&mut self, rehash: &dyn Fn(&V) -> u64) {
        debug_assert!(!self.growth.has_no_deleted());
        debug_assert!(self.capacity + 1 >= GROUP_WIDTH);
        self.bump_generation();
        self.seed = Seed::next();
        let capacity = self.capacity;

        // SAFETY: heap mode guarantees the control and slot array bounds
        // used throughout; the conversion marks exactly the initialized
        // slots as deleted, and each is re-placed exactly once.
        unsafe {
            let ctrl = self.ctrl_base();
            convert_deleted_to_empty_and_full_to_deleted(ctrl, capacity);
            let slots = self.slots_ptr().as_mut().as_mut_ptr();

            let mut index = 0;
            'slots: while index < capacity {
                if *ctrl.add(index) != DELETED {
                    index += 1;
                    continue;
                }
                loop {
                    let hash = rehash(&*(slots.add(index) as *const V));
                    let (target, _) = self.find_first_non_full(hash);

                    // An element already inside the first usable group of
                    // its probe sequence stays put.
                    if self.probe_group_of(hash, target) == self.probe_group_of(hash, index) {
                        self.set_ctrl(index, hashtag(hash));
                        index += 1;
                        continue 'slots;
                    }

                    let target_tag = *ctrl.add(target);
                    if target_tag == EMPTY {
                        self.set_ctrl(target, hashtag(hash));
                        core::ptr::copy_nonoverlapping(slots.add(index), slots.add(target), 1);
                        self.set_ctrl(index, EMPTY);
                        index += 1;
                        continue 'slots;
                    }

                    // The target still holds an unplaced element; swap and
                    // place that one next.
                    debug_assert_eq!(target_tag, DELETED);
                    self.set_ctrl(target, hashtag(hash));
                    core::ptr::swap_nonoverlapping(slots.add(index), slots.add(target), 1);
                }
            }
            self.growth
                .init(capacity_to_growth(capacity) - self.populated);
        }
        self.stats_record_rehash();
    }

    /// Returns an iterator over all values in the table.
    ///
    /// The iteration order depends on the table's seed: it differs between
    /// tables with identical contents and changes on rehash. Do not depend
    /// on it.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            table: self,
            index: 0,
            #[cfg(debug_assertions)]
            generation: self.generation,
        }
    }

    /// Returns an iterator yielding mutable references to all values.
    pub fn iter_mut(&mut self) -> IterMut<'_, V> {
        IterMut {
            #[cfg(debug_assertions)]
            generation: self.generation,
            table: NonNull::from(&mut *self),
            index: 0,
            _phantom: PhantomData,
        }
    }

    /// Returns an iterator that removes and yields all values from the
    /// table.
    ///
    /// After calling `drain()`, the table is empty but keeps its capacity.
    /// Dropping the iterator drops any unyielded values; `mem::forget` on
    /// the iterator leaks them.
    pub fn drain(&mut self) -> Drain<'_, V> {
        self.bump_generation();
        // SAFETY: the control snapshot records exactly the initialized
        // slots; the live control bytes are reset before the iterator
        // exists, so the table can never double-drop what the iterator
        // reads out.
        unsafe {
            if self.is_soo() {
                let value = if self.populated == 1 {
                    Some(self.soo_slot().read())
                } else {
                    None
                };
                self.populated = 0;
                self.growth.init(SOO_CAPACITY);
                return Drain {
                    table: self,
                    occupied: Box::new([]),
                    soo_value: value,
                    index: 0,
                };
            }
            if self.capacity == 0 {
                return Drain {
                    table: self,
                    occupied: Box::new([]),
                    soo_value: None,
                    index: 0,
                };
            }

            let mut occupied = Box::new_uninit_slice(self.capacity);
            core::ptr::copy_nonoverlapping(
                self.ctrl_base() as *const u8,
                occupied.as_mut_ptr().cast(),
                self.capacity,
            );
            let occupied = occupied.assume_init();

            self.reset_ctrl();
            self.growth.init(capacity_to_growth(self.capacity));
            self.populated = 0;

            Drain {
                table: self,
                occupied,
                soo_value: None,
                index: 0,
            }
        }
    }
}

cfg_if! {
    if #[cfg(feature = "std")] {
        impl<V> HashTable<V> {
            /// Consults the global sampler; at most once per table, at its
            /// first heap allocation.
            #[inline]
            fn maybe_sample(&mut self) {
                if self.stats.is_none() {
                    self.stats = crate::sampler::maybe_sample(
                        mem::size_of::<V>(),
                        mem::align_of::<V>(),
                        if soo_enabled::<V>() { SOO_CAPACITY } else { 0 },
                    );
                }
            }

            #[inline(always)]
            fn is_sampled(&self) -> bool {
                self.stats.is_some()
            }

            #[inline(always)]
            fn stats_record_insert(&self, hash: u64, probe_len: usize) {
                if let Some(stats) = &self.stats {
                    stats.record_insert(hash, probe_len);
                }
            }

            #[inline(always)]
            fn stats_record_erase(&self) {
                if let Some(stats) = &self.stats {
                    stats.record_erase();
                }
            }

            #[inline(always)]
            fn stats_record_resize(&self, capacity: usize) {
                if let Some(stats) = &self.stats {
                    stats.record_resize(capacity);
                }
            }

            #[inline(always)]
            fn stats_record_rehash(&self) {
                if let Some(stats) = &self.stats {
                    stats.record_rehash();
                }
            }

            #[inline(always)]
            fn stats_record_reserve(&self, requested: usize) {
                if let Some(stats) = &self.stats {
                    stats.record_reserve(requested);
                }
            }
        }
    } else {
        impl<V> HashTable<V> {
            #[inline(always)]
            fn maybe_sample(&mut self) {}

            #[inline(always)]
            fn is_sampled(&self) -> bool {
                false
            }

            #[inline(always)]
            fn stats_record_insert(&self, _hash: u64, _probe_len: usize) {}

            #[inline(always)]
            fn stats_record_erase(&self) {}

            #[inline(always)]
            fn stats_record_resize(&self, _capacity: usize) {}

            #[inline(always)]
            fn stats_record_rehash(&self) {}

            #[inline(always)]
            fn stats_record_reserve(&self, _requested: usize) {}
        }
    }
}

/// Error returned by [`HashTable::try_entry`] when admitting the value
/// would require the table to grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError;

impl core::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("hash table is at capacity")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CapacityError {}

/// A view into a single position in the table, occupied or vacant.
pub enum Entry<'a, V> {
    /// The table holds a matching value.
    Occupied(OccupiedEntry<'a, V>),
    /// No matching value; a slot is staged for insertion.
    Vacant(VacantEntry<'a, V>),
}

impl<'a, V> Entry<'a, V> {
    /// Returns a mutable reference to the value, inserting `default` if
    /// the entry is vacant.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Returns a mutable reference to the value, inserting the result of
    /// `default()` if the entry is vacant.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Applies `f` to the value if the entry is occupied and returns the
    /// mutable reference, or `None` if it is vacant.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Option<&'a mut V> {
        match self {
            Entry::Occupied(entry) => {
                let value = entry.into_mut();
                f(value);
                Some(value)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Returns a mutable reference to the value, inserting `V::default()`
    /// if the entry is vacant.
    pub fn or_default(self) -> &'a mut V
    where
        V: Default,
    {
        self.or_insert_with(V::default)
    }
}

/// A vacant position with its insertion slot already staged; inserting is
/// a slot write plus bookkeeping.
pub struct VacantEntry<'a, V> {
    table: &'a mut HashTable<V>,
    hash: u64,
    index: usize,
    probe_len: usize,
}

impl<'a, V> VacantEntry<'a, V> {
    /// Inserts a value into the staged slot and returns a mutable
    /// reference to it.
    pub fn insert(self, value: V) -> &'a mut V {
        let table = self.table;
        // SAFETY: the slot was staged against the table's current
        // geometry, which no operation can have changed while this entry
        // held the exclusive borrow.
        unsafe {
            if table.is_soo() {
                debug_assert_eq!(table.populated, 0);
                let slot = table.soo_slot_mut();
                slot.write(value);
                table.populated = 1;
                table.growth.overwrite_empty_as_full();
                &mut *slot
            } else {
                table
                    .slots_ptr()
                    .as_mut()
                    .get_unchecked_mut(self.index)
                    .write(value);
                table.record_insert(self.index, self.hash, self.probe_len);
                table.slot_mut(self.index)
            }
        }
    }
}

/// An occupied position in the table.
pub struct OccupiedEntry<'a, V> {
    table: &'a mut HashTable<V>,
    index: usize,
}

impl<'a, V> OccupiedEntry<'a, V> {
    /// Returns a reference to the value.
    pub fn get(&self) -> &V {
        // SAFETY: entry indices refer to live slots for the lifetime of
        // the borrow.
        unsafe {
            if self.table.is_soo() {
                &*self.table.soo_slot()
            } else {
                self.table.slot_ref(self.index)
            }
        }
    }

    /// Returns a mutable reference to the value.
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: entry indices refer to live slots for the lifetime of
        // the borrow.
        unsafe {
            if self.table.is_soo() {
                &mut *self.table.soo_slot_mut()
            } else {
                self.table.slot_mut(self.index)
            }
        }
    }

    /// Converts the entry into a mutable reference tied to the table.
    pub fn into_mut(self) -> &'a mut V {
        // SAFETY: entry indices refer to live slots for the lifetime of
        // the borrow.
        unsafe {
            if self.table.is_soo() {
                &mut *self.table.soo_slot_mut()
            } else {
                self.table.slot_mut(self.index)
            }
        }
    }

    /// Removes the value from the table and returns it.
    pub fn remove(self) -> V {
        // SAFETY: entry indices refer to live slots.
        unsafe { self.table.remove_at(self.index) }
    }
}

/// An iterator over the values of a [`HashTable`].
pub struct Iter<'a, V> {
    table: &'a HashTable<V>,
    index: usize,
    #[cfg(debug_assertions)]
    generation: u32,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<&'a V> {
        #[cfg(debug_assertions)]
        assert_eq!(
            self.generation, self.table.generation,
            "hash table was modified unexpectedly during iteration"
        );
        if self.table.is_soo() {
            if self.index == 0 && self.table.populated == 1 {
                self.index = 1;
                // SAFETY: the inline slot is initialized while populated.
                return Some(unsafe { &*self.table.soo_slot() });
            }
            return None;
        }
        while self.index < self.table.capacity {
            // SAFETY: group loads at offsets below `capacity` stay within
            // the control array; a full byte implies an initialized slot.
            unsafe {
                let group = Group::load(self.table.ctrl_base().add(self.index));
                let skip = group.count_leading_empty_or_deleted();
                if skip > 0 {
                    // Skip whole runs of empties and tombstones at once.
                    // The sentinel stops the count, so this never
                    // overshoots the table.
                    self.index += skip;
                    continue;
                }
                let index = self.index;
                self.index += 1;
                return Some(self.table.slot_ref(index));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.table.populated))
    }
}

/// An iterator over mutable references to the values of a [`HashTable`].
pub struct IterMut<'a, V> {
    table: NonNull<HashTable<V>>,
    index: usize,
    #[cfg(debug_assertions)]
    generation: u32,
    _phantom: PhantomData<&'a mut HashTable<V>>,
}

impl<'a, V> Iterator for IterMut<'a, V> {
    type Item = &'a mut V;

    fn next(&mut self) -> Option<&'a mut V> {
        // SAFETY: the iterator holds the table's exclusive borrow for 'a,
        // and each slot index is visited at most once, so the returned
        // references never alias.
        unsafe {
            let table = self.table.as_mut();
            #[cfg(debug_assertions)]
            assert_eq!(
                self.generation, table.generation,
                "hash table was modified unexpectedly during iteration"
            );
            if table.is_soo() {
                if self.index == 0 && table.populated == 1 {
                    self.index = 1;
                    return Some(&mut *table.soo_slot_mut());
                }
                return None;
            }
            while self.index < table.capacity {
                let group = Group::load(table.ctrl_base().add(self.index));
                let skip = group.count_leading_empty_or_deleted();
                if skip > 0 {
                    self.index += skip;
                    continue;
                }
                let index = self.index;
                self.index += 1;
                return Some(&mut *(table.slot_mut(index) as *mut V));
            }
            None
        }
    }
}

/// A draining iterator over the values of a [`HashTable`].
///
/// The table is emptied up front; values are handed out as the iterator
/// advances, and dropping the iterator drops the rest.
pub struct Drain<'a, V> {
    table: &'a mut HashTable<V>,
    occupied: Box<[u8]>,
    soo_value: Option<V>,
    index: usize,
}

impl<V> Iterator for Drain<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if let Some(value) = self.soo_value.take() {
            return Some(value);
        }
        while self.index < self.occupied.len() {
            let index = self.index;
            self.index += 1;
            if is_full(self.occupied[index]) {
                // SAFETY: the snapshot marks slots that were initialized
                // when the drain began; the table's own control bytes were
                // reset, so each value is read out exactly once, here.
                return Some(unsafe {
                    self.table
                        .slots_ptr()
                        .as_ref()
                        .get_unchecked(index)
                        .assume_init_read()
                });
            }
        }
        None
    }
}

impl<V> Drop for Drain<'_, V> {
    fn drop(&mut self) {
        for _ in self {}
    }
}

cfg_if! {
    if #[cfg(feature = "stats")] {
        /// Debug statistics for hash table analysis.
        #[derive(Debug, Clone)]
        pub struct DebugStats {
            /// Number of elements currently in the table.
            pub populated: usize,
            /// Maximum load before the next resize.
            pub capacity: usize,
            /// Total number of slots allocated.
            pub total_slots: usize,
            /// Number of tombstoned slots.
            pub tombstones: usize,
            /// Load factor (populated / capacity).
            pub load_factor: f64,
            /// Total memory in bytes used by the backing allocation.
            pub total_bytes: usize,
            /// Whether the table is in inline (small-object) mode.
            pub inline: bool,
        }

        impl DebugStats {
            /// Pretty-print the debug statistics.
            #[cfg(feature = "std")]
            pub fn print(&self) {
                println!("=== Hash Table Debug Statistics ===");
                println!(
                    "Population: {}/{} ({:.2}% load factor)",
                    self.populated,
                    self.capacity,
                    self.load_factor * 100.0
                );
                println!(
                    "Slots: {} total, {} tombstoned",
                    self.total_slots, self.tombstones
                );
                println!("Allocated: {} bytes", self.total_bytes);
                if self.inline {
                    println!("Storage: inline");
                }
            }
        }

        /// Histogram of probe-sequence lengths, in groups.
        pub struct ProbeHistogram {
            /// `lengths[n]` counts elements found after probing `n + 1`
            /// groups.
            pub lengths: [usize; GROUP_WIDTH],
            /// Elements whose probe ran longer than the histogram tracks.
            pub overlong: usize,
            populated: usize,
        }

        impl ProbeHistogram {
            /// Pretty-print the probe histogram.
            #[cfg(feature = "std")]
            pub fn print(&self) {
                let max = self
                    .lengths
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(0)
                    .max(self.overlong);
                if max == 0 {
                    println!("probe histogram: empty");
                    return;
                }
                println!("probe length by group ({} entries):", self.populated);
                let bar = |count: usize| "█".repeat(count * 60 / max);
                for (i, &count) in self.lengths.iter().enumerate() {
                    println!("{:>2} | {} ({})", i + 1, bar(count), count);
                }
                println!("+  | {} ({})", bar(self.overlong), self.overlong);
            }
        }

        impl<V> HashTable<V> {
            /// Computes summary statistics for the current table state.
            pub fn debug_stats(&self) -> DebugStats {
                let tombstones = if self.layout.layout.size() == 0 {
                    0
                } else {
                    // SAFETY: heap mode; indices stay below capacity.
                    (0..self.capacity)
                        .filter(|&i| unsafe { self.ctrl(i) } == DELETED)
                        .count()
                };
                DebugStats {
                    populated: self.populated,
                    capacity: self.capacity(),
                    total_slots: self.bucket_count(),
                    tombstones,
                    load_factor: if self.capacity() == 0 {
                        0.0
                    } else {
                        self.populated as f64 / self.capacity() as f64
                    },
                    total_bytes: self.layout.layout.size(),
                    inline: self.is_soo(),
                }
            }

            /// Computes a histogram of probe lengths for the current table
            /// state.
            ///
            /// This method is intended for debugging and performance
            /// analysis; it walks every live element and recomputes its
            /// probe distance from its home group.
            pub fn probe_histogram(&self, rehash: impl Fn(&V) -> u64) -> ProbeHistogram {
                let mut histogram = ProbeHistogram {
                    lengths: [0; GROUP_WIDTH],
                    overlong: 0,
                    populated: self.populated,
                };
                if self.is_soo() || self.capacity == 0 {
                    if self.populated > 0 {
                        histogram.lengths[0] = self.populated;
                    }
                    return histogram;
                }
                for index in 0..self.capacity {
                    // SAFETY: heap mode; a full byte implies an
                    // initialized slot.
                    unsafe {
                        if !is_full(self.ctrl(index)) {
                            continue;
                        }
                        let hash = rehash(self.slot_ref(index));
                        let groups = self.probe_group_of(hash, index);
                        if groups < GROUP_WIDTH {
                            histogram.lengths[groups] += 1;
                        } else {
                            histogram.overlong += 1;
                        }
                    }
                }
                histogram
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::hash::Hasher;
    use core::sync::atomic::AtomicUsize;

    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use siphasher::sip::SipHasher;

    use super::*;
    use crate::control::NUM_CLONED_BYTES;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }

        fn build_hasher(&self) -> SipHasher {
            SipHasher::new_with_keys(self.k0, self.k1)
        }
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Item {
        key: u64,
        value: i64,
    }

    fn hash_key(state: &HashState, key: u64) -> u64 {
        let mut h = state.build_hasher();
        h.write_u64(key);
        h.finish()
    }

    fn insert_item(table: &mut HashTable<Item>, state: &HashState, key: u64, value: i64) {
        let hash = hash_key(state, key);
        match table.entry(hash, |v: &Item| v.key == key, |v| hash_key(state, v.key)) {
            Entry::Vacant(v) => {
                v.insert(Item { key, value });
            }
            Entry::Occupied(_) => panic!("unexpected occupied for {}: {:#?}", key, table),
        }
    }

    fn find_item<'a>(
        table: &'a HashTable<Item>,
        state: &HashState,
        key: u64,
    ) -> Option<&'a Item> {
        table.find(hash_key(state, key), |v| v.key == key)
    }

    fn tombstones<V>(table: &HashTable<V>) -> usize {
        if table.layout.layout.size() == 0 {
            return 0;
        }
        (0..table.capacity)
            .filter(|&i| unsafe { table.ctrl(i) } == DELETED)
            .count()
    }

    fn assert_invariants<V>(table: &HashTable<V>) {
        if table.layout.layout.size() == 0 {
            assert!(table.populated <= SOO_CAPACITY);
            return;
        }
        let cap = table.capacity;
        // SAFETY: indices stay within the control array.
        unsafe {
            let full = (0..cap).filter(|&i| is_full(table.ctrl(i))).count();
            assert_eq!(full, table.populated, "{:#?}", table);
            assert_eq!(table.ctrl(cap), SENTINEL);
            for i in 0..cap {
                assert_eq!(
                    table.ctrl(i),
                    table.ctrl(mirror_index(i, cap)),
                    "mirror mismatch at {}",
                    i
                );
            }
            for i in 0..NUM_CLONED_BYTES.min(cap) {
                assert_ne!(table.ctrl(cap + 1 + i), SENTINEL);
            }
        }
        assert!(
            table.populated + table.growth.growth_left() <= capacity_to_growth(cap),
            "{:#?}",
            table
        );
    }

    #[test]
    fn inline_default_and_first_insert() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        assert_eq!(table.capacity(), 1);
        assert_eq!(table.bucket_count(), 1);
        assert_eq!(table.layout.layout.size(), 0);

        insert_item(&mut table, &state, 7, 70);
        assert_eq!(table.len(), 1);
        // Still no heap allocation with a single element.
        assert_eq!(table.layout.layout.size(), 0);
        assert_eq!(find_item(&table, &state, 7), Some(&Item { key: 7, value: 70 }));
        assert!(find_item(&table, &state, 8).is_none());
    }

    #[test]
    fn inline_to_heap_on_second_insert() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        insert_item(&mut table, &state, 1, 10);
        insert_item(&mut table, &state, 2, 20);

        assert_eq!(table.len(), 2);
        assert_ne!(table.layout.layout.size(), 0);
        assert_eq!(table.bucket_count(), 3);
        assert_eq!(find_item(&table, &state, 1), Some(&Item { key: 1, value: 10 }));
        assert_eq!(find_item(&table, &state, 2), Some(&Item { key: 2, value: 20 }));
        assert_invariants(&table);
    }

    #[test]
    fn inline_erase_and_reuse() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        insert_item(&mut table, &state, 1, 10);
        let removed = table.remove(hash_key(&state, 1), |v| v.key == 1);
        assert_eq!(removed, Some(Item { key: 1, value: 10 }));
        assert_eq!(table.len(), 0);
        assert_eq!(table.layout.layout.size(), 0);

        insert_item(&mut table, &state, 2, 20);
        assert_eq!(table.len(), 1);
        assert_eq!(find_item(&table, &state, 2), Some(&Item { key: 2, value: 20 }));
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Wide {
        key: u64,
        pad: [u64; 4],
    }

    impl Wide {
        fn new(key: u64) -> Self {
            Wide { key, pad: [key; 4] }
        }
    }

    #[test]
    fn heap_default_for_large_values() {
        let state = HashState::default();
        let mut table: HashTable<Wide> = HashTable::new();
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.bucket_count(), 0);

        let hash = hash_key(&state, 3);
        match table.entry(hash, |v: &Wide| v.key == 3, |v| hash_key(&state, v.key)) {
            Entry::Vacant(v) => {
                v.insert(Wide::new(3));
            }
            Entry::Occupied(_) => unreachable!(),
        }
        assert_eq!(table.len(), 1);
        assert_ne!(table.layout.layout.size(), 0);
        assert_eq!(table.find(hash, |v| v.key == 3), Some(&Wide::new(3)));

        for key in 4..40u64 {
            let hash = hash_key(&state, key);
            match table.entry(hash, |v: &Wide| v.key == key, |v| hash_key(&state, v.key)) {
                Entry::Vacant(v) => {
                    v.insert(Wide::new(key));
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }
        for key in 3..40u64 {
            let hash = hash_key(&state, key);
            assert_eq!(table.find(hash, |v| v.key == key), Some(&Wide::new(key)));
        }
        assert_invariants(&table);
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..32u64 {
            insert_item(&mut table, &state, k, (k as i64) * 2);
            assert_eq!(
                find_item(&table, &state, k),
                Some(&Item {
                    key: k,
                    value: (k as i64) * 2
                }),
                "{:#?}",
                table
            );
        }
        assert_eq!(table.len(), 32);
        for k in 0..32u64 {
            assert_eq!(
                find_item(&table, &state, k),
                Some(&Item {
                    key: k,
                    value: (k as i64) * 2
                }),
                "{:#?}",
                table
            );
        }
        assert!(find_item(&table, &state, 999).is_none());
        assert_invariants(&table);
    }

    #[test]
    fn duplicate_entry_is_occupied() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        let k = 42u64;
        insert_item(&mut table, &state, k, 7);

        let hash = hash_key(&state, k);
        match table.entry(hash, |v| v.key == k, |v| hash_key(&state, v.key)) {
            Entry::Occupied(mut occ) => {
                assert_eq!(occ.get().value, 7);
                occ.get_mut().value = 11;
            }
            Entry::Vacant(_) => panic!("should be occupied: {:#?}", table),
        }
        assert_eq!(find_item(&table, &state, k).unwrap().value, 11);
    }

    #[test]
    fn find_mut_and_modify() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..5u64 {
            insert_item(&mut table, &state, k, 1);
        }
        for k in 0..5u64 {
            if let Some(v) = table.find_mut(hash_key(&state, k), |v| v.key == k) {
                v.value += 9;
            }
        }
        for k in 0..5u64 {
            assert_eq!(find_item(&table, &state, k).unwrap().value, 10);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for i in 0..10000u64 {
            let k = i << 40;
            insert_item(&mut table, &state, k, i as i64);
            assert_eq!(table.len(), (i + 1) as usize);
        }
        for i in 0..10000u64 {
            let k = i << 40;
            assert_eq!(
                find_item(&table, &state, k),
                Some(&Item {
                    key: k,
                    value: i as i64
                })
            );
        }
        assert_invariants(&table);
    }

    #[test]
    fn grows_only_when_budget_exhausted() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(100);
        let buckets = table.bucket_count();
        let budget = table.capacity();
        assert!(budget >= 100);

        for k in 0..budget as u64 {
            insert_item(&mut table, &state, k, 0);
        }
        assert_eq!(table.bucket_count(), buckets, "{:#?}", table);

        insert_item(&mut table, &state, budget as u64, 0);
        assert!(table.bucket_count() > buckets, "{:#?}", table);
        for k in 0..=budget as u64 {
            assert!(find_item(&table, &state, k).is_some(), "key {}", k);
        }
        assert_invariants(&table);
    }

    #[test]
    fn explicit_collision() {
        let mut table: HashTable<Item> = HashTable::new();
        let count = 2 * GROUP_WIDTH as u64 + 5;
        for k in 0..count {
            match table.entry(0, |v| v.key == k, |_| 0) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i64,
                    });
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(table.len(), count as usize);
        for k in 0..count {
            assert_eq!(
                table.find(0, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: k as i64
                }),
                "{:#?}",
                table
            );
        }
        assert_invariants(&table);
    }

    #[test]
    fn collision_erase_keeps_later_keys_findable() {
        let mut table: HashTable<Item> = HashTable::new();
        let count = 2 * GROUP_WIDTH as u64 + 5;
        for k in 0..count {
            match table.entry(0, |v| v.key == k, |_| 0) {
                Entry::Vacant(v) => {
                    v.insert(Item {
                        key: k,
                        value: k as i64,
                    });
                }
                _ => unreachable!(),
            }
        }
        for k in 0..count {
            assert!(table.remove(0, |v| v.key == k).is_some(), "key {}", k);
            for j in k + 1..count {
                assert!(
                    table.find(0, |v| v.key == j).is_some(),
                    "key {} lost after erasing {}: {:#?}",
                    j,
                    k,
                    table
                );
            }
        }
        assert_eq!(table.len(), 0);
        assert_invariants(&table);
    }

    #[test]
    fn tombstone_reuse_keeps_capacity() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(100);
        let budget = table.capacity();
        for k in 0..budget as u64 {
            insert_item(&mut table, &state, k, 0);
        }
        let buckets = table.bucket_count();

        assert!(table.remove(hash_key(&state, 0), |v| v.key == 0).is_some());
        insert_item(&mut table, &state, 0, 1);
        assert_eq!(table.bucket_count(), buckets, "{:#?}", table);
        for k in 0..budget as u64 {
            assert!(find_item(&table, &state, k).is_some(), "key {}", k);
        }
        assert_invariants(&table);
    }

    #[test]
    fn erase_to_empty_in_small_tables() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..3u64 {
            insert_item(&mut table, &state, k, 0);
        }
        for k in 0..3u64 {
            assert!(table.remove(hash_key(&state, k), |v| v.key == k).is_some());
            // Single-group tables never need tombstones.
            assert_eq!(tombstones(&table), 0, "{:#?}", table);
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn clear_leaves_no_tombstones() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(56);
        for k in 0..56u64 {
            insert_item(&mut table, &state, k, 0);
        }
        let buckets = table.bucket_count();
        for k in 0..28u64 {
            assert!(table.remove(hash_key(&state, k), |v| v.key == k).is_some());
        }
        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(tombstones(&table), 0);
        assert_eq!(table.bucket_count(), buckets);
        assert_invariants(&table);

        // The cleared table packs fresh inserts without growing.
        for k in 0..table.capacity() as u64 {
            insert_item(&mut table, &state, k, 1);
        }
        assert_eq!(table.bucket_count(), buckets);
    }

    #[test]
    fn full_range_erase_after_middle_erases_leaves_no_tombstones() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(56);
        let budget = table.capacity() as u64;
        for k in 0..budget {
            insert_item(&mut table, &state, k, 0);
        }
        let buckets = table.bucket_count();

        // Erase the middle half element by element; at full load these
        // erases leave tombstones behind.
        for k in budget / 4..3 * budget / 4 {
            assert!(table.remove(hash_key(&state, k), |v| v.key == k).is_some());
        }
        assert!(tombstones(&table) > 0, "{:#?}", table);

        // Erasing everything that remains is a whole-table drain, which
        // resets the control bytes outright instead of tombstoning.
        let remaining = table.drain().count();
        assert_eq!(remaining as u64, budget - budget / 2);
        assert_eq!(table.len(), 0);
        assert_eq!(tombstones(&table), 0, "{:#?}", table);
        assert_eq!(table.bucket_count(), buckets);
        assert_invariants(&table);

        // The emptied table packs fresh inserts without growing.
        for k in 0..budget {
            insert_item(&mut table, &state, k, 1);
        }
        assert_eq!(table.bucket_count(), buckets);
    }

    #[test]
    fn rehash_zero_releases_empty_table() {
        let state = HashState::default();
        let mut table: HashTable<Wide> = HashTable::with_capacity(100);
        assert_ne!(table.layout.layout.size(), 0);
        table.rehash(0, |v| hash_key(&state, v.key));
        assert_eq!(table.layout.layout.size(), 0);
        assert_eq!(table.bucket_count(), 0);

        let hash = hash_key(&state, 1);
        match table.entry(hash, |v: &Wide| v.key == 1, |v| hash_key(&state, v.key)) {
            Entry::Vacant(v) => {
                v.insert(Wide::new(1));
            }
            _ => unreachable!(),
        }
        assert_eq!(table.find(hash, |v| v.key == 1), Some(&Wide::new(1)));
    }

    #[test]
    fn rehash_zero_returns_to_inline() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..10u64 {
            insert_item(&mut table, &state, k, 0);
        }
        assert_ne!(table.layout.layout.size(), 0);
        for k in 1..10u64 {
            assert!(table.remove(hash_key(&state, k), |v| v.key == k).is_some());
        }

        table.rehash(0, |v| hash_key(&state, v.key));
        assert_eq!(table.layout.layout.size(), 0);
        assert_eq!(table.capacity(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(find_item(&table, &state, 0), Some(&Item { key: 0, value: 0 }));
    }

    #[test]
    fn rehash_shrinks_oversized_table() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(1000);
        for k in 0..20u64 {
            insert_item(&mut table, &state, k, 0);
        }
        let before = table.bucket_count();
        table.rehash(0, |v| hash_key(&state, v.key));
        assert!(table.bucket_count() < before, "{:#?}", table);
        for k in 0..20u64 {
            assert!(find_item(&table, &state, k).is_some());
        }
        assert_invariants(&table);
    }

    #[test]
    fn rehash_noop_when_satisfied() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(100);
        for k in 0..50u64 {
            insert_item(&mut table, &state, k, 0);
        }
        let buckets = table.bucket_count();
        table.rehash(60, |v| hash_key(&state, v.key));
        assert_eq!(table.bucket_count(), buckets);
        table.rehash(1000, |v| hash_key(&state, v.key));
        assert!(table.bucket_count() > buckets);
        assert_invariants(&table);
    }

    #[test]
    fn rehash_same_capacity_compacts_tombstones() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(56);
        for k in 0..56u64 {
            insert_item(&mut table, &state, k, 0);
        }
        assert_eq!(table.bucket_count(), 63);
        for k in 0..20u64 {
            assert!(table.remove(hash_key(&state, k), |v| v.key == k).is_some());
        }
        assert!(tombstones(&table) > 0, "{:#?}", table);

        table.rehash(0, |v| hash_key(&state, v.key));
        assert_eq!(table.bucket_count(), 63, "{:#?}", table);
        assert_eq!(tombstones(&table), 0);
        for k in 20..56u64 {
            assert!(find_item(&table, &state, k).is_some(), "key {}", k);
        }
        assert_invariants(&table);
    }

    #[test]
    fn insert_reuses_tombstones_without_growing() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(56);
        let buckets = table.bucket_count();
        for k in 0..56u64 {
            insert_item(&mut table, &state, k, 0);
        }
        for k in 0..30u64 {
            assert!(table.remove(hash_key(&state, k), |v| v.key == k).is_some());
        }
        // 20 re-inserts keep the load below the in-place compaction
        // threshold, so the table must absorb them without reallocating.
        for k in 1000..1020u64 {
            insert_item(&mut table, &state, k, 0);
        }
        assert_eq!(table.bucket_count(), buckets, "{:#?}", table);
        for k in (30..56u64).chain(1000..1020) {
            assert!(find_item(&table, &state, k).is_some(), "key {}", k);
        }
        assert_invariants(&table);
    }

    #[test]
    fn reserve_grows_and_never_shrinks() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        table.reserve(1000, |v| hash_key(&state, v.key));
        assert!(table.capacity() >= 1000);
        let buckets = table.bucket_count();
        table.reserve(10, |v| hash_key(&state, v.key));
        assert_eq!(table.bucket_count(), buckets);
    }

    #[test]
    fn iteration_order_differs_between_instances() {
        let state = HashState::default();
        let build = || {
            let mut table: HashTable<Item> = HashTable::new();
            for k in 0..50u64 {
                insert_item(&mut table, &state, k, 0);
            }
            table
        };
        let reference: Vec<u64> = build().iter().map(|v| v.key).collect();
        let mut differed = false;
        for _ in 0..500 {
            let order: Vec<u64> = build().iter().map(|v| v.key).collect();
            if order != reference {
                differed = true;
                break;
            }
        }
        assert!(differed, "iteration order never changed across instances");
    }

    #[test]
    fn iteration_order_changes_on_rehash() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..50u64 {
            insert_item(&mut table, &state, k, 0);
        }
        let before: Vec<u64> = table.iter().map(|v| v.key).collect();
        let mut differed = false;
        for _ in 0..10 {
            table.rehash(0, |v| hash_key(&state, v.key));
            let after: Vec<u64> = table.iter().map(|v| v.key).collect();
            if after != before {
                differed = true;
                break;
            }
        }
        assert!(differed, "iteration order never changed across rehashes");
        for k in 0..50u64 {
            assert!(find_item(&table, &state, k).is_some());
        }
    }

    #[test]
    fn iter_mut_updates_values() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..20u64 {
            insert_item(&mut table, &state, k, 1);
        }
        for v in table.iter_mut() {
            v.value *= 10;
        }
        for k in 0..20u64 {
            assert_eq!(find_item(&table, &state, k).unwrap().value, 10);
        }
    }

    #[test]
    fn test_clone() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..40u64 {
            insert_item(&mut table, &state, k, k as i64);
        }
        // Leave tombstones behind so the clone has to preserve them.
        for k in 0..5u64 {
            assert!(table.remove(hash_key(&state, k), |v| v.key == k).is_some());
        }

        let mut cloned = table.clone();
        assert_eq!(cloned.len(), table.len());
        assert_eq!(cloned.bucket_count(), table.bucket_count());
        for k in 5..40u64 {
            assert_eq!(
                find_item(&cloned, &state, k),
                find_item(&table, &state, k),
                "key {}",
                k
            );
        }
        assert_invariants(&cloned);

        insert_item(&mut cloned, &state, 1000, 0);
        assert!(find_item(&table, &state, 1000).is_none());
    }

    #[test]
    fn test_clone_inline_and_empty() {
        let state = HashState::default();
        let empty: HashTable<Item> = HashTable::new();
        assert_eq!(empty.clone().len(), 0);

        let mut one: HashTable<Item> = HashTable::new();
        insert_item(&mut one, &state, 3, 30);
        let cloned = one.clone();
        assert_eq!(cloned.len(), 1);
        assert_eq!(cloned.layout.layout.size(), 0);
        assert_eq!(find_item(&cloned, &state, 3), Some(&Item { key: 3, value: 30 }));
    }

    #[derive(Debug, Clone)]
    struct Counted {
        key: u64,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counted_table(
        state: &HashState,
        count: u64,
    ) -> (HashTable<Counted>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut table: HashTable<Counted> = HashTable::new();
        for key in 0..count {
            let hash = hash_key(state, key);
            match table.entry(hash, |v: &Counted| v.key == key, |v| hash_key(state, v.key)) {
                Entry::Vacant(v) => {
                    v.insert(Counted {
                        key,
                        drops: Arc::clone(&drops),
                    });
                }
                _ => unreachable!(),
            }
        }
        (table, drops)
    }

    #[test]
    fn drop_runs_once_per_element() {
        let state = HashState::default();
        let (table, drops) = counted_table(&state, 20);
        drop(table);
        assert_eq!(drops.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn clear_drops_all_elements() {
        let state = HashState::default();
        let (mut table, drops) = counted_table(&state, 20);
        table.clear();
        assert_eq!(drops.load(Ordering::Relaxed), 20);
        assert_eq!(table.len(), 0);
        drop(table);
        assert_eq!(drops.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn partial_drain_drops_the_rest() {
        let state = HashState::default();
        let (mut table, drops) = counted_table(&state, 20);
        {
            let mut drain = table.drain();
            let first = drain.next().unwrap();
            assert!(first.key < 20);
            // The rest go down with the iterator.
        }
        assert_eq!(drops.load(Ordering::Relaxed), 20);
        assert_eq!(table.len(), 0);

        // The drained table stays usable.
        let hash = hash_key(&state, 99);
        match table.entry(hash, |v: &Counted| v.key == 99, |v| hash_key(&state, v.key)) {
            Entry::Vacant(v) => {
                v.insert(Counted {
                    key: 99,
                    drops: Arc::new(AtomicUsize::new(0)),
                });
            }
            _ => unreachable!(),
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn drain_yields_everything() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 10..30u64 {
            insert_item(&mut table, &state, k, 0);
        }
        let mut keys: Vec<u64> = table.drain().map(|v| v.key).collect();
        keys.sort_unstable();
        assert_eq!(keys, (10..30u64).collect::<Vec<_>>());
        assert_eq!(table.len(), 0);
        assert_eq!(tombstones(&table), 0);
    }

    #[test]
    fn retain_keeps_matching_elements() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..50u64 {
            insert_item(&mut table, &state, k, 0);
        }
        table.retain(|v| v.key % 2 == 0);
        assert_eq!(table.len(), 25);
        for k in 0..50u64 {
            assert_eq!(find_item(&table, &state, k).is_some(), k % 2 == 0, "key {}", k);
        }
        assert_invariants(&table);
    }

    #[test]
    fn merge_moves_missing_elements() {
        let state = HashState::default();
        let mut first: HashTable<Item> = HashTable::new();
        let mut second: HashTable<Item> = HashTable::new();
        for k in 0..10u64 {
            insert_item(&mut first, &state, k, 1);
        }
        for k in 5..15u64 {
            insert_item(&mut second, &state, k, 2);
        }

        first.merge_from(
            &mut second,
            |v| hash_key(&state, v.key),
            |a, b| a.key == b.key,
        );

        assert_eq!(first.len(), 15);
        assert_eq!(second.len(), 5);
        for k in 0..15u64 {
            assert!(find_item(&first, &state, k).is_some(), "key {}", k);
        }
        // Duplicates stayed behind with their original values.
        for k in 5..10u64 {
            assert_eq!(find_item(&second, &state, k).unwrap().value, 2);
        }
        assert_invariants(&first);
        assert_invariants(&second);
    }

    #[test]
    fn growth_info_tombstone_bit_set_by_erase() {
        let mut table: HashTable<Item> = HashTable::new();
        let count = 2 * GROUP_WIDTH as u64 + 5;
        for k in 0..count {
            match table.entry(0, |v| v.key == k, |_| 0) {
                Entry::Vacant(v) => {
                    v.insert(Item { key: k, value: 0 });
                }
                _ => unreachable!(),
            }
        }
        assert!(table.growth.has_no_deleted());
        assert!(table.remove(0, |v| v.key == 5).is_some());
        assert!(!table.growth.has_no_deleted(), "{:#?}", table);
        assert!(tombstones(&table) > 0);
    }

    #[test]
    fn zst_values() {
        let mut table: HashTable<()> = HashTable::new();
        match table.entry(0, |_| true, |_| 0) {
            Entry::Vacant(v) => {
                v.insert(());
            }
            _ => unreachable!(),
        }
        assert_eq!(table.len(), 1);
        match table.entry(0, |_| true, |_| 0) {
            Entry::Occupied(_) => {}
            Entry::Vacant(_) => panic!("zst entry should be occupied"),
        }
        assert!(table.find(0, |_| true).is_some());
        assert_eq!(table.remove(0, |_| true), Some(()));
        assert!(table.is_empty());
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    #[repr(align(32))]
    struct Overaligned {
        key: u64,
    }

    #[test]
    fn overaligned_values_stay_on_heap() {
        let state = HashState::default();
        let mut table: HashTable<Overaligned> = HashTable::new();
        // Alignment disqualifies the inline slot.
        assert_eq!(table.capacity(), 0);
        for key in 0..20u64 {
            let hash = hash_key(&state, key);
            match table.entry(hash, |v: &Overaligned| v.key == key, |v| {
                hash_key(&state, v.key)
            }) {
                Entry::Vacant(v) => {
                    v.insert(Overaligned { key });
                }
                _ => unreachable!(),
            }
        }
        for key in 0..20u64 {
            let hash = hash_key(&state, key);
            assert_eq!(
                table.find(hash, |v| v.key == key),
                Some(&Overaligned { key })
            );
        }
        assert_invariants(&table);
    }

    #[test]
    fn entry_or_insert_helpers() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        let hash = hash_key(&state, 1);
        let value = table
            .entry(hash, |v| v.key == 1, |v| hash_key(&state, v.key))
            .or_insert(Item { key: 1, value: 5 });
        assert_eq!(value.value, 5);
        let value = table
            .entry(hash, |v| v.key == 1, |v| hash_key(&state, v.key))
            .or_insert(Item { key: 1, value: 9 });
        assert_eq!(value.value, 5);

        let modified = table
            .entry(hash, |v| v.key == 1, |v| hash_key(&state, v.key))
            .and_modify(|v| v.value = 100);
        assert_eq!(modified.unwrap().value, 100);

        let miss = table
            .entry(hash_key(&state, 2), |v| v.key == 2, |v| {
                hash_key(&state, v.key)
            })
            .and_modify(|v| v.value = 0);
        assert!(miss.is_none());
    }

    #[test]
    fn try_entry_never_grows() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        // The inline slot is available exactly once.
        match table.try_entry(hash_key(&state, 1), |v| v.key == 1) {
            Ok(Entry::Vacant(v)) => {
                v.insert(Item { key: 1, value: 0 });
            }
            _ => panic!("inline slot should be available"),
        }
        assert_eq!(
            table.try_entry(hash_key(&state, 2), |v| v.key == 2).err(),
            Some(CapacityError)
        );
        assert!(matches!(
            table.try_entry(hash_key(&state, 1), |v| v.key == 1),
            Ok(Entry::Occupied(_))
        ));

        let mut table: HashTable<Item> = HashTable::with_capacity(20);
        let budget = table.capacity();
        let buckets = table.bucket_count();
        for k in 0..budget as u64 {
            match table.try_entry(hash_key(&state, k), |v| v.key == k) {
                Ok(Entry::Vacant(v)) => {
                    v.insert(Item { key: k, value: 0 });
                }
                _ => panic!("budget not exhausted at {}", k),
            }
        }
        assert!(
            table
                .try_entry(hash_key(&state, 9999), |v| v.key == 9999)
                .is_err()
        );
        assert_eq!(table.bucket_count(), buckets);

        // An erased slot makes room again, still without growing.
        assert!(table.remove(hash_key(&state, 0), |v| v.key == 0).is_some());
        match table.try_entry(hash_key(&state, 0), |v| v.key == 0) {
            Ok(Entry::Vacant(v)) => {
                v.insert(Item { key: 0, value: 1 });
            }
            _ => panic!("erased slot should be reusable"),
        }
        assert_eq!(table.bucket_count(), buckets);
        assert_invariants(&table);
    }

    #[test]
    fn occupied_entry_remove() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::new();
        for k in 0..8u64 {
            insert_item(&mut table, &state, k, k as i64);
        }
        let hash = hash_key(&state, 3);
        match table.entry(hash, |v| v.key == 3, |v| hash_key(&state, v.key)) {
            Entry::Occupied(occ) => {
                let removed = occ.remove();
                assert_eq!(removed, Item { key: 3, value: 3 });
            }
            Entry::Vacant(_) => panic!("key 3 should be present"),
        }
        assert_eq!(table.len(), 7);
        assert!(find_item(&table, &state, 3).is_none());
    }

    #[test]
    fn string_payloads() {
        let state = HashState::default();
        let mut table: HashTable<(String, i64)> = HashTable::new();
        let keys = ["hello", "world", "foo", "bar", "baz"];
        let hash_str = |state: &HashState, s: &str| {
            let mut h = state.build_hasher();
            h.write(s.as_bytes());
            h.finish()
        };

        for (i, k) in keys.iter().enumerate() {
            let hash = hash_str(&state, k);
            match table.entry(
                hash,
                |v: &(String, i64)| v.0 == *k,
                |v| hash_str(&state, &v.0),
            ) {
                Entry::Vacant(v) => {
                    v.insert((k.to_string(), i as i64));
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }
        assert_eq!(table.len(), keys.len());
        for (i, k) in keys.iter().enumerate() {
            let hash = hash_str(&state, k);
            let found = table.find(hash, |v| v.0 == *k).unwrap();
            assert_eq!(found.1, i as i64);
        }

        let removed = table.remove(hash_str(&state, "foo"), |v| v.0 == "foo");
        assert_eq!(removed, Some(("foo".to_string(), 2)));
        assert!(table.find(hash_str(&state, "foo"), |v| v.0 == "foo").is_none());
    }
}
