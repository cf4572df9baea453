//! The block-partitioned volume store (spec component C4): partitioning,
//! block residency, sharing/deduplication of homogeneous blocks, and
//! random voxel access.

use std::collections::HashMap;
use std::rc::Rc;

use crate::block::Block;
use crate::error::{check_power_of_two, Result, VoxelError};
use crate::region::Region;

/// Hasher matching the teacher crate's choice of `ahash` for small,
/// densely-packed keys (here: voxel values) over the standard library's
/// SipHash.
type FastMap<K, V> = HashMap<K, V, ahash::RandomState>;

/// One grid slot: either a reference to a deduplicated, read-only
/// homogeneous block, or a privately owned one.
///
/// `Shared` keeps the homogeneous value alongside the `Rc` so reads never
/// have to dereference the singleton itself; the `Rc` only exists to keep
/// the compressed singleton block alive and to give `Volume::singletons`
/// somewhere to anchor the dedup (see DESIGN.md's sharing-representation
/// decision).
enum BlockSlot<T> {
    Shared(Rc<Block<T>>, T),
    Private(Box<Block<T>>),
}

/// A paged, compressed, block-partitioned cubic volume of voxels of type `T`.
///
/// `vs` (the domain side length) and `bs` (the block side length) must both
/// be powers of two with `vs >= bs`. The grid starts entirely as shared
/// references to a singleton block encoding `T::default()`; the first write
/// into any given block breaks that sharing (copy-on-write) and allocates a
/// private block.
pub struct Volume<T> {
    vs: u32,
    bs: u32,
    bs_pow: u32,
    blocks_per_side: u32,
    slots: Vec<BlockSlot<T>>,
    potentially_sharable: Vec<bool>,
    timestamps: Vec<u64>,
    /// Cache of compressed singleton blocks, one per distinct homogeneous
    /// value currently referenced by at least one shared slot.
    singletons: FastMap<T, Rc<Block<T>>>,
    max_uncompressed_blocks: usize,
    uncompressed_count: usize,
    clock: u64,
    /// Bumped on every mutating method; `VolumeIterator` checks it against
    /// the generation it was bound against to detect external mutation
    /// (the safe-Rust equivalent of the teacher's non-owning back reference
    /// becoming invalid — see spec.md §9 and SPEC_FULL.md §5).
    generation: u64,
}

impl<T> Volume<T>
where
    T: Copy + PartialEq + Eq + std::hash::Hash + Default,
{
    /// Builds a volume of side length `vs` partitioned into blocks of side
    /// length `bs`. Both must be powers of two, and `vs >= bs`.
    ///
    /// Every grid slot starts as a shared reference to the default-value
    /// singleton block; no allocation beyond the grid's own bookkeeping
    /// arrays happens at construction.
    pub fn new(vs: u32, bs: u32, max_uncompressed_blocks: usize) -> Result<Self> {
        Self::with_initial_value(vs, bs, max_uncompressed_blocks, T::default())
    }

    /// As [`Volume::new`], but every slot starts out shared at `initial_value`
    /// instead of `T::default()`. Used by [`VolumeBuilder::build`].
    fn with_initial_value(
        vs: u32,
        bs: u32,
        max_uncompressed_blocks: usize,
        initial_value: T,
    ) -> Result<Self> {
        check_power_of_two(vs, "volume side length")?;
        check_power_of_two(bs, "block side length")?;
        if bs > vs {
            return Err(VoxelError::InvalidArgument(format!(
                "block side length {bs} must not exceed volume side length {vs}"
            )));
        }

        let blocks_per_side = vs / bs;
        let num_blocks = (blocks_per_side as u64).pow(3) as usize;

        let mut block = Block::new(bs)?;
        if initial_value != T::default() {
            block.uncompress();
            block.fill(initial_value);
            block.compress();
        }
        let initial_singleton = Rc::new(block);
        let mut singletons = FastMap::default();
        singletons.insert(initial_value, initial_singleton.clone());

        Ok(Self {
            vs,
            bs,
            bs_pow: bs.trailing_zeros(),
            blocks_per_side,
            slots: (0..num_blocks)
                .map(|_| BlockSlot::Shared(initial_singleton.clone(), initial_value))
                .collect(),
            potentially_sharable: vec![false; num_blocks],
            timestamps: vec![0; num_blocks],
            singletons,
            max_uncompressed_blocks,
            uncompressed_count: 0,
            clock: 0,
            generation: 0,
        })
    }

    #[inline]
    pub fn side_length(&self) -> u32 {
        self.vs
    }

    #[inline]
    pub fn block_side_length(&self) -> u32 {
        self.bs
    }

    /// Length of the volume's space diagonal, for camera/scale computations
    /// by out-of-scope consumers (spec.md §6).
    pub fn diagonal_length(&self) -> f64 {
        (3.0_f64).sqrt() * self.vs as f64
    }

    #[inline]
    pub fn blocks_per_side(&self) -> u32 {
        self.blocks_per_side
    }

    #[inline]
    pub(crate) fn bs_pow(&self) -> u32 {
        self.bs_pow
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    fn in_bounds(&self, x: u32, y: u32, z: u32) -> bool {
        x < self.vs && y < self.vs && z < self.vs
    }

    fn check_bounds(&self, x: u32, y: u32, z: u32) -> Result<()> {
        if self.in_bounds(x, y, z) {
            Ok(())
        } else {
            Err(VoxelError::OutOfBounds {
                x,
                y,
                z,
                side_length: self.vs,
            })
        }
    }

    #[inline]
    pub(crate) fn block_coords(&self, x: u32, y: u32, z: u32) -> (u32, u32, u32) {
        (x >> self.bs_pow, y >> self.bs_pow, z >> self.bs_pow)
    }

    #[inline]
    pub(crate) fn local_coords(&self, x: u32, y: u32, z: u32) -> (u32, u32, u32) {
        let mask = self.bs - 1;
        (x & mask, y & mask, z & mask)
    }

    #[inline]
    pub(crate) fn block_index(&self, bx: u32, by: u32, bz: u32) -> usize {
        (bx + by * self.blocks_per_side + bz * self.blocks_per_side * self.blocks_per_side) as usize
    }

    fn next_timestamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Reads a single voxel. Shared, homogeneous blocks are read directly
    /// from `homogeneous_value` without uncompressing anything or touching
    /// residency state (spec.md §4.4).
    pub fn get_voxel(&mut self, x: u32, y: u32, z: u32) -> Result<T> {
        self.check_bounds(x, y, z)?;
        let (bx, by, bz) = self.block_coords(x, y, z);
        let (lx, ly, lz) = self.local_coords(x, y, z);
        let bi = self.block_index(bx, by, bz);

        match &self.slots[bi] {
            BlockSlot::Shared(_, value) => Ok(*value),
            BlockSlot::Private(_) => {
                self.ensure_uncompressed(bi)?;
                let ts = self.next_timestamp();
                self.timestamps[bi] = ts;
                match &self.slots[bi] {
                    BlockSlot::Private(block) => Ok(block.get_voxel(lx, ly, lz)),
                    BlockSlot::Shared(..) => unreachable!("ensure_uncompressed never re-shares"),
                }
            }
        }
    }

    /// Writes a single voxel, breaking sharing on the owning block if
    /// necessary (spec.md §4.4).
    pub fn set_voxel(&mut self, x: u32, y: u32, z: u32, value: T) -> Result<()> {
        self.check_bounds(x, y, z)?;
        let (bx, by, bz) = self.block_coords(x, y, z);
        let (lx, ly, lz) = self.local_coords(x, y, z);
        let bi = self.block_index(bx, by, bz);

        match &self.slots[bi] {
            BlockSlot::Shared(_, shared_value) => {
                if *shared_value == value {
                    return Ok(());
                }
                let homogeneous_value = *shared_value;
                self.break_sharing(bi, homogeneous_value)?;
            }
            BlockSlot::Private(_) => {
                self.ensure_uncompressed(bi)?;
            }
        }

        let ts = self.next_timestamp();
        self.timestamps[bi] = ts;
        match &mut self.slots[bi] {
            BlockSlot::Private(block) => {
                block.set_voxel(lx, ly, lz, value);
            }
            BlockSlot::Shared(..) => unreachable!("break_sharing/ensure_uncompressed leave a Private slot"),
        }
        self.potentially_sharable[bi] = true;
        self.generation += 1;
        Ok(())
    }

    /// Materialises a private copy of a shared block, pre-filled with its
    /// former homogeneous value, and uncompresses it. Called the first time
    /// a write targets a shared slot.
    fn break_sharing(&mut self, bi: usize, homogeneous_value: T) -> Result<()> {
        self.reserve_uncompressed_slot(Some(bi));
        let mut block = Block::new(self.bs)?;
        block.uncompress();
        block.fill(homogeneous_value);
        self.slots[bi] = BlockSlot::Private(Box::new(block));
        self.uncompressed_count += 1;
        log::trace!("block {bi} broke sharing from value; now private");
        Ok(())
    }

    /// Ensures the private block at `bi` has an uncompressed buffer,
    /// evicting another block first if that would exceed the residency
    /// budget. No-op if already uncompressed. `bi` must refer to a private
    /// slot.
    fn ensure_uncompressed(&mut self, bi: usize) -> Result<()> {
        let already_uncompressed = match &self.slots[bi] {
            BlockSlot::Private(block) => !block.is_compressed(),
            BlockSlot::Shared(..) => panic!("ensure_uncompressed called on a shared slot"),
        };
        if already_uncompressed {
            return Ok(());
        }
        self.reserve_uncompressed_slot(Some(bi));
        if let BlockSlot::Private(block) = &mut self.slots[bi] {
            block.uncompress();
            log::trace!("block {bi} uncompressed");
        }
        self.uncompressed_count += 1;
        Ok(())
    }

    /// If the residency budget would be exceeded by adding one more
    /// uncompressed block, evicts the least-recently-touched private
    /// uncompressed block other than `excluding`.
    fn reserve_uncompressed_slot(&mut self, excluding: Option<usize>) {
        if self.uncompressed_count < self.max_uncompressed_blocks {
            return;
        }
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, slot)| {
                Some(*i) != excluding
                    && matches!(slot, BlockSlot::Private(b) if !b.is_compressed())
            })
            .min_by_key(|(i, _)| self.timestamps[*i])
            .map(|(i, _)| i);

        if let Some(j) = victim {
            self.evict(j);
        }
    }

    /// Evicts block `j`: re-shares it if it has become homogeneous and was
    /// flagged as a candidate, otherwise simply recompresses it.
    fn evict(&mut self, j: usize) {
        let potentially_sharable = self.potentially_sharable[j];
        self.potentially_sharable[j] = false;

        if potentially_sharable {
            if let BlockSlot::Private(block) = &self.slots[j] {
                if let Some(v) = homogeneous_value(block) {
                    let bs = self.bs;
                    let singleton = self
                        .singletons
                        .entry(v)
                        .or_insert_with(|| {
                            let mut block = Block::new(bs).expect("bs already validated");
                            block.uncompress();
                            block.fill(v);
                            block.compress();
                            Rc::new(block)
                        })
                        .clone();
                    self.slots[j] = BlockSlot::Shared(singleton, v);
                    self.uncompressed_count -= 1;
                    log::debug!("block {j} evicted and re-shared as homogeneous value");
                    return;
                }
            }
        }

        if let BlockSlot::Private(block) = &mut self.slots[j] {
            block.compress();
            self.uncompressed_count -= 1;
            log::debug!("block {j} evicted and recompressed");
        }
    }

    /// `true` if the grid slot at block coordinates `(bx, by, bz)` is
    /// currently a shared reference, for tests and diagnostics (spec.md §8
    /// property 4).
    pub fn is_shared(&self, bx: u32, by: u32, bz: u32) -> bool {
        let bi = self.block_index(bx, by, bz);
        matches!(self.slots[bi], BlockSlot::Shared(..))
    }

    /// Number of blocks currently holding an uncompressed buffer, for the
    /// residency-bound property test (spec.md §8 property 7).
    pub fn uncompressed_block_count(&self) -> usize {
        self.uncompressed_count
    }

    /// `Some(homogeneous value)` if block `bi` is currently a shared slot.
    pub(crate) fn block_shared_value(&self, bi: usize) -> Option<T> {
        match &self.slots[bi] {
            BlockSlot::Shared(_, v) => Some(*v),
            BlockSlot::Private(_) => None,
        }
    }

    /// Ensures block `bi` is private and uncompressed, breaking sharing
    /// first if necessary, and records a touch. Used by `VolumeIterator`
    /// when it settles on a block it intends to cache a raw pointer into.
    pub(crate) fn prepare_block_for_iteration(&mut self, bi: usize) -> Result<()> {
        let homogeneous_value = match &self.slots[bi] {
            BlockSlot::Shared(_, v) => Some(*v),
            BlockSlot::Private(_) => None,
        };
        if let Some(v) = homogeneous_value {
            self.break_sharing(bi, v)?;
        } else {
            self.ensure_uncompressed(bi)?;
        }
        let ts = self.next_timestamp();
        self.timestamps[bi] = ts;
        Ok(())
    }

    /// Raw pointer to the first voxel of the uncompressed buffer of private
    /// block `bi`. Caller must have just called
    /// [`Volume::prepare_block_for_iteration`] on the same index.
    pub(crate) fn block_base_ptr(&mut self, bi: usize) -> *mut T {
        match &mut self.slots[bi] {
            BlockSlot::Private(block) => block.voxel_ptr_mut(0, 0, 0),
            BlockSlot::Shared(..) => panic!("block_base_ptr called on a shared slot"),
        }
    }

    /// Flags block `bi` as a candidate for re-sharing at its next eviction,
    /// and marks its uncompressed buffer dirty so that eviction's
    /// `compress()` actually re-encodes the write instead of keeping stale
    /// runs. Called by `VolumeIterator::set_voxel` after a direct write
    /// through its cached pointer, which bypasses `Block::set_voxel` and so
    /// would otherwise leave `uncompressed_dirty` untouched. Deliberately
    /// does not bump `generation`: per DESIGN.md's iterator-invalidation
    /// decision, the generation counter tracks mutation through some
    /// *other* handle while an iterator is alive, not the iterator's own
    /// writes.
    pub(crate) fn mark_written(&mut self, bi: usize) {
        self.potentially_sharable[bi] = true;
        if let BlockSlot::Private(block) = &mut self.slots[bi] {
            block.mark_dirty();
        }
    }

    /// Builds an iterator bound to this volume and positioned at `region`'s
    /// lower corner, restricted to `region`.
    ///
    /// Fails with `VoxelError::InvalidArgument` if `region` has `lo > hi` on
    /// any axis, or `VoxelError::OutOfBounds` if `region`'s upper corner
    /// lies outside the volume.
    pub fn iter_region(&mut self, region: Region) -> Result<crate::iter::VolumeIterator<'_, T>> {
        if !region.is_valid() {
            return Err(VoxelError::InvalidArgument(
                "region lower corner must not exceed its upper corner".to_string(),
            ));
        }
        self.check_bounds(region.upper_x(), region.upper_y(), region.upper_z())?;
        crate::iter::VolumeIterator::bind(self, region)
    }

    #[cfg(feature = "use-rayon")]
    /// Applies `f` in parallel to every currently-private block's
    /// uncompressed voxel buffer, skipping blocks that are still shared.
    /// Additive bulk-mutation entry point (SPEC_FULL.md §6); does not
    /// change residency accounting beyond what each touched block already
    /// tracks, and never breaks sharing — shared blocks are left untouched.
    pub fn par_for_each_private_block_mut<F>(&mut self, f: F)
    where
        T: Send + Sync,
        F: Fn(&mut [T]) + Send + Sync,
    {
        use rayon::prelude::*;

        self.slots.par_iter_mut().for_each(|slot| {
            if let BlockSlot::Private(block) = slot {
                if !block.is_compressed() {
                    if let Some(buf) = block.uncompressed_mut() {
                        f(buf);
                    }
                }
            }
        });
        self.generation += 1;
    }
}

/// Builds a [`Volume`] with its residency budget and initial fill value set
/// independently of construction, the same "builder, then use" shape the
/// teacher applies to its disk/k-ring builders.
pub struct VolumeBuilder<T> {
    max_uncompressed_blocks: usize,
    initial_value: T,
}

impl<T> VolumeBuilder<T>
where
    T: Copy + PartialEq + Eq + std::hash::Hash + Default,
{
    pub fn new() -> Self {
        Self {
            max_uncompressed_blocks: 16,
            initial_value: T::default(),
        }
    }

    /// Sets the maximum number of blocks allowed an uncompressed buffer at
    /// once. Defaults to 16.
    pub fn max_uncompressed_blocks(mut self, max_uncompressed_blocks: usize) -> Self {
        self.max_uncompressed_blocks = max_uncompressed_blocks;
        self
    }

    /// Sets the value every voxel starts out as. Defaults to `T::default()`.
    pub fn initial_value(mut self, initial_value: T) -> Self {
        self.initial_value = initial_value;
        self
    }

    /// Builds the volume at side length `vs` partitioned into blocks of side
    /// length `bs`, per the rules of [`Volume::new`].
    pub fn build(self, vs: u32, bs: u32) -> Result<Volume<T>> {
        Volume::with_initial_value(vs, bs, self.max_uncompressed_blocks, self.initial_value)
    }
}

impl<T> Default for VolumeBuilder<T>
where
    T: Copy + PartialEq + Eq + std::hash::Hash + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

/// If `block`'s uncompressed buffer holds a single repeated value, returns it.
fn homogeneous_value<T: Copy + PartialEq + Default>(block: &Block<T>) -> Option<T> {
    let buf = block.uncompressed_ref()?;
    let first = *buf.first()?;
    buf.iter().all(|v| *v == first).then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_volume_reads_default_everywhere() {
        let mut v = Volume::<u8>::new(64, 16, 4).unwrap();
        assert_eq!(v.get_voxel(0, 0, 0).unwrap(), 0);
        assert_eq!(v.get_voxel(63, 63, 63).unwrap(), 0);
        assert_eq!(v.uncompressed_block_count(), 0);
    }

    #[test]
    fn write_then_read_back() {
        let mut v = Volume::<u8>::new(64, 16, 4).unwrap();
        v.set_voxel(3, 4, 5, 7).unwrap();
        assert_eq!(v.get_voxel(3, 4, 5).unwrap(), 7);
    }

    #[test]
    fn single_write_breaks_sharing_locally() {
        let mut v = Volume::<u8>::new(64, 16, 4).unwrap();
        v.set_voxel(3, 4, 5, 7).unwrap();

        assert_eq!(v.get_voxel(3, 4, 5).unwrap(), 7);
        assert_eq!(v.get_voxel(3, 4, 6).unwrap(), 0);
        assert_eq!(v.get_voxel(16, 0, 0).unwrap(), 0);

        assert!(!v.is_shared(0, 0, 0));
        assert!(v.is_shared(1, 0, 0));
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mut v = Volume::<u8>::new(32, 8, 4).unwrap();
        assert!(matches!(
            v.get_voxel(32, 0, 0),
            Err(VoxelError::OutOfBounds { .. })
        ));
        assert!(matches!(
            v.set_voxel(0, 0, 100, 1),
            Err(VoxelError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn rejects_bs_larger_than_vs() {
        assert!(matches!(
            Volume::<u8>::new(8, 16, 4),
            Err(VoxelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn fill_block_then_evict_reshares_as_singleton() {
        let mut v = Volume::<u8>::new(32, 8, 1).unwrap();
        // Fill every voxel of block (0,0,0) with the same value.
        for z in 0..8 {
            for y in 0..8 {
                for x in 0..8 {
                    v.set_voxel(x, y, z, 9).unwrap();
                }
            }
        }
        assert!(!v.is_shared(0, 0, 0));

        // Touching a second block with a residency budget of 1 evicts the first.
        v.set_voxel(8, 0, 0, 1).unwrap();

        assert!(v.is_shared(0, 0, 0));
        assert_eq!(v.get_voxel(0, 0, 0).unwrap(), 9);
        assert_eq!(v.uncompressed_block_count(), 1);
    }

    #[test]
    fn residency_budget_is_respected() {
        let mut v = Volume::<u8>::new(64, 8, 2).unwrap();
        for i in 0..5u32 {
            v.set_voxel(i * 8, 0, 0, 1).unwrap();
            assert!(v.uncompressed_block_count() <= 2);
        }
    }

    #[test]
    fn builder_sets_initial_value_and_residency_budget() {
        let mut v = VolumeBuilder::<u8>::new()
            .initial_value(3)
            .max_uncompressed_blocks(1)
            .build(32, 8)
            .unwrap();
        assert_eq!(v.get_voxel(0, 0, 0).unwrap(), 3);
        assert_eq!(v.get_voxel(31, 31, 31).unwrap(), 3);
        assert!(v.is_shared(0, 0, 0));
    }

    #[test]
    fn copy_on_write_preserves_sibling_voxels() {
        let mut v = Volume::<u8>::new(16, 16, 4).unwrap();
        v.set_voxel(0, 0, 0, 5).unwrap();
        for z in 0..16u32 {
            for y in 0..16u32 {
                for x in 0..16u32 {
                    if (x, y, z) != (0, 0, 0) {
                        assert_eq!(v.get_voxel(x, y, z).unwrap(), 0);
                    }
                }
            }
        }
    }
}
