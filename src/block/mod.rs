//! A single cubic tile of voxels (spec component C2).
//!
//! A `Block` alternates between an uncompressed working buffer and a
//! compressed byte blob; exactly one is authoritative at any time. Encoding
//! and decoding are delegated to a [`Compressor`](crate::compressor::Compressor)
//! (by default [`RunLengthCompressor`]), matching spec.md's "the interface
//! allows substitution" note — a block can be built over a different codec
//! with [`Block::with_compressor`] without changing any of its access
//! patterns.

#[cfg(feature = "use-serde")]
use serde::{Deserialize, Serialize};

use crate::compressor::{Compressor, RunLengthCompressor};
use crate::error::{check_power_of_two, Result, VoxelError};

/// A cubic tile of side length `bs` (a power of two, `2 <= bs <= 256`),
/// encoded with compressor `C` (by default [`RunLengthCompressor`]).
///
/// Exactly one of the uncompressed buffer or `compressed` is authoritative:
/// `is_compressed` selects which. A compressed block never has
/// `uncompressed_dirty == true`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "use-serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "use-serde",
    serde(bound(
        serialize = "T: Serialize, C: Serialize",
        deserialize = "T: Deserialize<'de>, C: Deserialize<'de>"
    ))
)]
pub struct Block<T, C = RunLengthCompressor> {
    side_length: u32,
    side_length_pow: u32,
    /// Present only while `is_compressed == false`.
    uncompressed: Option<Vec<T>>,
    is_compressed: bool,
    uncompressed_dirty: bool,
    timestamp: u64,
    /// `compressor`'s encoding of the last-compressed contents. Empty and
    /// meaningless while `is_compressed == false`.
    compressed: Vec<u8>,
    compressor: C,
}

impl<T, C> Block<T, C>
where
    T: Copy + PartialEq + Default,
    C: Compressor<T>,
{
    /// Builds a new block of side length `bs`, initialised to the default
    /// value of `T` and already compressed to a single run, encoded with an
    /// explicit compressor instance instead of `C::default()`.
    ///
    /// Fails with [`VoxelError::InvalidArgument`] if `bs` is not a power of
    /// two, or [`VoxelError::OutOfMemory`] if the uncompressed working
    /// buffer can't be allocated.
    pub fn with_compressor(bs: u32, compressor: C) -> Result<Self> {
        check_power_of_two(bs, "block side length")?;
        let voxel_count = (bs as u64).pow(3) as usize;
        let mut block = Self {
            side_length: bs,
            side_length_pow: bs.trailing_zeros(),
            uncompressed: Some(alloc_default_filled(voxel_count)?),
            is_compressed: false,
            uncompressed_dirty: true,
            timestamp: 0,
            compressed: Vec::new(),
            compressor,
        };
        block.compress();
        Ok(block)
    }

    #[inline]
    pub fn side_length(&self) -> u32 {
        self.side_length
    }

    #[inline]
    pub fn side_length_pow(&self) -> u32 {
        self.side_length_pow
    }

    #[inline]
    pub fn voxel_count(&self) -> usize {
        (self.side_length as u64).pow(3) as usize
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn touch(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    #[inline]
    fn flat_index(&self, x: u32, y: u32, z: u32) -> usize {
        (x + y * self.side_length + z * self.side_length * self.side_length) as usize
    }

    /// Reads a voxel. Requires the block to be uncompressed.
    ///
    /// This is a hot-path operation: positional and state checks are
    /// `debug_assert!`s. Callers (the `Volume` and `VolumeIterator`) are
    /// responsible for calling [`Block::uncompress`] first.
    #[inline]
    pub fn get_voxel(&self, x: u32, y: u32, z: u32) -> T {
        debug_assert!(x < self.side_length && y < self.side_length && z < self.side_length);
        let data = self
            .uncompressed
            .as_ref()
            .expect("get_voxel requires an uncompressed block");
        data[self.flat_index(x, y, z)]
    }

    /// Writes a voxel and marks the buffer dirty. Requires the block to be
    /// uncompressed.
    #[inline]
    pub fn set_voxel(&mut self, x: u32, y: u32, z: u32, value: T) {
        debug_assert!(x < self.side_length && y < self.side_length && z < self.side_length);
        let idx = self.flat_index(x, y, z);
        let data = self
            .uncompressed
            .as_mut()
            .expect("set_voxel requires an uncompressed block");
        data[idx] = value;
        self.uncompressed_dirty = true;
    }

    /// A raw pointer to voxel `(x, y, z)` in the uncompressed buffer, for
    /// the iterator's cached fast-voxel pointer. Requires the block to be
    /// uncompressed; the caller must not outlive the block or cause it to
    /// recompress while the pointer is held.
    #[inline]
    pub fn voxel_ptr_mut(&mut self, x: u32, y: u32, z: u32) -> *mut T {
        debug_assert!(x < self.side_length && y < self.side_length && z < self.side_length);
        let idx = self.flat_index(x, y, z);
        let data = self
            .uncompressed
            .as_mut()
            .expect("voxel_ptr_mut requires an uncompressed block");
        // SAFETY: idx < data.len() by the debug_assert above (x,y,z < side_length).
        unsafe { data.as_mut_ptr().add(idx) }
    }

    /// Overwrites every voxel with `value`. Requires the block to be
    /// uncompressed. O(bs^3).
    pub fn fill(&mut self, value: T) {
        let data = self
            .uncompressed
            .as_mut()
            .expect("fill requires an uncompressed block");
        data.fill(value);
        self.uncompressed_dirty = true;
    }

    /// Marks the uncompressed buffer dirty without otherwise touching it.
    /// Used by callers (`VolumeIterator::set_voxel`) that write through a
    /// cached raw pointer instead of [`Block::set_voxel`], so the write is
    /// still re-encoded on the next [`Block::compress`] rather than
    /// silently discarded.
    #[inline]
    pub(crate) fn mark_dirty(&mut self) {
        self.uncompressed_dirty = true;
    }

    /// Resizes the block to a new power-of-two side length, reallocating
    /// the uncompressed buffer if one is present (new voxels are
    /// default-initialised). Marks the buffer dirty when present.
    pub fn resize(&mut self, new_bs: u32) -> Result<()> {
        check_power_of_two(new_bs, "block side length")?;
        if self.uncompressed.is_some() {
            let voxel_count = (new_bs as u64).pow(3) as usize;
            self.uncompressed = Some(alloc_default_filled(voxel_count)?);
            self.uncompressed_dirty = true;
        }
        self.side_length = new_bs;
        self.side_length_pow = new_bs.trailing_zeros();
        Ok(())
    }

    /// Discards the uncompressed buffer, re-encoding it through `compressor`
    /// first if it has been mutated since the last compression.
    pub fn compress(&mut self) {
        if self.uncompressed_dirty {
            let data = self
                .uncompressed
                .as_ref()
                .expect("compress requires an uncompressed block when dirty");
            let mut buf = vec![0u8; self.compressor.max_compressed_size(data.len())];
            let written = self
                .compressor
                .compress(data, &mut buf)
                .expect("scratch buffer sized via max_compressed_size is never too small");
            buf.truncate(written);
            self.compressed = buf;

            log::trace!(
                "compressed block of side length {} into {} bytes",
                self.side_length,
                self.compressed.len()
            );
        }

        self.uncompressed = None;
        self.is_compressed = true;
        self.uncompressed_dirty = false;
    }

    /// Allocates an uncompressed buffer and decodes `compressed` into it via
    /// `compressor`. No-op if the block is already uncompressed.
    pub fn uncompress(&mut self) {
        if !self.is_compressed {
            return;
        }
        let voxel_count = self.voxel_count();
        let mut data = vec![T::default(); voxel_count];
        self.compressor
            .decompress(&self.compressed, &mut data)
            .expect("a block's own previously compressed bytes always decode to its own voxel count");

        log::trace!(
            "uncompressed block of side length {} from {} compressed bytes",
            self.side_length,
            self.compressed.len()
        );
        self.uncompressed = Some(data);
        self.is_compressed = false;
        self.uncompressed_dirty = false;
    }

    /// The uncompressed buffer, if present. Used by callers that need to
    /// rescan a block's contents (homogeneity checks on eviction, bulk
    /// parallel mutation) without going through per-voxel accessors.
    #[inline]
    pub fn uncompressed_ref(&self) -> Option<&[T]> {
        self.uncompressed.as_deref()
    }

    /// Mutable access to the uncompressed buffer, if present. Marks the
    /// buffer dirty unconditionally, since callers use this for bulk writes
    /// whose extent we cannot cheaply verify.
    #[inline]
    pub fn uncompressed_mut(&mut self) -> Option<&mut [T]> {
        self.uncompressed_dirty |= self.uncompressed.is_some();
        self.uncompressed.as_deref_mut()
    }
}

impl<T, C> Block<T, C>
where
    T: Copy + PartialEq + Default,
    C: Compressor<T> + Default,
{
    /// Builds a new block encoded with `C::default()`. Most callers want
    /// this; see [`Block::with_compressor`] to supply a specific compressor
    /// instance instead.
    ///
    /// Fails with [`VoxelError::InvalidArgument`] if `bs` is not a power of
    /// two, or [`VoxelError::OutOfMemory`] if the uncompressed working
    /// buffer can't be allocated.
    pub fn new(bs: u32) -> Result<Self> {
        Self::with_compressor(bs, C::default())
    }
}

impl<T> Block<T, RunLengthCompressor>
where
    T: Copy + PartialEq + Default,
{
    /// Run-length pairs of the compressed representation, for diagnostics
    /// and the property tests in spec.md §8. Only available over the
    /// default [`RunLengthCompressor`], whose byte format this decodes
    /// directly rather than through the generic [`Compressor`] interface.
    pub fn runs(&self) -> impl Iterator<Item = (u8, T)> + '_ {
        let value_size = std::mem::size_of::<T>();
        let bytes = &self.compressed;
        let mut read = 0usize;
        std::iter::from_fn(move || {
            if read >= bytes.len() {
                return None;
            }
            let run_len = bytes[read];
            read += 1;
            // SAFETY: compressed is this crate's own RunLengthCompressor
            // output: a run_len byte followed by exactly size_of::<T>() value
            // bytes, repeated until exhausted.
            let value: T = unsafe { std::ptr::read_unaligned(bytes[read..].as_ptr() as *const T) };
            read += value_size;
            Some((run_len, value))
        })
    }
}

/// Allocates a `Vec<T>` of `len` elements, each `T::default()`, surfacing
/// [`VoxelError::OutOfMemory`] instead of aborting the process if the
/// allocator can't satisfy the request.
fn alloc_default_filled<T: Copy + Default>(len: usize) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|_| VoxelError::OutOfMemory {
        requested_bytes: len.saturating_mul(std::mem::size_of::<T>()),
    })?;
    data.resize(len, T::default());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_is_compressed_and_default_filled() {
        let block = Block::<u8>::new(4).unwrap();
        assert!(block.is_compressed());
        assert_eq!(block.side_length(), 4);
        assert_eq!(block.side_length_pow(), 2);
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(
            Block::<u8>::new(3),
            Err(VoxelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn roundtrip_after_fill() {
        let mut block = Block::<u8>::new(4).unwrap();
        block.uncompress();
        block.fill(9);
        block.compress();
        block.uncompress();
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    assert_eq!(block.get_voxel(x, y, z), 9);
                }
            }
        }
    }

    #[test]
    fn get_after_set_is_consistent() {
        let mut block = Block::<u8>::new(4).unwrap();
        block.uncompress();
        block.set_voxel(1, 2, 3, 42);
        assert_eq!(block.get_voxel(1, 2, 3), 42);
        assert_eq!(block.get_voxel(0, 0, 0), 0);
    }

    #[test]
    fn mark_dirty_forces_reencode_on_next_compress() {
        // A direct raw-pointer write (what VolumeIterator::set_voxel does)
        // doesn't go through set_voxel, so without mark_dirty a subsequent
        // compress() would keep the stale pre-write runs.
        let mut block = Block::<u8>::new(4).unwrap();
        block.uncompress();
        block.fill(1);
        block.compress();

        block.uncompress();
        let ptr = block.voxel_ptr_mut(0, 0, 0);
        unsafe {
            *ptr = 9;
        }
        block.mark_dirty();
        block.compress();

        block.uncompress();
        assert_eq!(block.get_voxel(0, 0, 0), 9);
        assert_eq!(block.get_voxel(1, 0, 0), 1);
    }

    #[test]
    fn run_length_boundary_at_255() {
        // bs=4 -> 64 voxels; craft a buffer with a run crossing 255... not
        // possible at bs=4 (64 < 255), so verify within the voxel count
        // instead: a run of 64 stays one run.
        let mut block = Block::<u8>::new(4).unwrap();
        block.uncompress();
        block.fill(1);
        block.compress();
        let runs: Vec<_> = block.runs().collect();
        assert_eq!(runs, vec![(64, 1)]);
    }

    #[test]
    fn run_length_splits_at_255_boundary_for_larger_block() {
        let mut block = Block::<u8>::new(16).unwrap(); // 4096 voxels
        block.uncompress();
        block.fill(0);
        // Overwrite the first 300 voxels with 1 via direct indexing order (x fastest).
        for i in 0..300usize {
            let x = (i % 16) as u32;
            let y = ((i / 16) % 16) as u32;
            let z = (i / (16 * 16)) as u32;
            block.set_voxel(x, y, z, 1);
        }
        block.compress();
        let runs: Vec<_> = block.runs().collect();
        assert_eq!(runs[0], (255, 1));
        assert_eq!(runs[1], (45, 1));
        assert_eq!(runs[2], (4096 - 300, 0));

        block.uncompress();
        for i in 0..300usize {
            let x = (i % 16) as u32;
            let y = ((i / 16) % 16) as u32;
            let z = (i / (16 * 16)) as u32;
            assert_eq!(block.get_voxel(x, y, z), 1);
        }
        assert_eq!(block.get_voxel(15, 15, 15), 0);
    }

    #[test]
    fn resize_reallocates_uncompressed_buffer() {
        let mut block = Block::<u8>::new(4).unwrap();
        block.uncompress();
        block.resize(8).unwrap();
        assert_eq!(block.side_length(), 8);
        assert_eq!(block.voxel_count(), 512);
        assert_eq!(block.get_voxel(7, 7, 7), 0);
    }

    #[test]
    fn compress_without_dirty_just_discards_buffer() {
        let mut block = Block::<u8>::new(4).unwrap();
        block.uncompress();
        // no mutation: uncompressed_dirty is false after construction's
        // implicit compress+uncompress round trip would have cleared it,
        // but `uncompress()` itself resets dirty to false.
        block.compress();
        assert!(block.is_compressed());
    }

    #[cfg(feature = "use-serde")]
    #[test]
    fn serde_roundtrip() {
        let mut block = Block::<u16>::new(8).unwrap();
        block.uncompress();
        block.fill(7);
        block.set_voxel(0, 0, 0, 42);
        block.compress();

        let byte_data = bincode::serialize(&block).unwrap();
        let mut block_de = bincode::deserialize::<Block<u16>>(&byte_data).unwrap();

        block_de.uncompress();
        assert_eq!(block_de.get_voxel(0, 0, 0), 42);
        assert_eq!(block_de.get_voxel(1, 0, 0), 7);
    }
}
