//! The compressor abstraction (spec component C1) and the run-length codec
//! [`Block`](crate::block::Block) uses by default.
//!
//! Compressors are stateless: a given implementation only needs to expose a
//! worst-case size bound plus encode/decode, the same three-operation shape
//! `examples/original_source`'s `PolyVoxCore::Compressor` interface uses.
//! This crate ships one implementation, [`RunLengthCompressor`], but the
//! trait exists so a caller could substitute a general-purpose byte codec
//! for voxel types where straightforward RLE compresses poorly.

#[cfg(feature = "use-serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxelError};

/// A stateless codec over a fixed-size-element buffer.
pub trait Compressor<T> {
    /// Upper bound, in bytes, on the size of `compress`'s output for an
    /// input of `input_len` elements.
    fn max_compressed_size(&self, input_len: usize) -> usize;

    /// Encodes `src` into `dst`, returning the number of bytes written.
    ///
    /// Fails with [`VoxelError::InvalidArgument`] if `dst` is smaller than
    /// [`Compressor::max_compressed_size`] would require.
    fn compress(&self, src: &[T], dst: &mut [u8]) -> Result<usize>;

    /// Decodes `src` into `dst`, filling it exactly.
    ///
    /// Fails with [`VoxelError::Corruption`] if the encoded run lengths do
    /// not sum to `dst.len()`, or any run length is zero.
    fn decompress(&self, src: &[u8], dst: &mut [T]) -> Result<usize>;
}

/// The default block codec: a sequence of `(run_len: u8, value: T)` pairs,
/// `run_len` in `[1, 255]`, with `sum(run_len) == src.len()`.
///
/// This is the format spec.md §4.2/§6 calls the "RLE block format"; see
/// [`crate::block::Block::compress`] for the run-building logic itself —
/// this type only implements the generic `Compressor<T>` entry points over
/// an already-built `(run_lengths, values)` pair, for callers that want the
/// codec without a full `Block`.
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "use-serde", derive(Serialize, Deserialize))]
pub struct RunLengthCompressor;

impl<T> Compressor<T> for RunLengthCompressor
where
    T: Copy + PartialEq,
{
    fn max_compressed_size(&self, input_len: usize) -> usize {
        // Worst case: every element starts a new run of length 1.
        input_len * (std::mem::size_of::<u8>() + std::mem::size_of::<T>())
    }

    fn compress(&self, src: &[T], dst: &mut [u8]) -> Result<usize> {
        let needed = <RunLengthCompressor as Compressor<T>>::max_compressed_size(self, src.len());
        if dst.len() < needed {
            return Err(VoxelError::InvalidArgument(format!(
                "destination buffer of {} bytes is smaller than the worst case {needed} bytes",
                dst.len()
            )));
        }
        if src.is_empty() {
            return Ok(0);
        }

        let value_size = std::mem::size_of::<T>();
        let mut written = 0usize;
        let mut current = src[0];
        let mut run_len: u8 = 1;

        let mut emit = |run_len: u8, value: T, dst: &mut [u8], written: &mut usize| {
            dst[*written] = run_len;
            *written += 1;
            // SAFETY-free byte copy: T is Copy, and we write exactly size_of::<T> bytes.
            let value_bytes = unsafe {
                std::slice::from_raw_parts(&value as *const T as *const u8, value_size)
            };
            dst[*written..*written + value_size].copy_from_slice(value_bytes);
            *written += value_size;
        };

        for &value in &src[1..] {
            if value == current && run_len < 255 {
                run_len += 1;
            } else {
                emit(run_len, current, dst, &mut written);
                current = value;
                run_len = 1;
            }
        }
        emit(run_len, current, dst, &mut written);
        Ok(written)
    }

    fn decompress(&self, src: &[u8], dst: &mut [T]) -> Result<usize> {
        let value_size = std::mem::size_of::<T>();
        let mut read = 0usize;
        let mut written = 0usize;

        while read < src.len() {
            let run_len = src[read];
            if run_len == 0 {
                return Err(VoxelError::Corruption("run length of zero".to_string()));
            }
            read += 1;
            if read + value_size > src.len() {
                return Err(VoxelError::Corruption(
                    "truncated run value".to_string(),
                ));
            }
            let value: T = unsafe { std::ptr::read_unaligned(src[read..].as_ptr() as *const T) };
            read += value_size;

            let run_len = run_len as usize;
            if written + run_len > dst.len() {
                return Err(VoxelError::Corruption(format!(
                    "decoded run lengths exceed the destination of {} elements",
                    dst.len()
                )));
            }
            dst[written..written + run_len].fill(value);
            written += run_len;
        }

        if written != dst.len() {
            return Err(VoxelError::Corruption(format!(
                "decoded {written} elements, expected {}",
                dst.len()
            )));
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_uniform() {
        let src = vec![7u8; 64];
        let codec = RunLengthCompressor;
        let mut buf = vec![0u8; <RunLengthCompressor as Compressor<u8>>::max_compressed_size(&codec, src.len())];
        let n = codec.compress(&src, &mut buf).unwrap();
        buf.truncate(n);

        let mut out = vec![0u8; 64];
        codec.decompress(&buf, &mut out).unwrap();
        assert_eq!(src, out);
        // A single run compresses far below the worst case.
        assert!(n < src.len());
    }

    #[test]
    fn roundtrip_run_boundary_at_255() {
        let mut src = vec![1u8; 300];
        src.extend(std::iter::repeat(0u8).take(10));
        let codec = RunLengthCompressor;
        let mut buf = vec![0u8; <RunLengthCompressor as Compressor<u8>>::max_compressed_size(&codec, src.len())];
        let n = codec.compress(&src, &mut buf).unwrap();
        buf.truncate(n);

        // 300 ones needs two runs (255 + 45), plus one run of zeros.
        assert_eq!(n, 3 * (1 + std::mem::size_of::<u8>()));

        let mut out = vec![0u8; src.len()];
        codec.decompress(&buf, &mut out).unwrap();
        assert_eq!(src, out);
    }

    #[test]
    fn decompress_rejects_size_mismatch() {
        let codec = RunLengthCompressor;
        let encoded = [5u8, 9u8]; // run of 5, value 9 -> 5 elements
        let mut out = vec![0u8; 4];
        assert!(matches!(
            codec.decompress(&encoded, &mut out),
            Err(VoxelError::Corruption(_))
        ));
    }

    #[test]
    fn decompress_rejects_zero_run() {
        let codec = RunLengthCompressor;
        let encoded = [0u8, 9u8];
        let mut out = vec![0u8; 4];
        assert!(matches!(
            codec.decompress(&encoded, &mut out),
            Err(VoxelError::Corruption(_))
        ));
    }
}
