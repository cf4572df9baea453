//! Paged, compressed, block-partitioned storage for large 3D voxel volumes.
//!
//! A [`Volume`] partitions a cubic domain into fixed-size [`Block`]s. Every
//! block starts out as a shared reference to a singleton, run-length
//! compressed encoding of `T::default()`; writing into a block breaks that
//! sharing on first touch (copy-on-write), and a block that becomes
//! homogeneous again is eligible to be re-shared the next time it is
//! evicted from the uncompressed working set. [`VolumeIterator`] walks a
//! [`Region`] of a volume in row-major order with a cached fast voxel
//! pointer and constant-time 26-neighbour peeking.
//!
//! # Features
//!
//! * **use-serde**: `serde::{Serialize, Deserialize}` on [`Point3`],
//!   [`Region`], [`Block`] and [`RunLengthCompressor`], plus a `bincode`
//!   round-trip test for `Block`.
//! * **use-rayon**: enables [`Volume::par_for_each_private_block_mut`].
pub use block::Block;
pub use compressor::{Compressor, RunLengthCompressor};
pub use error::{Result, VoxelError};
pub use iter::VolumeIterator;
pub use point::{Point3, PointU16, PointU32, PointU8};
pub use region::Region;
pub use volume::{Volume, VolumeBuilder};

pub mod block;
pub mod compressor;
pub mod error;
pub mod iter;
pub mod point;
pub mod region;
pub mod volume;
