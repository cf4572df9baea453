//! Error types shared by every module of the crate.

use thiserror::Error;

/// Errors surfaced by the public API.
///
/// Hot-path positional checks inside [`crate::block::Block`] and
/// [`crate::iter::VolumeIterator`] are `debug_assert!`s rather than
/// `VoxelError` variants — see each function's doc comment. [`crate::volume::Volume`]
/// validates positions and arguments at the boundary and returns these
/// variants instead of asserting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoxelError {
    /// A side length, region, or residency budget was not a valid shape for
    /// the operation (non-power-of-two side length, `lo > hi`, `bs > vs`, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A position was outside `[0, vs)` on one or more axes.
    #[error("position ({x}, {y}, {z}) is out of bounds for a volume of side length {side_length}")]
    OutOfBounds {
        x: u32,
        y: u32,
        z: u32,
        side_length: u32,
    },

    /// An allocation failed while materialising an uncompressed buffer.
    #[error("out of memory while allocating {requested_bytes} bytes")]
    OutOfMemory { requested_bytes: usize },

    /// A run-length-encoded block failed to decode to its expected size.
    #[error("corrupted block data: {0}")]
    Corruption(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VoxelError>;

/// Checks that `n` is a power of two, returning [`VoxelError::InvalidArgument`] otherwise.
pub fn check_power_of_two(n: u32, what: &str) -> Result<()> {
    if n == 0 || (n & (n - 1)) != 0 {
        Err(VoxelError::InvalidArgument(format!(
            "{what} must be a power of two, got {n}"
        )))
    } else {
        Ok(())
    }
}
