use thiserror::Error;

#[derive(Error, Debug)]
pub enum BinaryError {
    /// The buffer ran out before the requested field was complete. Counts
    /// are in bits because reads are not necessarily byte aligned.
    #[error("buffer ended after {remaining} bits remaining, {needed} more bits required")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("varint too large for target type")]
    VarintTooLarge,
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, BinaryError>;
