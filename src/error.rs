use thiserror::Error;

/// Why an arena could not be set up.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
  #[error("backing storage of {len} bytes could not be acquired")]
  BackingUnavailable { len: usize },

  #[error("{len} bytes cannot hold an arena (need at least {required} after alignment)")]
  TooSmall { len: usize, required: usize },
}

pub type Result<T> = core::result::Result<T, ArenaError>;
