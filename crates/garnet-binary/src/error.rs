use thiserror::Error;

#[derive(Error, Debug)]
pub enum BinaryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("buffer ended unexpectedly: needed {needed} more bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("value out of range for field `{0}`")]
    OutOfRange(&'static str),
}

pub type Result<T> = std::result::Result<T, BinaryError>;
