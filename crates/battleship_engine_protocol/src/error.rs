use std::io;

/// Errors that can occur while framing or parsing a single envelope off the
/// wire. A [`FrameError`] always maps to a protocol-error close code; it
/// never leaves an unknown variant unreadable, only a truncated or corrupt
/// frame.
#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("I/O error while framing message: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame payload of {0} bytes exceeds the maximum of {1} bytes")]
    PayloadTooLarge(usize, usize),
}
