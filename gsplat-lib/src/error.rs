use std::{fmt, io};

#[derive(Debug)]
pub enum SplatError {
    ParsePly(String),
    UnknownContentLength,
    SorterDisconnected,
    ReadyTimeout,
    IoError(io::Error),
}

impl fmt::Display for SplatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplatError::ParsePly(e) => {
                write!(f, "Failed to parse splats from the PLY buffer: {}", e)
            }
            SplatError::UnknownContentLength => {
                write!(
                    f,
                    "The transport does not expose a content length; texture buffers cannot be sized."
                )
            }
            SplatError::SorterDisconnected => {
                write!(f, "The sort worker channel is closed.")
            }
            SplatError::ReadyTimeout => {
                write!(f, "Timed out waiting for the splat textures to become ready.")
            }
            SplatError::IoError(e) => {
                write!(f, "An I/O error occurred: {}", e)
            }
        }
    }
}

impl std::error::Error for SplatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SplatError::IoError(e) => Some(e),
            _ => None,
        }
    }
}
