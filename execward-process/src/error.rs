use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("spawned process has no pid")]
    MissingPid,

    #[error("failed to prepare confinement: {0}")]
    Confinement(String),

    #[error("{feature} is not supported on {platform}")]
    Unsupported {
        feature: &'static str,
        platform: &'static str,
    },

    #[error("I/O error while supervising process: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Resource exhaustion from fork/exec (EAGAIN, ENOMEM) as opposed to a bad program.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            #[cfg(unix)]
            Self::Spawn { source, .. } => matches!(
                source.raw_os_error(),
                Some(libc::EAGAIN) | Some(libc::ENOMEM)
            ),
            _ => false,
        }
    }
}
