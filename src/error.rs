use std::path::PathBuf;

use crate::{KeyError, PoolError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a load failed.  These never reach callers of `get`; listeners just see a failure.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("fetching {identifier} failed")]
    Fetch {
        identifier: String,
        #[source]
        source: BoxError,
    },
    #[error("transforming {} failed", .raw.display())]
    Transform {
        raw: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("decoding {} failed", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
    #[error("{} is missing after fetch", .path.display())]
    MissingArtifact { path: PathBuf },
    #[error("buffer pool misuse")]
    Pool(#[from] PoolError),
    #[error("load panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
    #[error("the bucket has been destroyed")]
    Destroyed,
}

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
