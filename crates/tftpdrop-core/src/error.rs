use std::io;
use std::path::PathBuf;

use tftpdrop_engine::ServerError;

/// Fatal errors while starting or running the receiver.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("cannot create output folder {path:?}: {source}")]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Server(#[from] ServerError),
}
