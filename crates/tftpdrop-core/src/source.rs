//! Where an upload's bytes come from.

use std::io;

use tokio::fs;
use tokio::io::AsyncRead;

/// Readable byte stream handed to the client session.
pub type ByteSource = Box<dyn AsyncRead + Unpin + Send>;

/// Opens `path` for reading, or standard input when `path` is empty or
/// absent. Standard input is not closed when the source is dropped.
pub async fn resolve(path: Option<&str>) -> io::Result<ByteSource> {
    match path {
        None | Some("") => Ok(Box::new(tokio::io::stdin())),
        Some(path) => {
            let file = fs::File::open(path).await?;
            Ok(Box::new(file))
        }
    }
}
