use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use tftpdrop_engine::{ErrorCode, WriteHandler, WriteRequest};

use crate::paths::{destination_path, staging_path};

/// Persists inbound writes under an output folder.
///
/// Direct mode writes straight to the destination. Atomic mode writes a
/// hidden staging file, syncs it and renames it over the destination, so the
/// destination only ever holds a complete file.
///
/// The pipeline is stateless across writes; concurrent uploads of the same
/// name are not serialized (last rename wins).
#[derive(Debug, Clone)]
pub struct WriteCompletion {
    output_root: PathBuf,
    atomic: bool,
}

/// Step at which a write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Create,
    Copy,
    Rename,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Copy => write!(f, "copy"),
            Self::Rename => write!(f, "rename"),
        }
    }
}

/// How one inbound write ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Done { path: PathBuf, bytes: u64 },
    Failed { stage: Stage, path: PathBuf },
}

impl WriteCompletion {
    pub fn new(output_root: impl Into<PathBuf>, atomic: bool) -> Self {
        Self {
            output_root: output_root.into(),
            atomic,
        }
    }

    /// Persists one upload. Failures are reported to the peer as
    /// `AccessViolation` through the request before this returns.
    pub async fn complete(&self, request: &mut dyn WriteRequest) -> WriteOutcome {
        let destination = destination_path(&self.output_root, request.name());

        if !self.atomic {
            return match write_file(&destination, request, false).await {
                Ok(bytes) => {
                    info!(
                        "Saved {} bytes to {} (direct) from {}",
                        bytes,
                        destination.display(),
                        request.peer()
                    );
                    WriteOutcome::Done {
                        path: destination,
                        bytes,
                    }
                }
                Err(outcome) => outcome,
            };
        }

        let staging = staging_path(&self.output_root, request.name());
        let bytes = match write_file(&staging, request, true).await {
            Ok(bytes) => bytes,
            Err(outcome) => return outcome,
        };

        if let Err(e) = fs::rename(&staging, &destination).await {
            // Staging file is left in place
            warn!(
                "Rename of {} to {} failed: {}",
                staging.display(),
                destination.display(),
                e
            );
            request.write_error(
                ErrorCode::AccessViolation,
                &format!("cannot rename file to {:?}", destination),
            );
            return WriteOutcome::Failed {
                stage: Stage::Rename,
                path: destination,
            };
        }

        info!(
            "Saved {} bytes to {} (atomic) from {}",
            bytes,
            destination.display(),
            request.peer()
        );
        WriteOutcome::Done {
            path: destination,
            bytes,
        }
    }
}

impl WriteHandler for WriteCompletion {
    fn serve_write<'a>(&'a self, request: &'a mut dyn WriteRequest) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let peer = request.peer();
            if let WriteOutcome::Failed { stage, path } = self.complete(request).await {
                warn!(
                    "Upload from {} failed at {} stage ({})",
                    peer,
                    stage,
                    path.display()
                );
            }
        })
    }
}

/// Creates `path` and streams the request into it. On a copy failure the
/// partial file is removed.
async fn write_file(
    path: &Path,
    request: &mut dyn WriteRequest,
    sync: bool,
) -> Result<u64, WriteOutcome> {
    let mut file = match fs::File::create(path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot create {}: {}", path.display(), e);
            request.write_error(
                ErrorCode::AccessViolation,
                &format!("cannot create file {:?}", path),
            );
            return Err(WriteOutcome::Failed {
                stage: Stage::Create,
                path: path.to_path_buf(),
            });
        }
    };

    match copy_into(request, &mut file, sync).await {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            drop(file);
            warn!("Write to {} failed: {}", path.display(), e);
            remove_partial(path).await;
            request.write_error(
                ErrorCode::AccessViolation,
                &format!("cannot write to file {:?}", path),
            );
            Err(WriteOutcome::Failed {
                stage: Stage::Copy,
                path: path.to_path_buf(),
            })
        }
    }
}

async fn copy_into(
    request: &mut dyn WriteRequest,
    file: &mut fs::File,
    sync: bool,
) -> io::Result<u64> {
    let bytes = tokio::io::copy(&mut *request, file).await?;
    file.flush().await?;
    if sync {
        file.sync_all().await?;
    }
    Ok(bytes)
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove partial file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::task::{Context, Poll, ready};
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::io::{AsyncRead, ReadBuf};
    use tokio::sync::mpsc;

    /// Request double fed chunk by chunk through a channel.
    struct TestRequest {
        name: String,
        chunks: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
        pending: Vec<u8>,
        errors: Vec<(ErrorCode, String)>,
    }

    impl TestRequest {
        fn new(name: &str) -> (Self, mpsc::UnboundedSender<io::Result<Vec<u8>>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let request = Self {
                name: name.to_string(),
                chunks: rx,
                pending: Vec::new(),
                errors: Vec::new(),
            };
            (request, tx)
        }

        /// A request whose stream yields `chunks` and then ends.
        fn scripted(name: &str, chunks: &[&str]) -> Self {
            let (request, tx) = Self::new(name);
            for chunk in chunks {
                tx.send(Ok(chunk.as_bytes().to_vec())).unwrap();
            }
            request
        }

        /// A request whose stream yields `chunks` and then fails.
        fn failing(name: &str, chunks: &[&str]) -> Self {
            let (request, tx) = Self::new(name);
            for chunk in chunks {
                tx.send(Ok(chunk.as_bytes().to_vec())).unwrap();
            }
            tx.send(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away")))
                .unwrap();
            request
        }
    }

    impl WriteRequest for TestRequest {
        fn name(&self) -> &str {
            &self.name
        }

        fn peer(&self) -> SocketAddr {
            "127.0.0.1:50000".parse().unwrap()
        }

        fn write_error(&mut self, code: ErrorCode, message: &str) {
            self.errors.push((code, message.to_string()));
        }
    }

    impl AsyncRead for TestRequest {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            loop {
                if !this.pending.is_empty() {
                    let n = this.pending.len().min(buf.remaining());
                    buf.put_slice(&this.pending[..n]);
                    this.pending.drain(..n);
                    return Poll::Ready(Ok(()));
                }
                match ready!(this.chunks.poll_recv(cx)) {
                    Some(Ok(chunk)) => this.pending = chunk,
                    Some(Err(e)) => return Poll::Ready(Err(e)),
                    None => return Poll::Ready(Ok(())),
                }
            }
        }
    }

    #[tokio::test]
    async fn direct_write_saves_content() {
        let dir = TempDir::new().unwrap();
        let pipeline = WriteCompletion::new(dir.path(), false);
        let mut request = TestRequest::scripted("greeting.txt", &["ab", "c\n"]);

        let outcome = pipeline.complete(&mut request).await;

        let path = dir.path().join("greeting.txt");
        assert_eq!(outcome, WriteOutcome::Done { path: path.clone(), bytes: 4 });
        assert_eq!(std::fs::read(&path).unwrap(), b"abc\n");
        assert!(request.errors.is_empty());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_staging_file() {
        let dir = TempDir::new().unwrap();
        let pipeline = WriteCompletion::new(dir.path(), true);
        let mut request = TestRequest::scripted("greeting.txt", &["abc\n"]);

        let outcome = pipeline.complete(&mut request).await;

        assert!(matches!(outcome, WriteOutcome::Done { bytes: 4, .. }));
        assert_eq!(
            std::fs::read(dir.path().join("greeting.txt")).unwrap(),
            b"abc\n"
        );
        assert!(!dir.path().join(".greeting.txt").exists());
        assert!(request.errors.is_empty());
    }

    #[tokio::test]
    async fn direct_failure_mid_copy_removes_destination() {
        let dir = TempDir::new().unwrap();
        let pipeline = WriteCompletion::new(dir.path(), false);
        let mut request = TestRequest::failing("broken.bin", &["partial"]);

        let outcome = pipeline.complete(&mut request).await;

        let path = dir.path().join("broken.bin");
        assert_eq!(
            outcome,
            WriteOutcome::Failed { stage: Stage::Copy, path: path.clone() }
        );
        assert!(!path.exists());
        assert_eq!(
            request.errors,
            vec![(
                ErrorCode::AccessViolation,
                format!("cannot write to file {:?}", path)
            )]
        );
    }

    #[tokio::test]
    async fn atomic_failure_mid_copy_keeps_old_destination() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("data.bin");
        std::fs::write(&destination, b"old").unwrap();

        let pipeline = WriteCompletion::new(dir.path(), true);
        let mut request = TestRequest::failing("data.bin", &["new-part"]);

        let outcome = pipeline.complete(&mut request).await;

        let staging = dir.path().join(".data.bin");
        assert_eq!(
            outcome,
            WriteOutcome::Failed { stage: Stage::Copy, path: staging.clone() }
        );
        assert_eq!(std::fs::read(&destination).unwrap(), b"old");
        assert!(!staging.exists());
        // Message names the staging file
        assert_eq!(
            request.errors,
            vec![(
                ErrorCode::AccessViolation,
                format!("cannot write to file {:?}", staging)
            )]
        );
    }

    #[tokio::test]
    async fn create_failure_reports_access_violation() {
        let dir = TempDir::new().unwrap();
        let pipeline = WriteCompletion::new(dir.path(), false);
        // Parent directory does not exist
        let mut request = TestRequest::scripted("missing/x.txt", &["abc"]);

        let outcome = pipeline.complete(&mut request).await;

        let path = dir.path().join("missing/x.txt");
        assert_eq!(
            outcome,
            WriteOutcome::Failed { stage: Stage::Create, path: path.clone() }
        );
        assert!(!path.exists());
        assert_eq!(
            request.errors,
            vec![(
                ErrorCode::AccessViolation,
                format!("cannot create file {:?}", path)
            )]
        );
    }

    #[tokio::test]
    async fn rename_failure_keeps_staging_file() {
        let dir = TempDir::new().unwrap();
        // A non-empty directory cannot be replaced by a file
        let destination = dir.path().join("target");
        std::fs::create_dir(&destination).unwrap();
        std::fs::write(destination.join("keep"), b"kept").unwrap();

        let pipeline = WriteCompletion::new(dir.path(), true);
        let mut request = TestRequest::scripted("target", &["fresh"]);

        let outcome = pipeline.complete(&mut request).await;

        assert_eq!(
            outcome,
            WriteOutcome::Failed { stage: Stage::Rename, path: destination.clone() }
        );
        assert_eq!(std::fs::read(dir.path().join(".target")).unwrap(), b"fresh");
        assert_eq!(std::fs::read(destination.join("keep")).unwrap(), b"kept");
        assert_eq!(
            request.errors,
            vec![(
                ErrorCode::AccessViolation,
                format!("cannot rename file to {:?}", destination)
            )]
        );
    }

    #[tokio::test]
    async fn reupload_leaves_second_content() {
        for atomic in [false, true] {
            let dir = TempDir::new().unwrap();
            let pipeline = WriteCompletion::new(dir.path(), atomic);

            let mut first = TestRequest::scripted("same.txt", &["first version"]);
            pipeline.complete(&mut first).await;
            let mut second = TestRequest::scripted("same.txt", &["second"]);
            pipeline.complete(&mut second).await;

            assert_eq!(
                std::fs::read(dir.path().join("same.txt")).unwrap(),
                b"second",
                "atomic={}",
                atomic
            );
        }
    }

    #[tokio::test]
    async fn atomic_destination_is_never_partial() {
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("live.bin");
        let staging = dir.path().join(".live.bin");
        std::fs::write(&destination, b"old").unwrap();

        let (mut request, tx) = TestRequest::new("live.bin");
        let pipeline = WriteCompletion::new(dir.path(), true);
        let task = tokio::spawn(async move {
            let outcome = pipeline.complete(&mut request).await;
            (outcome, request)
        });

        tx.send(Ok(b"half of the ".to_vec())).unwrap();
        for _ in 0..200 {
            if staging.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(staging.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"old");

        tx.send(Ok(b"new content".to_vec())).unwrap();
        drop(tx);
        let (outcome, request) = task.await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Done { bytes: 23, .. }));
        assert!(request.errors.is_empty());
        assert_eq!(
            std::fs::read(&destination).unwrap(),
            b"half of the new content"
        );
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn traversal_stays_inside_output_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("out");
        std::fs::create_dir(&root).unwrap();
        let pipeline = WriteCompletion::new(&root, false);
        let mut request = TestRequest::scripted("../../escape.txt", &["x"]);

        let outcome = pipeline.complete(&mut request).await;

        assert!(matches!(outcome, WriteOutcome::Done { .. }));
        assert!(root.join("escape.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Create.to_string(), "create");
        assert_eq!(Stage::Copy.to_string(), "copy");
        assert_eq!(Stage::Rename.to_string(), "rename");
    }

    #[tokio::test]
    async fn handler_reports_failure_to_peer() {
        let dir = TempDir::new().unwrap();
        let pipeline = WriteCompletion::new(dir.path(), false);
        let mut request = TestRequest::scripted("missing/y.txt", &["x"]);

        pipeline.serve_write(&mut request).await;

        assert_eq!(request.errors.len(), 1);
        assert_eq!(request.errors[0].0, ErrorCode::AccessViolation);
    }

    #[tokio::test]
    async fn handler_discards_outcome() {
        let dir = TempDir::new().unwrap();
        let pipeline = WriteCompletion::new(dir.path(), false);
        let mut request = TestRequest::scripted("via-handler.txt", &["ok"]);

        pipeline.serve_write(&mut request).await;

        assert_eq!(
            std::fs::read(dir.path().join("via-handler.txt")).unwrap(),
            b"ok"
        );
    }
}
