//! Streaming blob reads over one `git cat-file --batch` connection.
//!
//! Protocol: the request is `<oid>\n` on stdin; the reply is a header
//! `<oid> blob <size>\n` (or `<oid> missing\n`), then exactly `size` bytes,
//! then a single `\n`. Content is consumed in fixed-size chunks so memory use
//! stays bounded regardless of blob size.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use super::{BlobReader, GitError, ObjectId};

/// Chunk size for streaming blob contents (64 KiB).
pub(crate) const BLOB_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum header line length accepted from `cat-file`.
const MAX_HEADER_LEN: usize = 512;

const COMMAND: &str = "cat-file --batch";

/// A live `git cat-file --batch` process.
pub(crate) struct CatFileBatch {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    chunk: Vec<u8>,
}

impl CatFileBatch {
    /// Spawns the batch process. `command` must already carry the
    /// `cat-file --batch` arguments.
    pub(crate) fn spawn(mut command: Command) -> Result<Self, GitError> {
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| GitError::Spawn { program, source })?;

        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GitError::MalformedOutput {
                command: COMMAND.to_string(),
                detail: "stdout pipe unavailable".to_string(),
            });
        };

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            chunk: vec![0u8; BLOB_CHUNK_SIZE],
        })
    }

    fn request(&mut self, blob: &ObjectId) -> Result<(), GitError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| GitError::MalformedOutput {
            command: COMMAND.to_string(),
            detail: "stdin already closed".to_string(),
        })?;
        writeln!(stdin, "{blob}")
            .and_then(|()| stdin.flush())
            .map_err(|e| GitError::io(format!("requesting blob {blob}"), e))
    }

    fn read_header(&mut self, blob: &ObjectId) -> Result<u64, GitError> {
        let mut header = Vec::with_capacity(128);
        let read = (&mut self.stdout)
            .take(MAX_HEADER_LEN as u64)
            .read_until(b'\n', &mut header)
            .map_err(|e| GitError::io(format!("reading header for blob {blob}"), e))?;
        if read == 0 || header.last() != Some(&b'\n') {
            return Err(GitError::TruncatedBlob {
                blob: blob.clone(),
                expected: 0,
                actual: 0,
            });
        }
        let header = String::from_utf8_lossy(&header[..header.len() - 1]).into_owned();
        parse_header(&header, blob)
    }
}

/// Parses a batch reply header, returning the announced blob size.
fn parse_header(header: &str, blob: &ObjectId) -> Result<u64, GitError> {
    let malformed = |detail: String| GitError::MalformedOutput {
        command: COMMAND.to_string(),
        detail,
    };
    let fields: Vec<&str> = header.split(' ').collect();
    match fields.as_slice() {
        [id, "missing"] if *id == blob.as_str() => Err(GitError::MissingBlob { blob: blob.clone() }),
        [id, "blob", size] if *id == blob.as_str() => size
            .parse::<u64>()
            .map_err(|_| malformed(format!("invalid size in header `{header}`"))),
        [id, kind, _] if *id == blob.as_str() => {
            Err(malformed(format!("object {blob} is a {kind}, not a blob")))
        },
        _ => Err(malformed(format!("unexpected header `{header}` for {blob}"))),
    }
}

impl BlobReader for CatFileBatch {
    fn stream_blob(
        &mut self,
        blob: &ObjectId,
        sink: &mut dyn FnMut(&[u8]),
    ) -> Result<u64, GitError> {
        self.request(blob)?;
        let size = self.read_header(blob)?;

        let mut remaining = size;
        while remaining > 0 {
            let len = usize::try_from(remaining).map_or(BLOB_CHUNK_SIZE, |r| r.min(BLOB_CHUNK_SIZE));
            let piece = &mut self.chunk[..len];
            match self.stdout.read_exact(piece) {
                Ok(()) => {},
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(GitError::TruncatedBlob {
                        blob: blob.clone(),
                        expected: size,
                        actual: size - remaining,
                    });
                },
                Err(e) => return Err(GitError::io(format!("reading blob {blob}"), e)),
            }
            sink(piece);
            remaining -= len as u64;
        }

        let mut terminator = [0u8; 1];
        match self.stdout.read_exact(&mut terminator) {
            Ok(()) if terminator[0] == b'\n' => Ok(size),
            Ok(()) => Err(GitError::MalformedOutput {
                command: COMMAND.to_string(),
                detail: format!("missing terminator after blob {blob}"),
            }),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(GitError::TruncatedBlob {
                blob: blob.clone(),
                expected: size,
                actual: size,
            }),
            Err(e) => Err(GitError::io(format!("reading blob {blob}"), e)),
        }
    }
}

impl Drop for CatFileBatch {
    fn drop(&mut self) {
        // Closing stdin ends the batch session.
        drop(self.stdin.take());
        match self.child.wait() {
            Ok(status) if !status.success() => {
                tracing::warn!(%status, "git cat-file --batch exited unsuccessfully");
            },
            Ok(_) => {},
            Err(e) => tracing::warn!(error = %e, "failed to reap git cat-file --batch"),
        }
    }
}
