//! Out-of-band file uploads.
//!
//! Each connection on the file listener carries exactly one upload: a header
//! line `<name> <byte-length>\n` followed by exactly that many raw bytes.
//! Uploads land under a fixed storage root and never touch the chat side.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    fs::{self, File},
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tracing::{debug, info, warn};

const MAX_HEADER_LEN: u64 = 4096;

static NEXT_UPLOAD: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub storage_root: PathBuf,
    /// Size of the intermediate copy buffer.
    pub chunk_size: usize,
    /// Longest wait for the next read before the sender counts as stalled.
    pub idle_timeout: Duration,
    /// How long to watch for bytes past the declared length.
    pub trailer_grace: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("files"),
            chunk_size: 64 * 1024,
            idle_timeout: Duration::from_secs(30),
            trailer_grace: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("malformed header: {0}")]
    BadHeader(String),
    #[error("rejected file name {name:?}: {reason}")]
    Rejected { name: String, reason: &'static str },
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },
    #[error("peer sent data past the declared {expected} bytes")]
    TrailingBytes { expected: u64 },
    #[error("no data from peer for {0:?}")]
    Stalled(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Bookkeeping for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub name: String,
    pub declared_len: u64,
    pub written: u64,
}

impl TransferDescriptor {
    pub fn remaining(&self) -> u64 {
        self.declared_len - self.written
    }

    pub fn is_complete(&self) -> bool {
        self.written == self.declared_len
    }
}

/// Checks a client-declared file name.
///
/// Only a single plain path component is accepted. Separators, parent or
/// current directory references, absolute paths and hidden names are refused
/// rather than rewritten, so the stored name is always exactly what the
/// client declared.
pub fn sanitize_name(raw: &str) -> Result<&str, TransferError> {
    let reject = |reason| TransferError::Rejected {
        name: raw.to_string(),
        reason,
    };

    if raw.is_empty() {
        return Err(reject("empty name"));
    }
    if raw.contains(['/', '\\']) {
        return Err(reject("path separators are not allowed"));
    }
    if raw.contains('\0') {
        return Err(reject("NUL bytes are not allowed"));
    }
    if raw.starts_with('.') {
        return Err(reject("hidden and relative names are not allowed"));
    }

    let mut components = Path::new(raw).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(raw),
        _ => Err(reject("not a plain file name")),
    }
}

/// Parses `<name> <byte-length>`; the name is everything before the last space.
pub fn parse_header(line: &str) -> Result<(&str, u64), TransferError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let (name, len) = line.rsplit_once(' ').ok_or_else(|| {
        TransferError::BadHeader(format!("expected `<name> <length>`, got {line:?}"))
    })?;
    let len = len
        .parse::<u64>()
        .map_err(|err| TransferError::BadHeader(format!("invalid length {len:?}: {err}")))?;
    Ok((name.trim(), len))
}

/// Receives one upload from `reader` into the storage root.
///
/// The body is streamed into a hidden temporary file and renamed onto its
/// final name only after exactly the declared number of bytes arrived, so
/// concurrent uploads of the same name never interleave: the last one to
/// finish wins. Failed uploads leave nothing behind.
pub async fn receive<R>(
    reader: &mut R,
    config: &TransferConfig,
) -> Result<TransferDescriptor, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let header = read_header(reader, config.idle_timeout).await?;
    let (name, declared_len) = parse_header(&header)?;
    let name = sanitize_name(name)?;

    fs::create_dir_all(&config.storage_root).await?;
    let target = config.storage_root.join(name);
    // Independent of the client's name, which may already be close to the
    // file system's limit.
    let staging = config.storage_root.join(format!(
        ".upload-{}-{}.partial",
        std::process::id(),
        NEXT_UPLOAD.fetch_add(1, Ordering::Relaxed)
    ));

    let mut descriptor = TransferDescriptor {
        name: name.to_string(),
        declared_len,
        written: 0,
    };

    let outcome = async {
        let mut file = File::create(&staging).await?;
        copy_body(reader, &mut file, &mut descriptor, config).await?;
        file.sync_all().await?;
        drop(file);
        ensure_no_trailer(reader, declared_len, config.trailer_grace).await?;
        fs::rename(&staging, &target).await?;
        Ok::<_, TransferError>(())
    }
    .await;

    if let Err(err) = outcome {
        if let Err(cleanup) = fs::remove_file(&staging).await {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(
                    path = %staging.display(),
                    error = %cleanup,
                    "failed to remove partial upload"
                );
            }
        }
        return Err(err);
    }

    Ok(descriptor)
}

async fn read_header<R>(reader: &mut R, idle: Duration) -> Result<String, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take(MAX_HEADER_LEN);
    timeout(idle, limited.read_until(b'\n', &mut line))
        .await
        .map_err(|_| TransferError::Stalled(idle))??;

    if line.last() != Some(&b'\n') {
        return Err(TransferError::BadHeader(
            "header line missing, unterminated or too long".into(),
        ));
    }
    String::from_utf8(line).map_err(|_| TransferError::BadHeader("header is not UTF-8".into()))
}

async fn copy_body<R>(
    reader: &mut R,
    file: &mut File,
    descriptor: &mut TransferDescriptor,
    config: &TransferConfig,
) -> Result<(), TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = vec![0u8; config.chunk_size.max(1)];

    while !descriptor.is_complete() {
        let want = usize::try_from(descriptor.remaining())
            .unwrap_or(usize::MAX)
            .min(buffer.len());
        let read = timeout(config.idle_timeout, reader.read(&mut buffer[..want]))
            .await
            .map_err(|_| TransferError::Stalled(config.idle_timeout))??;
        if read == 0 {
            return Err(TransferError::Truncated {
                expected: descriptor.declared_len,
                received: descriptor.written,
            });
        }
        file.write_all(&buffer[..read]).await?;
        descriptor.written += read as u64;
    }

    file.flush().await?;
    Ok(())
}

/// A sender that keeps talking after the declared length is an error. One
/// that goes quiet without closing is given the benefit of the doubt.
async fn ensure_no_trailer<R>(
    reader: &mut R,
    expected: u64,
    grace: Duration,
) -> Result<(), TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut probe = [0u8; 1];
    match timeout(grace, reader.read(&mut probe)).await {
        Ok(Ok(0)) | Err(_) => Ok(()),
        Ok(Ok(_)) => Err(TransferError::TrailingBytes { expected }),
        Ok(Err(err)) => {
            debug!(error = %err, "connection error after complete upload");
            Ok(())
        }
    }
}

/// Accept loop for the file channel.
pub struct FileReceiver {
    listener: TcpListener,
    config: Arc<TransferConfig>,
}

impl FileReceiver {
    pub async fn bind(addr: SocketAddr, config: TransferConfig) -> Result<Self> {
        fs::create_dir_all(&config.storage_root)
            .await
            .with_context(|| format!("failed to create {}", config.storage_root.display()))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind file listener on {addr}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: TransferConfig) -> Self {
        Self {
            listener,
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let FileReceiver { listener, config } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    debug!("file listener shutting down");
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => spawn_upload(stream, peer, &config),
                    Err(err) => warn!(error = ?err, "failed to accept file connection"),
                },
            }
        }

        Ok(())
    }
}

fn spawn_upload(stream: TcpStream, peer: SocketAddr, config: &Arc<TransferConfig>) {
    let config = Arc::clone(config);
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        match receive(&mut reader, &config).await {
            Ok(upload) => info!(
                peer = %peer,
                name = %upload.name,
                bytes = upload.written,
                "file received"
            ),
            Err(err) => warn!(peer = %peer, error = %err, "file transfer failed"),
        }
    });
}
