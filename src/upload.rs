// Size- and type-bounded intake of uploaded image streams.
//
// Payloads are staged in memory one chunk at a time and written out in
// fixed-size pieces, so memory use depends on `CHUNK_SIZE` and never on
// the payload. The first `SNIFF_LEN` bytes are checked against
// `ALLOWED_MEDIA_TYPES` before anything touches the disk.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use mime::Mime;
use std::fmt;
use std::io;
use std::path::Path;
use std::pin::pin;
use tokio::io::AsyncWriteExt;

pub const CHUNK_SIZE: usize = 64 * 1024;
pub const SNIFF_LEN: usize = 2048;
pub const ALLOWED_MEDIA_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("file too large (max {limit} bytes)")]
    PayloadTooLarge { limit: u64 },
    #[error("unsupported media type: {}", .detected.as_deref().unwrap_or("unknown"))]
    UnsupportedMediaType { detected: Option<String> },
    #[error("empty upload")]
    EmptyPayload,
    #[error("failed to read upload: {0}")]
    Stream(String),
    #[error("failed to store upload: {0}")]
    Io(#[from] io::Error),
}

/// Detects the media type of a payload from its leading bytes.
pub trait ContentSniffer: Send + Sync {
    fn sniff(&self, head: &[u8]) -> Option<Mime>;
}

/// Magic-number detection backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicSniffer;

impl ContentSniffer for MagicSniffer {
    fn sniff(&self, head: &[u8]) -> Option<Mime> {
        image::guess_format(head)
            .ok()
            .and_then(|format| format.to_mime_type().parse().ok())
    }
}

fn check_media_type(sniffer: &dyn ContentSniffer, head: &[u8]) -> Result<Mime, UploadError> {
    let detected = sniffer.sniff(&head[..head.len().min(SNIFF_LEN)]);
    match detected {
        Some(mime) if ALLOWED_MEDIA_TYPES.contains(&mime.essence_str()) => Ok(mime),
        other => Err(UploadError::UnsupportedMediaType {
            detected: other.map(|m| m.essence_str().to_string()),
        }),
    }
}

/// Streams `source` into `dest`, enforcing `limit` and the media allow-list.
///
/// On any failure the partial file is removed. When the payload is rejected
/// for its size or type, the rest of the source is read and discarded before
/// returning, so the connection is left in a clean state.
pub async fn receive_to_file<S, E>(
    source: S,
    dest: &Path,
    limit: u64,
    sniffer: &dyn ContentSniffer,
) -> Result<(u64, Mime), UploadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut source = pin!(source);
    let result = write_stream(&mut source, dest, limit, sniffer).await;

    if let Err(err) = &result {
        match tokio::fs::remove_file(dest).await {
            Ok(()) => tracing::debug!("Removed partial upload {}", dest.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove partial upload {}: {}", dest.display(), e),
        }
        if !matches!(err, UploadError::Stream(_)) {
            drain(&mut source).await;
        }
    }
    result
}

async fn write_stream<S, E>(
    source: &mut S,
    dest: &Path,
    limit: u64,
    sniffer: &dyn ContentSniffer,
) -> Result<(u64, Mime), UploadError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    let mut staged = BytesMut::with_capacity(CHUNK_SIZE);
    let mut sink: Option<(tokio::fs::File, Mime)> = None;
    let mut received: u64 = 0;

    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|e| UploadError::Stream(e.to_string()))?;
        received += chunk.len() as u64;
        if received > limit {
            return Err(UploadError::PayloadTooLarge { limit });
        }
        staged.extend_from_slice(&chunk);

        if sink.is_none() {
            if staged.len() < SNIFF_LEN {
                continue;
            }
            let mime = check_media_type(sniffer, &staged)?;
            sink = Some((tokio::fs::File::create(dest).await?, mime));
        }

        if let Some((file, _)) = sink.as_mut() {
            while staged.len() >= CHUNK_SIZE {
                let piece = staged.split_to(CHUNK_SIZE);
                file.write_all(&piece).await?;
            }
        }
    }

    if received == 0 {
        return Err(UploadError::EmptyPayload);
    }

    let (mut file, mime) = match sink {
        Some(sink) => sink,
        None => {
            let mime = check_media_type(sniffer, &staged)?;
            (tokio::fs::File::create(dest).await?, mime)
        }
    };
    file.write_all(&staged).await?;
    file.flush().await?;

    Ok((received, mime))
}

/// In-memory variant of [`receive_to_file`] for single-image requests.
pub async fn read_limited<S, E>(
    source: S,
    limit: u64,
    sniffer: &dyn ContentSniffer,
) -> Result<(Bytes, Mime), UploadError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut source = pin!(source);
    let mut buffer = BytesMut::new();
    let mut sniffed: Option<Mime> = None;

    let outcome = loop {
        let Some(chunk) = source.next().await else {
            break Ok(());
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Err(UploadError::Stream(e.to_string())),
        };
        if (buffer.len() + chunk.len()) as u64 > limit {
            break Err(UploadError::PayloadTooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
        if sniffed.is_none() && buffer.len() >= SNIFF_LEN {
            match check_media_type(sniffer, &buffer) {
                Ok(mime) => sniffed = Some(mime),
                Err(err) => break Err(err),
            }
        }
    };

    if let Err(err) = outcome {
        drain(&mut source).await;
        return Err(err);
    }
    if buffer.is_empty() {
        return Err(UploadError::EmptyPayload);
    }
    let mime = match sniffed {
        Some(mime) => mime,
        None => check_media_type(sniffer, &buffer)?,
    };
    Ok((buffer.freeze(), mime))
}

async fn drain<S, E>(source: &mut S)
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut discarded: u64 = 0;
    while let Some(chunk) = source.next().await {
        match chunk {
            Ok(chunk) => discarded += chunk.len() as u64,
            Err(_) => break,
        }
    }
    tracing::debug!(discarded, "Drained rejected upload");
}
