// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded streaming copy with optional zstd transcoding.
//!
//! Every byte the sidecar moves (producer → HTTP body, HTTP body → bucket,
//! bucket → extractor) goes through a fixed-size buffer: the largest chunk
//! read or written never exceeds `buf_size`, whatever the artifact size.
//!
//! # Codecs
//!
//! - `Identity`: bytes pass through.
//! - `ZstdEncode`: compress on the way out (uploads to buckets).
//! - `ZstdDecode`: decompress; a truncated frame is an error, not a short file.
//! - `Detect`: decode if the stream starts with the zstd magic, else pass through.
//!
//! The raw zstd API is used so that both directions run with a caller-owned
//! output buffer; a highly compressible input cannot balloon memory.

use sha2::{Digest, Sha256};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

/// zstd magic bytes for decompression detection
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Whether `prefix` starts a zstd frame.
pub fn is_zstd(prefix: &[u8]) -> bool {
    prefix.len() >= 4 && prefix[..4] == ZSTD_MAGIC
}

/// Transformation applied while copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Identity,
    ZstdEncode { level: i32 },
    ZstdDecode,
    Detect,
}

/// Why a copy stopped early. Read and write sides are kept apart so callers
/// can attribute the failure (source vs destination).
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("corrupt compressed stream: {0}")]
    Decode(#[source] io::Error),
    #[error("cancelled")]
    Cancelled,
}

/// What a completed copy moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Largest single read or write observed.
    pub max_chunk: usize,
    /// Hex SHA-256 of the input bytes, when requested.
    pub sha256: Option<String>,
}

/// A configured copy.
#[derive(Debug, Clone)]
pub struct Pump {
    codec: Codec,
    buf_size: usize,
    hash_input: bool,
}

enum Transcoder {
    Identity,
    Encode(Encoder<'static>),
    Decode { decoder: Decoder<'static>, hint: usize },
}

impl Pump {
    pub fn new(buf_size: usize) -> Self {
        Self {
            codec: Codec::Identity,
            buf_size: buf_size.max(1),
            hash_input: false,
        }
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Compute a SHA-256 over the input.
    pub fn hash_input(mut self) -> Self {
        self.hash_input = true;
        self
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Copy until EOF, then flush `writer`. Does not shut the writer down;
    /// committing or closing the sink is the caller's decision.
    pub async fn run<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<CopyStats, PumpError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut stats = CopyStats::default();
        let mut hasher = self.hash_input.then(Sha256::new);
        // Sniffing may carry up to three bytes into the next read.
        let mut input = vec![0u8; self.buf_size + ZSTD_MAGIC.len()];
        let mut output = vec![0u8; self.buf_size];
        let mut transcoder: Option<Transcoder> = match self.codec {
            Codec::Detect => None,
            other => Some(Transcoder::new(other)?),
        };
        // Bytes read while sniffing for the zstd magic.
        let mut pending = 0usize;

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PumpError::Cancelled),
                r = reader.read(&mut input[pending..pending + self.buf_size]) => r.map_err(PumpError::Read)?,
            };
            stats.bytes_in += n as u64;
            stats.max_chunk = stats.max_chunk.max(n);
            if let Some(h) = hasher.as_mut() {
                h.update(&input[pending..pending + n]);
            }
            let eof = n == 0;
            let filled = pending + n;

            if transcoder.is_none() {
                if filled < ZSTD_MAGIC.len() && !eof {
                    pending = filled;
                    continue;
                }
                let codec = if is_zstd(&input[..filled]) {
                    Codec::ZstdDecode
                } else {
                    Codec::Identity
                };
                transcoder = Some(Transcoder::new(codec)?);
            }
            let tc = transcoder.get_or_insert(Transcoder::Identity);
            pending = 0;

            if filled > 0 {
                tc.feed(&input[..filled], &mut output, writer, &mut stats, cancel)
                    .await?;
            }
            if eof {
                tc.finish(&mut output, writer, &mut stats).await?;
                break;
            }
        }

        writer.flush().await.map_err(PumpError::Write)?;
        stats.sha256 = hasher.map(|h| hex::encode(h.finalize()));
        Ok(stats)
    }
}

impl Transcoder {
    fn new(codec: Codec) -> Result<Self, PumpError> {
        Ok(match codec {
            Codec::Identity | Codec::Detect => Transcoder::Identity,
            Codec::ZstdEncode { level } => {
                Transcoder::Encode(Encoder::new(level).map_err(PumpError::Write)?)
            }
            Codec::ZstdDecode => Transcoder::Decode {
                decoder: Decoder::new().map_err(PumpError::Decode)?,
                hint: 0,
            },
        })
    }

    async fn feed<W>(
        &mut self,
        chunk: &[u8],
        output: &mut [u8],
        writer: &mut W,
        stats: &mut CopyStats,
        cancel: &CancellationToken,
    ) -> Result<(), PumpError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match self {
            Transcoder::Identity => {
                for piece in chunk.chunks(output.len()) {
                    emit(writer, piece, stats).await?;
                }
                Ok(())
            }
            Transcoder::Encode(encoder) => {
                let mut src = InBuffer::around(chunk);
                while src.pos() < chunk.len() {
                    let produced = {
                        let mut dst = OutBuffer::around(&mut *output);
                        encoder.run(&mut src, &mut dst).map_err(PumpError::Write)?;
                        dst.pos()
                    };
                    emit(writer, &output[..produced], stats).await?;
                }
                Ok(())
            }
            Transcoder::Decode { decoder, hint } => {
                let mut src = InBuffer::around(chunk);
                loop {
                    if cancel.is_cancelled() {
                        return Err(PumpError::Cancelled);
                    }
                    let produced = {
                        let mut dst = OutBuffer::around(&mut *output);
                        *hint = decoder.run(&mut src, &mut dst).map_err(PumpError::Decode)?;
                        dst.pos()
                    };
                    emit(writer, &output[..produced], stats).await?;
                    // A full output buffer may hide more pending output.
                    if src.pos() >= chunk.len() && produced < output.len() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn finish<W>(
        &mut self,
        output: &mut [u8],
        writer: &mut W,
        stats: &mut CopyStats,
    ) -> Result<(), PumpError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match self {
            Transcoder::Identity => Ok(()),
            Transcoder::Encode(encoder) => loop {
                let (remaining, produced) = {
                    let mut dst = OutBuffer::around(&mut *output);
                    let remaining = encoder.finish(&mut dst, true).map_err(PumpError::Write)?;
                    (remaining, dst.pos())
                };
                emit(writer, &output[..produced], stats).await?;
                if remaining == 0 {
                    return Ok(());
                }
            },
            Transcoder::Decode { hint, .. } => {
                if *hint != 0 {
                    return Err(PumpError::Decode(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "zstd frame truncated",
                    )));
                }
                Ok(())
            }
        }
    }
}

async fn emit<W>(writer: &mut W, bytes: &[u8], stats: &mut CopyStats) -> Result<(), PumpError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if bytes.is_empty() {
        return Ok(());
    }
    writer.write_all(bytes).await.map_err(PumpError::Write)?;
    stats.bytes_out += bytes.len() as u64;
    stats.max_chunk = stats.max_chunk.max(bytes.len());
    Ok(())
}

/// Decode a complete in-memory buffer, passing non-zstd data through.
pub fn maybe_decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    if is_zstd(data) {
        zstd::stream::decode_all(data)
    } else {
        Ok(data.to_vec())
    }
}
