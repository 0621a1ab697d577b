//! In-process xz codec for the native backend.
//!
//! Work runs on the blocking pool in 1 MiB chunks; the cancellation token is
//! checked between chunks and a partial output file is removed on any failure.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use {
    tokio_util::sync::CancellationToken,
    tracing::debug,
    turingpi_common::Interrupt,
    xz2::{read::XzDecoder, write::XzEncoder},
};

use crate::error::{Error, Result};

const CHUNK: usize = 1 << 20;

/// Failures of the codec itself read like a failed `xz` run, so both backends
/// report corrupt or truncated input the same way. Plain filesystem errors
/// stay I/O.
fn codec_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::Other => Error::tool("xz", 1, &e.to_string()),
        _ => Error::Io(e),
    }
}

fn pump<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    cancel: &CancellationToken,
    read_err: fn(io::Error) -> Error,
    write_err: fn(io::Error) -> Error,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Interrupt::Cancelled.into());
        }
        let n = reader.read(&mut buf).map_err(read_err)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).map_err(write_err)?;
        total += n as u64;
    }
}

async fn on_blocking<F>(dest: PathBuf, job: F) -> Result<u64>
where
    F: FnOnce() -> Result<u64> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| Error::Message(format!("codec task failed: {e}")))
        .and_then(|r| r);
    if outcome.is_err() {
        let _ = tokio::fs::remove_file(&dest).await;
    }
    outcome
}

/// Decompress `src` (single- or multi-stream xz) into `dest`.
pub async fn decompress_file(src: &Path, dest: &Path, cancel: &CancellationToken) -> Result<u64> {
    let (src_owned, dest_owned, token) = (src.to_path_buf(), dest.to_path_buf(), cancel.clone());
    let written = on_blocking(dest.to_path_buf(), move || {
        let input = BufReader::new(File::open(&src_owned)?);
        let mut output = BufWriter::new(File::create(&dest_owned)?);
        let total = pump(XzDecoder::new_multi_decoder(input), &mut output, &token, codec_error, Error::Io)?;
        output.flush()?;
        Ok(total)
    })
    .await?;
    debug!(src = %src.display(), dest = %dest.display(), bytes = written, "decompressed");
    Ok(written)
}

/// Compress `src` into `dest` at `level` (0-9).
pub async fn compress_file(
    src: &Path,
    dest: &Path,
    level: u32,
    cancel: &CancellationToken,
) -> Result<u64> {
    if level > 9 {
        return Err(Error::invalid(format!("compression level {level} is out of range 0-9")));
    }
    let (src_owned, dest_owned, token) = (src.to_path_buf(), dest.to_path_buf(), cancel.clone());
    let read = on_blocking(dest.to_path_buf(), move || {
        let input = BufReader::new(File::open(&src_owned)?);
        let output = BufWriter::new(File::create(&dest_owned)?);
        let mut encoder = XzEncoder::new(output, level);
        let total = pump(input, &mut encoder, &token, Error::Io, codec_error)?;
        encoder.finish().map_err(codec_error)?.flush()?;
        Ok(total)
    })
    .await?;
    debug!(src = %src.display(), dest = %dest.display(), bytes = read, level, "compressed");
    Ok(read)
}
