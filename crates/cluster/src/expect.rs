//! Expect/send over any byte stream pair.

use std::time::Duration;

use {
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    tokio_util::sync::CancellationToken,
    tracing::debug,
    turingpi_common::{Interrupt, guarded},
};

use crate::{
    error::{Error, Result, tail},
    shell::ExpectStep,
};

/// Walk `steps` against `reader`/`writer`. Matching only considers output
/// produced after the previous match, so a prompt echoed twice must appear
/// twice.
pub async fn converse<R, W>(
    reader: &mut R,
    writer: &mut W,
    steps: &[ExpectStep],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut transcript = String::new();
    let mut cursor = 0;
    let mut chunk = vec![0u8; 4096];

    for (index, step) in steps.iter().enumerate() {
        let wait = async {
            loop {
                if let Some(pos) = transcript[cursor..].find(&step.expect) {
                    cursor += pos + step.expect.len();
                    return Ok::<(), Error>(());
                }
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::ExpectTimeout {
                        expected: step.expect.clone(),
                        output_tail: format!("{} (stream closed)", tail(&transcript)),
                    });
                }
                transcript.push_str(&String::from_utf8_lossy(&chunk[..n]));
            }
        };
        let outcome = guarded(cancel, Some(timeout), wait).await;
        match outcome {
            Ok(matched) => matched?,
            Err(Interrupt::DeadlineExceeded) => {
                return Err(Error::ExpectTimeout {
                    expected: step.expect.clone(),
                    output_tail: tail(&transcript),
                });
            },
            Err(interrupt) => return Err(interrupt.into()),
        }
        debug!(step = index, expect = %step.expect, "matched, sending reply");
        writer.write_all(step.send.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(transcript)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        tokio::io::{AsyncBufReadExt, BufReader, duplex, split},
    };

    /// A fake login prompt on the far end of an in-memory pipe.
    async fn serve_login(stream: tokio::io::DuplexStream) -> Vec<String> {
        let (read_half, mut write_half) = split(stream);
        let mut lines = BufReader::new(read_half).lines();
        let mut received = Vec::new();
        write_half.write_all(b"turing login: ").await.unwrap();
        received.push(lines.next_line().await.unwrap().unwrap());
        write_half.write_all(b"Password: ").await.unwrap();
        received.push(lines.next_line().await.unwrap().unwrap());
        write_half.write_all(b"\nroot@turing:~# ").await.unwrap();
        received.push(lines.next_line().await.unwrap().unwrap());
        write_half.write_all(b"Linux turing 5.10\nroot@turing:~# ").await.unwrap();
        received.push(lines.next_line().await.unwrap().unwrap());
        received
    }

    #[tokio::test]
    async fn dialog_runs_in_order() {
        let (ours, theirs) = duplex(1024);
        let server = tokio::spawn(serve_login(theirs));
        let (mut reader, mut writer) = split(ours);
        let steps = [
            ExpectStep::new("login:", "root"),
            ExpectStep::new("Password:", "turing"),
            ExpectStep::new("# ", "uname -a"),
            ExpectStep::new("# ", ""),
        ];

        let transcript = converse(
            &mut reader,
            &mut writer,
            &steps,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(transcript.contains("Linux turing 5.10"));
        assert_eq!(server.await.unwrap(), ["root", "turing", "uname -a", ""]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_prompt_times_out_with_tail() {
        let (ours, mut theirs) = duplex(1024);
        theirs.write_all(b"U-Boot 2024.01\nHit any key").await.unwrap();
        let (mut reader, mut writer) = split(ours);

        let err = converse(
            &mut reader,
            &mut writer,
            &[ExpectStep::new("login:", "root")],
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            Error::ExpectTimeout {
                expected,
                output_tail,
            } => {
                assert_eq!(expected, "login:");
                assert!(output_tail.contains("Hit any key"));
            },
            other => panic!("unexpected {other:?}"),
        }
        drop(theirs);
    }

    #[tokio::test]
    async fn closed_stream_fails_fast() {
        let (ours, theirs) = duplex(64);
        drop(theirs);
        let (mut reader, mut writer) = split(ours);
        let err = converse(
            &mut reader,
            &mut writer,
            &[ExpectStep::new("$ ", "ls")],
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("stream closed"));
    }
}
