// Conversion of provider audio (mp3, wav, whatever ffmpeg reads) to
// the 48kHz s16le stereo PCM the encode pipeline expects. Runs ffmpeg
// as a subprocess; the write and read halves run concurrently so a
// large input can't deadlock against a full output pipe.

use std::io;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

pub(crate) async fn to_discord_pcm(input: Vec<u8>) -> io::Result<Vec<u8>> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel", "error",
            "-i", "pipe:0",
            "-f", "s16le",
            "-ar", "48000",
            "-ac", "2",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no ffmpeg stdin"))?;
    let write_task = tokio::spawn(async move {
        let result = stdin.write_all(&input).await;
        drop(stdin); // EOF so ffmpeg can finish
        result
    });

    let mut pcm = Vec::new();
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no ffmpeg stdout"))?;
    stdout.read_to_end(&mut pcm).await?;

    let status = child.wait().await?;
    // a broken-pipe write is fine if ffmpeg already produced its output
    let _ = write_task.await;

    if !status.success() {
        let mut stderr_text = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut stderr_text).await;
        }
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("ffmpeg failed: {}", stderr_text.trim()),
        ));
    }

    debug!("transcoded to {} bytes of pcm", pcm.len());
    Ok(pcm)
}
