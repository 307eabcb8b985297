use std::io;
use std::path::Path;
use std::process::Stdio;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use log::debug;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};

/// Lines buffered between the pipe readers and the consumer; once full the
/// readers stop draining the pipes and the child blocks on its own writes.
const LINE_BUFFER: usize = 256;

/// Longest line kept before a forced split
const MAX_LINE_BYTES: usize = 64 * 1024;

/// A running child process with line-oriented output
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if the process is still known to the OS
    fn id(&self) -> Option<u32>;

    /// Next line from stdout or stderr; `Ok(None)` once both streams are closed.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not lose a line.
    async fn next_line(&mut self) -> io::Result<Option<String>>;

    /// Wait for exit and return the exit code (-1 when killed by a signal)
    async fn wait(&mut self) -> io::Result<i32>;

    /// Kill the process and reap it
    async fn terminate(&mut self) -> io::Result<()>;
}

/// Spawns external programs
pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, program: &Path, args: &[String]) -> io::Result<Box<dyn ProcessHandle>>;
}

/// [`ProcessRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    fn spawn(&self, program: &Path, args: &[String]) -> io::Result<Box<dyn ProcessHandle>> {
        debug!("Spawning: {} {}", program.display(), args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "failed to capture stderr"))?;

        let (tx, lines) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(forward_lines(stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, tx));

        Ok(Box::new(TokioProcess { child, lines }))
    }
}

async fn forward_lines<R>(stream: R, tx: mpsc::Sender<io::Result<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(stream, StatusLineCodec);
    while let Some(item) = frames.next().await {
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

struct TokioProcess {
    child: Child,
    lines: mpsc::Receiver<io::Result<String>>,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.recv().await.transpose()
    }

    async fn wait(&mut self) -> io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn terminate(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Splits a byte stream on `\n` or `\r`.
///
/// ffmpeg rewrites its status line in place with a bare carriage return, so a
/// plain newline codec would only yield it once the encode ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusLineCodec;

impl Decoder for StatusLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let Some(pos) = buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                if buf.len() >= MAX_LINE_BYTES {
                    let line = buf.split_to(MAX_LINE_BYTES);
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
                return Ok(None);
            };

            let line = buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]).into_owned();
            // "\r\n" leaves an empty piece behind
            if !text.is_empty() {
                return Ok(Some(text));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}
