use crate::process::ChildOutput;
use chrono::{DateTime, Local};
use std::fmt;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

/// Longest line kept in one piece; longer output is split
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Where a console line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOrigin {
    Stdout,
    Stderr,
    /// A command accepted by the supervisor, echoed back to the console
    Command,
}

/// One line of console output, newline stripped
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleLine {
    pub timestamp: DateTime<Local>,
    pub text: String,
    pub origin: LineOrigin,
}

impl ConsoleLine {
    pub fn new(text: impl Into<String>, origin: LineOrigin) -> Self {
        Self {
            timestamp: Local::now(),
            text: text.into(),
            origin,
        }
    }
}

impl fmt::Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.text
        )
    }
}

/// Splits raw child output into text lines
///
/// Handles `\n` and `\r\n` endings and decodes invalid UTF-8 lossily so a
/// misbehaving server can never stall the console.
pub struct ConsoleCodec {
    max_length: usize,
    // Bytes already scanned for a newline
    next_index: usize,
}

impl ConsoleCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
        }
    }

    fn take_line(&mut self, src: &mut BytesMut, len: usize, skip: usize) -> String {
        let mut line = src.split_to(len);
        src.advance(skip);
        self.next_index = 0;
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8_lossy(&line).into_owned()
    }
}

impl Default for ConsoleCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ConsoleCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scan_end = src.len().min(self.max_length + 1);
        if let Some(offset) = src[self.next_index..scan_end]
            .iter()
            .position(|b| *b == b'\n')
        {
            let len = self.next_index + offset;
            return Ok(Some(self.take_line(src, len, 1)));
        }

        if src.len() > self.max_length {
            return Ok(Some(self.take_line(src, self.max_length, 0)));
        }

        self.next_index = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len();
                Ok(Some(self.take_line(src, len, 0)))
            }
        }
    }
}

type LineStream = Pin<Box<dyn Stream<Item = std::io::Result<ConsoleLine>> + Send>>;

fn framed(io: ChildOutput, origin: LineOrigin) -> LineStream {
    let frames = FramedRead::with_capacity(io, ConsoleCodec::new(), 8 * 1024);
    Box::pin(frames.map(move |frame| frame.map(|text| ConsoleLine::new(text, origin))))
}

/// Drains the child's output as a lazy, non-restartable sequence of lines
///
/// stdout and stderr are merged into one sequence. The sequence ends at
/// end-of-file of both streams or at the first read error; bytes of an
/// unfinished line are discarded on error.
pub struct LineReader {
    lines: LineStream,
    finished: bool,
}

impl LineReader {
    pub fn new(stdout: ChildOutput, stderr: Option<ChildOutput>) -> Self {
        let lines: LineStream = match stderr {
            Some(stderr) => Box::pin(
                framed(stdout, LineOrigin::Stdout).merge(framed(stderr, LineOrigin::Stderr)),
            ),
            None => framed(stdout, LineOrigin::Stdout),
        };
        Self {
            lines,
            finished: false,
        }
    }

    /// Next line, or `None` once the output is closed
    pub async fn next_line(&mut self) -> Option<ConsoleLine> {
        if self.finished {
            return None;
        }

        match self.lines.next().await {
            Some(Ok(line)) => Some(line),
            Some(Err(e)) => {
                warn!(error = %e, "Console stream failed, discarding partial output");
                self.finished = true;
                None
            }
            None => {
                debug!("Console stream reached end of file");
                self.finished = true;
                None
            }
        }
    }

    /// Pump every line into `sink` on a background task
    ///
    /// The task completes when the output closes, which is how the supervisor
    /// learns that the process is going away.
    pub fn spawn(mut self, sink: mpsc::UnboundedSender<ConsoleLine>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(line) = self.next_line().await {
                count += 1;
                if sink.send(line).is_err() {
                    debug!("Console sink closed, stopping reader");
                    break;
                }
            }
            debug!(lines = count, "Console reader finished");
        })
    }
}
