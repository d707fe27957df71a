//! Incremental capture of agent output streams.
//!
//! Every stream is captured twice over: the raw text accumulates for later
//! protocol extraction, while a live sink receives a human-readable rendering.
//! Only the sink output differs between raw and JSONL modes; the accumulator
//! always holds the literal decoded bytes.

use std::io::Read;

use serde_json::Value;
use tracing::debug;

/// How a JSONL formatter wants one event line displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRender {
    /// Replace the raw line with this rendering.
    Rendered(String),
    /// Show nothing for this line.
    Suppress,
    /// No opinion: forward the raw line verbatim.
    PassThrough,
}

/// Per-line display formatter for agents that emit JSONL events.
pub type LineFormatter = fn(&Value) -> LineRender;

/// Live display target for decoded agent output.
pub trait LiveSink: Send {
    fn write_chunk(&mut self, text: &str);
}

/// Sink backed by any writer (stderr for interactive runs).
pub struct WriterSink<W: std::io::Write + Send> {
    writer: W,
}

impl<W: std::io::Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: std::io::Write + Send> LiveSink for WriterSink<W> {
    fn write_chunk(&mut self, text: &str) {
        // Display-only path: a broken terminal must not abort the capture.
        let _ = self.writer.write_all(text.as_bytes());
        let _ = self.writer.flush();
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl LiveSink for NullSink {
    fn write_chunk(&mut self, _text: &str) {}
}

/// Capture mode for one stream.
#[derive(Debug, Clone, Copy)]
pub enum CaptureMode {
    /// Forward decoded text to the sink unmodified.
    Raw,
    /// Interpret each line as a JSON event and render it via the formatter.
    Jsonl(LineFormatter),
}

/// Result of draining one stream: full raw text plus the first read error.
#[derive(Debug)]
pub struct CaptureOutcome {
    pub text: String,
    pub error: Option<std::io::Error>,
}

impl CaptureOutcome {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Incremental decoder/renderer for one byte stream.
pub struct StreamCapture<'a> {
    mode: CaptureMode,
    sink: &'a mut dyn LiveSink,
    acc: String,
    /// Undecoded tail of a multi-byte sequence split across chunks.
    pending: Vec<u8>,
    /// JSONL mode: buffered partial line awaiting its newline.
    line: String,
}

impl<'a> StreamCapture<'a> {
    pub fn new(mode: CaptureMode, sink: &'a mut dyn LiveSink) -> Self {
        Self {
            mode,
            sink,
            acc: String::new(),
            pending: Vec::new(),
            line: String::new(),
        }
    }

    /// Feed one chunk of raw bytes, in arbitrary split positions.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let decoded = take_decodable(&mut self.pending);
        if decoded.is_empty() {
            return;
        }
        self.acc.push_str(&decoded);
        match self.mode {
            CaptureMode::Raw => self.sink.write_chunk(&decoded),
            CaptureMode::Jsonl(fmt) => self.feed_lines(&decoded, fmt),
        }
    }

    /// Flush any trailing partial line and return the full accumulated text.
    pub fn finish(mut self) -> String {
        if !self.pending.is_empty() {
            // Stream ended mid-sequence: decode the leftovers lossily.
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.acc.push_str(&tail);
            match self.mode {
                CaptureMode::Raw => self.sink.write_chunk(&tail),
                CaptureMode::Jsonl(_) => self.line.push_str(&tail),
            }
        }
        if let CaptureMode::Jsonl(fmt) = self.mode {
            let last = std::mem::take(&mut self.line);
            if !last.is_empty() {
                self.emit_line(&last, fmt);
            }
        }
        self.acc
    }

    fn feed_lines(&mut self, decoded: &str, fmt: LineFormatter) {
        self.line.push_str(decoded);
        while let Some(pos) = self.line.find('\n') {
            let complete: String = self.line[..pos].to_string();
            self.line.drain(..=pos);
            self.emit_line(&complete, fmt);
        }
    }

    fn emit_line(&mut self, line: &str, fmt: LineFormatter) {
        let trimmed = line.trim_end_matches('\r');
        // Blank lines are never forwarded.
        if trimmed.trim().is_empty() {
            return;
        }
        let render = match serde_json::from_str::<Value>(trimmed) {
            Ok(event) => fmt(&event),
            Err(_) => LineRender::PassThrough,
        };
        match render {
            LineRender::Rendered(text) => {
                if !text.is_empty() {
                    self.sink.write_chunk(&text);
                    self.sink.write_chunk("\n");
                }
            }
            LineRender::Suppress => {}
            LineRender::PassThrough => {
                self.sink.write_chunk(trimmed);
                self.sink.write_chunk("\n");
            }
        }
    }
}

/// Drain a reader to completion through a capture.
///
/// On a read error the capture stops; whatever accumulated so far is returned
/// together with the error so the caller can surface it.
pub fn capture_stream<R: Read>(
    mut reader: R,
    mode: CaptureMode,
    sink: &mut dyn LiveSink,
) -> CaptureOutcome {
    let mut capture = StreamCapture::new(mode, sink);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => capture.push(&chunk[..n]),
            Err(err) => {
                debug!(error = %err, "stream read failed, returning partial capture");
                return CaptureOutcome {
                    text: capture.finish(),
                    error: Some(err),
                };
            }
        }
    }
    CaptureOutcome {
        text: capture.finish(),
        error: None,
    }
}

/// Split the decodable prefix off `pending`, leaving any incomplete trailing
/// multi-byte sequence in place for the next chunk.
fn take_decodable(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let out = s.to_string();
            pending.clear();
            out
        }
        Err(err) => {
            let valid = err.valid_up_to();
            match err.error_len() {
                // Incomplete trailing sequence: keep it for the next chunk.
                None => {
                    let out = String::from_utf8_lossy(&pending[..valid]).into_owned();
                    pending.drain(..valid);
                    out
                }
                // Invalid byte run: replace it and continue decoding after it.
                Some(bad) => {
                    let mut out = String::from_utf8_lossy(&pending[..valid]).into_owned();
                    out.push('\u{FFFD}');
                    pending.drain(..valid + bad);
                    out.push_str(&take_decodable(pending));
                    out
                }
            }
        }
    }
}
