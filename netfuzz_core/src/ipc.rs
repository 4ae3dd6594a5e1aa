//! Worker-to-supervisor channels.
//!
//! Each worker owns two one-directional channels: a control channel carrying
//! [`ControlMessage`]s and an output channel streaming raw text captured from
//! child processes. Both can live inside one process (`mpsc`) or cross a
//! process boundary as newline-delimited JSON.

use crate::crash::CrashRecord;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::sync::mpsc::Sender;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Channel receiver has gone away")]
    Disconnected,
    #[error("Channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed channel message: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Messages sent from a worker to its supervisor.
///
/// For one debugger run, `Pid` always comes first and at most one `Data`
/// follows it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ControlMessage {
    Pid(u32),
    Data(CrashRecord),
}

pub trait ControlSink {
    fn send_control(&mut self, message: ControlMessage) -> Result<(), IpcError>;
}

pub trait OutputSink {
    fn send_output(&mut self, chunk: &str) -> Result<(), IpcError>;
}

impl ControlSink for Sender<ControlMessage> {
    fn send_control(&mut self, message: ControlMessage) -> Result<(), IpcError> {
        self.send(message).map_err(|_| IpcError::Disconnected)
    }
}

impl OutputSink for Sender<String> {
    fn send_output(&mut self, chunk: &str) -> Result<(), IpcError> {
        self.send(chunk.to_string())
            .map_err(|_| IpcError::Disconnected)
    }
}

impl<T: ControlSink + ?Sized> ControlSink for &mut T {
    fn send_control(&mut self, message: ControlMessage) -> Result<(), IpcError> {
        (**self).send_control(message)
    }
}

impl<T: OutputSink + ?Sized> OutputSink for &mut T {
    fn send_output(&mut self, chunk: &str) -> Result<(), IpcError> {
        (**self).send_output(chunk)
    }
}

/// Writes one JSON document per line and flushes after each, so a reader on
/// the other end of a pipe sees messages as soon as they are sent.
pub struct JsonLinesWriter<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), IpcError> {
        serde_json::to_writer(&mut self.writer, value)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write> ControlSink for JsonLinesWriter<W> {
    fn send_control(&mut self, message: ControlMessage) -> Result<(), IpcError> {
        self.write_line(&message)
    }
}

impl<W: Write> OutputSink for JsonLinesWriter<W> {
    fn send_output(&mut self, chunk: &str) -> Result<(), IpcError> {
        self.write_line(&chunk)
    }
}

/// Supervisor-side decoder for a [`JsonLinesWriter`] stream.
pub struct JsonLinesReader<R: BufRead> {
    reader: R,
    line: String,
}

impl<R: BufRead> JsonLinesReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }

    /// Next decoded message, or `None` at end of stream. Blank lines are skipped.
    pub fn next_message<T: for<'de> Deserialize<'de>>(&mut self) -> Option<Result<T, IpcError>> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) if self.line.trim().is_empty() => continue,
                Ok(_) => return Some(serde_json::from_str(self.line.trim_end()).map_err(IpcError::from)),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
