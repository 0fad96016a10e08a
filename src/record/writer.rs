//! Append-only record stream writer used by the capture stage

use crate::record::codec::{encode_into, Compression};
use crate::record::Record;
use crate::ConfigError;
use flate2::write::GzEncoder;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

enum Sink<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
}

/// Writes records back-to-back into one stream
///
/// With [`Compression::Gzip`] the whole stream is wrapped in a single gzip
/// member, which is only complete once [`RecordWriter::finish`] has run.
pub struct RecordWriter<W: Write> {
    sink: Sink<W>,
    written: usize,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(inner: W, compression: Compression) -> Self {
        let sink = match compression {
            Compression::None => Sink::Plain(inner),
            Compression::Gzip => Sink::Gzip(GzEncoder::new(inner, flate2::Compression::default())),
        };
        Self { sink, written: 0 }
    }

    /// Appends one record to the stream
    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        match &mut self.sink {
            Sink::Plain(w) => encode_into(w, record)?,
            Sink::Gzip(w) => encode_into(w, record)?,
        }
        self.written += 1;
        Ok(())
    }

    /// Number of records written so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flushes the stream, finishing compression, and returns the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self.sink {
            Sink::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Sink::Gzip(w) => {
                let mut inner = w.finish()?;
                inner.flush()?;
                Ok(inner)
            }
        }
    }
}

impl RecordWriter<BufWriter<File>> {
    /// Opens a blob file for appending, choosing compression from its extension
    ///
    /// The path must end in `.records` or `.records.gz` so that the replay
    /// stage can later tell how to decode it. Records already in the file are
    /// kept; a gzip blob gains one more gzip member per writer.
    pub fn create(path: &Path) -> Result<Self, ConfigError> {
        let compression = Compression::from_name(&path.to_string_lossy())?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file), compression))
    }
}
