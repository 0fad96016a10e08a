//! Envelope codec for record streams
//!
//! # Wire Format
//!
//! A stream is a sequence of frames with no header or trailer:
//!
//! | Bytes | Content |
//! |-------|---------|
//! | 4 | payload length, big-endian `u32` |
//! | n | the record as a UTF-8 JSON object |
//!
//! Compression wraps the whole stream. Gzip streams may consist of several
//! concatenated members, so a writer that gzips each append separately
//! produces a valid stream.

use crate::record::Record;
use crate::{ConfigError, CorruptStreamError};
use bytes::{Buf, Bytes};
use flate2::read::MultiGzDecoder;
use std::io::{self, BufReader, ErrorKind, Read, Write};

/// Largest payload a single frame may declare
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Blob name suffix of an uncompressed record stream
pub const PLAIN_EXTENSION: &str = ".records";

/// Blob name suffix of a gzip-wrapped record stream
pub const GZIP_EXTENSION: &str = ".records.gz";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression applied to a whole record stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    /// Selects compression from a blob name
    ///
    /// Only the `.records` and `.records.gz` suffixes are recognized; any
    /// other name is a configuration error rather than a guess.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        if name.ends_with(GZIP_EXTENSION) {
            Ok(Self::Gzip)
        } else if name.ends_with(PLAIN_EXTENSION) {
            Ok(Self::None)
        } else {
            Err(ConfigError::UnrecognizedBlob(name.to_string()))
        }
    }

    /// Guesses compression from the first bytes of a blob
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else {
            Self::None
        }
    }

    /// The blob name suffix for this compression
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => PLAIN_EXTENSION,
            Self::Gzip => GZIP_EXTENSION,
        }
    }
}

/// Encodes one record as a self-delimiting frame
pub fn encode(record: &Record) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(&mut buf, record)?;
    Ok(buf)
}

/// Writes one framed record to `writer`
pub fn encode_into<W: Write>(writer: &mut W, record: &Record) -> io::Result<()> {
    let payload = serde_json::to_vec(record)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "record for {} is {} bytes, larger than the {} byte frame limit",
                    record.url,
                    payload.len(),
                    MAX_FRAME_LEN
                ),
            )
        })?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Lazily decodes a record stream
///
/// Decoding is single-pass: after yielding record *i*, the underlying reader
/// is positioned exactly at the start of record *i + 1*. Reaching the end of
/// input between frames ends the iteration; running out of bytes (or finding
/// garbage) inside a frame yields one [`CorruptStreamError`] and then ends.
pub fn decode_stream<'a, R>(reader: R, compression: Compression) -> RecordReader<Box<dyn Read + Send + 'a>>
where
    R: Read + Send + 'a,
{
    let inner: Box<dyn Read + Send + 'a> = match compression {
        Compression::None => Box::new(BufReader::new(reader)),
        Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
    };
    RecordReader::new(inner)
}

/// Decodes an in-memory blob fetched from a backend
pub fn decode_bytes(bytes: Bytes, compression: Compression) -> RecordReader<Box<dyn Read + Send>> {
    decode_stream(bytes.reader(), compression)
}

/// Iterator over the records of one stream
pub struct RecordReader<R> {
    inner: R,
    offset: u64,
    index: usize,
    finished: bool,
}

impl<R: Read> RecordReader<R> {
    /// Wraps an already-decompressed byte stream
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            index: 0,
            finished: false,
        }
    }

    /// Number of records decoded so far
    pub fn records_read(&self) -> usize {
        self.index
    }

    /// Offset of the next frame in the decompressed stream
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn corrupt(&self, reason: impl Into<String>) -> CorruptStreamError {
        CorruptStreamError {
            record_index: self.index,
            offset: self.offset,
            reason: reason.into(),
        }
    }

    fn read_frame(&mut self) -> Result<Option<Record>, CorruptStreamError> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match self.inner.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.corrupt(format!("failed to read frame header: {}", e))),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(self.corrupt(format!(
                "stream ends after {} of 4 frame header bytes",
                filled
            )));
        }

        let len = u32::from_be_bytes(header);
        if len > MAX_FRAME_LEN {
            return Err(self.corrupt(format!(
                "frame declares {} bytes, more than the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }

        // Grows with the bytes actually present, not the declared length
        let mut payload = Vec::new();
        if let Err(e) = (&mut self.inner)
            .take(u64::from(len))
            .read_to_end(&mut payload)
        {
            return Err(self.corrupt(format!("failed to read record payload: {}", e)));
        }
        if payload.len() < len as usize {
            return Err(self.corrupt(format!(
                "stream ends inside a {} byte record payload",
                len
            )));
        }

        let record: Record = serde_json::from_slice(&payload)
            .map_err(|e| self.corrupt(format!("invalid record payload: {}", e)))?;

        self.offset += 4 + u64::from(len);
        self.index += 1;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, CorruptStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_frame() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
