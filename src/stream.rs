//! Chunked record splitting over large inputs.
//!
//! Tensor files routinely hold hundreds of thousands of rows. Instead of
//! decoding the whole input into one string and splitting it, the reader is
//! consumed `chunk_size` bytes at a time. Complete records are handed to the
//! callback as soon as their delimiter is seen; a trailing partial record is
//! carried over and joined with the leading fragment of the next chunk.
//!
//! Records are split on raw bytes before UTF-8 decoding, so a multi-byte
//! character straddling a chunk boundary is reassembled before it is decoded.

use crate::ProjectorError;
use bon::Builder;
use std::io::{ErrorKind, Read};
use tracing::debug;

/// Default number of bytes read per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1_000_000;

/// Options controlling how delimited text is split.
#[derive(Builder, Clone, Debug)]
pub struct ParseOptions {
    /// Bytes read from the source per chunk
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Byte separating records; must be ASCII
    #[builder(default = b'\n')]
    pub record_delimiter: u8,

    /// Byte separating values within a record; must be ASCII
    #[builder(default = b'\t')]
    pub value_delimiter: u8,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            record_delimiter: b'\n',
            value_delimiter: b'\t',
        }
    }
}

/// Streams `reader`, invoking `on_record` once per record in order.
///
/// Every record is delivered exactly once with its delimiter stripped. A
/// final record without a trailing delimiter is delivered when the reader is
/// exhausted. Memory held at any point is one chunk plus the carried partial
/// record.
///
/// # Errors
/// * `ProjectorError::InvalidDelimiter` if either delimiter is not ASCII
/// * `ProjectorError::Io` if reading fails
/// * `ProjectorError::Utf8` if a record is not valid UTF-8
/// * Any error returned by `on_record`, which stops the stream
pub fn stream_records<R, F, E>(
    mut reader: R,
    options: &ParseOptions,
    mut on_record: F,
) -> Result<(), E>
where
    R: Read,
    F: FnMut(&str) -> Result<(), E>,
    E: From<ProjectorError>,
{
    // A non-ASCII byte would split UTF-8 sequences.
    for byte in [options.record_delimiter, options.value_delimiter] {
        if !byte.is_ascii() {
            return Err(ProjectorError::InvalidDelimiter(byte).into());
        }
    }

    let chunk_size = options.chunk_size.max(1);
    let delimiter = options.record_delimiter;
    let mut chunk = vec![0u8; chunk_size];
    let mut carry: Vec<u8> = Vec::new();
    let mut records = 0usize;
    let mut chunks = 0usize;

    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(ProjectorError::from(err).into()),
        };
        chunks += 1;

        let mut fragments = chunk[..read].split(|&b| b == delimiter).peekable();
        while let Some(fragment) = fragments.next() {
            if fragments.peek().is_none() {
                // No delimiter after this fragment yet.
                carry.extend_from_slice(fragment);
                break;
            }

            if carry.is_empty() {
                on_record(decode(fragment, records)?)?;
            } else {
                carry.extend_from_slice(fragment);
                on_record(decode(&carry, records)?)?;
                carry.clear();
            }
            records += 1;
        }
    }

    if !carry.is_empty() {
        on_record(decode(&carry, records)?)?;
        records += 1;
    }

    debug!("Streamed {records} records in {chunks} chunks");
    Ok(())
}

fn decode(bytes: &[u8], record: usize) -> Result<&str, ProjectorError> {
    std::str::from_utf8(bytes).map_err(|source| ProjectorError::Utf8 { record, source })
}
