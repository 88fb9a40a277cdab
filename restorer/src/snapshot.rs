// restorer/src/snapshot.rs
//!
//! Snapshot reader: turns an exported snapshot file into a record stream
//!
//! The file is read in fixed-size chunks into a decode buffer, going
//! through a gzip decoder when the file is gzip framed. The buffer is then
//! scanned once to index the records (position, type, primary key and byte
//! span) without building a JSON tree for the whole document. Full records
//! are decoded from their span one at a time, when they are applied.
//!
//! Wire format: a JSON array of `{"model": .., "pk": .., "fields": {..}}`
//! objects, or a single such object.

use flate2::read::GzDecoder;
use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::RestoreConfig;
use crate::{provenance, EntityRecord, Error, PrimaryKey};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Keys that identify a cloud service-account credentials file.
const CREDENTIAL_KEYS: &[&str] = &["private_key", "client_email", "project_id"];

const SQL_DUMP_PREFIXES: &[&str] = &["--", "PRAGMA", "BEGIN TRANSACTION", "CREATE TABLE", "INSERT INTO"];

/// Progress of the read phase, in bytes of the file as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadProgress {
    pub bytes_read: u64,
    pub total_bytes: u64,
}

/// Index entry of one record inside the decode buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSlot {
    pub index: usize,
    pub entity_type: String,
    pub primary_key: Option<PrimaryKey>,
    span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSource {
    pub path: PathBuf,
    pub compressed: bool,
    pub stored_bytes: u64,
    pub decoded_bytes: u64,
    pub sha256: String,
}

/// A decoded snapshot: the raw document plus its record index.
#[derive(Debug)]
pub struct Snapshot {
    buffer: Vec<u8>,
    slots: Vec<RecordSlot>,
    source: SnapshotSource,
}

impl Snapshot {
    /// Opens a snapshot file with the default configuration and no progress
    /// reporting.
    pub fn open(path: &Path) -> Result<Self, Error> {
        SnapshotReader::new(&RestoreConfig::default()).open(path, |_| Ok(()))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn source(&self) -> &SnapshotSource {
        &self.source
    }

    pub fn slots(&self) -> &[RecordSlot] {
        &self.slots
    }

    /// Distinct types in order of first appearance.
    pub fn distinct_types(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.slots
            .iter()
            .filter(|slot| seen.insert(slot.entity_type.as_str()))
            .map(|slot| slot.entity_type.clone())
            .collect()
    }

    /// Decodes a fresh copy of the record behind `slot`.
    pub fn decode(&self, slot: &RecordSlot) -> Result<EntityRecord, Error> {
        let wire: WireRecord = serde_json::from_slice(&self.buffer[slot.span.clone()])
            .map_err(|err| Error::Format(format!("record {}: {err}", slot.index)))?;
        Ok(EntityRecord {
            index: slot.index,
            entity_type: wire.model,
            primary_key: wire.pk,
            fields: wire.fields,
        })
    }

    /// Lazily decodes every record in stream order.
    pub fn records(&self) -> impl Iterator<Item = Result<EntityRecord, Error>> + '_ {
        self.slots.iter().map(move |slot| self.decode(slot))
    }
}

pub struct SnapshotReader {
    max_snapshot_bytes: u64,
    max_decoded_bytes: u64,
    chunk_bytes: usize,
}

impl SnapshotReader {
    pub fn new(config: &RestoreConfig) -> Self {
        Self {
            max_snapshot_bytes: config.max_snapshot_bytes,
            max_decoded_bytes: config.max_decoded_bytes,
            chunk_bytes: config.read_chunk_bytes.max(1),
        }
    }

    /// Reads and indexes the snapshot at `path`.
    ///
    /// `on_progress` is called after every chunk; an error returned from it
    /// aborts the read (used for cancellation).
    pub fn open<F>(&self, path: &Path, mut on_progress: F) -> Result<Snapshot, Error>
    where
        F: FnMut(ReadProgress) -> Result<(), Error>,
    {
        let mut file = File::open(path).map_err(|err| {
            Error::Api(format!("failed to open snapshot {}: {err}", path.display()))
        })?;
        let total_bytes = file.metadata()?.len();
        if total_bytes > self.max_snapshot_bytes {
            return Err(Error::SnapshotTooLarge {
                size: total_bytes,
                limit: self.max_snapshot_bytes,
            });
        }

        let compressed = has_gzip_suffix(path) || starts_with_gzip_magic(&mut file)?;
        tracing::debug!(path = %path.display(), total_bytes, compressed, "reading snapshot");

        let bytes_read = Arc::new(AtomicU64::new(0));
        let counting = CountingReader {
            inner: file,
            count: bytes_read.clone(),
            hasher: Sha256::new(),
        };

        let (buffer, hasher) = if compressed {
            let mut decoder = GzDecoder::new(counting);
            let buffer = self.read_chunks(&mut decoder, &bytes_read, total_bytes, &mut on_progress)?;
            (buffer, decoder.into_inner().hasher)
        } else {
            let mut reader = counting;
            let buffer = self.read_chunks(&mut reader, &bytes_read, total_bytes, &mut on_progress)?;
            (buffer, reader.hasher)
        };

        let slots = index_records(&buffer)?;
        let source = SnapshotSource {
            path: path.to_path_buf(),
            compressed,
            stored_bytes: bytes_read.load(Ordering::Relaxed),
            decoded_bytes: buffer.len() as u64,
            sha256: provenance::finish_hex(hasher),
        };
        tracing::info!(
            path = %path.display(),
            records = slots.len(),
            decoded_bytes = source.decoded_bytes,
            "snapshot indexed"
        );

        Ok(Snapshot {
            buffer,
            slots,
            source,
        })
    }

    fn read_chunks<R, F>(
        &self,
        reader: &mut R,
        bytes_read: &AtomicU64,
        total_bytes: u64,
        on_progress: &mut F,
    ) -> Result<Vec<u8>, Error>
    where
        R: Read,
        F: FnMut(ReadProgress) -> Result<(), Error>,
    {
        let mut buffer = Vec::new();
        let mut chunk = vec![0u8; self.chunk_bytes];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == std::io::ErrorKind::InvalidInput
                    || err.kind() == std::io::ErrorKind::InvalidData =>
                {
                    return Err(Error::Format(format!("corrupt compressed stream: {err}")));
                }
                Err(err) => return Err(err.into()),
            };

            let stored = bytes_read.load(Ordering::Relaxed);
            if stored > self.max_snapshot_bytes {
                return Err(Error::SnapshotTooLarge {
                    size: stored,
                    limit: self.max_snapshot_bytes,
                });
            }
            let decoded = (buffer.len() + n) as u64;
            if decoded > self.max_decoded_bytes {
                return Err(Error::SnapshotTooLarge {
                    size: decoded,
                    limit: self.max_decoded_bytes,
                });
            }

            buffer.extend_from_slice(&chunk[..n]);
            on_progress(ReadProgress {
                bytes_read: stored,
                total_bytes,
            })?;
        }
        Ok(buffer)
    }
}

struct CountingReader<R: Read> {
    inner: R,
    count: Arc<AtomicU64>,
    hasher: Sha256,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

fn has_gzip_suffix(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

fn starts_with_gzip_magic(file: &mut File) -> Result<bool, Error> {
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(filled == magic.len() && magic == GZIP_MAGIC)
}

#[derive(Deserialize)]
struct WireRecord {
    model: String,
    #[serde(default)]
    pk: Option<PrimaryKey>,
    fields: serde_json::Map<String, serde_json::Value>,
}

/// Record shape check used while indexing; `fields` is skipped over.
#[derive(Deserialize)]
struct RecordHeader {
    model: String,
    #[serde(default)]
    pk: Option<PrimaryKey>,
    #[allow(dead_code)]
    fields: ObjectMarker,
}

/// Accepts any JSON object and discards its contents.
struct ObjectMarker;

impl<'de> Deserialize<'de> for ObjectMarker {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MarkerVisitor;

        impl<'de> Visitor<'de> for MarkerVisitor {
            type Value = ObjectMarker;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of fields")
            }

            fn visit_map<A>(self, mut map: A) -> Result<ObjectMarker, A::Error>
            where
                A: MapAccess<'de>,
            {
                while map.next_entry::<IgnoredAny, IgnoredAny>()?.is_some() {}
                Ok(ObjectMarker)
            }
        }

        deserializer.deserialize_map(MarkerVisitor)
    }
}

fn skip_whitespace(buffer: &[u8], mut pos: usize) -> usize {
    while pos < buffer.len() && buffer[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Builds the record index, rejecting anything that is not a snapshot.
fn index_records(buffer: &[u8]) -> Result<Vec<RecordSlot>, Error> {
    let text = std::str::from_utf8(buffer)
        .map_err(|err| Error::Format(format!("snapshot is not valid UTF-8: {err}")))?;
    let mut start = skip_whitespace(buffer, 0);
    // Tolerate a UTF-8 byte order mark.
    if text[start..].starts_with('\u{feff}') {
        start = skip_whitespace(buffer, start + '\u{feff}'.len_utf8());
    }

    match buffer.get(start) {
        None => Err(Error::Format("snapshot is empty".to_string())),
        Some(b'[') => index_array(buffer, start + 1),
        Some(b'{') => index_single_object(buffer, start),
        Some(_) => {
            let head = &buffer[start..];
            if SQL_DUMP_PREFIXES.iter().any(|prefix| {
                head.len() >= prefix.len() && head[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
            }) {
                return Err(Error::UnsupportedFormat(
                    "this looks like a SQL dump; restore it with the database's own tools and supply a JSON data export here".to_string(),
                ));
            }
            Err(Error::Format(
                "expected a JSON array of records or a single record object".to_string(),
            ))
        }
    }
}

fn index_array(buffer: &[u8], mut pos: usize) -> Result<Vec<RecordSlot>, Error> {
    let mut slots = Vec::new();
    pos = skip_whitespace(buffer, pos);
    if buffer.get(pos) == Some(&b']') {
        return expect_end(buffer, pos + 1).map(|_| slots);
    }

    loop {
        let start = skip_whitespace(buffer, pos);
        let index = slots.len();
        if buffer.get(start) != Some(&b'{') {
            return Err(Error::Format(format!(
                "record {index} is not an object"
            )));
        }
        let mut stream =
            serde_json::Deserializer::from_slice(&buffer[start..]).into_iter::<RecordHeader>();
        let header = match stream.next() {
            Some(Ok(header)) => header,
            Some(Err(err)) => {
                return Err(Error::Format(format!("record {index}: {err}")));
            }
            None => {
                return Err(Error::Format(format!(
                    "record {index}: unexpected end of input"
                )));
            }
        };
        let end = start + stream.byte_offset();
        slots.push(RecordSlot {
            index,
            entity_type: header.model,
            primary_key: header.pk,
            span: start..end,
        });

        pos = skip_whitespace(buffer, end);
        match buffer.get(pos) {
            Some(b',') => pos += 1,
            Some(b']') => return expect_end(buffer, pos + 1).map(|_| slots),
            Some(other) => {
                return Err(Error::Format(format!(
                    "unexpected character '{}' after record {index}",
                    *other as char
                )));
            }
            None => {
                return Err(Error::Format(
                    "unterminated record array".to_string(),
                ));
            }
        }
    }
}

fn index_single_object(buffer: &[u8], start: usize) -> Result<Vec<RecordSlot>, Error> {
    let value: serde_json::Value = serde_json::from_slice(&buffer[start..])
        .map_err(|err| Error::Format(format!("invalid JSON: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::Format("expected a record object".to_string()))?;

    let is_credentials = object.get("type").and_then(|v| v.as_str()) == Some("service_account")
        || CREDENTIAL_KEYS.iter().all(|key| object.contains_key(*key));
    if is_credentials {
        return Err(Error::UnsupportedFormat(
            "this is a service-account credentials file, not a data snapshot; select the exported backup file instead".to_string(),
        ));
    }

    let header = RecordHeader::deserialize(&value).map_err(|err| {
        Error::Format(format!(
            "top-level object is not a record (expected \"model\" and \"fields\"): {err}"
        ))
    })?;
    let end = skip_trailing_whitespace(buffer);
    Ok(vec![RecordSlot {
        index: 0,
        entity_type: header.model,
        primary_key: header.pk,
        span: start..end,
    }])
}

fn skip_trailing_whitespace(buffer: &[u8]) -> usize {
    let mut end = buffer.len();
    while end > 0 && buffer[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    end
}

fn expect_end(buffer: &[u8], pos: usize) -> Result<(), Error> {
    let pos = skip_whitespace(buffer, pos);
    if pos == buffer.len() {
        Ok(())
    } else {
        Err(Error::Format(format!(
            "trailing data at byte {pos} after record array"
        )))
    }
}
