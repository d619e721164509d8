//! The per-partition spill file and its in-memory index.
//!
//! Payloads are appended raw, in spill order, to a single file. The index maps
//! `(subpartition, sequence number)` to the region holding the payload. The
//! index is never persisted: spilling is a memory overflow mechanism and a
//! recreated partition starts from an empty file.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, instrument, warn};

use crate::buffer::{Buffer, DataType};
use crate::{Result, ShuffleError};

/// Suffix appended to the spill base path supplied at construction.
pub const DATA_FILE_SUFFIX: &str = ".data";

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Location of one spilled payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillRegion {
    pub offset: u64,
    pub length: usize,
    pub data_type: DataType,
}

/// Maps spilled sequence numbers to file regions, per subpartition.
#[derive(Debug, Default)]
pub struct SpillIndex {
    regions: Vec<BTreeMap<u64, SpillRegion>>,
}

impl SpillIndex {
    pub fn new(num_subpartitions: usize) -> Self {
        Self {
            regions: vec![BTreeMap::new(); num_subpartitions],
        }
    }

    pub fn insert(&mut self, subpartition: usize, sequence: u64, region: SpillRegion) {
        if let Some(map) = self.regions.get_mut(subpartition) {
            map.insert(sequence, region);
        }
    }

    pub fn get(&self, subpartition: usize, sequence: u64) -> Option<SpillRegion> {
        self.regions.get(subpartition)?.get(&sequence).copied()
    }

    pub fn remove(&mut self, subpartition: usize, sequence: u64) -> Option<SpillRegion> {
        self.regions.get_mut(subpartition)?.remove(&sequence)
    }

    /// Drops every region of one subpartition.
    pub fn remove_subpartition(&mut self, subpartition: usize) {
        if let Some(map) = self.regions.get_mut(subpartition) {
            map.clear();
        }
    }

    /// Number of regions not yet consumed.
    pub fn len(&self) -> usize {
        self.regions.iter().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.regions.iter_mut().for_each(BTreeMap::clear);
    }
}

enum WriterState {
    Unopened,
    Open { file: BufWriter<File>, offset: u64 },
    Closed,
}

/// Append-only spill file of one result partition.
///
/// The file is created on the first spill. Appends come from the producer
/// only; reads may come from any I/O thread.
pub struct SpillFile {
    path: PathBuf,
    writer: Mutex<WriterState>,
    reader: Mutex<Option<Arc<File>>>,
    index: Mutex<SpillIndex>,
    bytes_written: AtomicU64,
    deleted: AtomicBool,
}

impl SpillFile {
    /// Prepares a spill file at `<base_path>.data` without touching the disk.
    pub fn new(base_path: impl AsRef<Path>, num_subpartitions: usize) -> Self {
        let mut path = base_path.as_ref().as_os_str().to_owned();
        path.push(DATA_FILE_SUFFIX);

        Self {
            path: PathBuf::from(path),
            writer: Mutex::new(WriterState::Unopened),
            reader: Mutex::new(None),
            index: Mutex::new(SpillIndex::new(num_subpartitions)),
            bytes_written: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends the payloads of `buffers` and indexes them under `subpartition`.
    #[instrument(skip(self, buffers), fields(count = buffers.len()))]
    pub fn append(&self, subpartition: usize, buffers: &[(u64, Buffer)]) -> Result<Vec<SpillRegion>> {
        let mut writer = self.writer.lock();

        if matches!(*writer, WriterState::Unopened) {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)
                .map_err(|source| self.io_error(source))?;
            debug!(path = %self.path.display(), "Created spill file");
            *writer = WriterState::Open {
                file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
                offset: 0,
            };
        }

        let WriterState::Open { file, offset } = &mut *writer else {
            return Err(self.io_error(io::Error::other("spill file is closed for writing")));
        };

        let mut regions = Vec::with_capacity(buffers.len());
        let mut end = *offset;
        let written = buffers
            .iter()
            .try_for_each(|(_, buffer)| {
                file.write_all(buffer.as_slice())?;
                regions.push(SpillRegion {
                    offset: end,
                    length: buffer.readable_bytes(),
                    data_type: buffer.data_type(),
                });
                end += buffer.readable_bytes() as u64;
                Ok(())
            })
            .and_then(|()| file.flush());
        if let Err(source) = written {
            // Part of the batch may be on disk, so later offsets would be wrong.
            error!(
                path = %self.path.display(),
                "Spill write failed, closing spill file for writing: {}", source
            );
            *writer = WriterState::Closed;
            return Err(self.io_error(source));
        }
        *offset = end;
        drop(writer);

        let mut index = self.index.lock();
        let mut written = 0u64;
        for ((sequence, _), region) in buffers.iter().zip(&regions) {
            index.insert(subpartition, *sequence, *region);
            written += region.length as u64;
        }
        self.bytes_written.fetch_add(written, Ordering::AcqRel);

        Ok(regions)
    }

    /// Looks up the region of a spilled buffer.
    pub fn region(&self, subpartition: usize, sequence: u64) -> Option<SpillRegion> {
        self.index.lock().get(subpartition, sequence)
    }

    /// Forgets a region once its buffer has been delivered or discarded.
    pub fn remove_region(&self, subpartition: usize, sequence: u64) -> Option<SpillRegion> {
        self.index.lock().remove(subpartition, sequence)
    }

    pub fn remove_subpartition(&self, subpartition: usize) {
        self.index.lock().remove_subpartition(subpartition);
    }

    /// Number of indexed regions.
    pub fn num_regions(&self) -> usize {
        self.index.lock().len()
    }

    /// Total payload bytes appended so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// Reads a region into `dst`, whose length must equal the region length.
    pub fn read(&self, region: &SpillRegion, dst: &mut [u8]) -> Result<()> {
        if dst.len() != region.length {
            return Err(ShuffleError::DataCorruption(format!(
                "read buffer of {} bytes for region of {} bytes",
                dst.len(),
                region.length
            )));
        }
        if self.deleted.load(Ordering::Acquire) {
            return Err(self.io_error(io::Error::new(
                io::ErrorKind::NotFound,
                "spill file has been deleted",
            )));
        }

        let file = {
            let mut reader = self.reader.lock();
            match reader.as_ref() {
                Some(file) => Arc::clone(file),
                None => {
                    let file = Arc::new(File::open(&self.path).map_err(|source| self.io_error(source))?);
                    *reader = Some(Arc::clone(&file));
                    file
                }
            }
        };

        read_exact_at(&file, dst, region.offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ShuffleError::DataCorruption(format!(
                    "spill region [{}, {}) lies beyond the end of {:?}",
                    region.offset,
                    region.offset + region.length as u64,
                    self.path
                ))
            } else {
                self.io_error(e)
            }
        })
    }

    /// Flushes and closes the write side. Reads keep working.
    pub fn finish_writing(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let result = match &mut *writer {
            WriterState::Open { file, .. } => file.flush().map_err(|source| self.io_error(source)),
            _ => Ok(()),
        };
        *writer = WriterState::Closed;
        result
    }

    /// Closes both sides, clears the index and removes the file if it was created.
    pub fn delete(&self) -> Result<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        *self.writer.lock() = WriterState::Closed;
        self.reader.lock().take();
        self.index.lock().clear();

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Deleted spill file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn io_error(&self, source: io::Error) -> ShuffleError {
        ShuffleError::IoWithPath {
            path: self.path.clone(),
            source,
        }
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = self.delete() {
            warn!("Failed to delete spill file on drop: {}", e);
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ));
            }
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
