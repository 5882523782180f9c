//! Memory-mapped control and log files
//!
//! The client never owns the files it maps; the driver creates them and the
//! client holds non-owning views. `MappedFile` wraps the raw mapping,
//! `LogBuffers` layers the three-term log layout on top and validates it at
//! map time. Log buffer mappings are shared between local handles via
//! `Arc<LogBuffers>` and unmapped only when the last handle drops after its
//! linger deadline.

use crate::buffer::AtomicBuffer;
use crate::error::{ClientError, Result};
use crate::logbuffer::{self, frame};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// A read-write memory mapping of a file.
pub struct MappedFile {
    path: PathBuf,
    // Held for the lifetime of the mapping; all access goes through `ptr`.
    _mmap: MmapMut,
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Create a file of the given length (zero-filled) and map it.
    pub fn create<P: AsRef<Path>>(path: P, length: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(length)?;
        Self::map_file(path, file)
    }

    /// Map an existing file created by the driver.
    pub fn map_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::map_file(path, file)
    }

    fn map_file(path: PathBuf, file: std::fs::File) -> Result<Self> {
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        let len = mmap.len();
        Ok(Self {
            path,
            _mmap: mmap,
            ptr,
            len,
        })
    }

    /// Path this mapping was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View over the whole mapping.
    pub fn buffer(&self) -> AtomicBuffer {
        unsafe { AtomicBuffer::from_raw_parts(self.ptr, self.len) }
    }

    /// View over a sub-range of the mapping.
    pub fn buffer_at(&self, offset: usize, length: usize) -> AtomicBuffer {
        assert!(
            offset + length <= self.len,
            "mapping sub-range out of bounds: offset={} length={} len={}",
            offset,
            length,
            self.len
        );
        unsafe { AtomicBuffer::from_raw_parts(self.ptr.add(offset), length) }
    }
}

/// A mapped log buffer: three term partitions, their tail blocks and the
/// metadata trailer.
pub struct LogBuffers {
    mapped: MappedFile,
    term_length: i32,
}

impl LogBuffers {
    /// Map an existing log buffer file and validate its layout.
    pub fn map<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mapped = MappedFile::map_existing(path)?;
        let file_length = mapped.len() as u64;

        let overhead = (logbuffer::PARTITION_COUNT as u64)
            * (logbuffer::TERM_TAIL_BLOCK_LENGTH as u64)
            + logbuffer::LOG_META_DATA_LENGTH as u64;
        if file_length <= overhead {
            return Err(ClientError::InvalidBuffer(format!(
                "log file {} too short: {} bytes",
                mapped.path().display(),
                file_length
            )));
        }

        let term_length =
            ((file_length - overhead) / logbuffer::PARTITION_COUNT as u64) as i32;
        logbuffer::check_term_length(term_length)?;

        let log = Self {
            mapped,
            term_length,
        };
        let recorded = log
            .meta_buffer()
            .get_i32(logbuffer::LOG_TERM_LENGTH_OFFSET);
        if recorded != term_length {
            return Err(ClientError::InvalidBuffer(format!(
                "log metadata term length {} disagrees with file size ({})",
                recorded, term_length
            )));
        }

        Ok(log)
    }

    /// Create and initialise a log buffer file.
    ///
    /// This is the driver's half of the contract, carried here for the
    /// in-process driver used by tests and tooling. Partition 0 starts at
    /// `(initialTermId, 0)`; the other partitions get the stale term ids
    /// the rotation CAS expects.
    pub fn create<P: AsRef<Path>>(
        path: P,
        term_length: i32,
        initial_term_id: i32,
        mtu_length: i32,
        session_id: i32,
        stream_id: i32,
    ) -> Result<Self> {
        logbuffer::check_term_length(term_length)?;
        assert!(
            mtu_length > frame::HEADER_LENGTH && mtu_length % frame::FRAME_ALIGNMENT == 0,
            "mtu must exceed the header length and be frame aligned"
        );

        let mapped = MappedFile::create(path, logbuffer::compute_log_length(term_length))?;
        let log = Self {
            mapped,
            term_length,
        };

        let meta = log.meta_buffer();
        meta.put_i32(logbuffer::LOG_INITIAL_TERM_ID_OFFSET, initial_term_id);
        meta.put_i32(logbuffer::LOG_MTU_LENGTH_OFFSET, mtu_length);
        meta.put_i32(logbuffer::LOG_TERM_LENGTH_OFFSET, term_length);

        let default_header = logbuffer::LOG_DEFAULT_FRAME_HEADER_OFFSET;
        meta.put_u8(default_header + frame::VERSION_OFFSET, frame::CURRENT_VERSION);
        meta.put_u16(default_header + frame::TYPE_OFFSET, frame::DATA_FRAME_TYPE);
        meta.put_i32(default_header + frame::SESSION_ID_OFFSET, session_id);
        meta.put_i32(default_header + frame::STREAM_ID_OFFSET, stream_id);

        for index in 0..logbuffer::PARTITION_COUNT {
            let expected_term_id = if index == 0 {
                initial_term_id
            } else {
                initial_term_id + index as i32 - logbuffer::PARTITION_COUNT as i32
            };
            log.tail_block(index).put_i64(
                logbuffer::TERM_TAIL_COUNTER_OFFSET,
                logbuffer::pack_tail(expected_term_id, 0),
            );
        }

        Ok(log)
    }

    /// Term length of each partition.
    pub fn term_length(&self) -> i32 {
        self.term_length
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        self.mapped.path()
    }

    /// View over one term partition.
    pub fn term_buffer(&self, index: usize) -> AtomicBuffer {
        assert!(index < logbuffer::PARTITION_COUNT);
        self.mapped
            .buffer_at(index * self.term_length as usize, self.term_length as usize)
    }

    /// View over one per-term tail block.
    pub fn tail_block(&self, index: usize) -> AtomicBuffer {
        assert!(index < logbuffer::PARTITION_COUNT);
        let base = logbuffer::PARTITION_COUNT * self.term_length as usize;
        self.mapped.buffer_at(
            base + index * logbuffer::TERM_TAIL_BLOCK_LENGTH as usize,
            logbuffer::TERM_TAIL_BLOCK_LENGTH as usize,
        )
    }

    /// All three tail blocks, partition ordered.
    pub fn tail_blocks(&self) -> [AtomicBuffer; logbuffer::PARTITION_COUNT] {
        [self.tail_block(0), self.tail_block(1), self.tail_block(2)]
    }

    /// View over the log metadata trailer.
    pub fn meta_buffer(&self) -> AtomicBuffer {
        let base = logbuffer::PARTITION_COUNT
            * (self.term_length as usize + logbuffer::TERM_TAIL_BLOCK_LENGTH as usize);
        self.mapped
            .buffer_at(base, logbuffer::LOG_META_DATA_LENGTH as usize)
    }

    /// Session/stream identity recorded in the default frame header.
    pub fn header_template(&self) -> frame::HeaderTemplate {
        let meta = self.meta_buffer();
        let default_header = logbuffer::LOG_DEFAULT_FRAME_HEADER_OFFSET;
        frame::HeaderTemplate {
            session_id: meta.get_i32(default_header + frame::SESSION_ID_OFFSET),
            stream_id: meta.get_i32(default_header + frame::STREAM_ID_OFFSET),
        }
    }
}
