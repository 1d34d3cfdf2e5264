//! Shared-memory frame ring reader.
//!
//! The browser writes JPEG frames into a POSIX shared-memory region named
//! `/owl_stream_ctx_<context>`: a fixed little-endian header followed by
//! the payload area. The writer bumps `sequence` (release) after the
//! payload is in place; readers load it (acquire) as the newness and
//! liveness signal, and count any jump larger than one as missed frames.
//!
//! Region layout, byte offsets:
//!
//! ```text
//!   0  magic         u32   0x4F574C46
//!   4  active        u32   writer liveness flag (1 while streaming)
//!   8  context_id    [u8; 64]
//!  72  sequence      u64
//!  80  width         i32
//!  84  height        i32
//!  88  timestamp_ms  i64
//!  96  frame_size    u32
//! 104  payload       ...
//! ```

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use memmap2::Mmap;

pub const SHM_MAGIC: u32 = 0x4F57_4C46;
pub const SHM_NAME_PREFIX: &str = "/owl_stream_ctx_";
pub const SHM_HEADER_SIZE: usize = 104;
/// Payload capacity of a standard region (the writer sizes the object).
pub const SHM_MAX_FRAME: usize = 8 * 1024 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_ACTIVE: usize = 4;
const OFF_CONTEXT_ID: usize = 8;
const OFF_SEQUENCE: usize = 72;
const OFF_WIDTH: usize = 80;
const OFF_HEIGHT: usize = 84;
const OFF_TIMESTAMP: usize = 88;
const OFF_FRAME_SIZE: usize = 96;

/// Poll cadence inside `wait`.
const WAIT_POLL: Duration = Duration::from_millis(5);
/// A frame copied while the writer lapped us is retried this many times.
const TORN_READ_RETRIES: usize = 3;

pub fn shm_name_for_context(context_id: &str) -> String {
    format!("{SHM_NAME_PREFIX}{context_id}")
}

/// One decoded frame, copied out of the ring.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub sequence: u64,
}

#[derive(Debug)]
pub struct ShmFrameReader {
    name: String,
    map: Mmap,
    last_sequence: u64,
    frames_read: u64,
    frames_missed: u64,
}

impl ShmFrameReader {
    /// Open and map the region read-only, verifying the magic number.
    pub fn open(shm_name: &str) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::ffi::CString;
            use std::fs::File;
            use std::os::fd::FromRawFd;

            let c_name = CString::new(shm_name)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad shm name"))?;
            let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let file = unsafe { File::from_raw_fd(fd) };
            let map = unsafe { Mmap::map(&file)? };
            if map.len() < SHM_HEADER_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("shm region too small: {} bytes", map.len()),
                ));
            }
            let reader = Self {
                name: shm_name.to_string(),
                map,
                last_sequence: 0,
                frames_read: 0,
                frames_missed: 0,
            };
            let magic = reader.read_u32(OFF_MAGIC);
            if magic != SHM_MAGIC {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad shm magic 0x{magic:08x} (expected 0x{SHM_MAGIC:08x})"),
                ));
            }
            Ok(reader)
        }
        #[cfg(not(unix))]
        {
            let _ = shm_name;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "video streaming requires POSIX shared memory",
            ))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context_id(&self) -> String {
        let bytes = &self.map[OFF_CONTEXT_ID..OFF_CONTEXT_ID + 64];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(64);
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let b: [u8; 4] = self.map[offset..offset + 4].try_into().unwrap();
        u32::from_le_bytes(b)
    }

    fn read_i32(&self, offset: usize) -> i32 {
        let b: [u8; 4] = self.map[offset..offset + 4].try_into().unwrap();
        i32::from_le_bytes(b)
    }

    fn read_i64(&self, offset: usize) -> i64 {
        let b: [u8; 8] = self.map[offset..offset + 8].try_into().unwrap();
        i64::from_le_bytes(b)
    }

    /// Current writer sequence (acquire — pairs with the writer's release
    /// bump after the payload is written). The mmap base is page-aligned,
    /// so offset 72 is properly aligned for an atomic load.
    pub fn sequence(&self) -> u64 {
        unsafe {
            (*(self.map.as_ptr().add(OFF_SEQUENCE) as *const AtomicU64)).load(Ordering::Acquire)
        }
    }

    /// Whether the writer still flags the stream active.
    pub fn is_active(&self) -> bool {
        let active = unsafe {
            (*(self.map.as_ptr().add(OFF_ACTIVE) as *const AtomicU32)).load(Ordering::Acquire)
        };
        active != 0
    }

    pub fn has_new(&self) -> bool {
        let seq = self.sequence();
        seq != 0 && seq != self.last_sequence
    }

    /// Copy out the latest frame, or `None` when nothing new. Sequence jumps
    /// feed the missed-frames counter; a copy the writer lapped mid-way is
    /// retried.
    pub fn read(&mut self) -> Option<Frame> {
        for _ in 0..=TORN_READ_RETRIES {
            let seq = self.sequence();
            if seq == 0 || seq == self.last_sequence {
                return None;
            }
            let width = self.read_i32(OFF_WIDTH);
            let height = self.read_i32(OFF_HEIGHT);
            let timestamp_ms = self.read_i64(OFF_TIMESTAMP);
            let size = self.read_u32(OFF_FRAME_SIZE) as usize;
            if size == 0 || size > self.map.len() - SHM_HEADER_SIZE {
                return None;
            }
            let data = self.map[SHM_HEADER_SIZE..SHM_HEADER_SIZE + size].to_vec();
            if self.sequence() != seq {
                continue;
            }
            if seq > self.last_sequence + 1 && self.last_sequence != 0 {
                self.frames_missed += seq - self.last_sequence - 1;
            }
            self.last_sequence = seq;
            self.frames_read += 1;
            return Some(Frame {
                data,
                width,
                height,
                timestamp_ms,
                sequence: seq,
            });
        }
        None
    }

    /// Poll until a new frame is available or the timeout elapses. Returns
    /// `false` on timeout or when the writer went inactive.
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.wait_with(timeout, WAIT_POLL).await
    }

    /// `wait` with an explicit poll cadence (streaming loops poll coarser
    /// than snapshot reads).
    pub async fn wait_with(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_new() {
                return true;
            }
            if !self.is_active() {
                return false;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// `(frames_read, frames_missed)`
    pub fn stats(&self) -> (u64, u64) {
        (self.frames_read, self.frames_missed)
    }
}
