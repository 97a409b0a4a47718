//! Shared protocol constants for the failover replication transport

// Handshake frame header constants
pub const MAGIC: &[u8; 4] = b"FOFR";
pub const FRAME_VERSION: u16 = 1;

// Replication stream version carried in the START payload
pub const PROTOCOL_VERSION: i32 = 1;

// Handshake frames are small; anything larger is hostile
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Fixed chunk width used by the chunked delta sub-protocol and as the
/// upper bound of any single data block on the wire.
pub const CHUNK_SIZE: usize = 1 << 20;

/// Largest number of chunks a candidate may have (chunk index is a signed 32-bit value).
pub const MAX_CHUNKS: u64 = i32::MAX as u64;

/// Upper bound on slots per batch.
pub const MAX_BATCH_SIZE: i32 = 10_000;

/// Batch size that terminates the record stream.
pub const END_OF_BATCHES: i32 = -1;

/// Upper bound on UTF string payloads (paths, symlink targets, source ids).
pub const MAX_UTF_LEN: usize = 65_535;

// Frame type IDs for the handshake
pub mod frame {
    pub const START: u8 = 1;
    pub const OK: u8 = 2;
    pub const ERROR: u8 = 3;
}

// Single-byte control tokens used after the handshake
pub mod token {
    pub const NEXT: u8 = 0;
    pub const DONE: u8 = 1;
    pub const NEXT_CHUNK: u8 = 2;
}

// Per-slot batch result codes
pub mod result {
    pub const NO_CHANGE: u8 = 0;
    pub const MODIFIED: u8 = 1;
    pub const MODIFIED_REQUEST_DATA: u8 = 2;
    pub const MODIFIED_REQUEST_DATA_CHUNKED: u8 = 3;
}

// POSIX file type bits as carried in the mode word
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFSOCK: u32 = 0o140000;
    pub const S_IFLNK: u32 = 0o120000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;
    pub const PERMISSIONS: u32 = 0o7777;
}

/// Number of chunks covering `size` bytes.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 * 7 / 2), 4);
    }
}
