use std::io::{ErrorKind, Read};

use sha2::{Digest, Sha256};

/// Read buffer size used when streaming resources through the digest.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Stream `reader` through SHA-256 in `chunk_size` reads and return the
/// lowercase hex digest. Memory use is bounded by the chunk size.
pub fn hash_reader(mut reader: impl Read, chunk_size: usize) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(to_hex(&hasher.finalize()))
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
