use sha1::{Digest, Sha1};
use std::io::Read;

/// Lowercase hex SHA-1 of the file at `path`, read in fixed-size chunks so
/// hashing large files does not require loading them whole into memory.
pub fn sha1_hex(path: &str) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_sha1_of_empty_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(
            sha1_hex(path.to_str().unwrap()).unwrap(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn matches_known_sha1_of_abc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha1_hex(path.to_str().unwrap()).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
