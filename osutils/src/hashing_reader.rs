use std::io::{self, Read};

use sha2::{Digest, Sha256};

/// Wraps a reader and computes the SHA-256 digest of everything read through
/// it, keeping count of the bytes consumed.
pub struct HashingReader<R: Read> {
    inner: R,
    digest: Sha256,
    consumed: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: Sha256::new(),
            consumed: 0,
        }
    }

    /// Lowercase hex digest of the bytes read so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.digest.clone().finalize())
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        self.consumed += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn test_digest_and_count() {
        let input = b"Hello, world!";
        let mut reader = HashingReader::new(Cursor::new(&input));

        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();

        assert_eq!(&output, input);
        assert_eq!(reader.consumed(), input.len() as u64);
        assert_eq!(
            reader.hex_digest(),
            "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
        );
    }

    #[test]
    fn test_empty_input() {
        let mut reader = HashingReader::new(Cursor::new(b""));
        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();

        assert_eq!(reader.consumed(), 0);
        assert_eq!(
            reader.hex_digest(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
