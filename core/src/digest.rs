use std::{
    fmt,
    io::{self, Read},
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Hex-encoded SHA-256 of some content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Invalid digest '{0}': expected {} lowercase hex chars", Digest::HEX_LEN)]
pub struct InvalidDigest(String);

impl Digest {
    pub const HEX_LEN: usize = 64;

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ok = s.len() == Self::HEX_LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if ok {
            Ok(Self(s.to_owned()))
        } else {
            Err(InvalidDigest(s.to_owned()))
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = InvalidDigest;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// Incremental hasher. The result only depends on the bytes fed, not on how they were split.
#[derive(Clone, Default)]
pub struct Digester {
    hasher: Sha256,
}

impl Digester {
    pub const CHUNK_SIZE: usize = 1 << 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.hasher.update(data.as_ref());
    }

    pub fn finalize(self) -> Digest {
        Digest(hex::encode(self.hasher.finalize()))
    }
}

pub fn digest_bytes(data: impl AsRef<[u8]>) -> Digest {
    let mut d = Digester::new();
    d.update(data);
    d.finalize()
}

pub fn digest_reader(reader: impl Read) -> io::Result<Digest> {
    digest_reader_chunked(reader, Digester::CHUNK_SIZE)
}

pub fn digest_reader_chunked(mut reader: impl Read, chunk_size: usize) -> io::Result<Digest> {
    let mut d = Digester::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        d.update(&buf[..n]);
    }
    Ok(d.finalize())
}

pub fn digest_file(path: impl AsRef<Path>) -> fsutil::Result<Digest> {
    let path = path.as_ref();
    let f = fsutil::open(path)?;
    digest_reader(f).map_err(|e| fsutil::Error::SingleIO("Cannot read file", path.to_owned(), e))
}
