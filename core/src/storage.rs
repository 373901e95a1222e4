use std::{
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::digest::{Digest, Digester};

/// Content-addressed blob store on the local file system.
///
/// Blobs live at `<root>/<first 2 hex chars>/<remaining hex chars>`. A blob is written to
/// a temporary file inside the store and renamed into place, so readers never observe a
/// partial blob and writing the same content twice is harmless.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

struct HashingWriter<W> {
    inner: W,
    digester: Digester,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ContentStore {
    const TMP_DIR: &str = ".tmp";

    pub fn open(root: impl Into<PathBuf>) -> fsutil::Result<Self> {
        let root = root.into();
        fsutil::mkdir_all(root.join(Self::TMP_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, digest: &Digest) -> PathBuf {
        let (dir, rest) = digest.as_str().split_at(2);
        self.root.join(dir).join(rest)
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.path_of(digest).is_file()
    }

    pub fn put_reader(&self, mut reader: impl Read) -> fsutil::Result<Digest> {
        let tmp_dir = self.root.join(Self::TMP_DIR);
        let tmp = NamedTempFile::new_in(&tmp_dir)
            .map_err(|e| fsutil::Error::SingleIO("Cannot create temp blob", tmp_dir.clone(), e))?;

        let mut w = HashingWriter {
            inner: tmp,
            digester: Digester::new(),
        };
        io::copy(&mut reader, &mut w)
            .and_then(|_| w.flush())
            .map_err(|e| fsutil::Error::SingleIO("Cannot write temp blob", tmp_dir.clone(), e))?;
        let HashingWriter { inner: tmp, digester } = w;
        let digest = digester.finalize();

        let dest = self.path_of(&digest);
        if dest.is_file() {
            return Ok(digest);
        }
        fsutil::mkdir_parent(&dest)?;
        tmp.persist(&dest).map_err(|e| {
            fsutil::Error::FromToIO("Cannot store blob", e.file.path().to_owned(), dest, e.error)
        })?;
        log::debug!("Stored blob {}", digest);
        Ok(digest)
    }

    pub fn put_bytes(&self, data: impl AsRef<[u8]>) -> fsutil::Result<Digest> {
        self.put_reader(data.as_ref())
    }

    pub fn put_path(&self, path: impl AsRef<Path>) -> fsutil::Result<Digest> {
        let f = fsutil::open(path)?;
        self.put_reader(f)
    }

    pub fn open_blob(&self, digest: &Digest) -> fsutil::Result<File> {
        fsutil::open(self.path_of(digest))
    }

    pub fn read(&self, digest: &Digest) -> fsutil::Result<Vec<u8>> {
        fsutil::read(self.path_of(digest))
    }

    /// Writes the blob to `dest`, keeping at most `maxlen` bytes.
    pub fn copy_to(
        &self,
        digest: &Digest,
        dest: impl AsRef<Path>,
        maxlen: Option<u64>,
    ) -> fsutil::Result<u64> {
        let f = self.open_blob(digest)?;
        fsutil::copy_reader_with_mkdir(f, dest, maxlen)
    }
}
