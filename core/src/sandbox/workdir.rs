use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use crate::digest::Digest;
use crate::storage::ContentStore;

/// A private working directory for sandboxed processes.
/// Removed when dropped, including during unwinding.
#[derive(Debug)]
pub struct Workdir {
    dir: TempDir,
}

impl Workdir {
    const PREFIX: &str = "sandbox-";

    pub fn create_in(root: impl AsRef<Path>) -> fsutil::Result<Self> {
        let root = root.as_ref();
        fsutil::mkdir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(Self::PREFIX)
            .tempdir_in(root)
            .map_err(|e| fsutil::Error::SingleIO("Cannot create sandbox dir", root.to_owned(), e))?;
        log::debug!("Created sandbox dir {}", dir.path().to_string_lossy());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Resolves a sandbox-relative path. Absolute paths are returned unchanged.
    pub fn relative_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(path)
    }

    pub fn stage_bytes(
        &self,
        dest: impl AsRef<Path>,
        contents: impl AsRef<[u8]>,
        executable: bool,
    ) -> fsutil::Result<()> {
        let dest = self.relative_path(dest);
        fsutil::write_with_mkdir(&dest, contents)?;
        fsutil::set_executable(&dest, executable)
    }

    pub fn stage_path(
        &self,
        dest: impl AsRef<Path>,
        src: impl AsRef<Path>,
        executable: bool,
    ) -> fsutil::Result<()> {
        let dest = self.relative_path(dest);
        fsutil::copy_file_with_mkdir(src, &dest)?;
        fsutil::set_executable(&dest, executable)
    }

    pub fn stage_digest(
        &self,
        dest: impl AsRef<Path>,
        store: &ContentStore,
        digest: &Digest,
        executable: bool,
    ) -> fsutil::Result<()> {
        let dest = self.relative_path(dest);
        store.copy_to(digest, &dest, None)?;
        fsutil::set_executable(&dest, executable)
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.relative_path(path).is_file()
    }

    pub fn is_executable(&self, path: impl AsRef<Path>) -> Option<bool> {
        fsutil::is_executable(self.relative_path(path))
    }

    pub fn read_bytes(&self, path: impl AsRef<Path>) -> fsutil::Result<Vec<u8>> {
        fsutil::read(self.relative_path(path))
    }

    pub fn read_to_string_lossy(&self, path: impl AsRef<Path>) -> fsutil::Result<String> {
        let bytes = self.read_bytes(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Stores a sandbox file into the content store, keeping at most `maxlen` bytes.
    pub fn read_to_store(
        &self,
        path: impl AsRef<Path>,
        store: &ContentStore,
        maxlen: Option<u64>,
    ) -> fsutil::Result<Digest> {
        let f = fsutil::open(self.relative_path(path))?;
        match maxlen {
            Some(n) => store.put_reader(f.take(n)),
            None => store.put_reader(f),
        }
    }

    /// Copies a sandbox file out to `dest`, keeping at most `maxlen` bytes.
    pub fn copy_out(
        &self,
        path: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        maxlen: Option<u64>,
    ) -> fsutil::Result<u64> {
        let f = fsutil::open(self.relative_path(path))?;
        fsutil::copy_reader_with_mkdir(f, dest, maxlen)
    }

    pub(crate) fn append_command_log(&self, line: &str) {
        let path = self.relative_path(super::COMMANDS_LOG);
        let res = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = res {
            log::warn!("Cannot append to {}: {}", path.to_string_lossy(), e);
        }
    }

    pub fn destroy(self) -> fsutil::Result<()> {
        let path = self.dir.path().to_owned();
        self.dir
            .close()
            .map_err(|e| fsutil::Error::SingleIO("Cannot remove sandbox dir", path, e))
    }
}
