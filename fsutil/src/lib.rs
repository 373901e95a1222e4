use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File, ReadDir},
    io::{self, BufReader, Read, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};

pub mod error {
    use std::{io, path::PathBuf};

    pub type Result<T> = std::result::Result<T, self::Error>;

    type Msg = &'static str;

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error("{0} ({1}): {2}")]
        SingleIO(Msg, PathBuf, #[source] io::Error),

        #[error("{0} (from='{1}', to='{2}): {3}")]
        FromToIO(Msg, PathBuf, PathBuf, #[source] io::Error),

        #[error("Cannot serialize to JSON (dest='{0}'): {1}")]
        SerializeToJson(PathBuf, #[source] serde_json::Error),

        #[error("Cannot deserialize from JSON (src='{0}'): {1}")]
        DeserializeFromJson(PathBuf, #[source] serde_json::Error),
    }

    impl Error {
        /// The underlying io error kind, if any.
        pub fn io_kind(&self) -> Option<io::ErrorKind> {
            match self {
                Self::SingleIO(_, _, e) | Self::FromToIO(_, _, _, e) => Some(e.kind()),
                _ => None,
            }
        }
    }
}
pub use error::{Error, Result};

const EXECUTABLE_MODE: u32 = 0o755;
const REGULAR_MODE: u32 = 0o644;

#[must_use]
pub fn mkdir_all(path: impl AsRef<Path>) -> Result<()> {
    let dir = path.as_ref();
    fs::create_dir_all(dir).map_err(|e| Error::SingleIO("Cannot create dir", dir.to_owned(), e))
}

#[must_use]
pub fn mkdir_parent(filepath: impl AsRef<Path>) -> Result<()> {
    match filepath.as_ref().parent() {
        Some(dir) if !dir.as_os_str().is_empty() => self::mkdir_all(dir),
        _ => Ok(()),
    }
}

#[must_use]
pub fn remove_dir_all(path: impl AsRef<Path>) -> Result<()> {
    let dir = path.as_ref();
    log::debug!("Removing dir {}", dir.to_string_lossy());
    fs::remove_dir_all(dir).map_err(|e| Error::SingleIO("Cannot remove dir", dir.to_owned(), e))
}

#[must_use]
pub fn write<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    fs::write(&filepath, contents)
        .map_err(|e| Error::SingleIO("Cannot write file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn write_with_mkdir<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    self::mkdir_parent(&filepath)?;
    self::write(filepath, contents)
}

#[must_use]
pub fn read_to_string(filepath: impl AsRef<Path>) -> Result<String> {
    fs::read_to_string(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn read(filepath: impl AsRef<Path>) -> Result<Vec<u8>> {
    fs::read(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn open(filepath: impl AsRef<Path>) -> Result<File> {
    File::open(&filepath)
        .map_err(|e| Error::SingleIO("Cannot open file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn create_with_mkdir(filepath: impl AsRef<Path>) -> Result<File> {
    self::mkdir_parent(&filepath)?;
    File::create(&filepath)
        .map_err(|e| Error::SingleIO("Cannot create file", filepath.as_ref().to_owned(), e))
}

#[must_use]
pub fn remove_file(filepath: impl AsRef<Path>) -> Result<()> {
    fs::remove_file(&filepath)
        .map_err(|e| Error::SingleIO("Cannot remove file", filepath.as_ref().to_owned(), e))
}

/// Same as [`remove_file`] but a missing file is not an error.
#[must_use]
pub fn remove_file_if_exists(filepath: impl AsRef<Path>) -> Result<()> {
    match self::remove_file(filepath) {
        Err(e) if e.io_kind() == Some(io::ErrorKind::NotFound) => Ok(()),
        res => res,
    }
}

#[must_use]
pub fn write_json_with_mkdir<P, T>(filepath: P, data: &T) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let s = serde_json::to_string(data)
        .map_err(|e| Error::SerializeToJson(filepath.as_ref().to_owned(), e))?;
    write_with_mkdir(filepath, &s)
}

#[must_use]
pub fn read_json_with_deserialize<P, T>(filepath: P) -> Result<T>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let filepath = filepath.as_ref();
    let f = self::open(filepath)?;
    serde_json::from_reader(BufReader::new(f))
        .map_err(|e| Error::DeserializeFromJson(filepath.to_owned(), e))
}

#[must_use]
pub fn copy_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    fs::copy(&from, &to).map_err(|e| {
        Error::FromToIO(
            "Cannot copy file",
            from.as_ref().to_owned(),
            to.as_ref().to_owned(),
            e,
        )
    })
}

#[must_use]
pub fn copy_file_with_mkdir(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<u64> {
    self::mkdir_parent(&to)?;
    self::copy_file(from, to)
}

/// Copies at most `maxlen` bytes (everything when `None`) from `reader` into a freshly created `to`.
#[must_use]
pub fn copy_reader_with_mkdir<R: Read>(
    reader: R,
    to: impl AsRef<Path>,
    maxlen: Option<u64>,
) -> Result<u64> {
    let to = to.as_ref();
    let mut dst = self::create_with_mkdir(to)?;
    let copied = match maxlen {
        Some(n) => io::copy(&mut reader.take(n), &mut dst),
        None => {
            let mut reader = reader;
            io::copy(&mut reader, &mut dst)
        }
    };
    copied
        .and_then(|n| dst.flush().map(|_| n))
        .map_err(|e| Error::SingleIO("Cannot write file", to.to_owned(), e))
}

#[must_use]
pub fn read_dir(dir: impl AsRef<Path>) -> Result<ReadDir> {
    fs::read_dir(&dir).map_err(|e| Error::SingleIO("Cannot read dir", dir.as_ref().to_owned(), e))
}

/// Sets mode 0755 when `executable`, 0644 otherwise.
#[must_use]
pub fn set_executable(filepath: impl AsRef<Path>, executable: bool) -> Result<()> {
    let mode = if executable {
        EXECUTABLE_MODE
    } else {
        REGULAR_MODE
    };
    fs::set_permissions(&filepath, fs::Permissions::from_mode(mode)).map_err(|e| {
        Error::SingleIO(
            "Cannot change permissions",
            filepath.as_ref().to_owned(),
            e,
        )
    })
}

/// Whether `filepath` is a regular file with any execute bit set.
/// Missing files are reported as `None`.
pub fn is_executable(filepath: impl AsRef<Path>) -> Option<bool> {
    let meta = fs::metadata(filepath).ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(meta.permissions().mode() & 0o111 != 0)
}
