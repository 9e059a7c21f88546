use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Error that occurs when a control file cannot be opened or read.
#[derive(Debug, thiserror::Error)]
#[error("failed to read `{path}`: {source}")]
pub struct FileReadError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Reads the first line of a kernel control file, without the trailing
/// newline.
///
/// Files like `memory.limit_in_bytes` or `cpuset.effective_cpus` carry a
/// single short line; anything after it is ignored. An empty file yields an
/// empty string.
///
/// # Errors
///
/// Returns a [`FileReadError`] carrying the offending path if the file
/// cannot be opened or read.
///
/// # Example
/// ```no_run
/// # use container_meta::fsutil;
/// let raw = fsutil::read_first_line("/sys/fs/cgroup/cpu/docker/4f1f20f9c661/cpu.shares")?;
/// let shares: i64 = raw.parse().unwrap_or(0);
/// # Ok::<(), fsutil::FileReadError>(())
/// ```
pub fn read_first_line(path: impl AsRef<Path>) -> Result<String, FileReadError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| FileReadError {
        path: path.to_path_buf(),
        source,
    })?;

    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .map_err(|source| FileReadError {
            path: path.to_path_buf(),
            source,
        })?;

    let trimmed_len = line.trim_end().len();
    line.truncate(trimmed_len);
    Ok(line)
}
