//! Core Journal implementation

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use eyre::{Context, Result, eyre};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{ARCHIVE_DIR, LOCK_FILE, STREAM_EXTENSION, now_ms};

/// One line of a stream file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry<T> {
    /// Position within the stream, starting at 1
    pub seq: u64,
    /// Append time (unix ms)
    pub at_ms: i64,
    /// The journaled record
    pub record: T,
}

/// Borrowing twin of [`Entry`] so appends don't clone the record
#[derive(Serialize)]
struct EntryRef<'a, T> {
    seq: u64,
    at_ms: i64,
    record: &'a T,
}

/// Statistics for a single stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub stream: String,
    pub entries: usize,
    pub bytes: u64,
    pub archived: bool,
}

/// Exclusive claim on a journal directory, released on drop
#[derive(Debug)]
pub struct JournalLock {
    file: File,
    path: PathBuf,
}

impl JournalLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release journal lock");
        }
        debug!(path = %self.path.display(), "Released journal lock");
    }
}

/// Append-only journal rooted at a directory
pub struct Journal {
    root: PathBuf,
    /// Last sequence number handed out per live stream
    sequences: Mutex<HashMap<String, u64>>,
}

/// Stream names become file names, so keep them boring
pub fn validate_stream_name(stream: &str) -> Result<()> {
    if stream.is_empty() {
        return Err(eyre!("Stream name must not be empty"));
    }
    if stream.starts_with('.') {
        return Err(eyre!("Stream name must not start with '.': {}", stream));
    }
    if let Some(bad) = stream
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(eyre!("Invalid character {:?} in stream name: {}", bad, stream));
    }
    Ok(())
}

impl Journal {
    /// Open or create a journal at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(root.join(ARCHIVE_DIR)).context("Failed to create journal directory")?;
        debug!(?root, "Opened journal");
        Ok(Self {
            root,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of this journal
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Claim the journal for a single writer process
    ///
    /// Fails immediately while another [`JournalLock`] on the same directory
    /// is alive, in this process or any other.
    pub fn lock_exclusive(&self) -> Result<JournalLock> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .context(format!("Failed to open lock file: {}", path.display()))?;
        file.try_lock_exclusive()
            .map_err(|e| eyre!("Journal {} is in use by another process: {}", self.root.display(), e))?;
        info!(path = %path.display(), "Acquired journal lock");
        Ok(JournalLock { file, path })
    }

    fn live_path(&self, stream: &str) -> Result<PathBuf> {
        validate_stream_name(stream)?;
        Ok(self.root.join(format!("{}.{}", stream, STREAM_EXTENSION)))
    }

    fn archive_path(&self, stream: &str) -> Result<PathBuf> {
        validate_stream_name(stream)?;
        Ok(self
            .root
            .join(ARCHIVE_DIR)
            .join(format!("{}.{}", stream, STREAM_EXTENSION)))
    }

    /// Append a record to a stream, returning its sequence number
    pub fn append<T: Serialize>(&self, stream: &str, record: &T) -> Result<u64> {
        let path = self.live_path(stream)?;
        let mut sequences = self
            .sequences
            .lock()
            .map_err(|_| eyre!("Journal sequence table poisoned"))?;

        let seq = match sequences.get(stream) {
            Some(last) => last + 1,
            None => last_seq(&path)? + 1,
        };

        let line = serde_json::to_string(&EntryRef {
            seq,
            at_ms: now_ms(),
            record,
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open stream file: {}", path.display()))?;
        file.lock_exclusive()
            .context(format!("Failed to lock stream file: {}", path.display()))?;
        terminate_torn_line(&mut file, &path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;

        sequences.insert(stream.to_string(), seq);
        debug!(%stream, seq, "Journal::append: written");
        Ok(seq)
    }

    /// Read every entry of a live stream
    pub fn read<T: DeserializeOwned>(&self, stream: &str) -> Result<Vec<Entry<T>>> {
        read_entries(&self.live_path(stream)?)
    }

    /// Read every entry of an archived stream
    pub fn read_archived<T: DeserializeOwned>(&self, stream: &str) -> Result<Vec<Entry<T>>> {
        read_entries(&self.archive_path(stream)?)
    }

    /// Read a stream wherever it lives, preferring the live copy
    pub fn read_any<T: DeserializeOwned>(&self, stream: &str) -> Result<Vec<Entry<T>>> {
        let live = self.live_path(stream)?;
        if live.exists() {
            return read_entries(&live);
        }
        self.read_archived(stream)
    }

    /// Names of all live streams, sorted
    pub fn streams(&self) -> Result<Vec<String>> {
        list_streams(&self.root)
    }

    /// Names of all archived streams, sorted
    pub fn archived_streams(&self) -> Result<Vec<String>> {
        list_streams(&self.root.join(ARCHIVE_DIR))
    }

    /// Move a live stream into the archive
    ///
    /// Returns false if the stream did not exist. If an archived stream of the
    /// same name exists, the live entries are appended to it.
    pub fn archive(&self, stream: &str) -> Result<bool> {
        let live = self.live_path(stream)?;
        let archived = self.archive_path(stream)?;
        let mut sequences = self
            .sequences
            .lock()
            .map_err(|_| eyre!("Journal sequence table poisoned"))?;

        if !live.exists() {
            debug!(%stream, "Journal::archive: stream does not exist");
            return Ok(false);
        }

        if archived.exists() {
            let content = fs::read_to_string(&live)?;
            let mut file = OpenOptions::new().read(true).append(true).open(&archived)?;
            file.lock_exclusive()?;
            terminate_torn_line(&mut file, &archived)?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
            fs::remove_file(&live)?;
        } else {
            fs::rename(&live, &archived).context(format!("Failed to archive stream: {}", stream))?;
        }

        sequences.remove(stream);
        info!(%stream, "Archived stream");
        Ok(true)
    }

    /// Statistics for a stream (live first, then archive)
    pub fn stats(&self, stream: &str) -> Result<StreamStats> {
        let live = self.live_path(stream)?;
        let (path, archived) = if live.exists() {
            (live, false)
        } else {
            (self.archive_path(stream)?, true)
        };

        if !path.exists() {
            return Err(eyre!("Stream not found: {}", stream));
        }

        let bytes = fs::metadata(&path)?.len();
        let entries = read_entries::<serde_json::Value>(&path)?.len();
        Ok(StreamStats {
            stream: stream.to_string(),
            entries,
            bytes,
            archived,
        })
    }
}

fn read_entries<T: DeserializeOwned>(path: &Path) -> Result<Vec<Entry<T>>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = fs::File::open(path).context(format!("Failed to open stream file: {}", path.display()))?;
    let mut entries = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Entry<T>>(&line) {
            Ok(entry) => entries.push(entry),
            // A crash mid-append leaves a torn last line
            Err(e) => warn!(path = %path.display(), line = index + 1, error = %e, "Skipping unreadable journal line"),
        }
    }

    Ok(entries)
}

/// End a half-written last line so the next record starts on its own line
fn terminate_torn_line(file: &mut File, path: &Path) -> Result<()> {
    if file.metadata()?.len() == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        warn!(path = %path.display(), "Terminating torn last line before append");
        file.write_all(b"\n")?;
    }
    Ok(())
}

fn last_seq(path: &Path) -> Result<u64> {
    Ok(read_entries::<serde_json::Value>(path)?
        .last()
        .map(|entry| entry.seq)
        .unwrap_or(0))
}

fn list_streams(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut streams: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == STREAM_EXTENSION))
        .filter_map(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .collect();
    streams.sort();
    Ok(streams)
}
