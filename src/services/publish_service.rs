use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::errors::PipelineError;
use crate::external::csv_source::{archive_file_name, bars_to_csv};
use crate::models::{Artifact, Bar, SymbolConfig};

/// Writes artifacts under `{root}/{SYMBOL}/`.
#[derive(Debug, Clone)]
pub struct Publisher {
    root: PathBuf,
    keep_dated: bool,
}

impl Publisher {
    pub fn new(root: impl Into<PathBuf>, keep_dated: bool) -> Self {
        Self {
            root: root.into(),
            keep_dated,
        }
    }

    pub fn symbol_dir(&self, symbol: &str) -> PathBuf {
        self.root.join(symbol)
    }

    /// `{root}/{SYMBOL}/{SYMBOL}_chipzones_hybrid.{ext}`
    pub fn latest_path(&self, symbol: &str, extension: &str) -> PathBuf {
        self.symbol_dir(symbol).join(Artifact::latest_name(symbol, extension))
    }

    pub fn dated_path(&self, symbol: &str, date: NaiveDate, extension: &str) -> PathBuf {
        self.symbol_dir(symbol)
            .join(Artifact::dated_name(symbol, date, extension))
    }

    /// Write every file of `artifact` atomically and return the final paths.
    ///
    /// Dated copies go first so the "latest" files only move once the
    /// history is in place. Within each set every file is fully staged before
    /// the first rename, so png and csv switch over back to back.
    pub fn publish(&self, artifact: &Artifact) -> Result<Vec<PathBuf>, PipelineError> {
        let mut written = Vec::new();

        if self.keep_dated {
            let dated = artifact
                .files()
                .into_iter()
                .map(|(ext, bytes)| (self.dated_path(&artifact.symbol, artifact.run_date, ext), reader(bytes)))
                .collect();
            written.extend(commit_together(dated)?);
        }
        let latest = artifact
            .files()
            .into_iter()
            .map(|(ext, bytes)| (self.latest_path(&artifact.symbol, ext), reader(bytes)))
            .collect();
        written.extend(commit_together(latest)?);

        info!(
            "📤 Published {} file(s) for {} under {}",
            written.len(),
            artifact.symbol,
            self.symbol_dir(&artifact.symbol).display()
        );
        Ok(written)
    }
}

fn reader(bytes: &[u8]) -> Box<dyn Read + '_> {
    Box::new(bytes)
}

/// Content fully written to a temporary file next to its destination, not yet visible there.
pub struct StagedFile {
    tmp: NamedTempFile,
    path: PathBuf,
}

impl StagedFile {
    /// Rename into place. Dropping an uncommitted stage removes the temporary file.
    pub fn commit(self) -> io::Result<PathBuf> {
        self.tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(self.path)
    }
}

/// Copy `content` into a synced temporary file in `path`'s directory.
///
/// If reading or writing fails part way, the temporary file is removed and
/// `path` is untouched.
pub fn stage<R: Read + ?Sized>(path: &Path, content: &mut R) -> io::Result<StagedFile> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    io::copy(content, &mut tmp)?;
    tmp.as_file().sync_all()?;
    Ok(StagedFile {
        tmp,
        path: path.to_path_buf(),
    })
}

/// Stage every file, then rename them one after another.
///
/// A staging failure leaves all destinations untouched. Only a failing
/// rename can leave the set half switched.
pub fn commit_together(files: Vec<(PathBuf, Box<dyn Read + '_>)>) -> io::Result<Vec<PathBuf>> {
    let mut staged = Vec::with_capacity(files.len());
    for (path, mut content) in files {
        staged.push(stage(&path, &mut content)?);
    }
    staged.into_iter().map(StagedFile::commit).collect()
}

/// Write `bytes` to `path` via a temporary file in the same directory and a rename.
///
/// Readers see either the previous file or the complete new one.
pub fn write_atomic(path: &Path, mut bytes: &[u8]) -> io::Result<()> {
    let len = bytes.len();
    stage(path, &mut bytes)?.commit()?;
    debug!("Wrote {} ({} bytes)", path.display(), len);
    Ok(())
}

/// Keep the downloaded bars as `{data_dir}/{CODE}_{start}_{end}_{interval}.csv`.
pub fn archive_raw_bars(
    data_dir: &Path,
    symbol: &SymbolConfig,
    end: NaiveDate,
    bars: &[Bar],
) -> Result<PathBuf, PipelineError> {
    let path = data_dir.join(archive_file_name(&symbol.code, symbol.start_date, end, symbol.interval));
    let bytes = bars_to_csv(bars).map_err(|e| PipelineError::Publish(std::io::Error::other(e.to_string())))?;
    write_atomic(&path, &bytes)?;
    Ok(path)
}
