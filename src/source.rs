/*
  printhost, a 3D printer build controller.
  Copyright (C) 2023 the printhost developers.

  printhost is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  printhost is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Sources of G-code lines for the build pipeline.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Error)]
/// The ways in which opening or reading a G-code source can fail.
pub enum Error {
    /// An I/O error occurred while opening or scanning the source.
    #[error("failed to read G-code source: {0}")]
    Io(#[from] io::Error),
}

/// An iterator over the lines of a source.
/// Each item may individually fail with an I/O error for file-backed sources.
pub type Lines<'a> = Box<dyn Iterator<Item = io::Result<String>> + Send + 'a>;

/// A restartable, lazy, finite sequence of G-code text lines.
///
/// Every call to `lines` starts over from the first line, so the same source
/// can back several build attempts (and the estimator) without rewinding
/// state by hand.
pub trait GCodeSource: Send + Sync {
    /// A human-readable name for this source, used in logs and events.
    fn name(&self) -> &str;

    /// An approximate number of lines in the source, used for progress
    /// reporting. Exact for in-memory sources.
    fn line_count(&self) -> usize;

    /// Open a fresh iterator over the lines of the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be opened.
    fn lines(&self) -> Result<Lines<'_>, Error>;
}

/// An in-memory G-code source.
///
/// Warmup and cooldown blocks from the machine configuration are loaded
/// through this type, and tests use it to script builds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StringSource {
    name: String,
    lines: Vec<String>,
}

impl StringSource {
    /// Construct a source from a newline-separated block of G-code.
    pub fn from_block(name: &str, block: &str) -> StringSource {
        StringSource {
            name: name.to_owned(),
            lines: block.lines().map(String::from).collect(),
        }
    }

    /// Construct a source from pre-split lines.
    pub fn from_lines(name: &str, lines: Vec<String>) -> StringSource {
        StringSource {
            name: name.to_owned(),
            lines,
        }
    }

    /// Whether the source contains no lines at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl GCodeSource for StringSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn lines(&self) -> Result<Lines<'_>, Error> {
        Ok(Box::new(self.lines.iter().cloned().map(Ok)))
    }
}

/// A G-code source backed by a file on the host.
///
/// The line count is taken once at construction; the file is reopened on
/// every `lines` call so the source stays restartable.
#[derive(Debug)]
pub struct FileSource {
    name: String,
    path: PathBuf,
    count: usize,
}

impl FileSource {
    /// Open a file source, scanning it once to count its lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or read.
    pub fn open(path: impl AsRef<Path>) -> Result<FileSource, Error> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

        let mut count = 0;
        for line in BufReader::new(File::open(&path)?).lines() {
            line?;
            count += 1;
        }

        Ok(FileSource { name, path, count })
    }

    /// The path this source reads from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GCodeSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn line_count(&self) -> usize {
        self.count
    }

    fn lines(&self) -> Result<Lines<'_>, Error> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(Box::new(reader.lines()))
    }
}
