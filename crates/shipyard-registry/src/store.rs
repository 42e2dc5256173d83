use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::RegistryError;

/// Storage seam behind the registry. Call sites only ever append, update the
/// newest matching record, or read the tail.
pub trait RecordStore<T> {
    fn append(&self, record: &T) -> Result<(), RegistryError>;

    /// Scan newest-first, apply `update` to the first record accepted by
    /// `matches` and persist. Returns the updated record, if any.
    fn find_and_update<M, U>(&self, matches: M, update: U) -> Result<Option<T>, RegistryError>
    where
        M: Fn(&T) -> bool,
        U: FnOnce(&mut T);

    /// Up to `limit` newest records, oldest first.
    fn scan_recent(&self, limit: usize) -> Result<Vec<T>, RegistryError>;
}

/// One JSON object per line. Lines that do not decode are skipped on read and
/// written back untouched on rewrite.
#[derive(Debug)]
pub struct JsonlStore<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonlStore<T> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone())
    }
}

enum Line<T> {
    Record(T),
    Raw(String),
}

impl<T> JsonlStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Serialize + DeserializeOwned> JsonlStore<T> {
    fn read_lines(&self) -> Result<Vec<Line<T>>, RegistryError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(RegistryError::io(&self.path, err)),
        };

        let mut lines = Vec::new();
        for (idx, raw) in data.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(raw) {
                Ok(record) => lines.push(Line::Record(record)),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        line = idx + 1,
                        error = %err,
                        "skipping unreadable registry line"
                    );
                    lines.push(Line::Raw(raw.to_string()));
                }
            }
        }
        Ok(lines)
    }

    fn rewrite(&self, lines: &[Line<T>]) -> Result<(), RegistryError> {
        let mut out = String::new();
        for line in lines {
            match line {
                Line::Record(record) => out.push_str(&serde_json::to_string(record)?),
                Line::Raw(raw) => out.push_str(raw),
            }
            out.push('\n');
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, out).map_err(|err| RegistryError::io(&tmp_path, err))?;
        fs::rename(&tmp_path, &self.path).map_err(|err| RegistryError::io(&self.path, err))
    }

    fn ensure_parent(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| RegistryError::io(parent, err))?;
            }
        }
        Ok(())
    }
}

impl<T: Serialize + DeserializeOwned + Clone> RecordStore<T> for JsonlStore<T> {
    fn append(&self, record: &T) -> Result<(), RegistryError> {
        self.ensure_parent()?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| RegistryError::io(&self.path, err))?;

        // A crash mid-append can leave a partial last line; start on a fresh one.
        let len = file
            .metadata()
            .map_err(|err| RegistryError::io(&self.path, err))?
            .len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))
                .and_then(|_| file.read_exact(&mut last))
                .map_err(|err| RegistryError::io(&self.path, err))?;
            if last[0] != b'\n' {
                line.insert(0, '\n');
            }
        }

        file.write_all(line.as_bytes())
            .map_err(|err| RegistryError::io(&self.path, err))
    }

    fn find_and_update<M, U>(&self, matches: M, update: U) -> Result<Option<T>, RegistryError>
    where
        M: Fn(&T) -> bool,
        U: FnOnce(&mut T),
    {
        let mut lines = self.read_lines()?;
        let hit = lines.iter_mut().rev().find_map(|line| match line {
            Line::Record(record) if matches(&*record) => Some(record),
            _ => None,
        });
        let Some(record) = hit else {
            return Ok(None);
        };
        update(record);
        let updated = record.clone();
        self.rewrite(&lines)?;
        Ok(Some(updated))
    }

    fn scan_recent(&self, limit: usize) -> Result<Vec<T>, RegistryError> {
        let mut recent: Vec<T> = self
            .read_lines()?
            .into_iter()
            .rev()
            .filter_map(|line| match line {
                Line::Record(record) => Some(record),
                Line::Raw(_) => None,
            })
            .take(limit)
            .collect();
        recent.reverse();
        Ok(recent)
    }
}
