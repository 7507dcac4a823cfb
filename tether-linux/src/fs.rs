//! Directory-backed filesystem: one flat directory, one file per stored record.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use tether_core::storage::{Entry, Filesystem};

pub struct DirFs {
    root: PathBuf,
    /// Open handle for the file currently being appended to.
    writer: Option<(String, File)>,
}

impl DirFs {
    /// Open `root`, creating it if missing.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, writer: None })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn close_writer(&mut self, name: &str) -> io::Result<()> {
        if let Some((open, mut file)) = self.writer.take() {
            if open == name {
                file.flush()?;
            } else {
                self.writer = Some((open, file));
            }
        }
        Ok(())
    }
}

impl Filesystem for DirFs {
    fn entries(&self) -> io::Result<Vec<Entry>> {
        let mut out = Vec::new();
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let meta = dirent.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = dirent.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs());
            out.push(Entry {
                name,
                size: meta.len(),
                modified,
            });
        }
        Ok(out)
    }

    fn create(&mut self, name: &str) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path(name))?;
        self.writer = Some((name.to_string(), file));
        Ok(())
    }

    fn append(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        if let Some((open, file)) = self.writer.as_mut() {
            if open == name {
                return file.write_all(data);
            }
        }
        let mut file = OpenOptions::new().append(true).open(self.path(name))?;
        file.write_all(data)?;
        self.writer = Some((name.to_string(), file));
        Ok(())
    }

    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = File::open(self.path(name))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        self.close_writer(from)?;
        fs::rename(self.path(from), self.path(to))
    }

    fn remove(&mut self, name: &str) -> io::Result<()> {
        if matches!(&self.writer, Some((open, _)) if open == name) {
            self.writer = None;
        }
        fs::remove_file(self.path(name))
    }
}
