//! Directory listings shared by the whole cluster.
//!
//! The master enumerates the real directory and forwards each entry as a
//! `(type, name)` record, then an end marker. Slaves see the same entries in
//! the same order, whatever order the operating system produced on the
//! master.

use crate::error::{Result, Side};
use crate::multiplexer::Multiplexer;
use crate::packet::PacketWriter;
use crate::pipe::{ClusterPipe, PipeChannel};
use crate::replay::{self, ErrorContext, Record, ReplayChannel, Replayable, TAG_END, TAG_ENTRY};
use std::fmt;
use std::fs::{self, FileType, ReadDir};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    /// Sockets, devices, FIFOs
    Other,
    DoesNotExist,
}

impl EntryType {
    fn code(self) -> u8 {
        match self {
            EntryType::File => 1,
            EntryType::Directory => 2,
            EntryType::Symlink => 3,
            EntryType::Other => 4,
            EntryType::DoesNotExist => 0,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            1 => EntryType::File,
            2 => EntryType::Directory,
            3 => EntryType::Symlink,
            4 => EntryType::Other,
            _ => EntryType::DoesNotExist,
        }
    }
}

impl From<FileType> for EntryType {
    fn from(file_type: FileType) -> Self {
        if file_type.is_symlink() {
            EntryType::Symlink
        } else if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_file() {
            EntryType::File
        } else {
            EntryType::Other
        }
    }
}

impl Replayable for EntryType {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        u64::from(self.code()).encode(writer)
    }

    fn decode(record: Record) -> Result<Self> {
        u64::decode(record).map(|code| EntryType::from_code(code as u8))
    }
}

/// One listing step: the next entry, or `None` at the end.
type Step = Option<(EntryType, String)>;

impl Replayable for Step {
    fn encode(&self, writer: &mut PacketWriter<'_>) -> Result<()> {
        match self {
            Some((entry_type, name)) => {
                writer.write(TAG_ENTRY)?;
                writer.write(entry_type.code())?;
                replay::write_text(writer, name)
            }
            None => writer.write(TAG_END),
        }
    }

    fn decode(record: Record) -> Result<Self> {
        match record {
            Record::Entry(code, name) => Ok(Some((EntryType::from_code(code), name))),
            Record::End => Ok(None),
            other => Err(other.unexpected("directory entry")),
        }
    }
}

/// An enumerable directory.
pub trait DirectoryResource: Send + fmt::Debug {
    fn path(&self) -> &Path;

    /// Restart the listing from the first entry.
    fn rewind(&mut self) -> Result<()>;

    /// Advance to the next entry; false once the listing is exhausted.
    fn read_next_entry(&mut self) -> Result<bool>;

    /// Name of the current entry.
    fn entry_name(&self) -> Option<&str>;

    /// Type of the current entry; `DoesNotExist` before the first or after
    /// the last entry.
    fn entry_type(&self) -> EntryType;

    /// Type of a path relative to this directory, without following a
    /// final symlink.
    fn path_type(&mut self, relative: &str) -> Result<EntryType>;

    fn full_path(&self, relative: &str) -> PathBuf {
        self.path().join(relative)
    }

    /// The coupling controls, if this directory is shared through a cluster pipe.
    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        None
    }
}

/// Open the directory at `path` on every node.
pub fn open_directory(
    multiplexer: Option<&Arc<Multiplexer>>,
    path: impl AsRef<Path>,
) -> Result<Box<dyn DirectoryResource>> {
    let path = path.as_ref();
    Ok(match multiplexer {
        Some(mux) if mux.is_master() => Box::new(StandardDirectoryMaster::open(mux, path)?),
        Some(mux) => Box::new(StandardDirectorySlave::open(mux, path)?),
        None => Box::new(LocalDirectory::open(path)?),
    })
}

fn open_context(path: &Path) -> ErrorContext {
    ErrorContext::Open(path.display().to_string())
}

/// A directory read straight from the file system.
#[derive(Debug)]
pub struct LocalDirectory {
    path: PathBuf,
    entries: ReadDir,
    current: Step,
}

impl LocalDirectory {
    pub fn open(path: &Path) -> Result<Self> {
        let entries = fs::read_dir(path).map_err(|e| open_context(path).wrap(e))?;
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            current: None,
        })
    }

    fn rewind_real(&mut self) -> io::Result<()> {
        self.entries = fs::read_dir(&self.path)?;
        self.current = None;
        Ok(())
    }

    fn next_real(&mut self) -> io::Result<Step> {
        let step = match self.entries.next() {
            Some(entry) => {
                let entry = entry?;
                let entry_type = entry.file_type()?.into();
                Some((entry_type, entry.file_name().to_string_lossy().into_owned()))
            }
            None => None,
        };
        self.current = step.clone();
        Ok(step)
    }

    fn path_type_real(&self, relative: &str) -> io::Result<EntryType> {
        match fs::symlink_metadata(self.path.join(relative)) {
            Ok(metadata) => Ok(metadata.file_type().into()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(EntryType::DoesNotExist),
            Err(e) => Err(e),
        }
    }
}

fn current_name(current: &Step) -> Option<&str> {
    current.as_ref().map(|(_, name)| name.as_str())
}

fn current_type(current: &Step) -> EntryType {
    current
        .as_ref()
        .map_or(EntryType::DoesNotExist, |(entry_type, _)| *entry_type)
}

impl DirectoryResource for LocalDirectory {
    fn path(&self) -> &Path {
        &self.path
    }

    fn rewind(&mut self) -> Result<()> {
        Ok(self.rewind_real()?)
    }

    fn read_next_entry(&mut self) -> Result<bool> {
        Ok(self.next_real()?.is_some())
    }

    fn entry_name(&self) -> Option<&str> {
        current_name(&self.current)
    }

    fn entry_type(&self) -> EntryType {
        current_type(&self.current)
    }

    fn path_type(&mut self, relative: &str) -> Result<EntryType> {
        Ok(self.path_type_real(relative)?)
    }
}

/// Master side of a shared directory.
#[derive(Debug)]
pub struct StandardDirectoryMaster {
    channel: ReplayChannel,
    local: LocalDirectory,
}

impl StandardDirectoryMaster {
    pub fn open(multiplexer: &Arc<Multiplexer>, path: &Path) -> Result<Self> {
        let channel = ReplayChannel::open(multiplexer)?;
        let context = open_context(path);
        let local = match fs::read_dir(path) {
            Ok(entries) => {
                channel.forward(Side::Read, Ok(()), &context)?;
                LocalDirectory {
                    path: path.to_path_buf(),
                    entries,
                    current: None,
                }
            }
            Err(e) => return Err(channel.forward_error(Side::Read, e, &context)),
        };
        Ok(Self { channel, local })
    }
}

impl DirectoryResource for StandardDirectoryMaster {
    fn path(&self) -> &Path {
        &self.local.path
    }

    fn rewind(&mut self) -> Result<()> {
        let result = self.local.rewind_real();
        self.channel.forward(Side::Read, result, &ErrorContext::Io)
    }

    fn read_next_entry(&mut self) -> Result<bool> {
        let result = self.local.next_real();
        Ok(self
            .channel
            .forward(Side::Read, result, &ErrorContext::Io)?
            .is_some())
    }

    fn entry_name(&self) -> Option<&str> {
        self.local.entry_name()
    }

    fn entry_type(&self) -> EntryType {
        self.local.entry_type()
    }

    fn path_type(&mut self, relative: &str) -> Result<EntryType> {
        let result = self.local.path_type_real(relative);
        self.channel.forward(Side::Read, result, &ErrorContext::Io)
    }

    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        Some(self)
    }
}

impl PipeChannel for StandardDirectoryMaster {
    fn cluster_pipe(&self) -> &ClusterPipe {
        self.channel.pipe()
    }

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe {
        self.channel.pipe_mut()
    }
}

/// Slave side of a shared directory.
#[derive(Debug)]
pub struct StandardDirectorySlave {
    channel: ReplayChannel,
    path: PathBuf,
    current: Step,
}

impl StandardDirectorySlave {
    pub fn open(multiplexer: &Arc<Multiplexer>, path: &Path) -> Result<Self> {
        let channel = ReplayChannel::open(multiplexer)?;
        channel.replay::<()>(Side::Read, &open_context(path))?;
        Ok(Self {
            channel,
            path: path.to_path_buf(),
            current: None,
        })
    }
}

impl DirectoryResource for StandardDirectorySlave {
    fn path(&self) -> &Path {
        &self.path
    }

    fn rewind(&mut self) -> Result<()> {
        self.channel.replay::<()>(Side::Read, &ErrorContext::Io)?;
        self.current = None;
        Ok(())
    }

    fn read_next_entry(&mut self) -> Result<bool> {
        self.current = self.channel.replay::<Step>(Side::Read, &ErrorContext::Io)?;
        Ok(self.current.is_some())
    }

    fn entry_name(&self) -> Option<&str> {
        current_name(&self.current)
    }

    fn entry_type(&self) -> EntryType {
        current_type(&self.current)
    }

    fn path_type(&mut self, _relative: &str) -> Result<EntryType> {
        self.channel.replay(Side::Read, &ErrorContext::Io)
    }

    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        Some(self)
    }
}

impl PipeChannel for StandardDirectorySlave {
    fn cluster_pipe(&self) -> &ClusterPipe {
        self.channel.pipe()
    }

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe {
        self.channel.pipe_mut()
    }
}
