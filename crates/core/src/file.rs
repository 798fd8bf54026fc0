//! Files shared by the whole cluster.
//!
//! The master opens the real file; slaves receive a replay of every result
//! the master observes. Reads are served from chunks of at most
//! `max_packet_size - 1` bytes, the same chunks on every node, so any
//! sequence of read calls returns identical bytes everywhere. Writes go to
//! the real file on the master only. While only the read side is coupled,
//! every read is forwarded on its own instead of through shared chunks.
//!
//! Use `open_file` rather than the concrete types: it picks the master,
//! slave or local variant.

use crate::error::{Result, Side};
use crate::multiplexer::Multiplexer;
use crate::pipe::{ClusterPipe, PipeChannel};
use crate::replay::{ChunkBuffer, ErrorContext, ReplayChannel};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How to open a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    /// Create or truncate
    WriteOnly,
    /// Create if missing, keep contents
    ReadWrite,
    /// Create if missing, every write goes to the end
    Append,
}

impl OpenMode {
    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            OpenMode::ReadOnly => options.read(true),
            OpenMode::WriteOnly => options.write(true).create(true).truncate(true),
            OpenMode::ReadWrite => options.read(true).write(true).create(true),
            OpenMode::Append => options.read(true).append(true).create(true),
        };
        options
    }

    fn open(self, path: &Path) -> io::Result<File> {
        self.options().open(path)
    }
}

/// A readable, writable, seekable file.
pub trait SeekableResource: Read + Write + Seek + Send + fmt::Debug {
    fn path(&self) -> &Path;

    /// Current size of the file in bytes.
    fn size(&mut self) -> Result<u64>;

    /// The coupling controls, if this file is shared through a cluster pipe.
    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        None
    }
}

/// Open `path` on every node.
///
/// With a multiplexer, the master opens the file and slaves replay the
/// outcome, including the error if the open fails. Without one, the file is
/// opened locally.
pub fn open_file(
    multiplexer: Option<&Arc<Multiplexer>>,
    path: impl AsRef<Path>,
    mode: OpenMode,
) -> Result<Box<dyn SeekableResource>> {
    let path = path.as_ref();
    Ok(match multiplexer {
        Some(mux) if mux.is_master() => Box::new(StandardFileMaster::open(mux, path, mode)?),
        Some(mux) => Box::new(StandardFileSlave::open(mux, path)?),
        None => Box::new(LocalFile::open(path, mode)?),
    })
}

/// Read side coupled, write side not: the master may write on its own, so
/// slaves cannot serve reads from a chunk of their own. Each read is
/// forwarded as exactly the bytes it returned.
fn reads_per_call(pipe: &ClusterPipe) -> bool {
    pipe.is_read_coupled() && !pipe.is_write_coupled()
}

fn read_retrying(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Master side of a shared file.
#[derive(Debug)]
pub struct StandardFileMaster {
    channel: ReplayChannel,
    file: File,
    path: PathBuf,
    chunk: ChunkBuffer,
    /// Logical position; the real file may be ahead by the unread chunk
    position: u64,
}

impl StandardFileMaster {
    pub fn open(multiplexer: &Arc<Multiplexer>, path: &Path, mode: OpenMode) -> Result<Self> {
        let channel = ReplayChannel::open(multiplexer)?;
        let context = ErrorContext::Open(path.display().to_string());
        let file = match mode.open(path) {
            Ok(file) => {
                channel.forward(Side::Read, Ok(()), &context)?;
                file
            }
            Err(e) => return Err(channel.forward_error(Side::Read, e, &context)),
        };

        Ok(Self {
            channel,
            file,
            path: path.to_path_buf(),
            chunk: ChunkBuffer::default(),
            position: 0,
        })
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if reads_per_call(self.channel.pipe()) {
            let result = self.read_local(buf).map(|n| buf[..n].to_vec());
            let data = self.channel.forward_data(Side::Read, result, &ErrorContext::Io)?;
            return Ok(data.len());
        }
        if self.chunk.is_exhausted() {
            let mut data = vec![0u8; self.channel.max_chunk()];
            let result = read_retrying(&mut self.file, &mut data).map(|n| {
                data.truncate(n);
                data
            });
            let data = self.channel.forward_data(Side::Read, result, &ErrorContext::Io)?;
            if data.is_empty() {
                self.chunk.clear(self.channel.pipe());
                return Ok(0);
            }
            self.chunk.set_owned(self.channel.pipe(), data);
        }

        let n = self.chunk.take_into(buf);
        self.position += n as u64;
        Ok(n)
    }

    /// Serve a read from the chunk, refilling it from the file, without
    /// telling the slaves.
    fn read_local(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.chunk.is_exhausted() {
            let mut data = vec![0u8; self.channel.max_chunk()];
            let n = read_retrying(&mut self.file, &mut data)?;
            if n == 0 {
                self.chunk.clear(self.channel.pipe());
                return Ok(0);
            }
            data.truncate(n);
            self.chunk.set_owned(self.channel.pipe(), data);
        }
        let n = self.chunk.take_into(buf);
        self.position += n as u64;
        Ok(n)
    }

    /// Bring the real file cursor back to the logical position.
    fn sync_cursor(&mut self) -> io::Result<()> {
        if !self.chunk.is_exhausted() {
            self.file.seek(SeekFrom::Start(self.position))?;
        }
        self.chunk.clear(self.channel.pipe());
        Ok(())
    }

    fn write_real(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sync_cursor()?;
        let n = self.file.write(buf)?;
        self.position = self.file.stream_position()?;
        Ok(n)
    }

    fn seek_real(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Current(delta) => {
                let absolute = self.position.checked_add_signed(delta).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
                })?;
                SeekFrom::Start(absolute)
            }
            other => other,
        };
        let new_position = self.file.seek(target)?;
        self.chunk.clear(self.channel.pipe());
        self.position = new_position;
        Ok(new_position)
    }
}

impl Read for StandardFileMaster {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_some(buf)?)
    }
}

impl Write for StandardFileMaster {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.write_real(buf);
        Ok(self.channel.forward(Side::Write, result, &ErrorContext::Io)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.file.flush();
        Ok(self.channel.forward(Side::Write, result, &ErrorContext::Io)?)
    }
}

impl Seek for StandardFileMaster {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let result = self.seek_real(pos);
        Ok(self.channel.forward(Side::Read, result, &ErrorContext::Io)?)
    }
}

impl SeekableResource for StandardFileMaster {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&mut self) -> Result<u64> {
        let result = self.file.metadata().map(|metadata| metadata.len());
        self.channel.forward(Side::Read, result, &ErrorContext::Io)
    }

    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        Some(self)
    }
}

impl PipeChannel for StandardFileMaster {
    fn cluster_pipe(&self) -> &ClusterPipe {
        self.channel.pipe()
    }

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe {
        self.channel.pipe_mut()
    }

    /// Re-coupling the read side moves the real file to the logical position
    /// and tells the slaves where that is. Leaving per-call reads drops the
    /// chunk only the master held.
    fn couple(&mut self, read_coupled: bool, write_coupled: bool) -> Result<()> {
        let rejoin = read_coupled && !self.channel.pipe().is_read_coupled();
        let was_per_call = reads_per_call(self.channel.pipe());
        self.channel.pipe_mut().couple(read_coupled, write_coupled);
        if was_per_call && !reads_per_call(self.channel.pipe()) {
            self.sync_cursor()?;
        }
        if rejoin {
            let position = self.position;
            let result = self.seek_real(SeekFrom::Start(position));
            self.channel.forward(Side::Read, result, &ErrorContext::Io)?;
        }
        Ok(())
    }
}

/// Slave side of a shared file.
#[derive(Debug)]
pub struct StandardFileSlave {
    channel: ReplayChannel,
    path: PathBuf,
    chunk: ChunkBuffer,
}

impl StandardFileSlave {
    pub fn open(multiplexer: &Arc<Multiplexer>, path: &Path) -> Result<Self> {
        let channel = ReplayChannel::open(multiplexer)?;
        let context = ErrorContext::Open(path.display().to_string());
        channel.replay::<()>(Side::Read, &context)?;

        Ok(Self {
            channel,
            path: path.to_path_buf(),
            chunk: ChunkBuffer::default(),
        })
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.channel.pipe().check_slave_access(Side::Read)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if reads_per_call(self.channel.pipe()) {
            self.chunk.clear(self.channel.pipe());
            let packet = self.channel.replay_data(Side::Read, &ErrorContext::Io)?;
            self.chunk.set_received(self.channel.pipe(), packet);
            let n = self.chunk.take_into(buf);
            self.chunk.clear(self.channel.pipe());
            return Ok(n);
        }
        if self.chunk.is_exhausted() {
            self.chunk.clear(self.channel.pipe());
            let packet = self.channel.replay_data(Side::Read, &ErrorContext::Io)?;
            self.chunk.set_received(self.channel.pipe(), packet);
            if self.chunk.is_exhausted() {
                self.chunk.clear(self.channel.pipe());
                return Ok(0);
            }
        }
        Ok(self.chunk.take_into(buf))
    }
}

impl Read for StandardFileSlave {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_some(buf)?)
    }
}

impl Write for StandardFileSlave {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        self.chunk.clear(self.channel.pipe());
        Ok(self.channel.replay::<usize>(Side::Write, &ErrorContext::Io)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.channel.replay::<()>(Side::Write, &ErrorContext::Io)?)
    }
}

impl Seek for StandardFileSlave {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        self.chunk.clear(self.channel.pipe());
        Ok(self.channel.replay::<u64>(Side::Read, &ErrorContext::Io)?)
    }
}

impl SeekableResource for StandardFileSlave {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&mut self) -> Result<u64> {
        self.channel.replay(Side::Read, &ErrorContext::Io)
    }

    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        Some(self)
    }
}

impl PipeChannel for StandardFileSlave {
    fn cluster_pipe(&self) -> &ClusterPipe {
        self.channel.pipe()
    }

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe {
        self.channel.pipe_mut()
    }

    fn couple(&mut self, read_coupled: bool, write_coupled: bool) -> Result<()> {
        let rejoin = read_coupled && !self.channel.pipe().is_read_coupled();
        let was_per_call = reads_per_call(self.channel.pipe());
        self.channel.pipe_mut().couple(read_coupled, write_coupled);
        if was_per_call || rejoin {
            self.chunk.clear(self.channel.pipe());
        }
        if rejoin {
            self.channel.replay::<u64>(Side::Read, &ErrorContext::Io)?;
        }
        Ok(())
    }
}

impl Drop for StandardFileSlave {
    fn drop(&mut self) {
        self.chunk.clear(self.channel.pipe());
    }
}

/// A plain file for single-node runs.
#[derive(Debug)]
pub struct LocalFile {
    file: File,
    path: PathBuf,
}

impl LocalFile {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let file = mode.open(path).map_err(|e| ErrorContext::Open(path.display().to_string()).wrap(e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Read for LocalFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_retrying(&mut self.file, buf)
    }
}

impl Write for LocalFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LocalFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl SeekableResource for LocalFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::error::Error;
    use crate::network::{LoopbackNetwork, NetworkConfig};
    use std::thread;

    fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    /// Run `body` on a master and one slave; returns both results.
    fn on_pair<T, F>(body: F) -> (T, T)
    where
        T: Send + 'static,
        F: Fn(Arc<Multiplexer>) -> T + Send + Sync + 'static,
    {
        let net = LoopbackNetwork::new(2, NetworkConfig::perfect(21));
        let body = Arc::new(body);
        let handles: Vec<_> = (0..2)
            .map(|node| {
                let endpoint = net.endpoint(node);
                let body = Arc::clone(&body);
                thread::spawn(move || {
                    let mux = Multiplexer::new(ClusterConfig::for_node(2, node), endpoint).unwrap();
                    body(mux)
                })
            })
            .collect();
        let mut results = handles.into_iter().map(|h| h.join().unwrap());
        let master = results.next().unwrap();
        let slave = results.next().unwrap();
        (master, slave)
    }

    #[test]
    fn test_local_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.txt");
        {
            let mut file = open_file(None, &path, OpenMode::WriteOnly).unwrap();
            file.write_all(b"local data").unwrap();
        }
        let mut file = open_file(None, &path, OpenMode::ReadOnly).unwrap();
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        assert_eq!(text, "local data");
        assert_eq!(file.size().unwrap(), 10);
        assert!(file.channel().is_none());
    }

    #[test]
    fn test_local_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_file(None, dir.path().join("nope"), OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }

    #[test]
    fn test_seek_and_size_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 256) as u8).collect();
        let path = write_temp(&dir, "seek.bin", &data);

        let (master, slave) = on_pair(move |mux| {
            let mut file = open_file(Some(&mux), &path, OpenMode::ReadOnly).unwrap();
            let size = file.size().unwrap();
            let mut head = [0u8; 10];
            file.read_exact(&mut head).unwrap();
            let pos = file.seek(SeekFrom::Current(100)).unwrap();
            let mut middle = [0u8; 10];
            file.read_exact(&mut middle).unwrap();
            let end = file.seek(SeekFrom::End(-5)).unwrap();
            let mut tail = Vec::new();
            file.read_to_end(&mut tail).unwrap();
            (size, head.to_vec(), pos, middle.to_vec(), end, tail)
        });

        assert_eq!(master, slave);
        assert_eq!(master.0, 4000);
        assert_eq!(master.2, 110);
        assert_eq!(master.3, data[110..120].to_vec());
        assert_eq!(master.4, 3995);
        assert_eq!(master.5, data[3995..].to_vec());
    }

    #[test]
    fn test_write_goes_to_master_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let check_path = path.clone();

        let (master, slave) = on_pair(move |mux| {
            let mut file = open_file(Some(&mux), &path, OpenMode::WriteOnly).unwrap();
            let n = file.write(b"written once").unwrap();
            file.flush().unwrap();
            n
        });

        assert_eq!(master, 12);
        assert_eq!(slave, 12);
        assert_eq!(std::fs::read(check_path).unwrap(), b"written once");
    }

    #[test]
    fn test_recoupled_read_resyncs() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 199) as u8).collect();
        let path = write_temp(&dir, "couple.bin", &data);

        let (master, slave) = on_pair(move |mux| {
            let mut file = open_file(Some(&mux), &path, OpenMode::ReadOnly).unwrap();
            let mut first = [0u8; 16];
            file.read_exact(&mut first).unwrap();

            file.channel().unwrap().couple(false, true).unwrap();
            if mux.is_master() {
                // Local reads while decoupled advance only the master
                let mut skip = [0u8; 100];
                file.read_exact(&mut skip).unwrap();
            } else {
                let mut byte = [0u8; 1];
                assert!(file.read(&mut byte).is_err());
            }
            file.channel().unwrap().couple(true, true).unwrap();

            let mut next = [0u8; 16];
            file.read_exact(&mut next).unwrap();
            (first.to_vec(), next.to_vec())
        });

        assert_eq!(master, slave);
        assert_eq!(master.1, data[116..132].to_vec());
    }

    #[test]
    fn test_master_only_write_keeps_reads_identical() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 199) as u8).collect();
        let path = write_temp(&dir, "mixed.bin", &data);

        let (master, slave) = on_pair(move |mux| {
            let mut file = open_file(Some(&mux), &path, OpenMode::ReadWrite).unwrap();
            let mut first = [0u8; 10];
            file.read_exact(&mut first).unwrap();

            file.channel().unwrap().couple(true, false).unwrap();
            if mux.is_master() {
                file.write_all(b"ZZZZ").unwrap();
            }
            let mut after_write = [0u8; 10];
            file.read_exact(&mut after_write).unwrap();

            file.channel().unwrap().couple(true, true).unwrap();
            let mut recoupled = [0u8; 10];
            file.read_exact(&mut recoupled).unwrap();
            (first.to_vec(), after_write.to_vec(), recoupled.to_vec())
        });

        assert_eq!(master, slave);
        assert_eq!(master.0, data[..10].to_vec());
        assert_eq!(master.1, data[14..24].to_vec());
        assert_eq!(master.2, data[24..34].to_vec());
    }
}
