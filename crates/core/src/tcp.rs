//! TCP connections shared by the whole cluster.
//!
//! Only the master connects. Every byte it receives is forwarded in chunks;
//! slaves read the identical byte stream in the identical pieces. What the
//! application writes goes out on the master's socket only.

use crate::error::{Result, Side};
use crate::multiplexer::Multiplexer;
use crate::pipe::{ClusterPipe, PipeChannel};
use crate::replay::{ChunkBuffer, ErrorContext, ReplayChannel};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A bidirectional byte stream to a remote host.
pub trait NetResource: Read + Write + Send + fmt::Debug {
    /// Wait up to `timeout` for readable data; true if a read would not
    /// block (data or end of stream).
    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool>;

    /// Shut down the read and/or write half.
    fn shutdown(&mut self, read: bool, write: bool) -> Result<()>;

    fn peer_addr(&mut self) -> Result<SocketAddr>;

    /// The coupling controls, if this connection is shared through a cluster pipe.
    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        None
    }
}

/// Connect to `host:port` on every node.
pub fn open_tcp_pipe(
    multiplexer: Option<&Arc<Multiplexer>>,
    host: &str,
    port: u16,
) -> Result<Box<dyn NetResource>> {
    Ok(match multiplexer {
        Some(mux) if mux.is_master() => Box::new(TcpPipeMaster::connect(mux, host, port)?),
        Some(mux) => Box::new(TcpPipeSlave::connect(mux, host, port)?),
        None => Box::new(LocalTcpPipe::connect(host, port)?),
    })
}

fn connect_context(host: &str, port: u16) -> ErrorContext {
    ErrorContext::Open(format!("{}:{}", host, port))
}

fn shutdown_mode(read: bool, write: bool) -> Option<Shutdown> {
    match (read, write) {
        (true, true) => Some(Shutdown::Both),
        (true, false) => Some(Shutdown::Read),
        (false, true) => Some(Shutdown::Write),
        (false, false) => None,
    }
}

/// Probe the socket for readable data without consuming it.
fn poll_readable(stream: &TcpStream, timeout: Duration) -> io::Result<bool> {
    // A zero read timeout means "block forever" to the OS
    stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
    let mut probe = [0u8; 1];
    let ready = match stream.peek(&mut probe) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(false),
        Err(e) => Err(e),
    };
    stream.set_read_timeout(None)?;
    ready
}

/// Master side of a shared connection.
#[derive(Debug)]
pub struct TcpPipeMaster {
    channel: ReplayChannel,
    stream: TcpStream,
    chunk: ChunkBuffer,
}

impl TcpPipeMaster {
    pub fn connect(multiplexer: &Arc<Multiplexer>, host: &str, port: u16) -> Result<Self> {
        let channel = ReplayChannel::open(multiplexer)?;
        let context = connect_context(host, port);
        let stream = match TcpStream::connect((host, port)) {
            Ok(stream) => {
                channel.forward(Side::Read, Ok(()), &context)?;
                stream
            }
            Err(e) => return Err(channel.forward_error(Side::Read, e, &context)),
        };
        debug!(host, port, pipe_id = channel.pipe().pipe_id(), "connected shared TCP pipe");

        Ok(Self {
            channel,
            stream,
            chunk: ChunkBuffer::default(),
        })
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.chunk.is_exhausted() {
            let mut data = vec![0u8; self.channel.max_chunk()];
            let result = loop {
                match self.stream.read(&mut data) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            };
            let result = result.map(|n| {
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
        Ok(self.chunk.take_into(buf))
    }
}

impl Read for TcpPipeMaster {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_some(buf)?)
    }
}

impl Write for TcpPipeMaster {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = self.stream.write(buf);
        Ok(self.channel.forward(Side::Write, result, &ErrorContext::Io)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        let result = self.stream.flush();
        Ok(self.channel.forward(Side::Write, result, &ErrorContext::Io)?)
    }
}

impl NetResource for TcpPipeMaster {
    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        if !self.chunk.is_exhausted() {
            return Ok(true);
        }
        let result = poll_readable(&self.stream, timeout);
        self.channel.forward(Side::Read, result, &ErrorContext::Io)
    }

    fn shutdown(&mut self, read: bool, write: bool) -> Result<()> {
        let Some(how) = shutdown_mode(read, write) else {
            return Ok(());
        };
        let result = self.stream.shutdown(how);
        self.channel.forward(Side::Write, result, &ErrorContext::Io)
    }

    fn peer_addr(&mut self) -> Result<SocketAddr> {
        let result = self.stream.peer_addr();
        self.channel.forward(Side::Read, result, &ErrorContext::Io)
    }

    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        Some(self)
    }
}

impl PipeChannel for TcpPipeMaster {
    fn cluster_pipe(&self) -> &ClusterPipe {
        self.channel.pipe()
    }

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe {
        self.channel.pipe_mut()
    }

    /// Re-coupling the read side hands the slaves whatever the master has
    /// buffered but not yet consumed.
    fn couple(&mut self, read_coupled: bool, write_coupled: bool) -> Result<()> {
        let rejoin = read_coupled && !self.channel.pipe().is_read_coupled();
        self.channel.pipe_mut().couple(read_coupled, write_coupled);
        if rejoin {
            let pending = self.chunk.remaining().to_vec();
            self.channel.forward_data(Side::Read, Ok(pending), &ErrorContext::Io)?;
        }
        Ok(())
    }
}

/// Slave side of a shared connection.
#[derive(Debug)]
pub struct TcpPipeSlave {
    channel: ReplayChannel,
    chunk: ChunkBuffer,
}

impl TcpPipeSlave {
    pub fn connect(multiplexer: &Arc<Multiplexer>, host: &str, port: u16) -> Result<Self> {
        let channel = ReplayChannel::open(multiplexer)?;
        channel.replay::<()>(Side::Read, &connect_context(host, port))?;
        Ok(Self {
            channel,
            chunk: ChunkBuffer::default(),
        })
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.channel.pipe().check_slave_access(Side::Read)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.chunk.is_exhausted() {
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

impl Read for TcpPipeSlave {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_some(buf)?)
    }
}

impl Write for TcpPipeSlave {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Ok(self.channel.replay::<usize>(Side::Write, &ErrorContext::Io)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.channel.replay::<()>(Side::Write, &ErrorContext::Io)?)
    }
}

impl NetResource for TcpPipeSlave {
    fn wait_for_data(&mut self, _timeout: Duration) -> Result<bool> {
        self.channel.pipe().check_slave_access(Side::Read)?;
        if !self.chunk.is_exhausted() {
            return Ok(true);
        }
        self.channel.replay(Side::Read, &ErrorContext::Io)
    }

    fn shutdown(&mut self, read: bool, write: bool) -> Result<()> {
        if shutdown_mode(read, write).is_none() {
            return Ok(());
        }
        self.channel.replay(Side::Write, &ErrorContext::Io)
    }

    fn peer_addr(&mut self) -> Result<SocketAddr> {
        self.channel.replay(Side::Read, &ErrorContext::Io)
    }

    fn channel(&mut self) -> Option<&mut dyn PipeChannel> {
        Some(self)
    }
}

impl PipeChannel for TcpPipeSlave {
    fn cluster_pipe(&self) -> &ClusterPipe {
        self.channel.pipe()
    }

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe {
        self.channel.pipe_mut()
    }

    fn couple(&mut self, read_coupled: bool, write_coupled: bool) -> Result<()> {
        let rejoin = read_coupled && !self.channel.pipe().is_read_coupled();
        self.channel.pipe_mut().couple(read_coupled, write_coupled);
        if rejoin {
            let packet = self.channel.replay_data(Side::Read, &ErrorContext::Io)?;
            self.chunk.set_received(self.channel.pipe(), packet);
        }
        Ok(())
    }
}

impl Drop for TcpPipeSlave {
    fn drop(&mut self) {
        self.chunk.clear(self.channel.pipe());
    }
}

/// A plain TCP connection for single-node runs.
#[derive(Debug)]
pub struct LocalTcpPipe {
    stream: TcpStream,
}

impl LocalTcpPipe {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).map_err(|e| connect_context(host, port).wrap(e))?;
        Ok(Self { stream })
    }
}

impl Read for LocalTcpPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for LocalTcpPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl NetResource for LocalTcpPipe {
    fn wait_for_data(&mut self, timeout: Duration) -> Result<bool> {
        Ok(poll_readable(&self.stream, timeout)?)
    }

    fn shutdown(&mut self, read: bool, write: bool) -> Result<()> {
        if let Some(how) = shutdown_mode(read, write) {
            self.stream.shutdown(how)?;
        }
        Ok(())
    }

    fn peer_addr(&mut self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}
