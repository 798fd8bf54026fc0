//! `MulticastPipe`: a byte stream from the master to every slave.
//!
//! The master fills one packet at a time and sends it when it is full, when
//! flushed, before a coupling change and on drop. Slaves read straight out of
//! received packets; each packet becomes the read buffer without a copy and
//! goes back to the pool once consumed.
//!
//! # Example
//!
//! ```no_run
//! use cluster_pipe_core::{MulticastPipe, Multiplexer, PipeChannel};
//! use std::sync::Arc;
//!
//! fn share_seed(mux: &Arc<Multiplexer>) -> cluster_pipe_core::Result<u64> {
//!     let mut pipe = MulticastPipe::open(mux)?;
//!     if mux.is_master() {
//!         pipe.write_value(42u64)?;
//!         pipe.flush_pipe()?;
//!         Ok(42)
//!     } else {
//!         pipe.read_value::<u64>()
//!     }
//! }
//! ```

use crate::error::{PacketError, PipeError, Result, Side};
use crate::multiplexer::Multiplexer;
use crate::packet::Packet;
use crate::pipe::{ClusterPipe, PipeChannel};
use bytemuck::Pod;
use std::io;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug)]
pub struct MulticastPipe {
    pipe: ClusterPipe,
    /// Master: packet being filled
    write_buf: Option<Packet>,
    /// Slave: packet being consumed, and the read offset into it
    read_buf: Option<Packet>,
    read_pos: usize,
}

impl MulticastPipe {
    pub fn open(multiplexer: &Arc<Multiplexer>) -> Result<Self> {
        Ok(Self {
            pipe: ClusterPipe::open(multiplexer)?,
            write_buf: None,
            read_buf: None,
            read_pos: 0,
        })
    }

    /// Buffer sizes are fixed; both resize calls only report the packet size.
    pub fn resize_read_buffer(&mut self, _requested: usize) -> usize {
        self.pipe.multiplexer().max_packet_size()
    }

    pub fn resize_write_buffer(&mut self, _requested: usize) -> usize {
        self.pipe.multiplexer().max_packet_size()
    }

    /// Append bytes to the stream (master only).
    pub fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        if !self.pipe.is_master() {
            return Err(PipeError::MasterOnly("MulticastPipe::write").into());
        }
        if !self.pipe.is_read_coupled() {
            return Ok(());
        }

        while !data.is_empty() {
            let packet = self
                .write_buf
                .get_or_insert_with(|| self.pipe.new_packet());
            let written = packet.append(data);
            data = &data[written..];
            if packet.remaining_capacity() == 0 {
                self.send_write_buffer()?;
            }
        }
        Ok(())
    }

    fn send_write_buffer(&mut self) -> Result<()> {
        match self.write_buf.take() {
            Some(packet) if !packet.is_empty() => self.pipe.send_packet(packet),
            Some(packet) => {
                self.pipe.delete_packet(packet);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Fill `out` completely from the stream (slaves only).
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            filled += self.read_some(&mut out[filled..])?;
        }
        Ok(())
    }

    /// Read at least one byte unless `out` is empty; blocks for the next packet.
    fn read_some(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.pipe.is_master() {
            return Err(PipeError::SlaveOnly("MulticastPipe::read").into());
        }
        self.pipe.check_slave_access(Side::Read)?;
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            if let Some(packet) = &self.read_buf {
                let available = &packet.payload()[self.read_pos..];
                if !available.is_empty() {
                    let n = available.len().min(out.len());
                    out[..n].copy_from_slice(&available[..n]);
                    self.read_pos += n;
                    return Ok(n);
                }
            }
            if let Some(spent) = self.read_buf.take() {
                self.pipe.delete_packet(spent);
            }
            self.read_buf = Some(self.pipe.receive_packet()?);
            self.read_pos = 0;
        }
    }

    pub fn write_value<T: Pod>(&mut self, value: T) -> Result<()> {
        self.write_bytes(bytemuck::bytes_of(&value))
    }

    pub fn read_value<T: Pod>(&mut self) -> Result<T> {
        let mut value = T::zeroed();
        self.read_bytes(bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Write a `u32` length prefix followed by UTF-8 bytes.
    pub fn write_string(&mut self, text: &str) -> Result<()> {
        self.write_value(text.len() as u32)?;
        self.write_bytes(text.as_bytes())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_value::<u32>()? as usize;
        let mut bytes = vec![0u8; len];
        self.read_bytes(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| PacketError::InvalidText.into())
    }
}

impl PipeChannel for MulticastPipe {
    fn cluster_pipe(&self) -> &ClusterPipe {
        &self.pipe
    }

    fn cluster_pipe_mut(&mut self) -> &mut ClusterPipe {
        &mut self.pipe
    }

    fn flush_pipe(&mut self) -> Result<()> {
        self.send_write_buffer()
    }

    fn couple(&mut self, read_coupled: bool, write_coupled: bool) -> Result<()> {
        self.send_write_buffer()?;
        self.pipe.couple(read_coupled, write_coupled);
        Ok(())
    }
}

impl io::Write for MulticastPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.flush_pipe()?)
    }
}

impl io::Read for MulticastPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_some(buf)?)
    }
}

impl Drop for MulticastPipe {
    fn drop(&mut self) {
        if let Err(e) = self.send_write_buffer() {
            warn!(pipe_id = self.pipe.pipe_id(), error = %e, "failed to flush multicast pipe");
        }
        if let Some(packet) = self.read_buf.take() {
            self.pipe.delete_packet(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::error::Error;
    use crate::network::{LoopbackNetwork, NetworkConfig};
    use std::io::{Read, Write};

    fn pair() -> (Arc<Multiplexer>, Arc<Multiplexer>) {
        let net = LoopbackNetwork::new(2, NetworkConfig::perfect(5));
        let master = Multiplexer::new(ClusterConfig::for_node(2, 0), net.endpoint(0)).unwrap();
        let slave = Multiplexer::new(ClusterConfig::for_node(2, 1), net.endpoint(1)).unwrap();
        (master, slave)
    }

    #[test]
    fn test_resize_reports_packet_size() {
        let (master, slave) = pair();
        let mut pipe = MulticastPipe::open(&master).unwrap();
        assert_eq!(pipe.resize_read_buffer(10), 1464);
        assert_eq!(pipe.resize_write_buffer(1 << 20), 1464);
        drop(pipe);
        drop(slave);
    }

    #[test]
    fn test_typed_values_and_strings() {
        let (master, slave) = pair();
        let mut out = MulticastPipe::open(&master).unwrap();
        let mut input = MulticastPipe::open(&slave).unwrap();

        out.write_value(7u16).unwrap();
        out.write_value(-2.5f64).unwrap();
        out.write_string("héllo").unwrap();
        out.flush_pipe().unwrap();

        assert_eq!(input.read_value::<u16>().unwrap(), 7);
        assert_eq!(input.read_value::<f64>().unwrap(), -2.5);
        assert_eq!(input.read_string().unwrap(), "héllo");

        drop(input);
        drop(slave);
    }

    #[test]
    fn test_stream_spans_packets() {
        let (master, slave) = pair();
        let mut out = MulticastPipe::open(&master).unwrap();
        let mut input = MulticastPipe::open(&slave).unwrap();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        out.write_all(&data).unwrap();
        out.flush().unwrap();

        let mut received = vec![0u8; data.len()];
        input.read_exact(&mut received).unwrap();
        assert_eq!(received, data);
        // 5000 bytes in 1464-byte packets
        assert_eq!(master.stats().packets_sent, 4);

        drop(input);
        drop(slave);
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let (master, slave) = pair();
        let mut out = MulticastPipe::open(&master).unwrap();
        let mut input = MulticastPipe::open(&slave).unwrap();

        assert!(matches!(
            input.write_bytes(b"x"),
            Err(Error::Pipe(PipeError::MasterOnly(_)))
        ));
        let mut buf = [0u8; 1];
        assert!(matches!(
            out.read_bytes(&mut buf),
            Err(Error::Pipe(PipeError::SlaveOnly(_)))
        ));

        drop(input);
        drop(slave);
    }

    #[test]
    fn test_decoupled_master_discards() {
        let (master, slave) = pair();
        let mut out = MulticastPipe::open(&master).unwrap();
        let mut input = MulticastPipe::open(&slave).unwrap();

        out.couple(false, true).unwrap();
        input.couple(false, true).unwrap();
        out.write_bytes(b"local only").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            input.read_bytes(&mut buf),
            Err(Error::Pipe(PipeError::Decoupled { .. }))
        ));

        out.couple(true, true).unwrap();
        input.couple(true, true).unwrap();
        out.write_bytes(b"sync").unwrap();
        out.flush_pipe().unwrap();
        input.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"sync");

        drop(input);
        drop(slave);
    }
}
