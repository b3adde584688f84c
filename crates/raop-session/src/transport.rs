//! Network endpoints for the data, control and timing channels.
//!
//! Every receive waits at most one poll interval so workers notice the stop
//! flag promptly.

use raop_core::error::{Result, TransportError};
use raop_core::MAX_PACKET_LEN;
use std::io::{self, ErrorKind, Read};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// RTSP-interleaved frame header in front of every packet on a stream connection.
pub const STREAM_HEADER_LEN: usize = 4;

/// Smallest packet that can be framed: a bare RTP header.
const MIN_STREAM_PACKET_LEN: usize = 12;

/// Outcome of one bounded wait on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete packet and the address it came from.
    Packet(Vec<u8>, Option<SocketAddr>),
    /// Nothing arrived within the poll interval.
    Idle,
}

/// A bound channel endpoint.
pub trait ChannelEndpoint: Send {
    /// Locally bound port.
    fn local_port(&self) -> u16;

    /// Wait up to one poll interval for the next packet.
    fn recv(&mut self) -> Result<Received>;
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

fn poll_timeout(poll_interval: Duration) -> Duration {
    poll_interval.max(Duration::from_millis(1))
}

/// UDP endpoint.
#[derive(Debug)]
pub struct DatagramEndpoint {
    socket: UdpSocket,
    port: u16,
    buf: Vec<u8>,
}

impl DatagramEndpoint {
    /// Bind to an ephemeral port on `addr`.
    pub fn bind(addr: IpAddr, channel: &'static str, poll_interval: Duration) -> Result<Self> {
        let bind_err = |source| TransportError::Bind { channel, source };

        let socket = UdpSocket::bind(SocketAddr::new(addr, 0)).map_err(bind_err)?;
        socket
            .set_read_timeout(Some(poll_timeout(poll_interval)))
            .map_err(bind_err)?;
        let port = socket.local_addr().map_err(bind_err)?.port();
        debug!("Bound {} channel on UDP port {}", channel, port);

        Ok(Self {
            socket,
            port,
            // One spare byte so oversize datagrams are detectable.
            buf: vec![0u8; MAX_PACKET_LEN + 1],
        })
    }

    /// Handle that sends from this endpoint's port.
    pub fn sender(&self) -> Result<DatagramSender> {
        Ok(DatagramSender {
            socket: self.socket.try_clone()?,
        })
    }

    /// Send one datagram. Failures are logged and dropped.
    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> bool {
        send_logged(&self.socket, data, dest)
    }
}

impl ChannelEndpoint for DatagramEndpoint {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn recv(&mut self) -> Result<Received> {
        match self.socket.recv_from(&mut self.buf) {
            Ok((len, from)) => Ok(Received::Packet(self.buf[..len].to_vec(), Some(from))),
            Err(ref e) if is_timeout(e) => Ok(Received::Idle),
            Err(e) => Err(e.into()),
        }
    }
}

/// Cloned UDP socket used to send from another thread.
#[derive(Debug)]
pub struct DatagramSender {
    socket: UdpSocket,
}

impl DatagramSender {
    pub fn send_to(&self, data: &[u8], dest: SocketAddr) -> bool {
        send_logged(&self.socket, data, dest)
    }
}

fn send_logged(socket: &UdpSocket, data: &[u8], dest: SocketAddr) -> bool {
    match socket.send_to(data, dest) {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to send {} bytes to {}: {}", data.len(), dest, e);
            false
        }
    }
}

/// Splits a byte stream into packets.
///
/// Each packet is preceded by a 4-byte header whose last two bytes carry the
/// big-endian packet length. Frames with an impossible length are skipped
/// whole, so one bad frame never desynchronizes the stream.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: Vec<u8>,
    dropped: u64,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame a packet for sending on a stream connection.
    pub fn encode(packet: &[u8]) -> Vec<u8> {
        let len = packet.len().min(u16::MAX as usize) as u16;
        let mut framed = Vec::with_capacity(STREAM_HEADER_LEN + packet.len());
        framed.push(b'$');
        framed.push(0);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(packet);
        framed
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete packet, if one is buffered.
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < STREAM_HEADER_LEN {
                return None;
            }

            let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
            let total = STREAM_HEADER_LEN + len;
            if self.buf.len() < total {
                return None;
            }

            if (MIN_STREAM_PACKET_LEN..=MAX_PACKET_LEN).contains(&len) {
                let packet = self.buf[STREAM_HEADER_LEN..total].to_vec();
                self.buf.drain(..total);
                return Some(packet);
            }

            debug!("Dropping stream frame with invalid length {}", len);
            self.buf.drain(..total);
            self.dropped += 1;
        }
    }

    /// Frames skipped for an invalid length.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes received but not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// TCP endpoint accepting one sender connection at a time.
#[derive(Debug)]
pub struct StreamEndpoint {
    listener: TcpListener,
    port: u16,
    poll_interval: Duration,
    connection: Option<(TcpStream, SocketAddr)>,
    framer: StreamFramer,
    read_buf: Vec<u8>,
}

impl StreamEndpoint {
    pub fn bind(addr: IpAddr, channel: &'static str, poll_interval: Duration) -> Result<Self> {
        let bind_err = |source| TransportError::Bind { channel, source };

        let listener = TcpListener::bind(SocketAddr::new(addr, 0)).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let port = listener.local_addr().map_err(bind_err)?.port();
        debug!("Listening for {} channel on TCP port {}", channel, port);

        Ok(Self {
            listener,
            port,
            poll_interval: poll_timeout(poll_interval),
            connection: None,
            framer: StreamFramer::new(),
            read_buf: vec![0u8; 4096],
        })
    }

    fn accept(&mut self) -> Result<bool> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(self.poll_interval))?;
                stream.set_nodelay(true)?;
                info!("Stream sender connected from {}", peer);
                self.framer.reset();
                self.connection = Some((stream, peer));
                Ok(true)
            }
            Err(ref e) if is_timeout(e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn disconnect(&mut self, reason: &str) {
        if let Some((_, peer)) = self.connection.take() {
            info!("Stream sender {} disconnected: {}", peer, reason);
        }
        if self.framer.pending() > 0 {
            debug!("Discarding {} unframed bytes", self.framer.pending());
        }
        self.framer.reset();
    }
}

impl ChannelEndpoint for StreamEndpoint {
    fn local_port(&self) -> u16 {
        self.port
    }

    fn recv(&mut self) -> Result<Received> {
        if self.connection.is_none() && !self.accept()? {
            thread::sleep(self.poll_interval);
            return Ok(Received::Idle);
        }

        loop {
            let peer = match &self.connection {
                Some((_, peer)) => *peer,
                None => return Ok(Received::Idle),
            };

            if let Some(packet) = self.framer.next_packet() {
                trace!("Framed {} byte packet from {}", packet.len(), peer);
                return Ok(Received::Packet(packet, Some(peer)));
            }

            let read = match self.connection.as_mut() {
                Some((stream, _)) => stream.read(&mut self.read_buf),
                None => return Ok(Received::Idle),
            };
            match read {
                Ok(0) => {
                    self.disconnect("end of stream");
                    return Ok(Received::Idle);
                }
                Ok(n) => self.framer.push(&self.read_buf[..n]),
                Err(ref e) if is_timeout(e) => return Ok(Received::Idle),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                    ) =>
                {
                    self.disconnect("connection reset");
                    return Ok(Received::Idle);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
