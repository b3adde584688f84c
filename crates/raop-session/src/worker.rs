//! Channel worker threads and the state they share.

use crate::playout::Playout;
use crate::transport::{ChannelEndpoint, DatagramEndpoint, DatagramSender, Received};
use crate::SessionConfig;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use raop_audio::rtp::payload_type;
use raop_audio::{payload_types, AesPacketCipher, ControlPacket, PacketCipher};
use raop_core::error::{Error, TransportError};
use raop_core::{AudioFormat, SequenceRange};
use raop_timing::{ResendTracker, TimingSynchronizer};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Sender ports for the control and timing channels, as announced at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemotePorts {
    pub(crate) control: u16,
    pub(crate) timing: u16,
}

/// State owned by the session and shared with its workers.
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) format: AudioFormat,
    pub(crate) cipher: AesPacketCipher,
    pub(crate) playout: Mutex<Playout>,
    pub(crate) timing: Mutex<TimingSynchronizer>,
    pub(crate) resend: Mutex<ResendTracker>,
    /// f32 bits of the volume in dB.
    pub(crate) volume: AtomicU32,
    pub(crate) stop: AtomicBool,
    pub(crate) peer: RwLock<Option<IpAddr>>,
    pub(crate) faults: Sender<Error>,
}

impl SessionShared {
    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Release);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn peer(&self) -> Option<IpAddr> {
        *self.peer.read()
    }

    /// Remember the sender's address from the first packet that reveals it.
    fn learn_peer(&self, from: Option<SocketAddr>) {
        let Some(from) = from else { return };
        if self.peer.read().is_some() {
            return;
        }
        let mut peer = self.peer.write();
        if peer.is_none() {
            info!("Sender address learned: {}", from.ip());
            *peer = Some(from.ip());
        }
    }

    /// Reset per-stream state before workers start.
    pub(crate) fn prepare(&self) {
        self.stop.store(false, Ordering::Release);
        *self.peer.write() = self.config.peer_addr;
        self.timing.lock().reset();
        self.resend.lock().reset();
        self.playout.lock().start(&self.format, self.volume());
    }

    /// Decrypt and admit one audio packet, then deliver what is ready.
    fn receive_audio(&self, data: &[u8], now: Instant) -> Option<SequenceRange> {
        let mut frame = match self.cipher.open(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping audio packet ({} bytes): {}", data.len(), e);
                return None;
            }
        };
        frame.playback_ns = self.timing.lock().rtp_to_local_ns(frame.timestamp);

        let volume = self.volume();
        let (_, missing) = self.playout.lock().push(frame, now, volume);
        missing
    }

    fn tick(&self, now: Instant) -> Option<SequenceRange> {
        let volume = self.volume();
        self.playout.lock().deliver(now, volume)
    }

    /// Stop every worker and report the fault.
    fn fail(&self, error: Error) {
        if self.stop.swap(true, Ordering::AcqRel) {
            debug!("Ignoring fault after stop: {}", error);
            return;
        }
        error!("Session transport failed: {}", error);
        self.playout.lock().report_failure(&error);
        let _ = self.faults.send(error);
    }
}

/// Issues retransmit requests from the control port.
pub(crate) struct Resender {
    sender: DatagramSender,
    remote: RemotePorts,
}

impl Resender {
    pub(crate) fn new(sender: DatagramSender, remote: RemotePorts) -> Self {
        Self { sender, remote }
    }

    /// Ask for `missing` if the policy allows. Nothing is counted while
    /// there is nowhere to send.
    fn request(&self, shared: &SessionShared, missing: Option<SequenceRange>, now: Instant) {
        if self.remote.control == 0 {
            return;
        }
        let Some(peer) = shared.peer() else {
            trace!("No sender address yet, resend request held back");
            return;
        };
        let Some(request) = shared.resend.lock().poll(missing, now) else {
            return;
        };
        self.sender
            .send_to(&request.serialize(), SocketAddr::new(peer, self.remote.control));
    }
}

/// Counts consecutive receive failures on one channel.
struct ErrorBudget {
    channel: &'static str,
    max: u32,
    count: u32,
}

impl ErrorBudget {
    fn new(channel: &'static str, max: u32) -> Self {
        Self { channel, max, count: 0 }
    }

    fn ok(&mut self) {
        self.count = 0;
    }

    /// Returns the fatal error once the budget is spent.
    fn record(&mut self, error: Error) -> Option<Error> {
        match error {
            Error::Io(last) => {
                self.count += 1;
                warn!(
                    "Receive on {} channel failed ({}/{}): {}",
                    self.channel, self.count, self.max, last
                );
                (self.count > self.max).then(|| {
                    TransportError::ReceiveFailed {
                        channel: self.channel,
                        count: self.count,
                        last,
                    }
                    .into()
                })
            }
            other => Some(other),
        }
    }

    /// Record a failure on a channel whose errors never end the session.
    fn tolerate(&mut self, error: Error, poll_interval: Duration) {
        if let Some(persistent) = self.record(error) {
            warn!("Still failing on {} channel, carrying on: {}", self.channel, persistent);
            self.ok();
        }
        thread::sleep(poll_interval);
    }
}

/// Data channel: audio packets, in either transport mode. Persistent receive
/// failures here end the session.
pub(crate) fn run_data(
    shared: Arc<SessionShared>,
    mut endpoint: Box<dyn ChannelEndpoint>,
    resender: Option<Resender>,
) {
    debug!("Data worker started on port {}", endpoint.local_port());
    let mut errors = ErrorBudget::new("data", shared.config.max_receive_errors);

    while !shared.should_stop() {
        let received = endpoint.recv();
        let now = Instant::now();
        let missing = match received {
            Ok(Received::Packet(data, from)) => {
                errors.ok();
                shared.learn_peer(from);
                shared.receive_audio(&data, now)
            }
            Ok(Received::Idle) => {
                errors.ok();
                shared.tick(now)
            }
            Err(e) => {
                if let Some(fatal) = errors.record(e) {
                    shared.fail(fatal);
                    break;
                }
                continue;
            }
        };

        if let Some(resender) = &resender {
            resender.request(&shared, missing, now);
        }
    }
    debug!("Data worker stopped");
}

/// Control channel: sync packets and retransmitted audio.
pub(crate) fn run_control(
    shared: Arc<SessionShared>,
    mut endpoint: Box<dyn ChannelEndpoint>,
    resender: Option<Resender>,
) {
    debug!("Control worker started on port {}", endpoint.local_port());
    let mut errors = ErrorBudget::new("control", shared.config.max_receive_errors);

    while !shared.should_stop() {
        let (data, from) = match endpoint.recv() {
            Ok(Received::Packet(data, from)) => {
                errors.ok();
                (data, from)
            }
            Ok(Received::Idle) => {
                errors.ok();
                continue;
            }
            Err(e) => {
                errors.tolerate(e, shared.config.poll_interval);
                continue;
            }
        };
        shared.learn_peer(from);

        match ControlPacket::parse(&data) {
            Ok(ControlPacket::Sync(sync)) => {
                trace!("Sync: rtp {} ntp {:#x}", sync.next_timestamp, sync.ntp_time);
                shared.timing.lock().handle_sync(&sync);
            }
            Ok(ControlPacket::RetransmitResponse(packet)) => {
                let now = Instant::now();
                let missing = shared.receive_audio(packet, now);
                if let Some(resender) = &resender {
                    resender.request(&shared, missing, now);
                }
            }
            Ok(ControlPacket::RetransmitRequest(request)) => {
                debug!("Ignoring retransmit request from sender: {:?}", request.missing);
            }
            Ok(ControlPacket::Other(pt)) => debug!("Unknown control packet type {}", pt),
            Err(e) => debug!("Dropping control packet: {}", e),
        }
    }
    debug!("Control worker stopped");
}

/// Timing channel: periodic requests to the sender and answers to its requests.
pub(crate) fn run_timing(shared: Arc<SessionShared>, mut endpoint: DatagramEndpoint, remote: RemotePorts) {
    debug!("Timing worker started on port {}", endpoint.local_port());
    let mut errors = ErrorBudget::new("timing", shared.config.max_receive_errors);
    let mut next_request = Instant::now();

    while !shared.should_stop() {
        if remote.timing != 0 && Instant::now() >= next_request {
            if let Some(peer) = shared.peer() {
                let request = shared.timing.lock().next_request();
                endpoint.send_to(&request.serialize(), SocketAddr::new(peer, remote.timing));
                next_request = Instant::now() + shared.config.timing_interval;
            }
        }

        let (data, from) = match endpoint.recv() {
            Ok(Received::Packet(data, from)) => {
                errors.ok();
                (data, from)
            }
            Ok(Received::Idle) => {
                errors.ok();
                continue;
            }
            Err(e) => {
                errors.tolerate(e, shared.config.poll_interval);
                continue;
            }
        };
        shared.learn_peer(from);

        match payload_type(&data) {
            Some(payload_types::TIMING_RESPONSE) => {
                if let Err(e) = shared.timing.lock().handle_response(&data) {
                    debug!("Dropping timing response: {}", e);
                }
            }
            Some(payload_types::TIMING_REQUEST) => {
                let answer = shared.timing.lock().answer_request(&data);
                match (answer, from) {
                    (Ok(response), Some(from)) => {
                        endpoint.send_to(&response.serialize(), from);
                    }
                    (Ok(_), None) => {}
                    (Err(e), _) => debug!("Dropping timing request: {}", e),
                }
            }
            other => debug!("Unexpected timing packet type {:?}", other),
        }
    }
    debug!("Timing worker stopped");
}
