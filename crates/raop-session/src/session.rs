//! Session controller: lifecycle and public operations.

use crate::playout::Playout;
use crate::transport::{ChannelEndpoint, DatagramEndpoint, StreamEndpoint};
use crate::worker::{self, RemotePorts, Resender, SessionShared};
use crate::SessionConfig;
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::{Mutex, RwLock};
use raop_audio::{AesPacketCipher, AudioSink, BufferStats, FlushTarget};
use raop_core::error::{ConstructionError, Error, Result, StateError, TransportError};
use raop_core::{AudioFormat, Fmtp, AES_IV_LEN, AES_KEY_LEN};
use raop_crypto::AesCbcCipher;
use raop_timing::{ClockOffset, ResendTracker, TimingSynchronizer};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Quietest volume (mute), in dB.
pub const VOLUME_MIN: f32 = -144.0;

/// Full volume, in dB.
pub const VOLUME_MAX: f32 = 0.0;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Destroyed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ports bound by [`RtpSession::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPorts {
    pub control: u16,
    pub timing: u16,
    pub data: u16,
}

/// Snapshot of session counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStats {
    pub buffer: BufferStats,
    /// Retransmit requests sent.
    pub resend_requests: u64,
    /// Best current clock offset estimate.
    pub clock_offset: Option<ClockOffset>,
    /// Volume in dB.
    pub volume: f32,
}

struct Running {
    ports: LocalPorts,
    workers: Vec<JoinHandle<()>>,
}

struct Lifecycle {
    state: SessionState,
    running: Option<Running>,
}

/// Receiver side of one RAOP audio stream.
pub struct RtpSession {
    shared: Arc<SessionShared>,
    lifecycle: Mutex<Lifecycle>,
    faults: Receiver<Error>,
}

/// Clamp to the RAOP volume range. NaN mutes.
fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return VOLUME_MIN;
    }
    volume.clamp(VOLUME_MIN, VOLUME_MAX)
}

fn invalid(operation: &'static str, state: SessionState) -> Error {
    StateError::InvalidTransition {
        operation,
        state: state.as_str(),
    }
    .into()
}

impl RtpSession {
    /// Create an idle session with the default configuration.
    pub fn init(sink: Arc<dyn AudioSink>, fmtp: &str, aes_key: &[u8], aes_iv: &[u8]) -> Result<Self> {
        Self::init_with_config(SessionConfig::default(), sink, fmtp, aes_key, aes_iv)
    }

    pub fn init_with_config(
        config: SessionConfig,
        sink: Arc<dyn AudioSink>,
        fmtp: &str,
        aes_key: &[u8],
        aes_iv: &[u8],
    ) -> Result<Self> {
        let key: [u8; AES_KEY_LEN] = aes_key.try_into().map_err(|_| ConstructionError::InvalidKeyLength {
            expected: AES_KEY_LEN,
            actual: aes_key.len(),
        })?;
        let iv: [u8; AES_IV_LEN] = aes_iv.try_into().map_err(|_| ConstructionError::InvalidIvLength {
            expected: AES_IV_LEN,
            actual: aes_iv.len(),
        })?;
        let fmtp = Fmtp::parse(fmtp).map_err(ConstructionError::InvalidFmtp)?;
        let format = fmtp.audio_format();

        info!(
            "RTP session created: {} Hz, {} bit, {} ch, {} frames/packet",
            format.sample_rate, format.bit_depth, format.channels, format.frames_per_packet
        );

        let (fault_tx, fault_rx) = unbounded();
        let shared = SessionShared {
            playout: Mutex::new(Playout::new(config.buffer_config(), sink)),
            timing: Mutex::new(TimingSynchronizer::new(format.sample_rate)),
            resend: Mutex::new(ResendTracker::new(config.resend_policy())),
            cipher: AesPacketCipher::new(AesCbcCipher::new(key, iv)),
            volume: AtomicU32::new(VOLUME_MAX.to_bits()),
            stop: AtomicBool::new(true),
            peer: RwLock::new(config.peer_addr),
            faults: fault_tx,
            format,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Idle,
                running: None,
            }),
            faults: fault_rx,
        })
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Bind the three channels and start receiving.
    ///
    /// With `use_udp == false` the data channel accepts a TCP stream; control
    /// and timing are always UDP. Remote ports of 0 disable sending on that
    /// channel.
    pub fn start(&self, use_udp: bool, control_rport: u16, timing_rport: u16) -> Result<LocalPorts> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Idle {
            return Err(invalid("start", lifecycle.state));
        }

        let config = &self.shared.config;
        let data: Box<dyn ChannelEndpoint> = if use_udp {
            Box::new(DatagramEndpoint::bind(config.bind_addr, "data", config.poll_interval)?)
        } else {
            Box::new(StreamEndpoint::bind(config.bind_addr, "data", config.poll_interval)?)
        };
        let control = DatagramEndpoint::bind(config.bind_addr, "control", config.poll_interval)?;
        let timing = DatagramEndpoint::bind(config.bind_addr, "timing", config.poll_interval)?;

        let ports = LocalPorts {
            control: control.local_port(),
            timing: timing.local_port(),
            data: data.local_port(),
        };
        let remote = RemotePorts {
            control: control_rport,
            timing: timing_rport,
        };

        let (data_resender, control_resender) = if use_udp {
            (
                Some(Resender::new(control.sender()?, remote)),
                Some(Resender::new(control.sender()?, remote)),
            )
        } else {
            (None, None)
        };

        // Faults from a previous run are stale now.
        while self.faults.try_recv().is_ok() {}
        self.shared.prepare();

        let mut workers = Vec::with_capacity(3);
        let spawned = self
            .spawn("raop-data", "data", {
                let shared = self.shared.clone();
                move || worker::run_data(shared, data, data_resender)
            })
            .and_then(|handle| {
                workers.push(handle);
                self.spawn("raop-control", "control", {
                    let shared = self.shared.clone();
                    move || worker::run_control(shared, Box::new(control), control_resender)
                })
            })
            .and_then(|handle| {
                workers.push(handle);
                self.spawn("raop-timing", "timing", {
                    let shared = self.shared.clone();
                    move || worker::run_timing(shared, timing, remote)
                })
            });

        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                self.shared.stop.store(true, Ordering::Release);
                for handle in workers {
                    let _ = handle.join();
                }
                self.shared.playout.lock().stop();
                return Err(e);
            }
        }

        info!(
            "RTP session started ({}): data {}, control {}, timing {}",
            if use_udp { "udp" } else { "tcp" },
            ports.data,
            ports.control,
            ports.timing
        );
        lifecycle.state = SessionState::Active;
        lifecycle.running = Some(Running { ports, workers });
        Ok(ports)
    }

    fn spawn<F>(&self, name: &str, channel: &'static str, f: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new().name(name.to_string()).spawn(f).map_err(|e| {
            warn!("Failed to spawn {} worker: {}", channel, e);
            TransportError::Spawn(channel).into()
        })
    }

    /// Set the volume in dB, clamped to `[-144.0, 0.0]`.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Active {
            return Err(invalid("set_volume", lifecycle.state));
        }
        let volume = clamp_volume(volume);
        debug!("Volume set to {} dB", volume);
        self.shared.set_volume(volume);
        Ok(())
    }

    /// Discard audio older than `next_seq`. Values outside the 16-bit range
    /// discard everything and let the next packet re-anchor the stream.
    pub fn flush(&self, next_seq: i32) -> Result<()> {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Active {
            return Err(invalid("flush", lifecycle.state));
        }

        let target = match u16::try_from(next_seq) {
            Ok(seq) => FlushTarget::Sequence(seq),
            Err(_) => FlushTarget::All,
        };
        if self.shared.playout.lock().flush(target) {
            info!("Flushed to {:?}", target);
            self.shared.resend.lock().reset();
        }
        Ok(())
    }

    /// Stop receiving and close all channels.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Active {
            return Err(invalid("stop", lifecycle.state));
        }
        self.shutdown(&mut lifecycle);
        Ok(())
    }

    fn shutdown(&self, lifecycle: &mut Lifecycle) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(running) = lifecycle.running.take() {
            for handle in running.workers {
                if handle.join().is_err() {
                    warn!("Worker thread panicked");
                }
            }
        }
        self.shared.playout.lock().stop();
        self.shared.timing.lock().reset();
        self.shared.resend.lock().reset();
        lifecycle.state = SessionState::Idle;
        info!("RTP session stopped");
    }

    /// Release the session. Only allowed while idle.
    pub fn destroy(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SessionState::Idle {
            return Err(invalid("destroy", lifecycle.state));
        }
        lifecycle.state = SessionState::Destroyed;
        debug!("RTP session destroyed");
        Ok(())
    }

    /// Ports bound by the running session.
    pub fn local_ports(&self) -> Option<LocalPorts> {
        self.lifecycle.lock().running.as_ref().map(|running| running.ports)
    }

    /// Transport fault raised by a worker, if any. The session stays active
    /// until [`stop`](Self::stop) is called.
    pub fn take_fault(&self) -> Option<Error> {
        self.faults.try_recv().ok()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            buffer: self.shared.playout.lock().stats(),
            resend_requests: self.shared.resend.lock().sent(),
            clock_offset: self.shared.timing.lock().offset(),
            volume: self.shared.volume(),
        }
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == SessionState::Active {
            self.shutdown(&mut lifecycle);
        }
    }
}

impl std::fmt::Debug for RtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtpSession")
            .field("state", &self.state())
            .field("format", &self.shared.format)
            .finish_non_exhaustive()
    }
}
