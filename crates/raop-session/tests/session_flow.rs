//! End-to-end tests against a simulated sender on loopback.
//!
//! The sender side encrypts audio with the session key, sends it to the
//! session's data port and plays the other half of the control and timing
//! exchanges.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use raop_audio::rtp::{payload_type, payload_types};
use raop_audio::{build_retransmit_response, RetransmitRequest, RtpHeader, RtpPacket, SyncPacket};
use raop_core::error::StateError;
use raop_core::SequenceRange;
use raop_crypto::AesCbcCipher;
use raop_session::{
    AudioFormat, AudioFrame, AudioSink, Error, LocalPorts, RtpSession, SessionBuilder, SessionState,
    StreamFramer,
};
use raop_timing::{NtpRequest, NtpResponse, TIMING_PACKET_LEN};

const KEY: [u8; 16] = [0x11; 16];
const IV: [u8; 16] = [0x22; 16];
const FMTP: &str = "96 352 0 16 40 10 14 2 255 0 0 44100";
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Start,
    Frame(u16, Vec<u8>),
    Volume(f32),
    Flush,
    Stop,
    Failed,
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn frames(&self) -> Vec<u16> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Frame(seq, _) => Some(*seq),
                _ => None,
            })
            .collect()
    }

    fn payload(&self, seq: u16) -> Option<Vec<u8>> {
        self.events.lock().iter().find_map(|event| match event {
            Event::Frame(s, payload) if *s == seq => Some(payload.clone()),
            _ => None,
        })
    }

    fn count(&self, wanted: &Event) -> usize {
        self.events.lock().iter().filter(|event| *event == wanted).count()
    }

    fn last_volume(&self) -> Option<f32> {
        self.events.lock().iter().rev().find_map(|event| match event {
            Event::Volume(volume) => Some(*volume),
            _ => None,
        })
    }
}

impl AudioSink for RecordingSink {
    fn start(&self, _format: &AudioFormat) {
        self.events.lock().push(Event::Start);
    }

    fn process(&self, frame: &AudioFrame) {
        self.events.lock().push(Event::Frame(frame.sequence, frame.payload.clone()));
    }

    fn set_volume(&self, volume: f32) {
        self.events.lock().push(Event::Volume(volume));
    }

    fn flush(&self) {
        self.events.lock().push(Event::Flush);
    }

    fn stop(&self) {
        self.events.lock().push(Event::Stop);
    }

    fn transport_failed(&self, _error: &Error) {
        self.events.lock().push(Event::Failed);
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn session(sink: Arc<RecordingSink>) -> RtpSession {
    init_tracing();
    SessionBuilder::new()
        .bind_addr(LOCALHOST)
        .peer_addr(LOCALHOST)
        .poll_interval(Duration::from_millis(5))
        .gap_timeout(Duration::from_secs(2))
        .build(sink, FMTP, &KEY, &IV)
        .unwrap()
}

fn plaintext(seq: u16) -> Vec<u8> {
    // Two full blocks plus a clear tail.
    (0..40u8).map(|i| i ^ seq as u8).collect()
}

fn audio_packet(seq: u16) -> Vec<u8> {
    let cipher = AesCbcCipher::new(KEY, IV);
    let payload = cipher.encrypt_raop(&plaintext(seq)).unwrap();
    let header = RtpHeader::new(payload_types::AUDIO_REALTIME, seq, seq as u32 * 352, 0x1234_5678);
    RtpPacket::new(header, payload).serialize()
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

struct Sender {
    socket: UdpSocket,
}

impl Sender {
    fn new() -> Self {
        let socket = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        Self { socket }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    fn send(&self, data: &[u8], port: u16) {
        self.socket.send_to(data, SocketAddr::new(LOCALHOST, port)).unwrap();
    }

    fn recv(&self) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 2048];
        let (len, from) = self.socket.recv_from(&mut buf).unwrap();
        (buf[..len].to_vec(), from)
    }
}

fn start_udp(session: &RtpSession, control: u16, timing: u16) -> LocalPorts {
    let ports = session.start(true, control, timing).unwrap();
    assert_eq!(session.state(), SessionState::Active);
    ports
}

mod delivery {
    use super::*;

    #[test]
    fn in_order_packets_delivered_once_and_decrypted() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        for seq in [100u16, 101, 102] {
            sender.send(&audio_packet(seq), ports.data);
        }
        wait_for("three frames", || sink.frames().len() == 3);

        // Duplicate of something already played.
        sender.send(&audio_packet(100), ports.data);
        sender.send(&audio_packet(103), ports.data);
        wait_for("fourth frame", || sink.frames().len() == 4);

        assert_eq!(sink.frames(), vec![100, 101, 102, 103]);
        assert_eq!(sink.payload(101), Some(plaintext(101)));
        assert_eq!(session.stats().buffer.delivered, 4);

        session.stop().unwrap();
        assert_eq!(sink.count(&Event::Start), 1);
        assert_eq!(sink.count(&Event::Stop), 1);
    }

    #[test]
    fn reordered_packets_delivered_in_sequence() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        sender.send(&audio_packet(500), ports.data);
        let mut rest: Vec<u16> = (501..520).collect();
        rest.shuffle(&mut rand::thread_rng());
        for seq in rest {
            sender.send(&audio_packet(seq), ports.data);
        }

        wait_for("twenty frames", || sink.frames().len() == 20);
        assert_eq!(sink.frames(), (500..520).collect::<Vec<_>>());
        session.stop().unwrap();
    }

    #[test]
    fn packets_across_sequence_wrap() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        for seq in [65534u16, 0, 65535, 1] {
            sender.send(&audio_packet(seq), ports.data);
        }
        wait_for("four frames", || sink.frames().len() == 4);
        assert_eq!(sink.frames(), vec![65534, 65535, 0, 1]);
        session.stop().unwrap();
    }

    #[test]
    fn garbage_on_data_port_is_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        sender.send(&[0x80, 0x60, 0x00], ports.data);
        sender.send(&[0xFF; 64], ports.data);
        sender.send(&audio_packet(7), ports.data);

        wait_for("one frame", || sink.frames().len() == 1);
        assert!(session.take_fault().is_none());
        assert_eq!(session.state(), SessionState::Active);
        session.stop().unwrap();
    }
}

mod flush {
    use super::*;

    #[test]
    fn older_packets_dropped_after_flush() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        for seq in 95u16..98 {
            sender.send(&audio_packet(seq), ports.data);
        }
        wait_for("three frames", || sink.frames().len() == 3);

        session.flush(100).unwrap();
        assert_eq!(sink.count(&Event::Flush), 1);

        sender.send(&audio_packet(99), ports.data);
        sender.send(&audio_packet(100), ports.data);
        wait_for("frame 100", || sink.frames().contains(&100));

        assert_eq!(sink.frames(), vec![95, 96, 97, 100]);
        session.stop().unwrap();
    }

    #[test]
    fn out_of_range_flush_reanchors() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        sender.send(&audio_packet(3000), ports.data);
        wait_for("first frame", || sink.frames().len() == 1);

        session.flush(-1).unwrap();
        sender.send(&audio_packet(10), ports.data);
        wait_for("re-anchored frame", || sink.frames().len() == 2);
        assert_eq!(sink.frames(), vec![3000, 10]);
        session.stop().unwrap();
    }
}

mod control {
    use super::*;

    #[test]
    fn lost_packet_requested_and_filled() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let control_sender = Sender::new();
        let ports = start_udp(&session, control_sender.port(), 0);
        let data_sender = Sender::new();

        data_sender.send(&audio_packet(1), ports.data);
        data_sender.send(&audio_packet(3), ports.data);

        let (request, from) = control_sender.recv();
        assert_eq!(from.port(), ports.control);
        let request = RetransmitRequest::parse(&request).unwrap();
        assert_eq!(request.missing, SequenceRange::new(2, 1));

        control_sender.send(&build_retransmit_response(&audio_packet(2)), ports.control);
        wait_for("three frames", || sink.frames().len() == 3);

        assert_eq!(sink.frames(), vec![1, 2, 3]);
        assert_eq!(sink.payload(2), Some(plaintext(2)));
        assert!(session.stats().resend_requests >= 1);
        session.stop().unwrap();
    }

    #[test]
    fn sync_packets_accepted() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        let sync = SyncPacket {
            first_after_flush: true,
            current_timestamp: 1000,
            ntp_time: 0xE000_0000_0000_0000,
            next_timestamp: 1000 + 77175,
        };
        sender.send(&sync.serialize(0), ports.control);
        sender.send(&audio_packet(42), ports.data);

        wait_for("one frame", || sink.frames().len() == 1);
        assert!(session.take_fault().is_none());
        session.stop().unwrap();
    }
}

mod timing {
    use super::*;

    #[test]
    fn requests_sent_and_offset_measured() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink);
        let timing_sender = Sender::new();
        let ports = start_udp(&session, 0, timing_sender.port());

        let (data, from) = timing_sender.recv();
        assert_eq!(data.len(), TIMING_PACKET_LEN);
        assert_eq!(payload_type(&data), Some(payload_types::TIMING_REQUEST));
        assert_eq!(from.port(), ports.timing);

        let request = NtpRequest::parse(&data).unwrap();
        let now = request.reference_time;
        let response = NtpResponse::from_request(&request, now, now);
        timing_sender.send(&response.serialize(), ports.timing);

        wait_for("clock offset", || session.stats().clock_offset.is_some());
        session.stop().unwrap();
    }

    #[test]
    fn answers_sender_requests() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink);
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        let request = NtpRequest::new(9, 0x1234_5678_9ABC_DEF0);
        sender.send(&request.serialize(), ports.timing);

        let (data, _) = sender.recv();
        assert_eq!(payload_type(&data), Some(payload_types::TIMING_RESPONSE));
        let response = NtpResponse::parse(&data).unwrap();
        assert_eq!(response.reference_time, request.reference_time);
        assert_ne!(response.receive_time, 0);
        session.stop().unwrap();
    }
}

mod stream {
    use super::*;

    fn connect(port: u16) -> TcpStream {
        TcpStream::connect((LOCALHOST, port)).unwrap()
    }

    #[test]
    fn framed_packets_delivered() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = session.start(false, 0, 0).unwrap();

        let mut stream = connect(ports.data);
        let mut bytes = Vec::new();
        for seq in 10u16..14 {
            bytes.extend_from_slice(&StreamFramer::encode(&audio_packet(seq)));
        }
        // Split mid-frame to exercise reassembly.
        let (first, second) = bytes.split_at(30);
        stream.write_all(first).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        stream.write_all(second).unwrap();

        wait_for("four frames", || sink.frames().len() == 4);
        assert_eq!(sink.frames(), vec![10, 11, 12, 13]);
        assert_eq!(sink.payload(12), Some(plaintext(12)));
        session.stop().unwrap();
    }

    #[test]
    fn reconnect_after_disconnect() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = session.start(false, 0, 0).unwrap();

        let mut stream = connect(ports.data);
        stream.write_all(&StreamFramer::encode(&audio_packet(1))).unwrap();
        wait_for("first frame", || sink.frames().len() == 1);
        drop(stream);

        let mut stream = connect(ports.data);
        stream.write_all(&StreamFramer::encode(&audio_packet(2))).unwrap();
        wait_for("second frame", || sink.frames().len() == 2);

        assert!(session.take_fault().is_none());
        session.stop().unwrap();
    }

    #[test]
    fn bad_frame_length_dropped_and_stream_continues() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = session.start(false, 0, 0).unwrap();

        let mut stream = connect(ports.data);
        stream.write_all(&[b'$', 0, 0, 4, 1, 2, 3, 4]).unwrap();
        stream.write_all(&StreamFramer::encode(&audio_packet(1))).unwrap();

        wait_for("frame after bad frame", || sink.frames() == vec![1]);
        assert!(session.take_fault().is_none());
        assert_eq!(sink.count(&Event::Failed), 0);
        assert_eq!(session.state(), SessionState::Active);
        session.stop().unwrap();
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn volume_reaches_sink() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);

        session.set_volume(-20.0).unwrap();
        wait_for("volume", || sink.last_volume() == Some(-20.0));

        session.set_volume(12.0).unwrap();
        wait_for("clamped volume", || sink.last_volume() == Some(0.0));

        Sender::new().send(&audio_packet(1), ports.data);
        wait_for("one frame", || sink.frames().len() == 1);
        session.stop().unwrap();
    }

    #[test]
    fn nothing_reaches_sink_after_stop() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());
        let ports = start_udp(&session, 0, 0);
        let sender = Sender::new();

        for seq in 1u16..4 {
            sender.send(&audio_packet(seq), ports.data);
        }
        wait_for("three frames", || sink.frames().len() == 3);

        session.stop().unwrap();
        let received = session.stats().buffer.received;
        let events_at_stop = sink.events.lock().len();
        assert_eq!(sink.events.lock().last(), Some(&Event::Stop));

        // The old port is closed; these go nowhere.
        for seq in 4u16..8 {
            let _ = sender.socket.send_to(&audio_packet(seq), SocketAddr::new(LOCALHOST, ports.data));
        }
        thread::sleep(Duration::from_millis(100));

        assert_eq!(sink.events.lock().len(), events_at_stop);
        assert_eq!(sink.frames(), vec![1, 2, 3]);
        assert_eq!(session.stats().buffer.received, received);
    }

    #[test]
    fn full_lifecycle() {
        let sink = Arc::new(RecordingSink::default());
        let session = session(sink.clone());

        let ports = start_udp(&session, 0, 0);
        assert!(matches!(
            session.start(true, 0, 0),
            Err(Error::State(StateError::InvalidTransition { operation: "start", .. }))
        ));
        let unique: std::collections::HashSet<u16> = [ports.data, ports.control, ports.timing].into();
        assert_eq!(unique.len(), 3);

        session.stop().unwrap();
        session.destroy().unwrap();
        assert_eq!(session.state(), SessionState::Destroyed);

        assert!(matches!(session.start(true, 0, 0), Err(Error::State(_))));
        assert!(matches!(session.set_volume(-1.0), Err(Error::State(_))));
        assert!(matches!(session.flush(0), Err(Error::State(_))));
        assert!(matches!(session.stop(), Err(Error::State(_))));
        assert_eq!(sink.count(&Event::Stop), 1);
    }

    #[test]
    fn invalid_parameters_rejected() {
        let sink: Arc<dyn AudioSink> = Arc::new(RecordingSink::default());
        assert!(matches!(
            RtpSession::init(sink.clone(), FMTP, &KEY[..8], &IV),
            Err(Error::Construction(_))
        ));
        assert!(matches!(
            RtpSession::init(sink.clone(), FMTP, &KEY, &IV[..15]),
            Err(Error::Construction(_))
        ));
        assert!(matches!(
            RtpSession::init(sink, "not an fmtp", &KEY, &IV),
            Err(Error::Construction(_))
        ));
    }
}
