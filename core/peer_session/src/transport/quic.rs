//! QUIC transport over a single UDP socket
//!
//! Connections are quiche connections driven by a mio poll loop. Every
//! endpoint can initiate; only endpoints configured with a certificate
//! accept. Connectionless control packets (see [`super::control`]) share the
//! socket and are told apart from QUIC by the fixed header bit.
//!
//! # Stream layout
//!
//! ```text
//! stream 0                 control: [type u8][len u32][payload]
//!                          0x01 hail (client → host), 0x02 approve (host → client)
//! stream 4 / 5             reliable-unordered data (client / host initiated)
//! stream 4·(c+2) [+1]      reliable-ordered data on channel c
//! DATAGRAM                 unreliable-sequenced: [channel u8][seq u32][payload]
//! ```
//!
//! Data frames on streams are `[len u32][payload]`. Partial writes are
//! buffered per stream and retried on every pump.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use ring::rand::{SecureRandom, SystemRandom};

use super::control::{is_control_packet, ControlPacket, PunchTokens};
use super::{
    first_interface_address, ConnectionHandle, ConnectionStatus, Reliability, SimulatedConditions, Transport,
    TransportError, TransportEvent, TransportStats,
};
use crate::settings::NetworkSettings;
use crate::wire::{WireReader, WireWriter};

// ============================================================================
// Constants
// ============================================================================

/// Maximum UDP payload size for QUIC packets
const MAX_DATAGRAM_SIZE: usize = 1350;

/// QUIC idle timeout in milliseconds
const IDLE_TIMEOUT_MS: u64 = 30_000;

/// ALPN protocol identifier shared by every peer
const ALPN_PROTOCOL: &[u8] = b"peer-session/1";

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// Enough bidirectional streams for every ordered channel
const MAX_STREAMS_BIDI: u64 = 300;

const CONTROL_STREAM: u64 = 0;
const FRAME_HAIL: u8 = 0x01;
const FRAME_APPROVE: u8 = 0x02;

/// Application close codes
const CLOSE_CODE_DISCONNECT: u64 = 0x0;
const CLOSE_CODE_DENIED: u64 = 0x100;

// ============================================================================
// Configuration
// ============================================================================

/// Socket and TLS settings for a [`QuicTransport`]
#[derive(Debug, Clone)]
pub struct QuicConfig {
    pub bind_addr: SocketAddr,
    /// Discovery requests carrying another app id are ignored
    pub app_id: String,
    /// Accept inbound connections (requires certificate and key)
    pub accept_incoming: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl QuicConfig {
    /// Endpoint that only initiates connections
    pub fn client(bind_addr: SocketAddr, app_id: &str) -> Self {
        QuicConfig {
            bind_addr,
            app_id: app_id.to_string(),
            accept_incoming: false,
            cert_path: None,
            key_path: None,
        }
    }

    /// Endpoint on `port` using the app id and TLS material from `settings`
    pub fn from_settings(settings: &NetworkSettings, port: u16, accept_incoming: bool) -> Self {
        QuicConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            app_id: settings.game_app_id.clone(),
            accept_incoming,
            cert_path: settings.cert_path.clone(),
            key_path: settings.key_path.clone(),
        }
    }
}

fn path_str(path: &Path) -> Result<&str, TransportError> {
    path.to_str()
        .ok_or_else(|| TransportError::Config(format!("non UTF-8 path {:?}", path)))
}

fn build_quic_config(identity: Option<(&Path, &Path)>) -> Result<quiche::Config, TransportError> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

    if let Some((cert, key)) = identity {
        config.load_cert_chain_from_pem_file(path_str(cert)?)?;
        config.load_priv_key_from_pem_file(path_str(key)?)?;
    }

    config.set_application_protos(&[ALPN_PROTOCOL])?;

    // Peers authenticate each other through the hail exchange
    config.verify_peer(false);

    config.enable_dgram(true, 1000, 1000);
    config.set_max_idle_timeout(IDLE_TIMEOUT_MS);
    config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_streams_bidi(MAX_STREAMS_BIDI);
    config.set_initial_max_streams_uni(0);
    config.set_disable_active_migration(true);

    Ok(config)
}

// ============================================================================
// Per-connection state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Host,
}

impl Role {
    fn stream_bit(self) -> u64 {
        match self {
            Role::Client => 0,
            Role::Host => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// QUIC handshake running, or hail sent and waiting for approval
    Handshaking,
    /// Host side: hail received, waiting for approve/deny
    AwaitingApproval,
    Connected,
    Closing,
}

fn ordered_stream(role: Role, channel: u8) -> u64 {
    4 * (u64::from(channel) + 2) + role.stream_bit()
}

fn unordered_stream(role: Role) -> u64 {
    4 + role.stream_bit()
}

/// Newer than `last` under wrapping sequence arithmetic
fn is_newer(seq: u32, last: u32) -> bool {
    (seq.wrapping_sub(last) as i32) > 0
}

fn encode_frame(frame_type: Option<u8>, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 5);
    let mut w = WireWriter::new(&mut buf);
    if let Some(frame_type) = frame_type {
        w.write_u8(frame_type);
    }
    w.write_bytes(payload);
    buf
}

/// Split complete frames off the front of `buf`, keeping any partial tail
fn take_frames(buf: &mut Vec<u8>, typed: bool) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();
    let mut consumed = 0;
    let mut r = WireReader::new(buf);
    loop {
        let frame_type = if typed {
            match r.read_u8() {
                Ok(t) => t,
                Err(_) => break,
            }
        } else {
            0
        };
        match r.read_bytes() {
            Ok(payload) => {
                frames.push((frame_type, payload));
                consumed = r.position();
            }
            Err(_) => break,
        }
    }
    buf.drain(..consumed);
    frames
}

fn diagnostic(level: log::Level, message: String) -> TransportEvent {
    TransportEvent::Diagnostic { level, message }
}

struct QuicConnection {
    conn: quiche::Connection,
    handle: ConnectionHandle,
    peer: SocketAddr,
    role: Role,
    state: LinkState,
    /// Client hail, written once the handshake completes
    outgoing_hail: Option<Vec<u8>>,
    /// Hail received by the host, reported again on approval
    remote_hail: Vec<u8>,
    stream_bufs: HashMap<u64, Vec<u8>>,
    pending_writes: HashMap<u64, Vec<u8>>,
    send_seq: HashMap<u8, u32>,
    recv_seq: HashMap<u8, u32>,
    local_reason: Option<String>,
}

impl QuicConnection {
    fn new(
        conn: quiche::Connection,
        handle: ConnectionHandle,
        peer: SocketAddr,
        role: Role,
        outgoing_hail: Option<Vec<u8>>,
    ) -> Self {
        QuicConnection {
            conn,
            handle,
            peer,
            role,
            state: LinkState::Handshaking,
            outgoing_hail,
            remote_hail: Vec::new(),
            stream_bufs: HashMap::new(),
            pending_writes: HashMap::new(),
            send_seq: HashMap::new(),
            recv_seq: HashMap::new(),
            local_reason: None,
        }
    }

    fn queue_stream_write(&mut self, stream: u64, data: &[u8]) -> Result<(), TransportError> {
        if let Some(pending) = self.pending_writes.get_mut(&stream) {
            if !pending.is_empty() {
                pending.extend_from_slice(data);
                return Ok(());
            }
        }

        let written = match self.conn.stream_send(stream, data, false) {
            Ok(n) => n,
            Err(quiche::Error::Done) => 0,
            Err(e) => return Err(e.into()),
        };
        if written < data.len() {
            self.pending_writes
                .entry(stream)
                .or_default()
                .extend_from_slice(&data[written..]);
        }
        Ok(())
    }

    fn flush_pending_writes(&mut self) {
        for (stream, pending) in self.pending_writes.iter_mut() {
            if pending.is_empty() {
                continue;
            }
            match self.conn.stream_send(*stream, pending, false) {
                Ok(n) => {
                    pending.drain(..n);
                }
                Err(quiche::Error::Done) => {}
                Err(e) => {
                    log::debug!("{}: stream {} write failed: {:?}", self.handle, stream, e);
                    pending.clear();
                }
            }
        }
    }

    fn send(&mut self, payload: &[u8], reliability: Reliability, channel: u8) -> Result<(), TransportError> {
        if self.state != LinkState::Connected {
            return Err(TransportError::NotConnected(self.handle));
        }

        match reliability {
            Reliability::UnreliableSequenced => {
                let seq = self.send_seq.entry(channel).or_insert(0);
                *seq = seq.wrapping_add(1);

                let mut dgram = Vec::with_capacity(payload.len() + 5);
                let mut w = WireWriter::new(&mut dgram);
                w.write_u8(channel);
                w.write_u32(*seq);
                w.write_raw(payload);

                match self.conn.dgram_send(&dgram) {
                    Ok(()) => Ok(()),
                    // Unreliable: a full queue drops the message
                    Err(quiche::Error::Done) => {
                        log::trace!("{}: datagram queue full, dropped", self.handle);
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Reliability::ReliableUnordered => {
                let frame = encode_frame(None, payload);
                self.queue_stream_write(unordered_stream(self.role), &frame)
            }
            Reliability::ReliableOrdered => {
                let frame = encode_frame(None, payload);
                self.queue_stream_write(ordered_stream(self.role, channel), &frame)
            }
        }
    }

    /// Read streams and datagrams, turning complete frames into events
    fn process(&mut self, scratch: &mut [u8], events: &mut VecDeque<TransportEvent>) {
        if self.conn.is_closed() {
            return;
        }

        if self.role == Role::Client && self.conn.is_established() {
            if let Some(hail) = self.outgoing_hail.take() {
                let frame = encode_frame(Some(FRAME_HAIL), &hail);
                if let Err(e) = self.queue_stream_write(CONTROL_STREAM, &frame) {
                    events.push_back(diagnostic(
                        log::Level::Warn,
                        format!("{}: failed to send hail: {}", self.handle, e),
                    ));
                }
            }
        }

        let readable: Vec<u64> = self.conn.readable().collect();
        for stream in readable {
            loop {
                match self.conn.stream_recv(stream, scratch) {
                    Ok((len, _fin)) => self
                        .stream_bufs
                        .entry(stream)
                        .or_default()
                        .extend_from_slice(&scratch[..len]),
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        events.push_back(diagnostic(
                            log::Level::Debug,
                            format!("{}: stream {} read failed: {:?}", self.handle, stream, e),
                        ));
                        break;
                    }
                }
            }
        }

        // Control frames first: an approval unlocks data that arrived with it
        let control = self
            .stream_bufs
            .get_mut(&CONTROL_STREAM)
            .map(|buf| take_frames(buf, true))
            .unwrap_or_default();
        for (frame_type, payload) in control {
            self.on_control_frame(frame_type, payload, events);
        }

        // Data stays buffered until the connection is approved
        if self.state == LinkState::Connected {
            let mut streams: Vec<u64> = self
                .stream_bufs
                .iter()
                .filter(|(id, buf)| **id != CONTROL_STREAM && !buf.is_empty())
                .map(|(id, _)| *id)
                .collect();
            streams.sort_unstable();

            for stream in streams {
                let frames = match self.stream_bufs.get_mut(&stream) {
                    Some(buf) => take_frames(buf, false),
                    None => Vec::new(),
                };
                for (_, payload) in frames {
                    events.push_back(TransportEvent::Data {
                        connection: self.handle,
                        payload,
                    });
                }
            }
        }

        loop {
            match self.conn.dgram_recv(scratch) {
                Ok(len) => self.on_datagram(&scratch[..len], events),
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    events.push_back(diagnostic(
                        log::Level::Debug,
                        format!("{}: datagram read failed: {:?}", self.handle, e),
                    ));
                    break;
                }
            }
        }
    }

    fn on_control_frame(&mut self, frame_type: u8, payload: Vec<u8>, events: &mut VecDeque<TransportEvent>) {
        match (frame_type, self.role, self.state) {
            (FRAME_HAIL, Role::Host, LinkState::Handshaking) => {
                self.state = LinkState::AwaitingApproval;
                self.remote_hail = payload.clone();
                events.push_back(TransportEvent::ConnectionApproval {
                    connection: self.handle,
                    hail: payload,
                });
            }
            (FRAME_APPROVE, Role::Client, LinkState::Handshaking) => {
                self.state = LinkState::Connected;
                log::info!("{}: approved by {}", self.handle, self.peer);
                events.push_back(TransportEvent::StatusChanged {
                    connection: self.handle,
                    status: ConnectionStatus::Connected { remote_hail: payload },
                    reason: "approved".to_string(),
                });
            }
            _ => events.push_back(diagnostic(
                log::Level::Warn,
                format!(
                    "{}: unexpected control frame {:#04x} in state {:?}",
                    self.handle, frame_type, self.state
                ),
            )),
        }
    }

    fn on_datagram(&mut self, data: &[u8], events: &mut VecDeque<TransportEvent>) {
        if self.state != LinkState::Connected {
            return;
        }

        let mut r = WireReader::new(data);
        let (channel, seq) = match (r.read_u8(), r.read_u32()) {
            (Ok(channel), Ok(seq)) => (channel, seq),
            _ => {
                events.push_back(diagnostic(
                    log::Level::Debug,
                    format!("{}: truncated datagram ({} bytes)", self.handle, data.len()),
                ));
                return;
            }
        };

        if let Some(&last) = self.recv_seq.get(&channel) {
            if !is_newer(seq, last) {
                log::trace!("{}: stale datagram seq={} last={} dropped", self.handle, seq, last);
                return;
            }
        }
        self.recv_seq.insert(channel, seq);

        events.push_back(TransportEvent::Data {
            connection: self.handle,
            payload: r.read_rest().to_vec(),
        });
    }

    fn close(&mut self, code: u64, reason: &str) {
        self.state = LinkState::Closing;
        self.local_reason.get_or_insert_with(|| reason.to_string());
        match self.conn.close(true, code, reason.as_bytes()) {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => log::debug!("{}: close failed: {:?}", self.handle, e),
        }
    }

    fn close_reason(&self) -> String {
        if let Some(reason) = &self.local_reason {
            return reason.clone();
        }
        if let Some(err) = self.conn.peer_error() {
            if !err.reason.is_empty() {
                return String::from_utf8_lossy(&err.reason).into_owned();
            }
            return format!("closed by peer (code {:#x})", err.error_code);
        }
        if self.conn.is_timed_out() {
            return "timed out".to_string();
        }
        "connection closed".to_string()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// [`Transport`] over quiche and a mio UDP socket
pub struct QuicTransport {
    poll: Poll,
    socket: UdpSocket,
    events: Events,
    client_config: quiche::Config,
    /// Present only when accepting connections
    server_config: Option<quiche::Config>,
    app_id: String,
    local_addr: SocketAddr,
    internal_addr: SocketAddr,
    connections: HashMap<ConnectionHandle, QuicConnection>,
    /// Connection ids (ours and the client's original) to handles
    ids: HashMap<quiche::ConnectionId<'static>, ConnectionHandle>,
    next_handle: u64,
    rng: SystemRandom,
    pending_events: VecDeque<TransportEvent>,
    reported_tokens: PunchTokens,
    /// Only the loss rate applies; QUIC pacing owns send timing
    conditions: SimulatedConditions,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    stream_buf: Vec<u8>,
    stats: TransportStats,
    shut_down: bool,
}

impl QuicTransport {
    pub fn bind(config: QuicConfig) -> Result<Self, TransportError> {
        let client_config = build_quic_config(None)?;
        let server_config = if config.accept_incoming {
            let (cert, key) = match (&config.cert_path, &config.key_path) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    return Err(TransportError::Config(
                        "accepting connections requires a certificate and key".to_string(),
                    ))
                }
            };
            Some(build_quic_config(Some((cert.as_path(), key.as_path())))?)
        } else {
            None
        };

        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(config.bind_addr).map_err(|source| TransportError::Bind {
            addr: config.bind_addr,
            source,
        })?;
        socket.set_broadcast(true)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        let local_addr = socket.local_addr()?;
        let internal_addr = if local_addr.ip().is_unspecified() {
            first_interface_address(local_addr.port()).unwrap_or(local_addr)
        } else {
            local_addr
        };

        log::info!(
            "QUIC transport bound on {} (internal {}, accepting: {})",
            local_addr,
            internal_addr,
            server_config.is_some()
        );

        Ok(QuicTransport {
            poll,
            socket,
            events: Events::with_capacity(1024),
            client_config,
            server_config,
            app_id: config.app_id,
            local_addr,
            internal_addr,
            connections: HashMap::new(),
            ids: HashMap::new(),
            next_handle: 1,
            rng: SystemRandom::new(),
            pending_events: VecDeque::new(),
            reported_tokens: PunchTokens::new(),
            conditions: SimulatedConditions::default(),
            recv_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            stream_buf: vec![0u8; 65535],
            stats: TransportStats::default(),
            shut_down: false,
        })
    }

    fn allocate_handle(&mut self) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn new_connection_id(&self) -> Result<quiche::ConnectionId<'static>, TransportError> {
        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        self.rng.fill(&mut scid).map_err(|_| TransportError::Random)?;
        Ok(quiche::ConnectionId::from_vec(scid.to_vec()))
    }

    fn connection_mut(&mut self, connection: ConnectionHandle) -> Result<&mut QuicConnection, TransportError> {
        self.connections
            .get_mut(&connection)
            .ok_or(TransportError::UnknownConnection(connection))
    }

    fn send_control(&mut self, addr: SocketAddr, packet: &ControlPacket) -> Result<(), TransportError> {
        let bytes = packet.encode()?;
        self.socket.send_to(&bytes, addr)?;
        self.stats.bytes_sent += bytes.len() as u64;
        self.stats.packets_sent += 1;
        Ok(())
    }

    fn read_socket(&mut self) -> Result<(), TransportError> {
        let mut buf = std::mem::take(&mut self.recv_buf);
        let result = loop {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e.into()),
            };
            self.stats.bytes_received += len as u64;
            self.stats.packets_received += 1;

            let packet = &mut buf[..len];
            if is_control_packet(packet) {
                self.handle_control(from, packet);
            } else {
                self.handle_quic(from, packet);
            }
        };
        self.recv_buf = buf;
        result
    }

    fn handle_control(&mut self, from: SocketAddr, data: &[u8]) {
        let packet = match ControlPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Malformed control packet from {}: {}", from, e);
                return;
            }
        };
        log::trace!("Control packet from {}: {:?}", from, packet);

        match packet {
            ControlPacket::DiscoveryRequest { app_id } => {
                if app_id == self.app_id {
                    self.pending_events.push_back(TransportEvent::DiscoveryRequest { from });
                } else {
                    log::debug!("Discovery request from {} for app '{}' ignored", from, app_id);
                }
            }
            ControlPacket::DiscoveryResponse { payload } => {
                self.pending_events
                    .push_back(TransportEvent::DiscoveryResponse { from, payload });
            }
            ControlPacket::Unconnected { payload } => {
                self.pending_events
                    .push_back(TransportEvent::UnconnectedData { from, payload });
            }
            ControlPacket::NatIntroduction {
                is_host,
                target_internal,
                target_external,
                token,
            } => {
                log::info!(
                    "NAT introduction from {}: punching {} / {} (as {})",
                    from,
                    target_internal,
                    target_external,
                    if is_host { "host" } else { "client" }
                );
                let punch = ControlPacket::NatPunch {
                    from_host: is_host,
                    token,
                };
                for target in [target_internal, target_external] {
                    if let Err(e) = self.send_control(target, &punch) {
                        log::debug!("NAT punch to {} failed: {}", target, e);
                    }
                }
            }
            ControlPacket::NatPunch { from_host, token } => {
                if !from_host {
                    log::trace!("NAT punch from client {} ignored", from);
                } else if self.reported_tokens.first_report(&token, Instant::now()) {
                    log::info!("NAT punch from host {} succeeded", from);
                    self.pending_events
                        .push_back(TransportEvent::NatIntroductionSuccess { from, token });
                }
            }
        }
    }

    fn handle_quic(&mut self, from: SocketAddr, packet: &mut [u8]) {
        let hdr = match quiche::Header::from_slice(packet, quiche::MAX_CONN_ID_LEN) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("Failed to parse QUIC header from {}: {:?}", from, e);
                return;
            }
        };

        let conn_id = hdr.dcid.clone().into_owned();
        let handle = match self.ids.get(&conn_id) {
            Some(handle) => *handle,
            None => {
                if hdr.ty != quiche::Type::Initial {
                    log::debug!("Non-Initial packet for unknown connection from {}", from);
                    return;
                }
                match self.accept(&hdr, from) {
                    Ok(Some(handle)) => handle,
                    Ok(None) => return,
                    Err(e) => {
                        log::debug!("Failed to accept connection from {}: {}", from, e);
                        return;
                    }
                }
            }
        };

        let recv_info = quiche::RecvInfo {
            from,
            to: self.local_addr,
        };
        if let Some(connection) = self.connections.get_mut(&handle) {
            match connection.conn.recv(packet, recv_info) {
                Ok(_) | Err(quiche::Error::Done) => {}
                Err(e) => log::debug!("{}: recv error: {:?}", handle, e),
            }
        }
    }

    fn accept(&mut self, hdr: &quiche::Header, from: SocketAddr) -> Result<Option<ConnectionHandle>, TransportError> {
        if !quiche::version_is_supported(hdr.version) {
            log::debug!("Version negotiation needed for {:?}", hdr.version);
            let len = quiche::negotiate_version(&hdr.scid, &hdr.dcid, &mut self.send_buf)?;
            self.socket.send_to(&self.send_buf[..len], from)?;
            return Ok(None);
        }

        let scid = self.new_connection_id()?;
        let Some(config) = self.server_config.as_mut() else {
            log::debug!("Connection attempt from {} while not accepting", from);
            return Ok(None);
        };
        let conn = quiche::accept(&scid, None, self.local_addr, from, config)?;

        let handle = self.allocate_handle();
        log::info!("New connection from {} ({})", from, handle);
        self.ids.insert(scid, handle);
        self.ids.insert(hdr.dcid.clone().into_owned(), handle);
        self.connections
            .insert(handle, QuicConnection::new(conn, handle, from, Role::Host, None));
        Ok(Some(handle))
    }

    fn process_connections(&mut self) {
        for connection in self.connections.values_mut() {
            connection.process(&mut self.stream_buf, &mut self.pending_events);
        }
    }

    fn send_packets(&mut self) {
        for connection in self.connections.values_mut() {
            connection.flush_pending_writes();
            loop {
                match connection.conn.send(&mut self.send_buf) {
                    Ok((len, send_info)) => {
                        log::trace!("Sending {} bytes to {}", len, send_info.to);
                        match self.socket.send_to(&self.send_buf[..len], send_info.to) {
                            Ok(_) => {
                                self.stats.bytes_sent += len as u64;
                                self.stats.packets_sent += 1;
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                log::debug!("{}: socket send failed: {}", connection.handle, e);
                                break;
                            }
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("{}: send error: {:?}", connection.handle, e);
                        break;
                    }
                }
            }
        }
    }

    fn reap_closed(&mut self) {
        let closed: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, c)| c.conn.is_closed())
            .map(|(handle, _)| *handle)
            .collect();

        for handle in closed {
            if let Some(connection) = self.connections.remove(&handle) {
                let reason = connection.close_reason();
                log::info!("Connection {} to {} closed: {}", handle, connection.peer, reason);
                self.ids.retain(|_, h| *h != handle);
                self.pending_events.push_back(TransportEvent::StatusChanged {
                    connection: handle,
                    status: ConnectionStatus::Disconnected,
                    reason,
                });
            }
        }
    }
}

impl Transport for QuicTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn internal_addr(&self) -> SocketAddr {
        self.internal_addr
    }

    fn accepts_incoming(&self) -> bool {
        self.server_config.is_some()
    }

    fn pump(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }

        self.send_packets();

        let next_timer = self.connections.values().filter_map(|c| c.conn.timeout()).min();
        let wait = match (timeout, next_timer) {
            (Some(t), Some(n)) => Some(t.min(n)),
            (Some(t), None) => Some(t),
            (None, n) => n,
        };
        if let Err(e) = self.poll.poll(&mut self.events, wait) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        self.read_socket()?;
        self.reported_tokens.trim(Instant::now());

        for connection in self.connections.values_mut() {
            connection.conn.on_timeout();
        }

        self.process_connections();
        self.send_packets();
        self.reap_closed();
        Ok(())
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.pending_events.pop_front()
    }

    fn connect(&mut self, addr: SocketAddr, hail: &[u8]) -> Result<ConnectionHandle, TransportError> {
        if self.shut_down {
            return Err(TransportError::ShutDown);
        }

        let scid = self.new_connection_id()?;
        let conn = quiche::connect(None, &scid, self.local_addr, addr, &mut self.client_config)?;
        let handle = self.allocate_handle();
        log::info!("Connecting to {} ({})", addr, handle);

        self.ids.insert(scid, handle);
        self.connections.insert(
            handle,
            QuicConnection::new(conn, handle, addr, Role::Client, Some(hail.to_vec())),
        );
        self.send_packets();
        Ok(handle)
    }

    fn connection_to(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
        self.connections
            .values()
            .find(|c| c.peer == addr && !c.conn.is_closed() && c.state != LinkState::Closing)
            .map(|c| c.handle)
    }

    fn approve(&mut self, connection: ConnectionHandle, hail: &[u8]) -> Result<(), TransportError> {
        let quic = self.connection_mut(connection)?;
        if quic.state != LinkState::AwaitingApproval {
            return Err(TransportError::NotConnected(connection));
        }
        quic.queue_stream_write(CONTROL_STREAM, &encode_frame(Some(FRAME_APPROVE), hail))?;
        quic.state = LinkState::Connected;
        let remote_hail = std::mem::take(&mut quic.remote_hail);
        log::info!("{}: approved {}", connection, quic.peer);

        self.pending_events.push_back(TransportEvent::StatusChanged {
            connection,
            status: ConnectionStatus::Connected { remote_hail },
            reason: "approved".to_string(),
        });
        Ok(())
    }

    fn deny(&mut self, connection: ConnectionHandle, reason: &str) -> Result<(), TransportError> {
        let quic = self.connection_mut(connection)?;
        log::info!("{}: denied {}: {}", connection, quic.peer, reason);
        quic.close(CLOSE_CODE_DENIED, reason);
        Ok(())
    }

    fn send(
        &mut self,
        connection: ConnectionHandle,
        payload: &[u8],
        reliability: Reliability,
        channel: u8,
    ) -> Result<(), TransportError> {
        let lost = reliability == Reliability::UnreliableSequenced && self.conditions.drops(&self.rng);
        let quic = self.connection_mut(connection)?;
        if !lost {
            return quic.send(payload, reliability, channel);
        }
        if quic.state != LinkState::Connected {
            return Err(TransportError::NotConnected(connection));
        }
        log::trace!("{}: simulated loss of {} byte datagram", connection, payload.len());
        Ok(())
    }

    fn disconnect(&mut self, connection: ConnectionHandle, reason: &str) {
        if let Some(quic) = self.connections.get_mut(&connection) {
            quic.close(CLOSE_CODE_DISCONNECT, reason);
        }
    }

    fn send_unconnected(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        self.send_control(
            addr,
            &ControlPacket::Unconnected {
                payload: payload.to_vec(),
            },
        )
    }

    fn discover(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        let request = ControlPacket::DiscoveryRequest {
            app_id: self.app_id.clone(),
        };
        self.send_control(addr, &request)
    }

    fn send_discovery_response(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        self.send_control(
            addr,
            &ControlPacket::DiscoveryResponse {
                payload: payload.to_vec(),
            },
        )
    }

    fn introduce(
        &mut self,
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: &str,
    ) -> Result<(), TransportError> {
        let to_host = ControlPacket::NatIntroduction {
            is_host: true,
            target_internal: client_internal,
            target_external: client_external,
            token: token.to_string(),
        };
        let to_client = ControlPacket::NatIntroduction {
            is_host: false,
            target_internal: host_internal,
            target_external: host_external,
            token: token.to_string(),
        };
        self.send_control(host_external, &to_host)?;
        self.send_control(client_external, &to_client)?;
        log::debug!("Introduced client {} to host {}", client_external, host_external);
        Ok(())
    }

    fn round_trip_time(&self, connection: ConnectionHandle) -> Option<Duration> {
        let quic = self.connections.get(&connection)?;
        if quic.state != LinkState::Connected {
            return None;
        }
        quic.conn.path_stats().next().map(|stats| stats.rtt)
    }

    fn statistics(&self) -> TransportStats {
        self.stats
    }

    fn set_simulated_conditions(&mut self, conditions: SimulatedConditions) {
        if !conditions.latency.is_zero() {
            log::warn!(
                "Simulated latency is not supported over QUIC; ignoring {:?}",
                conditions.latency
            );
        }
        self.conditions = SimulatedConditions {
            latency: Duration::ZERO,
            loss: conditions.loss,
        };
    }

    fn shutdown(&mut self, reason: &str) {
        if self.shut_down {
            return;
        }

        for connection in self.connections.values_mut() {
            connection.close(CLOSE_CODE_DISCONNECT, reason);
        }
        self.send_packets();
        self.connections.clear();
        self.ids.clear();

        if let Err(e) = self.poll.registry().deregister(&mut self.socket) {
            log::debug!("Failed to deregister socket: {}", e);
        }
        self.shut_down = true;
        log::info!("QUIC transport on {} shut down: {}", self.local_addr, reason);
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.shutdown("transport dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_layout() {
        assert_eq!(unordered_stream(Role::Client), 4);
        assert_eq!(unordered_stream(Role::Host), 5);
        assert_eq!(ordered_stream(Role::Client, 0), 8);
        assert_eq!(ordered_stream(Role::Host, 1), 13);
        assert!(ordered_stream(Role::Host, u8::MAX) / 4 < MAX_STREAMS_BIDI);
    }

    #[test]
    fn test_sequence_wraps() {
        assert!(is_newer(2, 1));
        assert!(!is_newer(1, 1));
        assert!(!is_newer(1, 2));
        assert!(is_newer(0, u32::MAX));
    }

    #[test]
    fn test_take_frames_keeps_partial_tail() {
        let mut buf = encode_frame(None, b"one");
        buf.extend(encode_frame(None, b"two"));
        let third = encode_frame(None, b"three");
        buf.extend_from_slice(&third[..4]);

        let frames = take_frames(&mut buf, false);
        assert_eq!(frames, vec![(0, b"one".to_vec()), (0, b"two".to_vec())]);
        assert_eq!(buf, third[..4].to_vec());

        buf.extend_from_slice(&third[4..]);
        assert_eq!(take_frames(&mut buf, false), vec![(0, b"three".to_vec())]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_typed_frames() {
        let mut buf = encode_frame(Some(FRAME_HAIL), b"hail");
        buf.push(FRAME_APPROVE);
        let frames = take_frames(&mut buf, true);
        assert_eq!(frames, vec![(FRAME_HAIL, b"hail".to_vec())]);
        assert_eq!(buf, vec![FRAME_APPROVE]);
    }

    #[test]
    fn test_accepting_requires_certificate() {
        let config = QuicConfig {
            accept_incoming: true,
            ..QuicConfig::client("127.0.0.1:0".parse().unwrap(), "app")
        };
        assert!(matches!(QuicTransport::bind(config), Err(TransportError::Config(_))));
    }
}
