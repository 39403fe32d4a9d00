//! The tunnel: hello handshake, channel table, channel-id allocation, message routing, and the
//! single-threaded event loop. Grounded on the teacher's `client/run.rs` / `server/run.rs` loop
//! shape, generalized from QUIC bidirectional streams to this crate's own UDP wire protocol.

use std::collections::HashMap;
use std::future::poll_fn;
use std::net::{Ipv4Addr, SocketAddr};
use std::task::Poll;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::acl::{self, AclRule};
use crate::channel::{Channel, ChannelOutcome, Destination};
use crate::error::TunnelError;
use crate::socket;
use crate::wire::{self, Message, MessageType, MAX_DATAGRAM_LEN};

/// Identifying string exchanged in `HELLO`/`NEW_CHANNEL` to gate compatibility between peers.
pub const PROFILE: &str = "UDPTunnel/1.2";

const MAX_PROFILE_LEN: usize = 63;
const MAX_HOST_LEN: usize = 127;
const MAX_PORT_LEN: usize = 63;

const HELLO_ROUNDS: u32 = 5;
const HELLO_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelRole {
    Client,
    Server,
}

/// Which of the tunnel's two disjoint channel tables a key refers to (spec §9, "Signed key for
/// two-space lookup": `opening` and `established` replace the original single signed-key map).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelSpace {
    /// Client-side channel that sent `NEW_CHANNEL` but has not yet received its ack; keyed by
    /// its provisional sequence number.
    Opening,
    /// A channel with a server-assigned id, on either side.
    Established,
}

pub struct Tunnel {
    role: TunnelRole,
    udp: UdpSocket,
    opening: HashMap<u16, Channel>,
    established: HashMap<u16, Channel>,
    next_cid: u16,
    sn_counter: u16,
    cancel: CancellationToken,

    // Client-only fields.
    client_listener: Option<TcpListener>,
    client_target: Option<(String, u16)>,
    peer_addr: Option<SocketAddr>,

    // Server-only fields.
    server_acl: Option<AclRule>,
}

impl Tunnel {
    /// Binds the UDP socket and runs the server's event loop until cancelled. The server never
    /// initiates a hello; it answers `HELLO` reactively as part of routing (spec §4.4).
    pub async fn run_server(listen_addr: SocketAddr, acl: Option<AclRule>, cancel: CancellationToken) -> Result<(), TunnelError> {
        let udp = socket::bind_udp(listen_addr).await?;
        info!(%listen_addr, "server listening");

        let tunnel = Self {
            role: TunnelRole::Server,
            udp,
            opening: HashMap::new(),
            established: HashMap::new(),
            next_cid: 0,
            sn_counter: 0,
            cancel,
            client_listener: None,
            client_target: None,
            peer_addr: None,
            server_acl: acl,
        };

        tunnel.event_loop().await
    }

    /// Resolves and hello-handshakes with `tunnel_peer`, binds the local TCP listener, and runs
    /// the client's event loop until cancelled.
    pub async fn run_client(
        listen_addr: SocketAddr,
        tunnel_peer: String,
        remote_host: String,
        remote_port: u16,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let addrs = socket::resolve_all(&tunnel_peer).await?;
        let udp = socket::bind_udp(SocketAddr::from(([0, 0, 0, 0], 0))).await?;

        let mut sn_counter = 0u16;
        let peer_addr = client_hello(&udp, &addrs, &mut sn_counter).await?;
        info!(%peer_addr, "hello handshake succeeded");

        let client_listener = socket::bind_tcp_listener(listen_addr).await?;
        info!(%listen_addr, "client listening for local TCP connections");

        let tunnel = Self {
            role: TunnelRole::Client,
            udp,
            opening: HashMap::new(),
            established: HashMap::new(),
            next_cid: 0,
            sn_counter,
            cancel,
            client_listener: Some(client_listener),
            client_target: Some((remote_host, remote_port)),
            peer_addr: Some(peer_addr),
            server_acl: None,
        };

        tunnel.event_loop().await
    }

    async fn event_loop(mut self) -> Result<(), TunnelError> {
        let mut idle_interval = tokio::time::interval(IDLE_CHECK_INTERVAL);
        let mut recv_buf = vec![0u8; MAX_DATAGRAM_LEN];

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("shutdown requested, tearing down channels");
                    break;
                }

                _ = idle_interval.tick() => {
                    self.run_idle_pass().await;
                }

                recv_result = self.udp.recv_from(&mut recv_buf) => {
                    match recv_result {
                        Ok((n, from)) => self.dispatch_datagram(&recv_buf[..n], from).await,
                        Err(error) => {
                            error!(%error, "UDP socket unrecoverable, stopping tunnel");
                            return Err(error.into());
                        }
                    }
                }

                accept_result = accept_or_pending(self.client_listener.as_ref()) => {
                    match accept_result {
                        Ok((tcp, addr)) => {
                            debug!(%addr, "accepted local TCP connection");
                            self.on_local_accept(tcp).await;
                        }
                        Err(error) => warn!(%error, "local TCP accept failed"),
                    }
                }

                (space, id) = next_tcp_readable(&self.opening, &self.established) => {
                    self.handle_tcp_readable(space, id).await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Destroys every live channel, sending each a best-effort `CLOSE` (spec §6, shutdown).
    async fn shutdown(&mut self) {
        let opening_ids: Vec<u16> = self.opening.keys().copied().collect();
        let established_ids: Vec<u16> = self.established.keys().copied().collect();

        for id in opening_ids {
            if let Some(mut channel) = self.opening.remove(&id) {
                self.destroy_channel(&mut channel).await;
            }
        }
        for id in established_ids {
            if let Some(mut channel) = self.established.remove(&id) {
                self.destroy_channel(&mut channel).await;
            }
        }
    }

    fn map_mut(&mut self, space: ChannelSpace) -> &mut HashMap<u16, Channel> {
        match space {
            ChannelSpace::Opening => &mut self.opening,
            ChannelSpace::Established => &mut self.established,
        }
    }

    async fn run_idle_pass(&mut self) {
        let now = Instant::now();
        let mut work: Vec<(ChannelSpace, u16, Vec<ChannelOutcome>)> = Vec::new();

        for (&id, channel) in self.opening.iter_mut() {
            work.push((ChannelSpace::Opening, id, channel.idle(now)));
        }
        for (&id, channel) in self.established.iter_mut() {
            work.push((ChannelSpace::Established, id, channel.idle(now)));
        }

        for (space, id, outcomes) in work {
            self.apply_outcomes(space, id, outcomes).await;
        }
    }

    async fn handle_tcp_readable(&mut self, space: ChannelSpace, id: u16) {
        let now = Instant::now();
        let outcomes = match self.map_mut(space).get_mut(&id) {
            Some(channel) => channel.tcp_readable(now).await,
            None => return,
        };
        self.apply_outcomes(space, id, outcomes).await;
    }

    async fn on_local_accept(&mut self, tcp: TcpStream) {
        let Some(peer_addr) = self.peer_addr else {
            warn!("local accept before hello completed, dropping connection");
            return;
        };
        let Some((host, port)) = self.client_target.clone() else {
            return;
        };

        self.sn_counter = wire::next_sn(self.sn_counter);
        let sn = self.sn_counter;

        let channel = Channel::create_client(sn, tcp, peer_addr, Instant::now());
        self.opening.insert(sn, channel);

        let payload = wire::nul_terminated_payload(&format!("{PROFILE}:{host}:{port}"));
        let msg = Message::control(MessageType::NewChannel, sn, payload);
        self.send_datagram(peer_addr, msg).await;
        debug!(sn, "sent NEW_CHANNEL request");
    }

    async fn dispatch_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let msg = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(_) => {
                trace!(%from, "dropped invalid datagram");
                return;
            }
        };

        // Routed by message type, not by channel id: `NEW_CHANNEL_ACK` already carries the real
        // (nonzero) channel id in its header, so a channel-id-based split would misroute it.
        match msg.msg_type {
            MessageType::TunnelHello => self.handle_hello_request(&msg, from).await,
            MessageType::NewChannel => self.handle_new_channel_request(&msg, from).await,
            MessageType::NewChannelAck => self.handle_new_channel_ack(&msg, from).await,
            MessageType::TunnelHelloAck => trace!(%from, "stray HELLO_ACK outside handshake, ignoring"),
            MessageType::ChannelKeepalive | MessageType::ChannelData | MessageType::ChannelDataAck | MessageType::ChannelClose => {
                self.dispatch_channel_message(msg).await;
            }
        }
    }

    async fn handle_hello_request(&mut self, msg: &Message, from: SocketAddr) {
        if self.role != TunnelRole::Server {
            return;
        }

        let Some(profile) = wire::read_nul_terminated(&msg.payload) else {
            warn!(%from, "HELLO missing NUL terminator, ignoring");
            return;
        };

        if profile.len() > MAX_PROFILE_LEN || profile != PROFILE {
            warn!(%from, profile, "HELLO profile mismatch, ignoring");
            return;
        }

        let ack = Message::control(MessageType::TunnelHelloAck, msg.sn, Vec::new());
        self.send_datagram(from, ack).await;
    }

    async fn handle_new_channel_request(&mut self, msg: &Message, from: SocketAddr) {
        if self.role != TunnelRole::Server {
            return;
        }

        let Some(text) = wire::read_nul_terminated(&msg.payload) else {
            warn!(%from, "NEW_CHANNEL missing NUL terminator, ignoring");
            return;
        };

        let mut parts = text.splitn(3, ':');
        let (Some(profile), Some(host), Some(port_str)) = (parts.next(), parts.next(), parts.next()) else {
            warn!(%from, "NEW_CHANNEL malformed payload, ignoring");
            return;
        };

        if profile != PROFILE || host.len() > MAX_HOST_LEN || port_str.len() > MAX_PORT_LEN {
            warn!(%from, "NEW_CHANNEL profile mismatch or exceeds length caps, ignoring");
            return;
        }

        let Ok(port) = port_str.parse::<u16>() else {
            warn!(%from, port_str, "NEW_CHANNEL has an unparseable port, ignoring");
            return;
        };

        if !self.acl_allows(from, host, port) {
            warn!(%from, host, port, "ACL denied NEW_CHANNEL");
            return;
        }

        let Some(cid) = self.allocate_cid() else {
            error!("channel id space exhausted, refusing NEW_CHANNEL");
            return;
        };

        let destination = Destination {
            host: host.to_string(),
            port,
        };
        let channel = Channel::create_server(cid, destination, from, Instant::now());
        self.established.insert(cid, channel);

        let ack = Message::empty(MessageType::NewChannelAck, cid, msg.sn);
        self.send_datagram(from, ack).await;
        debug!(cid, %from, "accepted NEW_CHANNEL request");
    }

    fn acl_allows(&self, from: SocketAddr, host: &str, port: u16) -> bool {
        let src = match from {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let dst = host.parse::<Ipv4Addr>().unwrap_or(Ipv4Addr::UNSPECIFIED);
        acl::is_allowed(self.server_acl.as_ref(), src, dst, port)
    }

    /// Allocates the next non-zero channel id, skipping ids already in `established` (spec §9,
    /// open question (b)). Returns `None` only once every one of the 65535 non-zero ids is live.
    fn allocate_cid(&mut self) -> Option<u16> {
        let start = self.next_cid;
        loop {
            self.next_cid = self.next_cid.wrapping_add(1);
            if self.next_cid == 0 {
                self.next_cid = 1;
            }
            if !self.established.contains_key(&self.next_cid) {
                return Some(self.next_cid);
            }
            if self.next_cid == start {
                return None;
            }
        }
    }

    /// Handles `NEW_CHANNEL_ACK` in both directions it can arrive in (spec §4.4):
    /// - Client: the server's ack of our `NEW_CHANNEL`. Promote the opening channel and echo
    ///   the ack back as a "proceed" signal (spec §9, open question (a): this reuses the ack
    ///   opcode to tell the server it may now dial the destination).
    /// - Server: that echoed "proceed" signal. Dial the destination.
    async fn handle_new_channel_ack(&mut self, msg: &Message, from: SocketAddr) {
        match self.role {
            TunnelRole::Client => {
                let Some(mut channel) = self.opening.remove(&msg.sn) else {
                    trace!(sn = msg.sn, "NEW_CHANNEL_ACK for unknown opening channel, ignoring");
                    return;
                };

                let outcomes = channel.opened(msg.channel_id, Instant::now());
                self.established.insert(msg.channel_id, channel);
                self.apply_outcomes(ChannelSpace::Established, msg.channel_id, outcomes).await;

                let reflect = Message::empty(MessageType::NewChannelAck, msg.channel_id, msg.sn);
                self.send_datagram(from, reflect).await;
            }
            TunnelRole::Server => {
                let Some(mut channel) = self.established.remove(&msg.channel_id) else {
                    trace!(channel_id = msg.channel_id, "NEW_CHANNEL_ACK reflection for unknown channel, ignoring");
                    return;
                };

                match channel.connect().await {
                    Ok(outcomes) => {
                        self.established.insert(msg.channel_id, channel);
                        self.apply_outcomes(ChannelSpace::Established, msg.channel_id, outcomes).await;
                    }
                    Err(error) => {
                        warn!(channel_id = msg.channel_id, %error, "destination connect failed");
                        self.destroy_channel(&mut channel).await;
                    }
                }
            }
        }
    }

    async fn dispatch_channel_message(&mut self, msg: Message) {
        let channel_id = msg.channel_id;
        let outcomes = match self.established.get_mut(&channel_id) {
            Some(channel) => channel.handle_message(&msg, Instant::now()).await,
            None => {
                trace!(channel_id, "message for unknown channel id, ignoring");
                return;
            }
        };
        self.apply_outcomes(ChannelSpace::Established, channel_id, outcomes).await;
    }

    async fn apply_outcomes(&mut self, space: ChannelSpace, key: u16, outcomes: Vec<ChannelOutcome>) {
        let peer_addr = self.map_mut(space).get(&key).map(|c| c.peer_addr());
        let mut destroy = false;

        for outcome in outcomes {
            match outcome {
                ChannelOutcome::SendDatagram(msg) => {
                    if let Some(peer) = peer_addr {
                        self.send_datagram(peer, msg).await;
                    }
                }
                ChannelOutcome::Destroy => destroy = true,
                // Readiness-set membership is derived every loop iteration from
                // `Channel::wants_tcp_readable`, so these intents don't need separate bookkeeping.
                ChannelOutcome::RegisterTcpReadable | ChannelOutcome::UnregisterTcpReadable => {}
            }
        }

        if destroy {
            if let Some(mut channel) = self.map_mut(space).remove(&key) {
                self.destroy_channel(&mut channel).await;
            }
        }
    }

    /// Sends a channel's best-effort `CLOSE` (a no-op if the channel already initiated or
    /// received one) and lets it drop, which closes its TCP socket.
    async fn destroy_channel(&mut self, channel: &mut Channel) {
        let peer = channel.peer_addr();
        for outcome in channel.close() {
            if let ChannelOutcome::SendDatagram(msg) = outcome {
                self.send_datagram(peer, msg).await;
            }
        }
    }

    async fn send_datagram(&self, to: SocketAddr, msg: Message) {
        let bytes = msg.encode();
        if let Err(error) = self.udp.send_to(&bytes, to).await {
            warn!(%error, %to, "UDP send failed");
        }
    }
}

/// Client hello: for up to `HELLO_ROUNDS` rounds, try every resolved peer address in turn,
/// waiting up to `HELLO_TIMEOUT` for a matching `HELLO_ACK`.
async fn client_hello(udp: &UdpSocket, addrs: &[SocketAddr], sn_counter: &mut u16) -> Result<SocketAddr, TunnelError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    for round in 0..HELLO_ROUNDS {
        for &addr in addrs {
            *sn_counter = wire::next_sn(*sn_counter);
            let sn = *sn_counter;

            let payload = wire::nul_terminated_payload(PROFILE);
            let hello = Message::control(MessageType::TunnelHello, sn, payload);
            udp.send_to(&hello.encode(), addr).await?;
            trace!(round, %addr, sn, "sent HELLO");

            if let Ok(Ok((n, from))) = tokio::time::timeout(HELLO_TIMEOUT, udp.recv_from(&mut buf)).await {
                if from == addr {
                    if let Ok(reply) = Message::decode(&buf[..n]) {
                        if reply.msg_type == MessageType::TunnelHelloAck && reply.sn == sn {
                            return Ok(addr);
                        }
                    }
                }
            }
        }
    }

    Err(TunnelError::HelloTimedOut(HELLO_ROUNDS))
}

async fn accept_or_pending(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Polls every channel that currently wants its TCP socket in the readable set (spec §3: "the
/// TCP socket is removed from the readable set while `WaitDataAck` holds") and resolves once one
/// of them is ready, mirroring the teacher's own `recv_from_any`/`accept_from_any` helpers
/// (`utils/sockets.rs`) generalized to a dynamically-sized, per-iteration channel set.
async fn next_tcp_readable(opening: &HashMap<u16, Channel>, established: &HashMap<u16, Channel>) -> (ChannelSpace, u16) {
    poll_fn(|cx| {
        for (&id, channel) in opening.iter() {
            if channel.wants_tcp_readable() {
                if let Some(tcp) = channel.tcp_ref() {
                    if tcp.poll_read_ready(cx).is_ready() {
                        return Poll::Ready((ChannelSpace::Opening, id));
                    }
                }
            }
        }
        for (&id, channel) in established.iter() {
            if channel.wants_tcp_readable() {
                if let Some(tcp) = channel.tcp_ref() {
                    if tcp.poll_read_ready(cx).is_ready() {
                        return Poll::Ready((ChannelSpace::Established, id));
                    }
                }
            }
        }
        Poll::Pending
    })
    .await
}
