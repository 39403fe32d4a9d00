//! Per-channel state machine: the TCP↔UDP relay, its retransmit timer, and its keepalive
//! deadline. Grounded on spec §4.3 and on the teacher's per-stream handling idiom
//! (`client/local_tunnels.rs`, `server/local_tunnels.rs`), generalized to this crate's own
//! ack/retransmit wire protocol instead of delegating reliability to QUIC.
//!
//! Per spec §9 ("Cyclic ownership"), a [`Channel`] never reaches back into the [`crate::tunnel::Tunnel`]
//! that owns it. Every operation instead returns a list of [`ChannelOutcome`] intents that the
//! tunnel applies — add/remove this channel's TCP socket from the readiness set, send a
//! datagram, or destroy the channel.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::wire::{self, Message, MessageType, MAX_PAYLOAD_LEN};

/// `(retries+1) * RETRY_INTERVAL` is the retransmit deadline; exhausting `MAX_RETRIES` attempts
/// destroys the channel.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 10;

/// Cadence at which a client emits a keepalive once it notices its own deadline has elapsed.
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// How long a server waits without hearing a keepalive before it destroys the channel.
/// `5 * KEEPALIVE_TIME + 1s`, matching spec §4.3.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5 * 60 + 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Closing,
}

/// The TCP→UDP direction's sub-state. Only meaningful while `Connected`.
#[derive(Debug)]
enum TcpSubstate {
    WaitData,
    WaitDataAck {
        sn: u16,
        payload: Vec<u8>,
        retries: u32,
        deadline: Instant,
    },
}

/// Effects a [`Channel`] operation asks the owning tunnel to perform. The tunnel applies these
/// in the order returned; a single call can return more than one (e.g. "send an ack" and
/// "re-register for reads").
#[derive(Debug)]
pub enum ChannelOutcome {
    /// Add this channel's TCP socket back to the readable set (leaving `WaitDataAck`).
    RegisterTcpReadable,
    /// Remove this channel's TCP socket from the readable set (entering `WaitDataAck`).
    UnregisterTcpReadable,
    /// Send this message to the channel's UDP peer (see [`Channel::peer_addr`]).
    SendDatagram(Message),
    /// The tunnel must remove this channel from its table; its TCP socket is torn down as a
    /// consequence of being dropped.
    Destroy,
}

/// The destination a server-side channel connects to once `connect()` is called; deferred so it
/// can be created immediately on `NEW_CHANNEL` and only actually dialed once the client's ack
/// reflection arrives (spec §3, "Server channel" lifecycle).
#[derive(Debug, Clone)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

pub struct Channel {
    id: u16,
    role: ChannelRole,
    state: ChannelState,
    peer_addr: SocketAddr,
    tcp: Option<TcpStream>,
    destination: Option<Destination>,
    send_sn: u16,
    substate: TcpSubstate,
    last_delivered_sn: Option<u16>,
    keepalive_deadline: Instant,
    closing_sent: bool,
}

impl Channel {
    /// Constructs a server-side channel in `Connecting`, with its TCP connect deferred until
    /// [`Channel::connect`] is called.
    pub fn create_server(id: u16, destination: Destination, peer_addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            role: ChannelRole::Server,
            state: ChannelState::Connecting,
            peer_addr,
            tcp: None,
            destination: Some(destination),
            send_sn: 0,
            substate: TcpSubstate::WaitData,
            last_delivered_sn: None,
            keepalive_deadline: now + KEEPALIVE_TIMEOUT,
            closing_sent: false,
        }
    }

    /// Constructs a client-side channel around an already-accepted local TCP socket, keyed
    /// provisionally by `provisional_id` (the `sn` sent in `NEW_CHANNEL`) until the server's ack
    /// arrives and [`Channel::opened`] assigns the real id.
    pub fn create_client(provisional_id: u16, tcp: TcpStream, peer_addr: SocketAddr, now: Instant) -> Self {
        Self {
            id: provisional_id,
            role: ChannelRole::Client,
            state: ChannelState::Connecting,
            peer_addr,
            tcp: Some(tcp),
            destination: None,
            send_sn: 0,
            substate: TcpSubstate::WaitData,
            last_delivered_sn: None,
            keepalive_deadline: now + KEEPALIVE_TIME,
            closing_sent: false,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether this channel's TCP socket currently belongs in the readable set: connected and
    /// not holding an outstanding unacked frame (spec §8 invariant).
    pub fn wants_tcp_readable(&self) -> bool {
        self.state == ChannelState::Connected && matches!(self.substate, TcpSubstate::WaitData)
    }

    /// Immutable accessor used by the tunnel to poll for read readiness without taking data off
    /// the socket (see [`crate::tunnel::next_tcp_readable`]).
    pub fn tcp_ref(&self) -> Option<&TcpStream> {
        self.tcp.as_ref()
    }

    /// Server only: dials the deferred destination. On success, transitions to `Connected` and
    /// asks the tunnel to register the new TCP socket for reads. This blocks the entire event
    /// loop for the duration of the TCP handshake — a deliberate simplification per spec §5/§9.
    pub async fn connect(&mut self) -> std::io::Result<Vec<ChannelOutcome>> {
        debug_assert_eq!(self.role, ChannelRole::Server);
        let destination = self.destination.clone().expect("server channel missing destination");
        let addr = crate::socket::resolve_host_port(&format!("{}:{}", destination.host, destination.port)).await?;
        let tcp = crate::socket::connect_tcp(addr).await?;
        self.tcp = Some(tcp);
        self.state = ChannelState::Connected;
        Ok(vec![ChannelOutcome::RegisterTcpReadable])
    }

    /// Client only: the channel has been assigned a real id by the server; rename it, transition
    /// to `Connected`, and reset the keepalive deadline to the client cadence.
    pub fn opened(&mut self, new_id: u16, now: Instant) -> Vec<ChannelOutcome> {
        debug_assert_eq!(self.role, ChannelRole::Client);
        self.id = new_id;
        self.state = ChannelState::Connected;
        self.keepalive_deadline = now + KEEPALIVE_TIME;
        vec![ChannelOutcome::RegisterTcpReadable]
    }

    /// Dispatches a received message addressed to this channel.
    pub async fn handle_message(&mut self, msg: &Message, now: Instant) -> Vec<ChannelOutcome> {
        match msg.msg_type {
            MessageType::ChannelKeepalive => {
                self.keepalive_deadline = now + KEEPALIVE_TIMEOUT;
                Vec::new()
            }
            MessageType::ChannelData => self.handle_data(msg).await,
            MessageType::ChannelDataAck => self.handle_data_ack(msg),
            MessageType::ChannelClose => {
                // The peer already tore its side down; mark closing_sent so close() doesn't
                // echo a CLOSE back to it (spec §3: CLOSE only if we initiated teardown).
                self.state = ChannelState::Closing;
                self.closing_sent = true;
                vec![ChannelOutcome::Destroy]
            }
            // Hello/new-channel messages never route to an existing channel.
            _ => {
                warn!(channel_id = self.id, "channel received a tunnel-level message type");
                Vec::new()
            }
        }
    }

    async fn handle_data(&mut self, msg: &Message) -> Vec<ChannelOutcome> {
        let is_duplicate = self.last_delivered_sn == Some(msg.sn);

        if !is_duplicate {
            let Some(tcp) = self.tcp.as_mut() else {
                warn!(channel_id = self.id, "received DATA before TCP socket existed");
                return Vec::new();
            };
            if let Err(error) = tcp.write_all(&msg.payload).await {
                debug!(channel_id = self.id, %error, "TCP write failed while delivering DATA");
                return vec![ChannelOutcome::Destroy];
            }
            self.last_delivered_sn = Some(msg.sn);
        } else {
            trace!(channel_id = self.id, sn = msg.sn, "suppressing duplicate DATA, re-acking");
        }

        vec![ChannelOutcome::SendDatagram(Message::empty(
            MessageType::ChannelDataAck,
            self.id,
            msg.sn,
        ))]
    }

    fn handle_data_ack(&mut self, msg: &Message) -> Vec<ChannelOutcome> {
        match &self.substate {
            TcpSubstate::WaitDataAck { sn, .. } if *sn == msg.sn => {
                self.substate = TcpSubstate::WaitData;
                vec![ChannelOutcome::RegisterTcpReadable]
            }
            _ => Vec::new(),
        }
    }

    /// Performs one `recv` on the channel's TCP socket. On EOF or error the channel must be
    /// destroyed; on data, frames it into a `DATA` message and enters `WaitDataAck`.
    pub async fn tcp_readable(&mut self, now: Instant) -> Vec<ChannelOutcome> {
        let mut buf = [0u8; MAX_PAYLOAD_LEN];
        let read_result = match self.tcp.as_mut() {
            Some(tcp) => tcp.read(&mut buf).await,
            None => return vec![ChannelOutcome::Destroy],
        };

        let n = match read_result {
            Ok(0) => {
                debug!(channel_id = self.id, "TCP peer closed (EOF)");
                return vec![ChannelOutcome::Destroy];
            }
            Ok(n) => n,
            Err(error) => {
                debug!(channel_id = self.id, %error, "TCP read failed");
                return vec![ChannelOutcome::Destroy];
            }
        };

        self.send_sn = wire::next_sn(self.send_sn);
        let payload = buf[..n].to_vec();
        let msg = Message::new(MessageType::ChannelData, self.id, self.send_sn, payload.clone());

        self.substate = TcpSubstate::WaitDataAck {
            sn: self.send_sn,
            payload,
            retries: 0,
            deadline: now + RETRY_INTERVAL,
        };

        vec![ChannelOutcome::UnregisterTcpReadable, ChannelOutcome::SendDatagram(msg)]
    }

    /// Periodic housekeeping: keepalive cadence/liveness and retransmit timers.
    pub fn idle(&mut self, now: Instant) -> Vec<ChannelOutcome> {
        let mut outcomes = Vec::new();

        if now >= self.keepalive_deadline {
            match self.role {
                ChannelRole::Client => {
                    self.keepalive_deadline = now + KEEPALIVE_TIME;
                    self.send_sn = wire::next_sn(self.send_sn);
                    outcomes.push(ChannelOutcome::SendDatagram(Message::empty(
                        MessageType::ChannelKeepalive,
                        self.id,
                        self.send_sn,
                    )));
                }
                ChannelRole::Server => {
                    debug!(channel_id = self.id, "server-side keepalive deadline expired");
                    return vec![ChannelOutcome::Destroy];
                }
            }
        }

        if let TcpSubstate::WaitDataAck {
            sn,
            payload,
            retries,
            deadline,
        } = &mut self.substate
        {
            if now >= *deadline {
                if *retries + 1 >= MAX_RETRIES {
                    debug!(channel_id = self.id, "retransmit attempts exhausted");
                    return vec![ChannelOutcome::Destroy];
                }

                *retries += 1;
                *deadline = now + RETRY_INTERVAL * (*retries + 1);
                trace!(channel_id = self.id, sn, retries = *retries, "resending unacked DATA");
                outcomes.push(ChannelOutcome::SendDatagram(Message::new(
                    MessageType::ChannelData,
                    self.id,
                    *sn,
                    payload.clone(),
                )));
            }
        }

        outcomes
    }

    /// Best-effort local teardown: sends `CLOSE` at most once. The tunnel is responsible for
    /// actually removing the channel from its table; dropping this value closes the TCP socket.
    pub fn close(&mut self) -> Vec<ChannelOutcome> {
        if self.closing_sent {
            return Vec::new();
        }
        self.closing_sent = true;
        self.state = ChannelState::Closing;
        vec![ChannelOutcome::SendDatagram(Message::empty(MessageType::ChannelClose, self.id, 0))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    async fn accepted_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connect_addr = listener.local_addr().unwrap();
        let connector = tokio::spawn(async move { TcpStream::connect(connect_addr).await.unwrap() });
        let (server_side, _) = listener.accept().await.unwrap();
        let client_side = connector.await.unwrap();
        (server_side, client_side)
    }

    #[tokio::test]
    async fn tcp_readable_enters_wait_data_ack_and_unregisters() {
        let (local_side, mut peer_side) = accepted_pair().await;
        let mut channel = Channel::create_client(7, local_side, addr(), Instant::now());
        channel.opened(1, Instant::now());

        peer_side.write_all(b"A").await.unwrap();

        let outcomes = channel.tcp_readable(Instant::now()).await;
        assert!(matches!(outcomes[0], ChannelOutcome::UnregisterTcpReadable));
        assert!(!channel.wants_tcp_readable());

        match outcomes.get(1) {
            Some(ChannelOutcome::SendDatagram(msg)) => {
                assert_eq!(msg.msg_type, MessageType::ChannelData);
                assert_eq!(msg.sn, 1);
                assert_eq!(msg.payload, b"A");
            }
            other => panic!("expected SendDatagram, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn data_ack_matching_sn_releases_back_pressure() {
        let (local_side, _peer_side) = accepted_pair().await;
        let mut channel = Channel::create_client(7, local_side, addr(), Instant::now());
        channel.opened(1, Instant::now());
        channel.substate = TcpSubstate::WaitDataAck {
            sn: 5,
            payload: vec![0x41],
            retries: 0,
            deadline: Instant::now() + RETRY_INTERVAL,
        };

        let ack = Message::empty(MessageType::ChannelDataAck, 1, 5);
        let outcomes = channel.handle_message(&ack, Instant::now()).await;
        assert!(matches!(outcomes[0], ChannelOutcome::RegisterTcpReadable));
        assert!(channel.wants_tcp_readable());
    }

    #[tokio::test]
    async fn mismatched_data_ack_is_a_no_op() {
        let (local_side, _peer_side) = accepted_pair().await;
        let mut channel = Channel::create_client(7, local_side, addr(), Instant::now());
        channel.opened(1, Instant::now());
        channel.substate = TcpSubstate::WaitDataAck {
            sn: 5,
            payload: vec![0x41],
            retries: 0,
            deadline: Instant::now() + RETRY_INTERVAL,
        };

        let ack = Message::empty(MessageType::ChannelDataAck, 1, 6);
        let outcomes = channel.handle_message(&ack, Instant::now()).await;
        assert!(outcomes.is_empty());
        assert!(!channel.wants_tcp_readable());
    }

    #[tokio::test]
    async fn duplicate_data_is_not_redelivered_but_is_acked() {
        let (local_side, mut peer_side) = accepted_pair().await;
        let mut channel = Channel::create_client(7, local_side, addr(), Instant::now());
        channel.opened(1, Instant::now());

        let data = Message::new(MessageType::ChannelData, 1, 3, vec![0x41]);
        let first = channel.handle_message(&data, Instant::now()).await;
        assert!(matches!(&first[0], ChannelOutcome::SendDatagram(m) if m.msg_type == MessageType::ChannelDataAck));

        let second = channel.handle_message(&data, Instant::now()).await;
        assert_eq!(second.len(), 1);
        assert!(matches!(&second[0], ChannelOutcome::SendDatagram(m) if m.msg_type == MessageType::ChannelDataAck && m.sn == 3));

        let mut received = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_millis(200), peer_side.read(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..n], b"A");
    }

    #[tokio::test]
    async fn idle_destroys_channel_after_ten_retries() {
        let (local_side, _peer_side) = accepted_pair().await;
        let mut channel = Channel::create_client(7, local_side, addr(), Instant::now());
        channel.opened(1, Instant::now());
        channel.substate = TcpSubstate::WaitDataAck {
            sn: 1,
            payload: vec![0x41],
            retries: 0,
            deadline: Instant::now(),
        };

        let mut now = Instant::now();
        let mut destroyed = false;
        for _ in 0..MAX_RETRIES {
            let outcomes = channel.idle(now);
            if outcomes.iter().any(|o| matches!(o, ChannelOutcome::Destroy)) {
                destroyed = true;
                break;
            }
            now += RETRY_INTERVAL * 20;
        }
        assert!(destroyed);
    }

    #[tokio::test]
    async fn server_channel_destroyed_on_keepalive_timeout() {
        let destination = Destination {
            host: "127.0.0.1".into(),
            port: 1,
        };
        let start = Instant::now();
        let mut channel = Channel::create_server(1, destination, addr(), start);
        let outcomes = channel.idle(start + KEEPALIVE_TIMEOUT);
        assert!(matches!(outcomes[0], ChannelOutcome::Destroy));
    }

    #[tokio::test]
    async fn client_emits_keepalive_on_its_own_cadence() {
        let (local_side, _peer_side) = accepted_pair().await;
        let start = Instant::now();
        let mut channel = Channel::create_client(7, local_side, addr(), start);
        channel.opened(1, start);

        let outcomes = channel.idle(start + KEEPALIVE_TIME);
        match &outcomes[0] {
            ChannelOutcome::SendDatagram(msg) => assert_eq!(msg.msg_type, MessageType::ChannelKeepalive),
            other => panic!("expected keepalive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_sends_best_effort_close_only_once() {
        let (local_side, _peer_side) = accepted_pair().await;
        let mut channel = Channel::create_client(7, local_side, addr(), Instant::now());
        let first = channel.close();
        assert_eq!(first.len(), 1);
        let second = channel.close();
        assert!(second.is_empty());
    }
}
