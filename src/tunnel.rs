//! KNXnet/IP tunnel connection task.
//!
//! One task owns the whole connection lifecycle: discovery, connect,
//! heartbeat, paced tunneling, sequence tracking, acknowledgement
//! correlation and disconnect. Commands arrive over an mpsc channel,
//! completions leave over per-request oneshot channels and observable
//! events over a broadcast channel, so every input (timer fire, socket
//! receive, API call) is handled serially on this task.
//!
//! ## State machine
//!
//! ```text
//!            startsearch          response           connect ok
//!  Idle ───────────────▶ Searching ───────▶ Connecting ─────────▶ Online ◀─┐
//!   ▲  ◀── 15 s timeout ───┘                    │ timeout             │     │ 50 ms
//!   │                                           ▼                    ▼     │
//!   │◀───────────────────────────────── Disconnecting ◀─── AwaitingAck ─▶ Waiting
//!   │        response / 10 s timeout            ▲          AwaitingHeartbeat ▲
//!   └───── 2 s retry while connect wanted ──────┴──────────────────────────┘
//! ```
//!
//! At most one tunneling request is in flight; after every settled exchange
//! the task parks in `Waiting` for the 50 ms pacing window before the next
//! queued request goes out. Requests submitted while the task is not online
//! queue up and are dispatched FIFO on re-entry.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::config::ClientConfig;
use crate::error::{KnxError, Result};
use crate::net::transport::{AsyncTransport, NetProvider};
use crate::protocol::builder::{Datagram, DatagramBuilder};
use crate::protocol::cemi::{Apci, CemiFrame};
use crate::protocol::constants::{
    CemiMessageCode, E_NO_ERROR, E_NO_MORE_CONNECTIONS, KNXNETIP_MULTICAST_ADDR, KNXNETIP_PORT,
    MAX_FRAME_SIZE,
};
use crate::protocol::frame::{ConnState, ConnectionHeader, DeviceInfoDib};
use crate::protocol::services::{Body, Frame};

/// Delay before a fresh search after landing in idle with a connect wanted.
pub const IDLE_RETRY_DELAY: Duration = Duration::from_secs(2);
/// How long to wait for a SEARCH_RESPONSE.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
/// How long to wait for a CONNECT_RESPONSE.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// How long to wait for a TUNNELING_ACK before retransmitting.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// Send attempts per tunneling request (one retransmission).
pub const ACK_MAX_ATTEMPTS: u8 = 2;
/// Heartbeat period while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(45);
/// How long to wait for a CONNECTIONSTATE_RESPONSE.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
/// Heartbeat failure streak that tears the connection down.
pub const MAX_HEARTBEAT_FAILURES: u8 = 3;
/// Minimum interval between tunneling requests.
pub const PACING_DELAY: Duration = Duration::from_millis(50);
/// How long to wait for a DISCONNECT_RESPONSE.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Observable connection events.
#[derive(Debug, Clone, PartialEq)]
pub enum KnxEvent {
    /// The tunnel is established and group operations will flow.
    Online,
    /// The connection is down; a reconnect follows while one is wanted.
    Offline,
    /// An inbound group telegram (`L_Data.ind`).
    GroupValue {
        /// Application control code of the telegram
        apci: Apci,
        /// Sending device
        src: IndividualAddress,
        /// Destination group address
        dest: GroupAddress,
        /// Raw payload bytes (datapoint decoding is the caller's concern)
        payload: Vec<u8>,
    },
}

/// A group operation submitted through the API.
pub(crate) struct GroupRequest {
    /// The prepared datagram; channel and sequence are stamped at dispatch.
    pub datagram: Datagram,
    /// Resolved on final ACK success or failure.
    pub ack: oneshot::Sender<Result<()>>,
    /// For reads: resolved by the first GroupValue_Response for the address.
    pub read_waiter: Option<(u16, oneshot::Sender<Vec<u8>>)>,
}

/// Commands from the API handle to the connection task.
pub(crate) enum Command {
    /// Start (and keep) the search → connect path.
    Connect,
    /// Tear the tunnel down and stay down.
    Disconnect,
    /// Submit a group operation.
    Group(GroupRequest),
}

/// A request sitting in the FIFO dispatch queue.
struct QueuedRequest {
    datagram: Datagram,
    ack: oneshot::Sender<Result<()>>,
}

/// An outbound tunneling exchange awaiting its ACK.
struct AckExchange {
    request: QueuedRequest,
    /// Encoded bytes, kept verbatim for the retransmission.
    wire: Vec<u8>,
    sequence: u8,
    deadline: Instant,
    attempt: u8,
}

enum State {
    Idle { retry_at: Option<Instant> },
    Searching { deadline: Instant },
    Connecting { deadline: Instant },
    Online,
    AwaitingAck { exchange: AckExchange },
    AwaitingHeartbeat { deadline: Instant },
    Waiting { until: Instant },
    Disconnecting { deadline: Instant },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle { .. } => "idle",
            State::Searching { .. } => "searching",
            State::Connecting { .. } => "connecting",
            State::Online => "online",
            State::AwaitingAck { .. } => "awaiting-ack",
            State::AwaitingHeartbeat { .. } => "awaiting-heartbeat",
            State::Waiting { .. } => "waiting",
            State::Disconnecting { .. } => "disconnecting",
        }
    }
}

enum Input {
    Command(Option<Command>),
    Discovery(Result<(Vec<u8>, SocketAddrV4)>),
    Control(Result<(Vec<u8>, SocketAddrV4)>),
    StateTimer,
    HeartbeatTimer,
}

/// The connection task.
pub(crate) struct Tunnel<P: NetProvider> {
    provider: P,
    config: ClientConfig,
    builder: DatagramBuilder,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<KnxEvent>,

    discovery: Option<P::Transport>,
    control: Option<P::Transport>,

    /// Gateway control endpoint, learned from discovery or configured.
    remote: Option<SocketAddrV4>,
    channel_id: Option<u8>,
    seq_out: u8,
    seq_in: u8,
    heartbeat_failures: u8,
    next_heartbeat: Option<Instant>,
    heartbeat_due: bool,
    /// The client wants the tunnel up; drives auto-reconnect from idle.
    want_connected: bool,

    state: State,
    queue: VecDeque<QueuedRequest>,
    /// Inbound tunneling requests that arrived mid-exchange, replayed in
    /// arrival order once the exchange settles.
    deferred_inbound: VecDeque<(ConnectionHeader, CemiFrame)>,
    read_waiters: HashMap<u16, Vec<oneshot::Sender<Vec<u8>>>>,
}

async fn recv_opt<T: AsyncTransport>(t: &mut Option<T>) -> Result<(Vec<u8>, SocketAddrV4)> {
    match t {
        Some(t) => {
            let mut buf = vec![0u8; MAX_FRAME_SIZE];
            let (n, from) = t.recv_from(&mut buf).await?;
            buf.truncate(n);
            Ok((buf, from))
        }
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl<P: NetProvider> Tunnel<P> {
    pub(crate) fn new(
        config: ClientConfig,
        provider: P,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<KnxEvent>,
    ) -> Self {
        let builder = DatagramBuilder::new(&config);
        Self {
            provider,
            config,
            builder,
            commands,
            events,
            discovery: None,
            control: None,
            remote: None,
            channel_id: None,
            seq_out: 0,
            seq_in: 0,
            heartbeat_failures: 0,
            next_heartbeat: None,
            heartbeat_due: false,
            want_connected: false,
            state: State::Idle { retry_at: None },
            queue: VecDeque::new(),
            deferred_inbound: VecDeque::new(),
            read_waiters: HashMap::new(),
        }
    }

    /// Drive the connection until the API handle goes away.
    pub(crate) async fn run(mut self) {
        loop {
            let state_deadline = self.state_deadline();
            let heartbeat_deadline = self.next_heartbeat;

            let input = tokio::select! {
                cmd = self.commands.recv() => Input::Command(cmd),
                r = recv_opt(&mut self.discovery) => Input::Discovery(r),
                r = recv_opt(&mut self.control) => Input::Control(r),
                _ = sleep_opt(state_deadline) => Input::StateTimer,
                _ = sleep_opt(heartbeat_deadline) => Input::HeartbeatTimer,
            };

            match input {
                Input::Command(None) => {
                    self.shutdown().await;
                    return;
                }
                Input::Command(Some(cmd)) => self.handle_command(cmd).await,
                Input::Discovery(Ok((data, from))) => self.handle_datagram(&data, from).await,
                Input::Control(Ok((data, from))) => self.handle_datagram(&data, from).await,
                Input::Discovery(Err(e)) => {
                    log::warn!("discovery socket error: {e}");
                    self.discovery = None;
                    if matches!(self.state, State::Searching { .. }) {
                        self.enter_idle().await;
                    }
                }
                Input::Control(Err(e)) => {
                    log::warn!("control socket error: {e}");
                    self.enter_idle().await;
                }
                Input::StateTimer => self.handle_state_timeout().await,
                Input::HeartbeatTimer => {
                    self.next_heartbeat = None;
                    self.heartbeat_due = true;
                    if matches!(self.state, State::Online) {
                        self.start_heartbeat().await;
                    }
                }
            }
        }
    }

    fn state_deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Idle { retry_at } => *retry_at,
            State::Searching { deadline }
            | State::Connecting { deadline }
            | State::AwaitingHeartbeat { deadline }
            | State::Disconnecting { deadline } => Some(*deadline),
            State::AwaitingAck { exchange } => Some(exchange.deadline),
            State::Waiting { until } => Some(*until),
            State::Online => None,
        }
    }

    // -- Commands -----------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                self.want_connected = true;
                match self.state {
                    State::Idle { .. } => self.start_search().await,
                    State::Online
                    | State::Waiting { .. }
                    | State::AwaitingAck { .. }
                    | State::AwaitingHeartbeat { .. } => {
                        // Already up: re-announce for the waiting caller.
                        let _ = self.events.send(KnxEvent::Online);
                    }
                    _ => {}
                }
            }
            Command::Disconnect => {
                self.want_connected = false;
                match self.state {
                    State::Idle { .. } => {
                        self.state = State::Idle { retry_at: None };
                        let _ = self.events.send(KnxEvent::Offline);
                    }
                    State::Searching { .. } | State::Connecting { .. } => {
                        self.enter_idle().await;
                    }
                    State::Disconnecting { .. } => {}
                    _ => self.enter_disconnecting().await,
                }
            }
            Command::Group(mut req) => {
                if let Some((key, waiter)) = req.read_waiter.take() {
                    self.read_waiters.entry(key).or_default().push(waiter);
                }
                if !self.builder.is_tunneling() {
                    self.send_routing(req.datagram, req.ack).await;
                    return;
                }
                self.queue.push_back(QueuedRequest {
                    datagram: req.datagram,
                    ack: req.ack,
                });
                if matches!(self.state, State::Online) {
                    self.dispatch_next().await;
                }
            }
        }
    }

    /// Routing mode: multicast the indication, no ACK leg, no pacing hold.
    async fn send_routing(&mut self, datagram: Datagram, ack: oneshot::Sender<Result<()>>) {
        if self.discovery.is_none() {
            match self.provider.discovery().await {
                Ok(t) => self.discovery = Some(t),
                Err(e) => {
                    let _ = ack.send(Err(e));
                    return;
                }
            }
        }
        let bytes = match datagram.frame.encode() {
            Ok(b) => b,
            Err(e) => {
                let _ = ack.send(Err(e));
                return;
            }
        };
        let target = SocketAddrV4::new(KNXNETIP_MULTICAST_ADDR, KNXNETIP_PORT);
        let result = match &mut self.discovery {
            Some(t) => t.send_to(&bytes, target).await,
            None => Err(KnxError::NotConnected),
        };
        let _ = ack.send(result);
    }

    // -- State entries ------------------------------------------------------

    async fn start_search(&mut self) {
        if let Some(endpoint) = self.config.remote_endpoint {
            log::debug!("gateway preconfigured at {endpoint}, skipping discovery");
            self.remote = Some(endpoint);
            self.enter_connecting().await;
            return;
        }

        if self.discovery.is_none() {
            match self.provider.discovery().await {
                Ok(t) => self.discovery = Some(t),
                Err(e) => {
                    log::error!("cannot open discovery socket: {e}");
                    self.enter_idle().await;
                    return;
                }
            }
        }

        let dg = self.builder.search_request();
        let target = SocketAddrV4::new(KNXNETIP_MULTICAST_ADDR, KNXNETIP_PORT);
        if let Ok(bytes) = dg.frame.encode() {
            if let Some(t) = &mut self.discovery {
                if let Err(e) = t.send_to(&bytes, target).await {
                    log::warn!("search request failed: {e}");
                }
            }
        }
        log::info!("searching for KNXnet/IP gateways on {target}");
        self.state = State::Searching {
            deadline: Instant::now() + SEARCH_TIMEOUT,
        };
    }

    async fn enter_connecting(&mut self) {
        // The discovery socket has served its purpose in tunneling mode;
        // routing mode keeps it for multicast indications.
        if self.builder.is_tunneling() {
            self.discovery = None;
        }

        let Some(remote) = self.remote else {
            self.enter_idle().await;
            return;
        };
        match self.provider.unicast().await {
            Ok(t) => self.control = Some(t),
            Err(e) => {
                log::error!("cannot open control socket: {e}");
                self.enter_idle().await;
                return;
            }
        }

        let dg = self.builder.connect_request();
        if let Ok(bytes) = dg.frame.encode() {
            self.send_control(&bytes).await;
        }
        log::info!("connecting to gateway at {remote}");
        self.state = State::Connecting {
            deadline: Instant::now() + CONNECT_TIMEOUT,
        };
    }

    /// Connected entry actions, then straight on to online.
    async fn enter_connected(&mut self, channel_id: u8) {
        self.channel_id = Some(channel_id);
        self.seq_out = 0;
        self.seq_in = 0;
        self.heartbeat_failures = 0;
        self.heartbeat_due = false;
        self.next_heartbeat = Some(Instant::now() + HEARTBEAT_INTERVAL);
        log::info!("tunnel established, channel {channel_id}");
        let _ = self.events.send(KnxEvent::Online);
        self.enter_online().await;
    }

    async fn enter_online(&mut self) {
        self.state = State::Online;
        if self.heartbeat_due {
            self.start_heartbeat().await;
            return;
        }
        if !self.queue.is_empty() {
            self.dispatch_next().await;
        }
    }

    async fn enter_waiting(&mut self) {
        self.state = State::Waiting {
            until: Instant::now() + PACING_DELAY,
        };
        // Replay inbound traffic that arrived mid-exchange, in order.
        while let Some((header, cemi)) = self.deferred_inbound.pop_front() {
            self.process_inbound(header, cemi).await;
            self.state = State::Waiting {
                until: Instant::now() + PACING_DELAY,
            };
        }
    }

    async fn enter_disconnecting(&mut self) {
        for req in self.queue.drain(..) {
            let _ = req.ack.send(Err(KnxError::ConnectionLost));
        }
        self.deferred_inbound.clear();
        self.next_heartbeat = None;
        self.heartbeat_due = false;

        let dg = self.builder.disconnect_request(self.channel_id.unwrap_or(0));
        if let Ok(bytes) = dg.frame.encode() {
            self.send_control(&bytes).await;
        }
        log::info!("disconnecting from gateway");
        self.state = State::Disconnecting {
            deadline: Instant::now() + DISCONNECT_TIMEOUT,
        };
    }

    async fn enter_idle(&mut self) {
        self.control = None;
        if self.builder.is_tunneling() {
            self.discovery = None;
        }
        self.channel_id = None;
        self.next_heartbeat = None;
        self.heartbeat_due = false;
        for req in self.queue.drain(..) {
            let _ = req.ack.send(Err(KnxError::ConnectionLost));
        }
        self.deferred_inbound.clear();
        self.read_waiters.clear();

        let retry_at = if self.want_connected {
            Some(Instant::now() + IDLE_RETRY_DELAY)
        } else {
            None
        };
        let previous = std::mem::replace(&mut self.state, State::Idle { retry_at });
        if let State::AwaitingAck { exchange } = previous {
            let _ = exchange.request.ack.send(Err(KnxError::ConnectionLost));
        }
        log::info!("connection offline");
        let _ = self.events.send(KnxEvent::Offline);
    }

    // -- Outbound dispatch --------------------------------------------------

    async fn dispatch_next(&mut self) {
        let Some(mut req) = self.queue.pop_front() else {
            return;
        };
        let Some(channel_id) = self.channel_id else {
            let _ = req.ack.send(Err(KnxError::NotConnected));
            return;
        };

        let sequence = self.seq_out;
        if let Body::TunnelingRequest { header, .. } = &mut req.datagram.frame.body {
            *header = ConnectionHeader::new(channel_id, sequence, 0);
        }
        let wire = match req.datagram.frame.encode() {
            Ok(w) => w,
            Err(e) => {
                let _ = req.ack.send(Err(e));
                return;
            }
        };

        log::debug!(
            "tunneling request seq {sequence} (correlation {})",
            req.datagram.id
        );
        self.send_control(&wire).await;
        self.state = State::AwaitingAck {
            exchange: AckExchange {
                request: req,
                wire,
                sequence,
                deadline: Instant::now() + ACK_TIMEOUT,
                attempt: 1,
            },
        };
    }

    async fn start_heartbeat(&mut self) {
        self.heartbeat_due = false;
        self.next_heartbeat = Some(Instant::now() + HEARTBEAT_INTERVAL);
        self.send_heartbeat_request().await;
    }

    async fn send_heartbeat_request(&mut self) {
        let dg = self
            .builder
            .connectionstate_request(self.channel_id.unwrap_or(0));
        if let Ok(bytes) = dg.frame.encode() {
            self.send_control(&bytes).await;
        }
        log::debug!("connection state request");
        self.state = State::AwaitingHeartbeat {
            deadline: Instant::now() + HEARTBEAT_TIMEOUT,
        };
    }

    async fn send_control(&mut self, bytes: &[u8]) {
        let Some(remote) = self.remote else {
            return;
        };
        if let Some(t) = &mut self.control {
            if let Err(e) = t.send_to(bytes, remote).await {
                log::warn!("send to {remote} failed: {e}");
            }
        }
    }

    // -- Timers -------------------------------------------------------------

    async fn handle_state_timeout(&mut self) {
        match &self.state {
            State::Idle { retry_at: Some(_) } => {
                self.state = State::Idle { retry_at: None };
                if self.want_connected {
                    self.start_search().await;
                }
            }
            State::Searching { .. } => {
                log::warn!("gateway search timed out");
                self.enter_idle().await;
            }
            State::Connecting { .. } => {
                log::warn!("connect timed out");
                self.enter_disconnecting().await;
            }
            State::AwaitingAck { .. } => self.ack_retry_or_fail(None).await,
            State::AwaitingHeartbeat { .. } => self.heartbeat_failure().await,
            State::Waiting { .. } => self.enter_online().await,
            State::Disconnecting { .. } => {
                log::debug!("disconnect response missing, going idle");
                self.enter_idle().await;
            }
            _ => {}
        }
    }

    /// Bounded retry for the in-flight tunneling request; `status` carries
    /// the error code when a negative ACK (rather than silence) got us here.
    async fn ack_retry_or_fail(&mut self, status: Option<u8>) {
        let resend = match &mut self.state {
            State::AwaitingAck { exchange } => {
                if exchange.attempt < ACK_MAX_ATTEMPTS {
                    exchange.attempt += 1;
                    exchange.deadline = Instant::now() + ACK_TIMEOUT;
                    Some(exchange.wire.clone())
                } else {
                    None
                }
            }
            _ => return,
        };

        match resend {
            Some(wire) => {
                log::warn!("no usable ack, retransmitting seq {}", self.seq_out);
                self.send_control(&wire).await;
            }
            None => {
                let State::AwaitingAck { exchange } =
                    std::mem::replace(&mut self.state, State::Online)
                else {
                    return;
                };
                let error = match status {
                    Some(code) => KnxError::AckFailed(code),
                    None => KnxError::NoResponse,
                };
                log::warn!(
                    "tunneling request seq {} failed: {error}",
                    exchange.sequence
                );
                let _ = exchange.request.ack.send(Err(error));
                self.enter_disconnecting().await;
            }
        }
    }

    async fn heartbeat_failure(&mut self) {
        self.heartbeat_failures += 1;
        if self.heartbeat_failures > MAX_HEARTBEAT_FAILURES {
            log::warn!(
                "gateway missed {} heartbeats, disconnecting",
                self.heartbeat_failures
            );
            self.enter_disconnecting().await;
        } else {
            log::debug!(
                "heartbeat failure {}/{}",
                self.heartbeat_failures,
                MAX_HEARTBEAT_FAILURES
            );
            self.send_heartbeat_request().await;
        }
    }

    // -- Inbound ------------------------------------------------------------

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddrV4) {
        let mut frame = match Frame::parse(data) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("dropping malformed packet from {from}: {e}");
                return;
            }
        };
        frame.patch_nat(from);

        // Frames carrying a channel id must match the session; the connect
        // response is the one that establishes it.
        if let Some(channel) = frame.channel_id() {
            let establishes = matches!(frame.body, Body::ConnectResponse { .. });
            if !establishes && self.channel_id != Some(channel) {
                log::debug!(
                    "dropping frame for channel {channel} (session {:?})",
                    self.channel_id
                );
                return;
            }
        }

        match frame.body {
            Body::SearchResponse {
                control,
                device_info,
            } => {
                self.handle_search_response(control.endpoint, device_info).await;
            }
            Body::ConnectResponse { state, .. } => self.handle_connect_response(state).await,
            Body::ConnectionstateResponse { state } => {
                self.handle_heartbeat_response(state).await;
            }
            Body::DisconnectRequest { .. } => {
                log::info!("gateway requested disconnect");
                self.enter_idle().await;
            }
            Body::DisconnectResponse { .. } => {
                if matches!(self.state, State::Disconnecting { .. }) {
                    self.enter_idle().await;
                }
            }
            Body::TunnelingAck { header } => self.handle_tunneling_ack(header).await,
            Body::TunnelingRequest { header, cemi } => {
                self.handle_tunneling_request(header, cemi).await;
            }
            Body::RoutingIndication { cemi } => {
                if cemi.msg_code == CemiMessageCode::LDataInd {
                    self.emit_group_event(&cemi);
                }
            }
            // Peer-role requests; a client has nothing to do with them.
            Body::SearchRequest { .. }
            | Body::ConnectRequest { .. }
            | Body::ConnectionstateRequest { .. } => {}
        }
    }

    async fn handle_search_response(&mut self, endpoint: SocketAddrV4, device_info: DeviceInfoDib) {
        if !matches!(self.state, State::Searching { .. }) {
            return;
        }
        if let Some(filter) = self.config.phys_server_addr {
            if device_info.individual_addr != filter {
                log::debug!(
                    "ignoring gateway {} ({}): filtered on {filter}",
                    device_info.individual_addr,
                    device_info.name()
                );
                return;
            }
        }
        log::info!(
            "gateway {} \"{}\" at {endpoint}",
            device_info.individual_addr,
            device_info.name()
        );
        self.remote = Some(endpoint);
        self.enter_connecting().await;
    }

    async fn handle_connect_response(&mut self, state: ConnState) {
        if !matches!(self.state, State::Connecting { .. }) {
            return;
        }
        match state.status {
            E_NO_ERROR => self.enter_connected(state.channel_id).await,
            E_NO_MORE_CONNECTIONS => {
                log::warn!("gateway has no free tunnel connections");
                self.enter_idle().await;
            }
            status => {
                log::warn!("gateway refused connection, status {status:#04x}");
                self.enter_idle().await;
            }
        }
    }

    async fn handle_heartbeat_response(&mut self, state: ConnState) {
        if !matches!(self.state, State::AwaitingHeartbeat { .. }) {
            return;
        }
        if state.is_ok() {
            self.heartbeat_failures = 0;
            self.enter_waiting().await;
        } else {
            log::debug!("heartbeat answered with status {:#04x}", state.status);
            self.heartbeat_failure().await;
        }
    }

    async fn handle_tunneling_ack(&mut self, header: ConnectionHeader) {
        let State::AwaitingAck { exchange } = &self.state else {
            log::debug!("stray tunneling ack seq {}", header.sequence);
            return;
        };
        if header.sequence != exchange.sequence {
            // Not ours; keep the timer running.
            log::debug!(
                "ack seq {} does not match in-flight seq {}",
                header.sequence,
                exchange.sequence
            );
            return;
        }

        if header.status == E_NO_ERROR {
            self.seq_out = self.seq_out.wrapping_add(1);
            let State::AwaitingAck { exchange } =
                std::mem::replace(&mut self.state, State::Online)
            else {
                return;
            };
            let _ = exchange.request.ack.send(Ok(()));
            self.enter_waiting().await;
        } else {
            self.ack_retry_or_fail(Some(header.status)).await;
        }
    }

    async fn handle_tunneling_request(&mut self, header: ConnectionHeader, cemi: CemiFrame) {
        match self.state {
            State::Online => {
                self.process_inbound(header, cemi).await;
                self.enter_waiting().await;
            }
            State::Waiting { .. } => {
                self.process_inbound(header, cemi).await;
                self.state = State::Waiting {
                    until: Instant::now() + PACING_DELAY,
                };
            }
            State::AwaitingAck { .. } | State::AwaitingHeartbeat { .. } => {
                self.deferred_inbound.push_back((header, cemi));
            }
            _ => {
                log::debug!(
                    "dropping tunneling request in state {}",
                    self.state.name()
                );
            }
        }
    }

    /// Acknowledge and deliver one inbound tunneling request. The expected
    /// sequence advances only on an exact match; the previous sequence is
    /// re-acknowledged without redelivery so a gateway retransmission does
    /// not stall the tunnel.
    async fn process_inbound(&mut self, header: ConnectionHeader, cemi: CemiFrame) {
        let Some(channel_id) = self.channel_id else {
            return;
        };
        let expected = self.seq_in;
        let duplicate = header.sequence == expected.wrapping_sub(1);

        if header.sequence != expected && !duplicate {
            log::warn!(
                "inbound seq {} outside window (expected {expected}), dropped without ack",
                header.sequence
            );
            return;
        }

        let ack = self
            .builder
            .tunneling_ack(channel_id, header.sequence, E_NO_ERROR);
        if let Ok(bytes) = ack.frame.encode() {
            self.send_control(&bytes).await;
        }

        if duplicate {
            log::debug!("re-acknowledged duplicate seq {}", header.sequence);
            return;
        }

        self.seq_in = self.seq_in.wrapping_add(1);
        match cemi.msg_code {
            CemiMessageCode::LDataInd => self.emit_group_event(&cemi),
            // Confirmations consume a sequence number but carry no event.
            CemiMessageCode::LDataCon => {
                log::trace!("L_Data.con for source {}", cemi.source);
            }
            other => log::debug!("ignoring tunneled {other:?}"),
        }
    }

    fn emit_group_event(&mut self, cemi: &CemiFrame) {
        let Some(apdu) = &cemi.apdu else {
            return;
        };
        let Some(dest) = cemi.destination_group() else {
            return;
        };
        let payload = apdu.payload.as_bytes().to_vec();

        if apdu.apci == Apci::GroupValueResponse {
            if let Some(waiters) = self.read_waiters.remove(&dest.raw()) {
                for waiter in waiters {
                    let _ = waiter.send(payload.clone());
                }
            }
        }

        log::debug!("{} from {} to {}", apdu.apci, cemi.source, dest);
        let _ = self.events.send(KnxEvent::GroupValue {
            apci: apdu.apci,
            src: cemi.source,
            dest,
            payload,
        });
    }

    /// API handle dropped: best-effort disconnect, then stop.
    async fn shutdown(&mut self) {
        if let Some(channel_id) = self.channel_id {
            let dg = self.builder.disconnect_request(channel_id);
            if let Ok(bytes) = dg.frame.encode() {
                self.send_control(&bytes).await;
            }
        }
        log::debug!("connection task stopping");
    }
}
