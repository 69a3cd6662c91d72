//! JSON-lines TCP bus between cluster members.
//!
//! Every unit listens on one socket and lazily opens one outbound
//! connection per peer, reconnecting on the next send after a drop.
//! Frames are encoded by [`crate::codec`]; inbound traffic is converted
//! to events and fed to the runner's channels. Requests are correlated
//! by the sender's [`RequestId`] and resolved to `Event::ReplyReceived`
//! by a reply frame, a timeout, or a missing route, so the state
//! machine always sees exactly one outcome per request.
//!
//! Delivery is best effort. A line queued for a dead peer is dropped
//! when the reconnect fails; the requester's timeout covers the loss,
//! and broadcasts are re-sent by the protocol's own periodic timers.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use gridmesh_core::{
    Event, OutboundMessage, OutboundRequest, RequestId, RequestIdAllocator, INBOUND_SCOPE,
};
use gridmesh_messages::{RequestError, RequestOutcome, TraceContext};
use gridmesh_types::UnitId;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Frame};
use crate::metrics;

/// Errors from starting the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to bind bus listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A remote endpoint the bus can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusPeer {
    Unit(UnitId),
    DealService,
}

impl fmt::Display for BusPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit(unit) => write!(f, "{unit}"),
            Self::DealService => f.write_str("the trading service"),
        }
    }
}

/// Bus wiring for one unit process.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub listen_addr: SocketAddr,
    /// Listen addresses of the other cluster members.
    pub peers: HashMap<UnitId, SocketAddr>,
    /// Listen address of the trading layer, if one is attached.
    pub deal_service: Option<SocketAddr>,
    pub connect_timeout: Duration,
    pub max_line_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            peers: HashMap::new(),
            deal_service: None,
            connect_timeout: Duration::from_millis(500),
            max_line_bytes: 256 * 1024,
        }
    }
}

/// Where the reply to an inbound request must go.
enum ReplyRoute {
    /// The request came from this process; deliver the reply as an event
    /// carrying the requester's original id.
    Loopback { request_id: RequestId },
    /// The request came over the wire; answer with a reply frame.
    Remote {
        peer: BusPeer,
        correlation: u64,
        address: &'static str,
    },
}

struct PendingRequest {
    request_id: RequestId,
    timeout_task: Option<JoinHandle<()>>,
}

/// The messaging endpoint of one unit.
///
/// Shared between the runner and the bus's own tasks as `Arc`; all
/// background tasks hold a `Weak` so dropping the last runner-side
/// handle tears the bus down.
pub struct MessageBus {
    unit_id: UnitId,
    local_addr: SocketAddr,
    connect_timeout: Duration,
    /// Remote traffic, bounded. Applies backpressure to the read loops.
    network_tx: mpsc::Sender<Event>,
    /// Self-delivery and request outcomes, lossless.
    internal_tx: mpsc::UnboundedSender<Event>,
    inbound_ids: Mutex<RequestIdAllocator>,
    reply_routes: Mutex<HashMap<RequestId, ReplyRoute>>,
    /// In-flight outbound requests keyed by wire correlation id.
    pending: Mutex<HashMap<u64, PendingRequest>>,
    connections: RwLock<HashMap<BusPeer, mpsc::UnboundedSender<String>>>,
    peers: RwLock<HashMap<UnitId, SocketAddr>>,
    deal_service: RwLock<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    /// Bind the listener and start accepting peer connections.
    pub async fn start(
        unit_id: UnitId,
        config: BusConfig,
        network_tx: mpsc::Sender<Event>,
        internal_tx: mpsc::UnboundedSender<Event>,
    ) -> Result<Arc<Self>, BusError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| BusError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| BusError::Bind {
            addr: config.listen_addr,
            source,
        })?;
        info!(unit = %unit_id, %local_addr, "bus listening");

        let bus = Arc::new(Self {
            unit_id,
            local_addr,
            connect_timeout: config.connect_timeout,
            network_tx,
            internal_tx,
            inbound_ids: Mutex::new(RequestIdAllocator::scoped(INBOUND_SCOPE)),
            reply_routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            peers: RwLock::new(config.peers),
            deal_service: RwLock::new(config.deal_service),
            accept_task: Mutex::new(None),
        });

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::downgrade(&bus),
            config.max_line_bytes,
        ));
        *bus.accept_task.lock() = Some(task);
        Ok(bus)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn add_peer(&self, unit: UnitId, addr: SocketAddr) {
        self.peers.write().insert(unit, addr);
    }

    pub fn set_deal_service(&self, addr: SocketAddr) {
        *self.deal_service.write() = Some(addr);
    }

    /// Publish a broadcast to every configured peer and to this unit
    /// itself.
    ///
    /// Self-delivery bypasses the wire so a unit always hears its own
    /// broadcasts, partitioned or not.
    pub fn publish(self: &Arc<Self>, message: OutboundMessage) {
        let address = message.address();
        match codec::encode_message(self.unit_id, &message) {
            Ok(line) => {
                let peers: Vec<UnitId> = self.peers.read().keys().copied().collect();
                for unit in peers {
                    if unit == self.unit_id {
                        continue;
                    }
                    if self.send_line(BusPeer::Unit(unit), line.clone()) {
                        metrics::record_bus_sent(address);
                    }
                }
            }
            Err(codec_error) => error!(%codec_error, address, "failed to encode broadcast"),
        }
        let _ = self.internal_tx.send(codec::local_event(message));
    }

    /// Send a message to one unit.
    pub fn send(self: &Arc<Self>, to: UnitId, message: OutboundMessage) {
        if to == self.unit_id {
            let _ = self.internal_tx.send(codec::local_event(message));
            return;
        }
        let address = message.address();
        match codec::encode_message(self.unit_id, &message) {
            Ok(line) => {
                if self.send_line(BusPeer::Unit(to), line) {
                    metrics::record_bus_sent(address);
                } else {
                    debug!(unit = %to, address, "no route for direct message");
                }
            }
            Err(codec_error) => error!(%codec_error, address, "failed to encode message"),
        }
    }

    /// Issue a request. Exactly one `Event::ReplyReceived` carrying
    /// `request_id` is delivered later: the remote answer, a timeout, or
    /// an immediate unreachable failure.
    pub fn request(
        self: &Arc<Self>,
        target: BusPeer,
        request: OutboundRequest,
        request_id: RequestId,
        timeout: Duration,
    ) {
        if target == BusPeer::Unit(self.unit_id) {
            self.loopback_request(request, request_id);
            return;
        }

        let address = request.address();
        let correlation = request_id.0;
        let line = match codec::encode_request(self.unit_id, correlation, &request) {
            Ok(line) => line,
            Err(codec_error) => {
                error!(%codec_error, address, "failed to encode request");
                self.deliver_failure(request_id, RequestError::unreachable("encoding failed"));
                return;
            }
        };

        self.pending.lock().insert(
            correlation,
            PendingRequest {
                request_id,
                timeout_task: None,
            },
        );
        if !self.send_line(target, line) {
            self.pending.lock().remove(&correlation);
            self.deliver_failure(
                request_id,
                RequestError::unreachable(format!("no bus route to {target}")),
            );
            return;
        }
        metrics::record_bus_sent(address);
        metrics::metrics().requests_in_flight.inc();

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(bus) = weak.upgrade() {
                bus.fail_pending(correlation, RequestError::timeout());
            }
        });
        let mut pending = self.pending.lock();
        match pending.get_mut(&correlation) {
            // The reply can land before the timeout task is attached.
            Some(entry) => entry.timeout_task = Some(task),
            None => task.abort(),
        }
    }

    /// Answer an inbound request by its inbound id.
    pub fn reply(self: &Arc<Self>, request_id: RequestId, outcome: RequestOutcome) {
        let Some(route) = self.reply_routes.lock().remove(&request_id) else {
            warn!(?request_id, "reply without a pending inbound request");
            return;
        };
        match route {
            ReplyRoute::Loopback { request_id } => {
                let _ = self.internal_tx.send(Event::ReplyReceived {
                    request_id,
                    outcome,
                });
            }
            ReplyRoute::Remote {
                peer,
                correlation,
                address,
            } => self.send_reply_frame(peer, address, correlation, &outcome),
        }
    }

    /// A request this unit addresses to itself skips the wire but still
    /// goes through the inbound-id and reply-route machinery, so the
    /// serving path is identical to a remote request.
    fn loopback_request(self: &Arc<Self>, request: OutboundRequest, request_id: RequestId) {
        let inbound = self.inbound_ids.lock().next();
        match codec::request_event(request, inbound) {
            Some(event) => {
                self.reply_routes
                    .lock()
                    .insert(inbound, ReplyRoute::Loopback { request_id });
                let _ = self.internal_tx.send(event);
            }
            None => self.deliver_failure(
                request_id,
                RequestError::not_found("interchange requests are served by the trading layer"),
            ),
        }
    }

    async fn dispatch_line(self: &Arc<Self>, line: &str) {
        match codec::decode_frame(line) {
            Ok(Frame::Message {
                sender,
                address,
                event,
                trace_context,
            }) => {
                metrics::record_bus_received(&address);
                link_remote_span(&address, trace_context.as_ref());
                debug!(?sender, address, "bus message received");
                if self.network_tx.send(event).await.is_err() {
                    debug!("runner gone; dropping bus message");
                }
            }
            Ok(Frame::Request {
                sender,
                correlation,
                request,
            }) => self.serve_inbound(sender, correlation, request).await,
            Ok(Frame::Reply {
                address,
                correlation,
                outcome,
            }) => {
                metrics::record_bus_received(&address);
                self.resolve_pending(correlation, outcome);
            }
            Err(codec_error) => warn!(%codec_error, "undecodable bus frame dropped"),
        }
    }

    async fn serve_inbound(
        self: &Arc<Self>,
        sender: Option<UnitId>,
        correlation: u64,
        request: OutboundRequest,
    ) {
        let address = request.address();
        metrics::record_bus_received(address);
        let peer = match sender {
            Some(unit) => BusPeer::Unit(unit),
            None => BusPeer::DealService,
        };

        let inbound = self.inbound_ids.lock().next();
        match codec::request_event(request, inbound) {
            Some(event) => {
                self.reply_routes.lock().insert(
                    inbound,
                    ReplyRoute::Remote {
                        peer,
                        correlation,
                        address,
                    },
                );
                if self.network_tx.send(event).await.is_err() {
                    self.reply_routes.lock().remove(&inbound);
                }
            }
            None => {
                let outcome: RequestOutcome = Err(RequestError::not_found(
                    "interchange requests are served by the trading layer",
                ));
                self.send_reply_frame(peer, address, correlation, &outcome);
            }
        }
    }

    fn send_reply_frame(
        self: &Arc<Self>,
        peer: BusPeer,
        address: &str,
        correlation: u64,
        outcome: &RequestOutcome,
    ) {
        match codec::encode_reply(self.unit_id, address, correlation, outcome) {
            Ok(line) => {
                if self.send_line(peer, line) {
                    metrics::record_bus_sent(address);
                } else {
                    debug!(%peer, address, "no route for reply");
                }
            }
            Err(codec_error) => error!(%codec_error, address, "failed to encode reply"),
        }
    }

    fn resolve_pending(&self, correlation: u64, outcome: RequestOutcome) {
        let Some(pending) = self.pending.lock().remove(&correlation) else {
            // Late reply after the timeout already resolved it.
            debug!(correlation, "reply without a pending request");
            return;
        };
        if let Some(task) = pending.timeout_task {
            task.abort();
        }
        metrics::metrics().requests_in_flight.dec();
        let _ = self.internal_tx.send(Event::ReplyReceived {
            request_id: pending.request_id,
            outcome,
        });
    }

    fn fail_pending(&self, correlation: u64, failure: RequestError) {
        self.resolve_pending(correlation, Err(failure));
    }

    fn deliver_failure(&self, request_id: RequestId, failure: RequestError) {
        let _ = self.internal_tx.send(Event::ReplyReceived {
            request_id,
            outcome: Err(failure),
        });
    }

    fn route(&self, peer: BusPeer) -> Option<SocketAddr> {
        match peer {
            BusPeer::Unit(unit) => self.peers.read().get(&unit).copied(),
            BusPeer::DealService => *self.deal_service.read(),
        }
    }

    /// Queue one line for a peer, opening or reopening the connection as
    /// needed. Returns false when the peer has no configured address.
    fn send_line(self: &Arc<Self>, peer: BusPeer, mut line: String) -> bool {
        let Some(addr) = self.route(peer) else {
            return false;
        };

        let mut connections = self.connections.write();
        if let Some(tx) = connections.get(&peer) {
            match tx.send(line) {
                Ok(()) => return true,
                // Writer exited; reclaim the line and reconnect.
                Err(mpsc::error::SendError(returned)) => line = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(line);
        connections.insert(peer, tx.clone());
        tokio::spawn(write_loop(
            Arc::downgrade(self),
            peer,
            addr,
            rx,
            tx,
            self.connect_timeout,
        ));
        true
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        for (_, pending) in self.pending.lock().drain() {
            if let Some(task) = pending.timeout_task {
                task.abort();
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, bus: Weak<MessageBus>, max_line_bytes: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "bus connection accepted");
                tokio::spawn(read_loop(bus.clone(), stream, max_line_bytes));
            }
            Err(io_error) => warn!(%io_error, "bus accept failed"),
        }
        if bus.strong_count() == 0 {
            break;
        }
    }
}

async fn read_loop(bus: Weak<MessageBus>, stream: TcpStream, max_line_bytes: usize) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(io_error) => {
                debug!(%io_error, "bus read failed");
                break;
            }
        };
        if line.len() > max_line_bytes {
            warn!(bytes = line.len(), "oversized bus frame; closing connection");
            break;
        }
        let Some(bus) = bus.upgrade() else { break };
        bus.dispatch_line(&line).await;
    }
}

/// One outbound connection: drain queued lines into the socket until the
/// queue closes or a write fails. Dropping the receiver makes senders
/// fail, which is the reconnect signal for the next [`MessageBus::send_line`].
async fn write_loop(
    bus: Weak<MessageBus>,
    peer: BusPeer,
    addr: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<String>,
    connect_timeout: Duration,
) {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            debug!(%peer, %addr, "bus connected");
            let mut writer = BufWriter::new(stream);
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    debug!(%peer, "bus write failed");
                    break;
                }
            }
        }
        Ok(Err(io_error)) => debug!(%peer, %addr, %io_error, "bus connect failed"),
        Err(_) => debug!(%peer, %addr, "bus connect timed out"),
    }

    // Deregister this connection unless a newer one already replaced it.
    if let Some(bus) = bus.upgrade() {
        let mut connections = bus.connections.write();
        if connections
            .get(&peer)
            .is_some_and(|current| current.same_channel(&tx))
        {
            connections.remove(&peer);
        }
    }
}

#[cfg(feature = "trace-propagation")]
fn link_remote_span(address: &str, trace_context: Option<&TraceContext>) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    if let Some(context) = trace_context {
        let span = tracing::info_span!("bus_receive", message.address = %address);
        span.set_parent(context.extract());
        let _entered = span.entered();
    }
}

#[cfg(not(feature = "trace-propagation"))]
fn link_remote_span(_address: &str, _trace_context: Option<&TraceContext>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use gridmesh_messages::{
        DemoteRequest, FaultQueryRequest, HeartbeatBroadcast, ReplyPayload, RequestErrorKind,
        TelemetryRequestBroadcast,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    struct TestEndpoint {
        bus: Arc<MessageBus>,
        network_rx: mpsc::Receiver<Event>,
        internal_rx: mpsc::UnboundedReceiver<Event>,
    }

    async fn start_endpoint(unit: u64) -> TestEndpoint {
        let (network_tx, network_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let bus = MessageBus::start(UnitId(unit), BusConfig::default(), network_tx, internal_tx)
            .await
            .expect("bind on an ephemeral port");
        TestEndpoint {
            bus,
            network_rx,
            internal_rx,
        }
    }

    /// Two endpoints wired to each other's listen addresses.
    async fn start_pair() -> (TestEndpoint, TestEndpoint) {
        let a = start_endpoint(1).await;
        let b = start_endpoint(2).await;
        a.bus.add_peer(UnitId(2), b.bus.local_addr());
        b.bus.add_peer(UnitId(1), a.bus.local_addr());
        (a, b)
    }

    async fn recv_network(endpoint: &mut TestEndpoint) -> Event {
        timeout(Duration::from_secs(2), endpoint.network_rx.recv())
            .await
            .expect("network event within deadline")
            .expect("channel open")
    }

    async fn recv_internal(endpoint: &mut TestEndpoint) -> Event {
        timeout(Duration::from_secs(2), endpoint.internal_rx.recv())
            .await
            .expect("internal event within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_publish_crosses_the_wire_and_loops_back() {
        let (mut a, mut b) = start_pair().await;

        a.bus
            .publish(OutboundMessage::Heartbeat(HeartbeatBroadcast::claim(
                UnitId(1),
            )));

        match recv_network(&mut b).await {
            Event::HeartbeatReceived { coordinator } => assert_eq!(coordinator, Some(UnitId(1))),
            other => panic!("wrong event at peer: {}", other.type_name()),
        }
        match recv_internal(&mut a).await {
            Event::HeartbeatReceived { coordinator } => assert_eq!(coordinator, Some(UnitId(1))),
            other => panic!("wrong self-delivery: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_direct_send_reaches_one_peer() {
        let (a, mut b) = start_pair().await;

        a.bus.send(
            UnitId(2),
            OutboundMessage::TelemetryRequest(TelemetryRequestBroadcast::new(7, UnitId(1))),
        );

        match recv_network(&mut b).await {
            Event::TelemetryRequested { round, requester } => {
                assert_eq!(round, 7);
                assert_eq!(requester, UnitId(1));
            }
            other => panic!("wrong event at peer: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let (mut a, mut b) = start_pair().await;
        let request_id = RequestId(0x0100);

        a.bus.request(
            BusPeer::Unit(UnitId(2)),
            OutboundRequest::FaultQuery(FaultQueryRequest::new()),
            request_id,
            Duration::from_secs(2),
        );

        let inbound = match recv_network(&mut b).await {
            Event::FaultQueryRequested { request_id } => request_id,
            other => panic!("wrong event at server: {}", other.type_name()),
        };
        assert_eq!(inbound.scope(), INBOUND_SCOPE);

        b.bus.reply(inbound, Ok(ReplyPayload::HasActiveFault(false)));

        match recv_internal(&mut a).await {
            Event::ReplyReceived {
                request_id: answered,
                outcome,
            } => {
                assert_eq!(answered, request_id);
                assert_eq!(outcome.unwrap().as_has_active_fault(), Some(false));
            }
            other => panic!("wrong event at requester: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let mut a = start_endpoint(1).await;
        // A listener that accepts but never replies.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        a.bus.add_peer(UnitId(2), silent.local_addr().unwrap());

        a.bus.request(
            BusPeer::Unit(UnitId(2)),
            OutboundRequest::FaultQuery(FaultQueryRequest::new()),
            RequestId(0x0200),
            Duration::from_millis(50),
        );

        match recv_internal(&mut a).await {
            Event::ReplyReceived { outcome, .. } => {
                assert_eq!(outcome.unwrap_err().kind, RequestErrorKind::Timeout);
            }
            other => panic!("wrong event: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_peer_fails_unreachable() {
        let mut a = start_endpoint(1).await;

        a.bus.request(
            BusPeer::Unit(UnitId(9)),
            OutboundRequest::FaultQuery(FaultQueryRequest::new()),
            RequestId(0x0300),
            Duration::from_secs(1),
        );

        match recv_internal(&mut a).await {
            Event::ReplyReceived { outcome, .. } => {
                assert_eq!(outcome.unwrap_err().kind, RequestErrorKind::Unreachable);
            }
            other => panic!("wrong event: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_missing_deal_service_fails_unreachable() {
        let mut a = start_endpoint(1).await;

        a.bus.request(
            BusPeer::DealService,
            OutboundRequest::DisposeDeal(gridmesh_messages::DisposeDealRequest::new(
                gridmesh_types::DealId(3),
            )),
            RequestId(0x0400),
            Duration::from_secs(1),
        );

        match recv_internal(&mut a).await {
            Event::ReplyReceived { outcome, .. } => {
                assert_eq!(outcome.unwrap_err().kind, RequestErrorKind::Unreachable);
            }
            other => panic!("wrong event: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_self_request_loops_back_through_inbound_path() {
        let mut a = start_endpoint(1).await;
        let request_id = RequestId(0x0500);

        a.bus.request(
            BusPeer::Unit(UnitId(1)),
            OutboundRequest::Demote(DemoteRequest::new(vec!["handover".to_string()])),
            request_id,
            Duration::from_secs(1),
        );

        let inbound = match recv_internal(&mut a).await {
            Event::DemoteRequested { request_id, .. } => request_id,
            other => panic!("wrong serving event: {}", other.type_name()),
        };
        assert_eq!(inbound.scope(), INBOUND_SCOPE);
        assert_ne!(inbound, request_id);

        a.bus.reply(inbound, Ok(ReplyPayload::Ack));

        match recv_internal(&mut a).await {
            Event::ReplyReceived {
                request_id: answered,
                outcome,
            } => {
                assert_eq!(answered, request_id);
                assert_eq!(outcome.unwrap(), ReplyPayload::Ack);
            }
            other => panic!("wrong event: {}", other.type_name()),
        }
    }
}
