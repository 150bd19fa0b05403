//! The fabric core: channel transport and the transact surface.
//!
//! One [`Fabric`] instance is the whole lifecycle-scoped context: registry,
//! pool, directory, counters, links, and the pending-transaction table all
//! hang off it, with no ambient globals. Per (peer, channel) there is one lazily
//! established link: a bounded send queue drained by one writer task over
//! one connection, which is what gives per-peer-per-channel send ordering.
//! Inbound connections are assigned round-robin to a channel's receive
//! workers; each connection feeds exactly one worker, preserving FIFO
//! dispatch.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{FabricChannel, MAX_CHANNEL_RECV_WORKERS};
use crate::config::FabricConfig;
use crate::error::{FabricError, Result};
use crate::frame::{encode_frame, FrameHeader, Preamble, FRAME_HEADER_SIZE, PREAMBLE_SIZE};
use crate::metrics::{FabricMetrics, FabricRate};
use crate::msg::{FieldKind, MsgTemplate, MsgType};
use crate::node::{Membership, NodeDirectory, NodeId, NodeList};
use crate::pool::{MsgPool, PooledMsg};
use crate::registry::{HandlerKind, MsgHandler, TypeRegistry};
use crate::transact::{
    PendingTable, TransactComplete, TransactContext, TransactHandler, TRANSACT_REPLY_BIT,
};

struct Inbound {
    from: NodeId,
    msg_type: MsgType,
    payload: Bytes,
}

struct PeerLink {
    tx: mpsc::Sender<Bytes>,
}

struct ChannelState {
    workers: Mutex<Vec<mpsc::Sender<Inbound>>>,
    next_worker: AtomicUsize,
    sockets: AtomicUsize,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            next_worker: AtomicUsize::new(0),
            sockets: AtomicUsize::new(0),
        }
    }

    fn pick_worker(&self) -> Option<mpsc::Sender<Inbound>> {
        let workers = self.workers.lock().expect("channel worker lock poisoned");
        if workers.is_empty() {
            return None;
        }
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % workers.len();
        Some(workers[idx].clone())
    }
}

pub(crate) struct FabricInner {
    self_node: NodeId,
    config: FabricConfig,
    registry: Arc<TypeRegistry>,
    pool: MsgPool,
    directory: NodeDirectory,
    metrics: FabricMetrics,
    pending: PendingTable,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    links: Mutex<HashMap<(NodeId, FabricChannel), PeerLink>>,
    channels: [ChannelState; FabricChannel::COUNT],
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one fabric instance; cheap to clone.
#[derive(Clone)]
pub struct Fabric {
    pub(crate) inner: Arc<FabricInner>,
}

impl Fabric {
    /// Creates an initialized but not yet started fabric.
    pub fn new(self_node: NodeId, config: FabricConfig, membership: Arc<dyn Membership>) -> Self {
        let mut config = config;
        config.send_queue_capacity = config.send_queue_capacity.max(1);
        config.recv_queue_capacity = config.recv_queue_capacity.max(1);
        let registry = Arc::new(TypeRegistry::new());
        let inner = Arc::new(FabricInner {
            self_node,
            pool: MsgPool::new(registry.clone()),
            registry,
            directory: NodeDirectory::new(membership),
            metrics: FabricMetrics::new(),
            pending: PendingTable::new(),
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            channels: std::array::from_fn(|_| ChannelState::new()),
            tasks: Mutex::new(Vec::new()),
            config,
        });
        Self { inner }
    }

    /// This fabric's own node identifier.
    pub fn node_id(&self) -> NodeId {
        self.inner.self_node
    }

    /// The bound listener address; `None` before start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("local addr lock poisoned")
    }

    /// Registers a fire-and-forget message type. Must run before [`start`].
    ///
    /// [`start`]: Fabric::start
    pub fn register_handler(
        &self,
        msg_type: MsgType,
        template: MsgTemplate,
        scratch_size: usize,
        handler: Arc<dyn MsgHandler>,
    ) -> Result<()> {
        self.inner
            .registry
            .register(msg_type, template, scratch_size, handler)
    }

    /// Registers a transact responder type. Must run before [`start`].
    ///
    /// [`start`]: Fabric::start
    pub fn transact_register(
        &self,
        msg_type: MsgType,
        template: MsgTemplate,
        scratch_size: usize,
        handler: Arc<dyn TransactHandler>,
    ) -> Result<()> {
        self.inner
            .registry
            .register_transact(msg_type, template, scratch_size, handler)
    }

    /// Acquires a message of a registered type from the pool.
    pub fn msg_pool(&self) -> &MsgPool {
        &self.inner.pool
    }

    /// Binds the listener, seals the registry, and spawns the receive
    /// workers, accept loop, and transact reaper.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(FabricError::Unknown("fabric already started".into()));
        }
        self.inner.registry.seal();
        let listener = match TcpListener::bind(self.inner.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock().expect("local addr lock poisoned") = Some(local);

        let mut tasks = Vec::new();
        for channel in FabricChannel::ALL {
            let count = self.inner.config.recv_workers[channel.index()]
                .clamp(1, MAX_CHANNEL_RECV_WORKERS);
            let mut senders = Vec::with_capacity(count);
            for _ in 0..count {
                let (tx, rx) = mpsc::channel(self.inner.config.recv_queue_capacity);
                senders.push(tx);
                tasks.push(tokio::spawn(run_recv_worker(self.inner.clone(), rx)));
            }
            *self.inner.channels[channel.index()]
                .workers
                .lock()
                .expect("channel worker lock poisoned") = senders;
        }
        tasks.push(tokio::spawn(run_accept(self.inner.clone(), listener)));
        tasks.push(tokio::spawn(run_reaper(self.inner.clone())));
        self.inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .extend(tasks);
        info!(node = %self.inner.self_node, addr = %local, "fabric started");
        Ok(())
    }

    /// Tears the fabric down: aborts its tasks, drops its links, and
    /// terminally fails every pending transaction so no completion is lost.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self
            .inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        self.inner
            .links
            .lock()
            .expect("link table lock poisoned")
            .clear();
        for channel in FabricChannel::ALL {
            self.inner.channels[channel.index()]
                .workers
                .lock()
                .expect("channel worker lock poisoned")
                .clear();
        }
        self.inner.pending.drain("fabric stopped");
        info!(node = %self.inner.self_node, "fabric stopped");
    }

    /// Queues `msg` for transmission to one peer on `channel`.
    ///
    /// Ownership of the message always passes to the fabric; it is recycled
    /// to the pool in every outcome. Fails with `Uninitialized` before
    /// start, `NoSuchNode` when membership cannot resolve the destination,
    /// and `QueueFull` when the link's bounded queue is saturated.
    pub fn send(&self, node: NodeId, msg: PooledMsg, channel: FabricChannel) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(FabricError::Uninitialized);
        }
        let addr = self
            .inner
            .directory
            .resolve(node)
            .ok_or(FabricError::NoSuchNode { node })?;
        let frame = encode_frame(&msg, channel)?;
        drop(msg);
        self.inner.enqueue(node, addr, channel, frame)
    }

    /// Fans one logical send out to each distinct node in `nodes`.
    ///
    /// The payload is encoded once and shared. Per-destination failures are
    /// best-effort and logged, never escalated; only lifecycle and encode
    /// errors fail the call.
    pub fn send_to_list(
        &self,
        nodes: &[NodeId],
        msg: PooledMsg,
        channel: FabricChannel,
    ) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(FabricError::Uninitialized);
        }
        let frame = encode_frame(&msg, channel)?;
        drop(msg);
        let mut seen: Vec<NodeId> = Vec::with_capacity(nodes.len());
        for &node in nodes {
            if seen.contains(&node) {
                continue;
            }
            seen.push(node);
            let Some(addr) = self.inner.directory.resolve(node) else {
                debug!(node = %node, "list send skipping unknown node");
                continue;
            };
            if let Err(e) = self.inner.enqueue(node, addr, channel, frame.clone()) {
                debug!(node = %node, channel = %channel, error = %e, "list send not queued");
            }
        }
        Ok(())
    }

    /// Starts a reliable request.
    ///
    /// Never fails synchronously in a way that loses the request: every
    /// outcome, including immediate transport errors, arrives through
    /// `complete`, which is invoked exactly once.
    pub fn transact_start(
        &self,
        node: NodeId,
        mut msg: PooledMsg,
        timeout: Duration,
        complete: TransactComplete,
    ) {
        if msg.template().field_kind(0) != Some(FieldKind::U64) {
            complete(Err(FabricError::BadMessage {
                reason: "transact request must reserve field 0 as u64".into(),
            }));
            return;
        }
        if !self.inner.started.load(Ordering::Acquire) {
            complete(Err(FabricError::Uninitialized));
            return;
        }
        // Insert before sending so a fast reply can never miss the entry.
        let tid = self.inner.pending.begin(node, timeout, complete);
        if let Err(e) = msg.set_u64(0, tid) {
            self.inner.pending.complete(tid, Err(e));
            return;
        }
        if let Err(e) = self.send(node, msg, FabricChannel::Ctrl) {
            self.inner.pending.complete(tid, Err(e));
        }
    }

    /// Request/response as a future: resolves with the matched reply or the
    /// terminal error the completion callback would have seen.
    pub async fn transact_call(
        &self,
        node: NodeId,
        msg: PooledMsg,
        timeout: Duration,
    ) -> Result<PooledMsg> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.transact_start(
            node,
            msg,
            timeout,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        rx.await
            .map_err(|_| FabricError::Unknown("transact completion dropped".into()))?
    }

    /// Sends a transact response back to the requester, consuming the
    /// request's context.
    pub fn transact_reply(&self, mut msg: PooledMsg, ctx: TransactContext) -> Result<()> {
        msg.set_u64(0, ctx.tid | TRANSACT_REPLY_BIT)?;
        self.send(ctx.node, msg, FabricChannel::Ctrl)
    }

    /// Point-in-time copy of the per-channel byte counters.
    pub fn rate_capture(&self) -> FabricRate {
        self.inner.metrics.capture()
    }

    /// Milliseconds since fabric start of the last traffic with `node`.
    pub fn last_activity_ms(&self, node: NodeId) -> Option<u64> {
        self.inner.directory.last_activity_ms(node)
    }

    /// Current membership snapshot, bounded at the maximum cluster size.
    pub fn nodes(&self) -> NodeList {
        self.inner.directory.snapshot()
    }

    /// Number of in-flight transact requests.
    pub fn pending_transactions(&self) -> usize {
        self.inner.pending.len()
    }

    /// Logs fabric state: pending count, link count, per-channel sockets,
    /// workers, and byte counters; `verbose` adds per-type pool depths and
    /// per-link queue headroom. Read-only.
    pub fn dump(&self, verbose: bool) {
        let rate = self.inner.metrics.capture();
        info!(
            node = %self.inner.self_node,
            pending = self.inner.pending.len(),
            links = self.inner.links.lock().expect("link table lock poisoned").len(),
            "fabric dump"
        );
        for channel in FabricChannel::ALL {
            let state = &self.inner.channels[channel.index()];
            info!(
                channel = %channel,
                sockets = state.sockets.load(Ordering::Relaxed),
                workers = state.workers.lock().expect("channel worker lock poisoned").len(),
                s_bytes = rate.s_bytes[channel.index()],
                r_bytes = rate.r_bytes[channel.index()],
                "fabric channel"
            );
        }
        if verbose {
            self.inner.pool.dump();
            let links = self.inner.links.lock().expect("link table lock poisoned");
            for ((node, channel), link) in links.iter() {
                info!(
                    node = %node,
                    channel = %channel,
                    queue_free = link.tx.capacity(),
                    "fabric link"
                );
            }
        }
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("node", &self.inner.self_node)
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl FabricInner {
    fn enqueue(
        self: &Arc<Self>,
        node: NodeId,
        addr: SocketAddr,
        channel: FabricChannel,
        frame: Bytes,
    ) -> Result<()> {
        let key = (node, channel);
        let mut frame = frame;
        let mut links = self.links.lock().expect("link table lock poisoned");
        if let Some(link) = links.get(&key) {
            match link.tx.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => return Err(FabricError::QueueFull { node }),
                Err(TrySendError::Closed(returned)) => {
                    // writer died; rebuild the link below
                    links.remove(&key);
                    frame = returned;
                }
            }
        }
        if self.channels[channel.index()].sockets.load(Ordering::Relaxed)
            >= self.config.max_channel_sockets
        {
            return Err(FabricError::QueueFull { node });
        }
        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity);
        if tx.try_send(frame).is_err() {
            return Err(FabricError::Unknown("fresh link queue refused a frame".into()));
        }
        links.insert(key, PeerLink { tx });
        drop(links);
        let handle = tokio::spawn(run_writer(self.clone(), node, addr, channel, rx));
        self.tasks
            .lock()
            .expect("task list lock poisoned")
            .push(handle);
        Ok(())
    }

    fn remove_link(&self, node: NodeId, channel: FabricChannel) {
        self.links
            .lock()
            .expect("link table lock poisoned")
            .remove(&(node, channel));
    }
}

async fn run_writer(
    inner: Arc<FabricInner>,
    node: NodeId,
    addr: SocketAddr,
    channel: FabricChannel,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let mut stream = match connect_with_backoff(&inner, node, addr, channel).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(node = %node, channel = %channel, error = %e, "link connect failed");
            teardown_link(&inner, node, channel, &mut rx);
            return;
        }
    };
    let sockets = &inner.channels[channel.index()].sockets;
    sockets.fetch_add(1, Ordering::Relaxed);
    while let Some(frame) = rx.recv().await {
        loop {
            match stream.write_all(&frame).await {
                Ok(()) => {
                    inner.metrics.add_sent(channel, frame.len() as u64);
                    inner.directory.touch(node);
                    break;
                }
                Err(e) => {
                    warn!(node = %node, channel = %channel, error = %e, "fabric write failed, reconnecting");
                    match connect_with_backoff(&inner, node, addr, channel).await {
                        // retry the same frame on the fresh connection
                        Ok(fresh) => stream = fresh,
                        Err(e) => {
                            warn!(node = %node, channel = %channel, error = %e, "reconnect budget exhausted");
                            sockets.fetch_sub(1, Ordering::Relaxed);
                            teardown_link(&inner, node, channel, &mut rx);
                            return;
                        }
                    }
                }
            }
        }
    }
    // every sender is gone: the link was removed or the fabric stopped
    sockets.fetch_sub(1, Ordering::Relaxed);
}

fn teardown_link(
    inner: &Arc<FabricInner>,
    node: NodeId,
    channel: FabricChannel,
    rx: &mut mpsc::Receiver<Bytes>,
) {
    inner.remove_link(node, channel);
    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(node = %node, channel = %channel, dropped, "dropped queued frames with failed link");
    }
}

async fn connect_with_backoff(
    inner: &Arc<FabricInner>,
    node: NodeId,
    addr: SocketAddr,
    channel: FabricChannel,
) -> Result<TcpStream> {
    let config = &inner.config;
    let mut backoff = config.reconnect_initial_backoff;
    let mut last_err = None;
    for attempt in 0..=config.reconnect_max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, config.reconnect_max_backoff);
        }
        match connect_once(inner, addr, channel).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(node = %node, channel = %channel, attempt, error = %e, "fabric connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| FabricError::Unknown("connect failed".into())))
}

async fn connect_once(
    inner: &Arc<FabricInner>,
    addr: SocketAddr,
    channel: FabricChannel,
) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(inner.config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| FabricError::Unknown(format!("connect to {addr} timed out")))??;
    if inner.config.nodelay {
        stream.set_nodelay(true)?;
    }
    let preamble = Preamble {
        node: inner.self_node,
        channel,
    };
    stream.write_all(&preamble.encode()).await?;
    Ok(stream)
}

async fn run_accept(inner: Arc<FabricInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(run_inbound(inner.clone(), stream, peer));
            }
            Err(e) => {
                warn!(error = %e, "fabric accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn run_inbound(inner: Arc<FabricInner>, mut stream: TcpStream, peer: SocketAddr) {
    if inner.config.nodelay {
        let _ = stream.set_nodelay(true);
    }
    let mut preamble_raw = [0u8; PREAMBLE_SIZE];
    if let Err(e) = stream.read_exact(&mut preamble_raw).await {
        debug!(peer = %peer, error = %e, "inbound connection closed before preamble");
        return;
    }
    let preamble = match Preamble::decode(&preamble_raw) {
        Ok(preamble) => preamble,
        Err(e) => {
            warn!(peer = %peer, error = %e, "rejecting inbound connection");
            return;
        }
    };
    let from = preamble.node;
    let channel = preamble.channel;
    let state = &inner.channels[channel.index()];
    if state.sockets.fetch_add(1, Ordering::Relaxed) >= inner.config.max_channel_sockets {
        state.sockets.fetch_sub(1, Ordering::Relaxed);
        warn!(peer = %peer, channel = %channel, "channel socket limit reached, dropping inbound connection");
        return;
    }
    let Some(worker) = state.pick_worker() else {
        state.sockets.fetch_sub(1, Ordering::Relaxed);
        return;
    };
    debug!(node = %from, channel = %channel, peer = %peer, "inbound fabric connection");
    if let Err(e) = read_frames(&inner, &mut stream, from, channel, worker).await {
        debug!(node = %from, channel = %channel, error = %e, "inbound connection ended");
    }
    state.sockets.fetch_sub(1, Ordering::Relaxed);
}

async fn read_frames(
    inner: &Arc<FabricInner>,
    stream: &mut TcpStream,
    from: NodeId,
    channel: FabricChannel,
    worker: mpsc::Sender<Inbound>,
) -> Result<()> {
    loop {
        let mut header_raw = [0u8; FRAME_HEADER_SIZE];
        match stream.read_exact(&mut header_raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        // a garbled header is a transport fault: close the connection
        let header = FrameHeader::decode(&header_raw)?;
        if header.channel != channel {
            return Err(FabricError::Unknown(format!(
                "frame channel {} does not match connection channel {channel}",
                header.channel
            )));
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        stream.read_exact(&mut payload).await?;
        inner
            .metrics
            .add_received(channel, (FRAME_HEADER_SIZE + payload.len()) as u64);
        inner.directory.touch(from);
        let inbound = Inbound {
            from,
            msg_type: header.msg_type,
            payload: Bytes::from(payload),
        };
        if worker.send(inbound).await.is_err() {
            return Ok(());
        }
    }
}

async fn run_recv_worker(inner: Arc<FabricInner>, mut rx: mpsc::Receiver<Inbound>) {
    while let Some(inbound) = rx.recv().await {
        let from = inbound.from;
        let msg_type = inbound.msg_type;
        if let Err(e) = dispatch(&inner, inbound) {
            // schema-level rejection: the message is dropped, the
            // connection stays up
            warn!(from = %from, msg_type, error = %e, "dropping inbound message");
        }
    }
}

fn dispatch(inner: &Arc<FabricInner>, inbound: Inbound) -> Result<()> {
    let registration =
        inner
            .registry
            .lookup(inbound.msg_type)
            .ok_or_else(|| FabricError::BadMessage {
                reason: format!("no handler registered for type {}", inbound.msg_type),
            })?;
    let mut msg = inner.pool.acquire(inbound.msg_type)?;
    msg.decode_from(&inbound.payload)?;
    let fabric = Fabric {
        inner: inner.clone(),
    };
    match registration.kind {
        HandlerKind::Msg(handler) => {
            handler.on_msg(&fabric, inbound.from, msg);
            Ok(())
        }
        HandlerKind::Transact(handler) => {
            let field0 = msg.get_u64(0).ok_or_else(|| FabricError::BadMessage {
                reason: "transact message is missing field 0".into(),
            })?;
            if field0 & TRANSACT_REPLY_BIT != 0 {
                let tid = field0 & !TRANSACT_REPLY_BIT;
                if !inner.pending.complete(tid, Ok(msg)) {
                    debug!(tid, from = %inbound.from, "late or duplicate transact reply");
                }
            } else {
                let ctx = TransactContext {
                    node: inbound.from,
                    tid: field0,
                };
                handler.on_request(&fabric, inbound.from, msg, ctx);
            }
            Ok(())
        }
    }
}

async fn run_reaper(inner: Arc<FabricInner>) {
    let mut interval = tokio::time::interval(inner.config.reap_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        inner.pending.reap(Instant::now());
    }
}
