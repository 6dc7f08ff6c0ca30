//! Radio transport: link lifecycle, inbound dispatch and ack correlation.
//!
//! Two background tasks run while the link is open:
//! - the read task decodes frames and routes every reply that somebody is
//!   waiting for (transmit status, AT response) straight to its waiter;
//! - the dispatch task hands data and delivery-status frames to the
//!   registered listeners, in arrival order.
//!
//! The read task never waits on the dispatch task: inbound items go through
//! an unbounded queue, so a slow listener delays other listeners but never
//! an acknowledgement or an AT response.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, ListenerError, ListenerId, ListenerSet, Subscription};
use crate::protocol::{
    ApiFrame, AtStatus, FrameDecoder, FrameType, NO_RESPONSE_FRAME_ID, ReceiveOptions,
    TransmitOptions, encode_frame,
};
use crate::transport::serial::{SerialConfig, SerialLink};
use crate::transport::{BoxedStream, Link, LinkState};
use crate::types::{
    Address16, Address64, DeliveryOutcome, LocalDevice, RemoteEndpoint, RemoteMessage,
    current_timestamp,
};

/// Default wait for a transmit status frame.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a local AT command response.
pub const DEFAULT_AT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default capacity of the event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast radius 0 lets the module use its maximum hop count.
pub const DEFAULT_BROADCAST_RADIUS: u8 = 0;

/// Configuration for a [`RadioTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long an acknowledged send waits for its status frame.
    pub ack_timeout: Duration,
    /// How long a local AT query waits for its response.
    pub at_timeout: Duration,
    /// Transmit options for acknowledged sends; the disable-ack bit is
    /// always cleared.
    pub ack_options: TransmitOptions,
    /// Transmit options for fire-and-forget sends and broadcasts; the
    /// disable-ack bit is always set.
    pub no_ack_options: TransmitOptions,
    /// Broadcast radius for every transmit request.
    pub broadcast_radius: u8,
    /// Read the module's own addresses when the link opens. A module that
    /// does not answer makes the open fail.
    pub probe_local_device: bool,
    /// Query `DB` after each received packet to fill in its RSSI.
    pub query_rssi: bool,
    /// Capacity of the event channel; slow subscribers skip what they miss.
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            at_timeout: DEFAULT_AT_TIMEOUT,
            ack_options: TransmitOptions::NONE,
            no_ack_options: TransmitOptions::NONE,
            broadcast_radius: DEFAULT_BROADCAST_RADIUS,
            probe_local_device: true,
            query_rssi: true,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl TransportConfig {
    /// Sets the acknowledgement timeout.
    #[must_use]
    pub const fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the AT command timeout.
    #[must_use]
    pub const fn at_timeout(mut self, timeout: Duration) -> Self {
        self.at_timeout = timeout;
        self
    }

    /// Sets the transmit options for acknowledged sends.
    #[must_use]
    pub const fn ack_options(mut self, options: TransmitOptions) -> Self {
        self.ack_options = options;
        self
    }

    /// Sets the transmit options for unacknowledged sends.
    #[must_use]
    pub const fn no_ack_options(mut self, options: TransmitOptions) -> Self {
        self.no_ack_options = options;
        self
    }

    /// Sets the broadcast radius.
    #[must_use]
    pub const fn broadcast_radius(mut self, radius: u8) -> Self {
        self.broadcast_radius = radius;
        self
    }

    /// Enables or disables the local device probe on open.
    #[must_use]
    pub const fn probe_local_device(mut self, enabled: bool) -> Self {
        self.probe_local_device = enabled;
        self
    }

    /// Enables or disables RSSI queries for received packets.
    #[must_use]
    pub const fn query_rssi(mut self, enabled: bool) -> Self {
        self.query_rssi = enabled;
        self
    }

    /// Sets the channel capacity.
    #[must_use]
    pub const fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

type Writer = Arc<Mutex<WriteHalf<BoxedStream>>>;

/// Outstanding requests keyed by frame id.
struct Correlation {
    next_id: u8,
    waiters: HashMap<u8, (FrameType, oneshot::Sender<ApiFrame>)>,
}

impl Correlation {
    fn new() -> Self {
        Self {
            next_id: 1,
            waiters: HashMap::new(),
        }
    }

    /// Reserves a free frame id for a reply of type `expected`.
    fn register(&mut self, expected: FrameType) -> Result<(u8, oneshot::Receiver<ApiFrame>)> {
        for _ in 0..=u8::MAX {
            let id = self.next_id;
            self.next_id = if id == u8::MAX { 1 } else { id + 1 };
            if !self.waiters.contains_key(&id) {
                let (tx, rx) = oneshot::channel();
                self.waiters.insert(id, (expected, tx));
                return Ok((id, rx));
            }
        }
        Err(Error::FrameIdsExhausted)
    }

    /// Hands `frame` to its waiter. Returns false if nobody took it.
    fn complete(&mut self, frame_id: u8, frame_type: FrameType, frame: ApiFrame) -> bool {
        match self.waiters.get(&frame_id) {
            Some((expected, _)) if *expected == frame_type => {}
            _ => return false,
        }
        self.waiters
            .remove(&frame_id)
            .is_some_and(|(_, tx)| tx.send(frame).is_ok())
    }
}

/// State shared between the transport handle and its tasks.
struct Shared {
    state: SyncMutex<LinkState>,
    correlation: SyncMutex<Correlation>,
    data_listeners: ListenerSet<RemoteMessage>,
    status_listeners: ListenerSet<DeliveryOutcome>,
    events: EventDispatcher,
}

impl Shared {
    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    fn set_state(&self, next: LinkState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            tracing::debug!("link state {} -> {}", previous, next);
            self.events.dispatch(Event::StateChanged(next));
        }
    }

    /// Marks the link as failed after the read task died on its own.
    fn link_lost(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, LinkState::Open | LinkState::Opening) {
                return;
            }
            *state = LinkState::Failed;
        }
        self.events.dispatch(Event::StateChanged(LinkState::Failed));
        self.fail_waiters();
    }

    /// Moves `Opening` to `Open`. Returns false if the link was lost first.
    fn promote_open(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != LinkState::Opening {
                return false;
            }
            *state = LinkState::Open;
        }
        tracing::debug!("link state {} -> {}", LinkState::Opening, LinkState::Open);
        self.events.dispatch(Event::StateChanged(LinkState::Open));
        true
    }

    /// Drops every waiter; their receivers see the channel close.
    fn fail_waiters(&self) {
        self.correlation.lock().waiters.clear();
    }
}

/// Removes a waiter on every exit path, including cancellation.
struct PendingGuard<'a> {
    shared: &'a Shared,
    frame_id: u8,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.correlation.lock().waiters.remove(&self.frame_id);
    }
}

/// Work items for the dispatch task.
enum Inbound {
    Data(RemoteMessage),
    Status(DeliveryOutcome),
}

/// Transport for an XBee module in API mode.
pub struct RadioTransport {
    link: Box<dyn Link>,
    config: TransportConfig,
    shared: Arc<Shared>,
    writer: Option<Writer>,
    local: Option<LocalDevice>,

    // Background tasks
    read_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
}

impl RadioTransport {
    /// Creates a transport for a serial port (not yet opened).
    #[must_use]
    pub fn serial(serial: SerialConfig, config: TransportConfig) -> Self {
        Self::new(SerialLink::new(serial), config)
    }

    /// Creates a transport over any link (not yet opened).
    #[must_use]
    pub fn new(link: impl Link + 'static, config: TransportConfig) -> Self {
        let shared = Arc::new(Shared {
            state: SyncMutex::new(LinkState::Closed),
            correlation: SyncMutex::new(Correlation::new()),
            data_listeners: ListenerSet::new("data"),
            status_listeners: ListenerSet::new("delivery status"),
            events: EventDispatcher::new(config.channel_capacity),
        });

        Self {
            link: Box::new(link),
            config,
            shared,
            writer: None,
            local: None,
            read_task: None,
            dispatch_task: None,
        }
    }

    /// Returns the current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Returns true if the link is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Returns the link name (e.g. the serial port).
    #[must_use]
    pub fn link_name(&self) -> &str {
        self.link.name()
    }

    /// Returns the transport configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns the attached module's addresses, once probed.
    #[must_use]
    pub const fn local_device(&self) -> Option<LocalDevice> {
        self.local
    }

    /// Subscribes to lifecycle and failure events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    pub(crate) fn events(&self) -> EventDispatcher {
        self.shared.events.clone()
    }

    /// Opens the link and starts the background tasks.
    ///
    /// Does nothing if already open. On failure the transport is left in
    /// [`LinkState::Failed`]; retrying is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportOpen`] wrapping the underlying cause.
    pub async fn open(&mut self) -> Result<()> {
        if self.state() == LinkState::Open {
            tracing::debug!("link {} already open", self.link.name());
            return Ok(());
        }

        // Leftovers from a failed or abandoned open
        if let Err(e) = self.teardown().await {
            tracing::debug!("discarding stale link: {}", e);
        }

        self.shared.set_state(LinkState::Opening);
        let opened = self.open_inner().await.and_then(|()| {
            if self.shared.promote_open() {
                Ok(())
            } else {
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "link lost while opening",
                )))
            }
        });
        match opened {
            Ok(()) => {
                tracing::info!("link {} open", self.link.name());
                Ok(())
            }
            Err(cause) => {
                if let Err(e) = self.teardown().await {
                    tracing::debug!("cleanup after failed open: {}", e);
                }
                self.shared.set_state(LinkState::Failed);
                tracing::warn!("failed to open link {}: {}", self.link.name(), cause);
                Err(Error::TransportOpen {
                    port: self.link.name().to_owned(),
                    cause: Box::new(cause),
                })
            }
        }
    }

    async fn open_inner(&mut self) -> Result<()> {
        let stream = self.link.open().await?;
        let (reader, writer) = tokio::io::split(stream);
        let writer: Writer = Arc::new(Mutex::new(writer));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::clone(&self.shared);
        self.read_task = Some(tokio::spawn(async move {
            match read_loop(reader, &shared, inbound_tx).await {
                Ok(()) => tracing::debug!("read loop stopped"),
                Err(e) => {
                    tracing::error!("read loop error: {}", e);
                    shared.link_lost();
                }
            }
        }));

        let rssi = self.config.query_rssi.then(|| RssiQuery {
            writer: Arc::clone(&writer),
            timeout: self.config.at_timeout,
        });
        self.dispatch_task = Some(tokio::spawn(dispatch_loop(
            inbound_rx,
            Arc::clone(&self.shared),
            rssi,
        )));
        self.writer = Some(Arc::clone(&writer));

        if self.config.probe_local_device {
            let local = self.probe(&writer).await?;
            tracing::info!("local module {}", local.endpoint);
            self.local = Some(local);
        }

        Ok(())
    }

    async fn probe(&self, writer: &Writer) -> Result<LocalDevice> {
        let timeout = self.config.at_timeout;
        let high = be_uint(&at_query(&self.shared, writer, *b"SH", timeout).await?)?;
        let low = be_uint(&at_query(&self.shared, writer, *b"SL", timeout).await?)?;
        let my = be_uint(&at_query(&self.shared, writer, *b"MY", timeout).await?)?;

        let high = u32::try_from(high).map_err(|_| Error::AtCommand {
            command: "SH".into(),
            status: AtStatus::InvalidParameter as u8,
        })?;
        let low = u32::try_from(low).map_err(|_| Error::AtCommand {
            command: "SL".into(),
            status: AtStatus::InvalidParameter as u8,
        })?;
        let my = u16::try_from(my).map_err(|_| Error::AtCommand {
            command: "MY".into(),
            status: AtStatus::InvalidParameter as u8,
        })?;

        Ok(LocalDevice {
            endpoint: RemoteEndpoint::new(
                Address64::new((u64::from(high) << 32) | u64::from(low)),
                Address16::new(my),
            ),
        })
    }

    /// Closes the link and stops the background tasks.
    ///
    /// Works from any state and does nothing when already closed. Waiters
    /// still blocked on an acknowledgement fail with
    /// [`Error::ChannelClosed`].
    pub async fn close(&mut self) -> Result<()> {
        if self.state() == LinkState::Closed && self.writer.is_none() {
            tracing::debug!("link {} already closed", self.link.name());
            return Ok(());
        }

        tracing::info!("closing link {}", self.link.name());
        self.shared.set_state(LinkState::Closing);
        let result = self.teardown().await;
        self.shared.set_state(LinkState::Closed);
        result
    }

    async fn teardown(&mut self) -> Result<()> {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }
        self.shared.fail_waiters();
        self.local = None;

        if let Some(writer) = self.writer.take() {
            let mut writer = writer.lock().await;
            writer.shutdown().await?;
        }
        Ok(())
    }

    /// Registers a listener for inbound data frames.
    pub fn register_data_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RemoteMessage) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.shared.data_listeners.register(listener)
    }

    /// Removes a data listener.
    pub fn unregister_data_listener(&self, id: ListenerId) -> bool {
        self.shared.data_listeners.unregister(id)
    }

    /// Registers a listener for delivery status frames.
    pub fn register_delivery_status_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DeliveryOutcome) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.shared.status_listeners.register(listener)
    }

    /// Removes a delivery status listener.
    pub fn unregister_delivery_status_listener(&self, id: ListenerId) -> bool {
        self.shared.status_listeners.unregister(id)
    }

    /// Sends `payload` to the node with the given 64-bit hex address.
    ///
    /// With `require_ack` the call waits for the module's transmit status
    /// and returns it; without, it returns `None` as soon as the frame is
    /// written.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] for a malformed destination
    /// - [`Error::PayloadEncoding`] if the payload is not UTF-8
    /// - [`Error::TransportNotOpen`] if the link is not open
    /// - [`Error::AckTimeout`] if no status arrives in time
    /// - [`Error::AckFailed`] if the module reports a failed delivery
    pub async fn send_unicast(
        &self,
        destination: &str,
        payload: &[u8],
        require_ack: bool,
    ) -> Result<Option<DeliveryOutcome>> {
        let destination = Address64::from_hex(destination)?;
        self.send_to(destination, payload, require_ack).await
    }

    /// Typed form of [`send_unicast`](Self::send_unicast).
    pub async fn send_to(
        &self,
        destination: Address64,
        payload: &[u8],
        require_ack: bool,
    ) -> Result<Option<DeliveryOutcome>> {
        std::str::from_utf8(payload)?;
        let writer = self.writer_if_open()?;
        let data = Bytes::copy_from_slice(payload);

        if !require_ack {
            let options = self.config.no_ack_options.with(TransmitOptions::DISABLE_ACK);
            let frame = self.transmit_request(NO_RESPONSE_FRAME_ID, destination, options, data);
            write_frame(&writer, &frame).await?;
            tracing::trace!("sent {} bytes to {} without ack", payload.len(), destination);
            return Ok(None);
        }

        let (frame_id, rx) = self
            .shared
            .correlation
            .lock()
            .register(FrameType::TransmitStatus)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            frame_id,
        };

        let options = self.config.ack_options.without(TransmitOptions::DISABLE_ACK);
        let frame = self.transmit_request(frame_id, destination, options, data);
        write_frame(&writer, &frame).await?;
        tracing::trace!("sent frame {} to {}, awaiting status", frame_id, destination);

        let timeout = self.config.ack_timeout;
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::ChannelClosed),
            Err(_) => {
                tracing::debug!("no status for frame {} within {:?}", frame_id, timeout);
                return Err(Error::AckTimeout {
                    frame_id,
                    timeout_ms: duration_ms(timeout),
                });
            }
        };

        let outcome = delivery_outcome(&reply).ok_or(Error::ChannelClosed)?;
        if outcome.is_success() {
            Ok(Some(outcome))
        } else {
            Err(Error::AckFailed(outcome))
        }
    }

    /// Broadcasts `payload` to every reachable node, without acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`Error::PayloadEncoding`] if the payload is not UTF-8
    /// - [`Error::TransportNotOpen`] if the link is not open
    pub async fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
        std::str::from_utf8(payload)?;
        let writer = self.writer_if_open()?;
        let options = self.config.no_ack_options.with(TransmitOptions::DISABLE_ACK);
        let frame = self.transmit_request(
            NO_RESPONSE_FRAME_ID,
            Address64::BROADCAST,
            options,
            Bytes::copy_from_slice(payload),
        );
        write_frame(&writer, &frame).await?;
        tracing::trace!("broadcast {} bytes", payload.len());
        Ok(())
    }

    /// Queries a local module parameter, e.g. `"DB"` or `"NI"`.
    ///
    /// # Errors
    ///
    /// - [`Error::TransportNotOpen`] if the link is not open
    /// - [`Error::AtCommand`] if the module rejects the command
    /// - [`Error::AtTimeout`] if the module does not answer
    pub async fn query_parameter(&self, command: &str) -> Result<Bytes> {
        let code: [u8; 2] = command
            .as_bytes()
            .try_into()
            .map_err(|_| Error::AtCommand {
                command: command.to_owned(),
                status: AtStatus::InvalidCommand as u8,
            })?;
        let writer = self.writer_if_open()?;
        at_query(&self.shared, &writer, code, self.config.at_timeout).await
    }

    fn writer_if_open(&self) -> Result<Writer> {
        if self.state() != LinkState::Open {
            return Err(Error::TransportNotOpen);
        }
        self.writer.clone().ok_or(Error::TransportNotOpen)
    }

    fn transmit_request(
        &self,
        frame_id: u8,
        destination: Address64,
        options: TransmitOptions,
        data: Bytes,
    ) -> ApiFrame {
        ApiFrame::TransmitRequest {
            frame_id,
            destination64: destination,
            destination16: Address16::UNKNOWN,
            broadcast_radius: self.config.broadcast_radius,
            options,
            data,
        }
    }
}

impl Drop for RadioTransport {
    fn drop(&mut self) {
        // Abort background tasks
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Big-endian unsigned value of up to 8 bytes; modules drop leading zeros.
fn be_uint(data: &[u8]) -> Result<u64> {
    if data.is_empty() || data.len() > 8 {
        return Err(Error::Frame(crate::error::FrameError::InvalidLength(
            data.len(),
        )));
    }
    Ok(data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn delivery_outcome(frame: &ApiFrame) -> Option<DeliveryOutcome> {
    match frame {
        ApiFrame::TransmitStatus {
            frame_id,
            destination16,
            retry_count,
            delivery_status,
            discovery_status,
        } => Some(DeliveryOutcome {
            frame_id: *frame_id,
            status: *delivery_status,
            destination16: *destination16,
            retry_count: *retry_count,
            discovery_status: *discovery_status,
        }),
        _ => None,
    }
}

/// Writes one whole frame.
///
/// The write runs on its own task, so a caller that is cancelled mid-write
/// never leaves half a frame on the link.
async fn write_frame(writer: &Writer, frame: &ApiFrame) -> Result<()> {
    let bytes = encode_frame(&frame.encode())?;
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        let mut writer = writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|e| Error::Io(io::Error::other(e)))??;
    Ok(())
}

/// Sends a local AT command and waits for its response data.
async fn at_query(
    shared: &Shared,
    writer: &Writer,
    command: [u8; 2],
    timeout: Duration,
) -> Result<Bytes> {
    let name = String::from_utf8_lossy(&command).into_owned();
    let (frame_id, rx) = shared
        .correlation
        .lock()
        .register(FrameType::AtCommandResponse)?;
    let _guard = PendingGuard { shared, frame_id };

    let frame = ApiFrame::AtCommand {
        frame_id,
        command,
        parameter: Bytes::new(),
    };
    write_frame(writer, &frame).await?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(ApiFrame::AtCommandResponse { status, data, .. })) => {
            if AtStatus::from_byte(status) == AtStatus::Ok {
                Ok(data)
            } else {
                Err(Error::AtCommand {
                    command: name,
                    status,
                })
            }
        }
        Ok(Ok(_) | Err(_)) => Err(Error::ChannelClosed),
        Err(_) => Err(Error::AtTimeout {
            command: name,
            timeout_ms: duration_ms(timeout),
        }),
    }
}

/// Fills in RSSI for received packets with the `DB` parameter.
struct RssiQuery {
    writer: Writer,
    timeout: Duration,
}

impl RssiQuery {
    /// Returns the last packet's RSSI in dBm, or `None` on any failure.
    async fn query(&self, shared: &Shared) -> Option<i32> {
        match at_query(shared, &self.writer, *b"DB", self.timeout).await {
            Ok(data) => match data.first() {
                Some(&db) => Some(-i32::from(db)),
                None => {
                    tracing::debug!("empty DB response");
                    None
                }
            },
            Err(e) => {
                tracing::debug!("RSSI query failed: {}", e);
                None
            }
        }
    }
}

/// Reads and routes frames until the link closes or the dispatch task is
/// gone.
async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    shared: &Shared,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("link closed by peer");
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "link closed",
                )));
            }
            Ok(n) => n,
            Err(e) => return Err(Error::Io(e)),
        };

        tracing::trace!("received {} bytes", n);
        decoder.feed(&buf[..n]);

        // Process all complete frames
        loop {
            match decoder.decode() {
                Ok(Some(data)) => {
                    if !route_frame(&data, shared, &inbound_tx) {
                        return Ok(());
                    }
                }
                Ok(None) => break, // Need more data
                Err(e) => {
                    // The decoder resynchronises on the next delimiter
                    tracing::warn!("frame decode error: {}", e);
                }
            }
        }
    }
}

/// Routes one frame. Returns false once the dispatch task is gone.
fn route_frame(
    data: &[u8],
    shared: &Shared,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
) -> bool {
    let frame = match ApiFrame::parse(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("malformed API frame: {}", e);
            return true;
        }
    };

    let item = match frame {
        ApiFrame::ReceivePacket {
            source64,
            source16,
            options,
            data,
        } => Inbound::Data(RemoteMessage {
            sender: RemoteEndpoint::new(source64, source16),
            payload: data,
            is_broadcast: options.contains(ReceiveOptions::BROADCAST),
            timestamp: current_timestamp(),
            rssi: None,
        }),
        ApiFrame::TransmitStatus { frame_id, .. } => {
            let Some(outcome) = delivery_outcome(&frame) else {
                return true;
            };
            let delivered =
                shared
                    .correlation
                    .lock()
                    .complete(frame_id, FrameType::TransmitStatus, frame);
            if !delivered {
                tracing::debug!("status for frame {} has no waiter", frame_id);
                shared.events.dispatch(Event::LateStatus { frame_id });
            }
            Inbound::Status(outcome)
        }
        ApiFrame::AtCommandResponse { frame_id, .. } => {
            let delivered =
                shared
                    .correlation
                    .lock()
                    .complete(frame_id, FrameType::AtCommandResponse, frame);
            if !delivered {
                tracing::debug!("AT response for frame {} has no waiter", frame_id);
            }
            return true;
        }
        ApiFrame::ModemStatus { status } => {
            tracing::info!("modem status {:#04x}", status);
            shared.events.dispatch(Event::ModemStatus(status));
            return true;
        }
        other => {
            tracing::trace!("ignoring frame {:?}", other);
            return true;
        }
    };

    inbound_tx.send(item).is_ok()
}

/// Hands inbound items to listeners, one at a time.
async fn dispatch_loop(
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<Shared>,
    rssi: Option<RssiQuery>,
) {
    while let Some(item) = inbound_rx.recv().await {
        match item {
            Inbound::Data(mut message) => {
                if let Some(query) = &rssi {
                    message.rssi = query.query(&shared).await;
                }
                tracing::debug!(
                    "data from {} ({} bytes, broadcast={})",
                    message.sender,
                    message.payload.len(),
                    message.is_broadcast
                );
                let failures = shared.data_listeners.dispatch(&message);
                shared.events.report("data", failures);
            }
            Inbound::Status(outcome) => {
                tracing::debug!("frame {} status {}", outcome.frame_id, outcome.status);
                let failures = shared.status_listeners.dispatch(&outcome);
                shared.events.report("delivery status", failures);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use futures::FutureExt;

    use super::*;
    use crate::protocol::DeliveryStatus;
    use crate::transport::mock::{MOCK_DB, MockLink, MockRadio};

    const PEER: &str = "0013A20040522BAA";

    async fn open_transport(config: TransportConfig) -> (RadioTransport, MockRadio) {
        let (link, radio) = MockLink::pair();
        let mut transport = RadioTransport::new(link, config);
        transport.open().await.unwrap();
        (transport, radio)
    }

    fn collect_data(transport: &RadioTransport) -> Arc<StdMutex<Vec<RemoteMessage>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport.register_data_listener(move |m: &RemoteMessage| {
            sink.lock().unwrap().push(m.clone());
            Ok(())
        });
        seen
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_frame_ids_skip_zero_and_pending() {
        let mut correlation = Correlation::new();
        let (first, _rx1) = correlation.register(FrameType::TransmitStatus).unwrap();
        assert_eq!(first, 1);

        correlation.next_id = u8::MAX;
        let (last, _rx2) = correlation.register(FrameType::TransmitStatus).unwrap();
        assert_eq!(last, u8::MAX);
        let (wrapped, _rx3) = correlation.register(FrameType::TransmitStatus).unwrap();
        assert_eq!(wrapped, 2);
    }

    #[test]
    fn test_frame_ids_exhausted() {
        let mut correlation = Correlation::new();
        let mut receivers = Vec::new();
        for _ in 0..255 {
            receivers.push(correlation.register(FrameType::TransmitStatus).unwrap());
        }
        assert!(matches!(
            correlation.register(FrameType::TransmitStatus),
            Err(Error::FrameIdsExhausted)
        ));
    }

    #[test]
    fn test_complete_checks_frame_type() {
        let mut correlation = Correlation::new();
        let (id, _rx) = correlation.register(FrameType::TransmitStatus).unwrap();
        let frame = ApiFrame::ModemStatus { status: 0 };
        assert!(!correlation.complete(id, FrameType::AtCommandResponse, frame));
        assert!(correlation.waiters.contains_key(&id));
    }

    #[test]
    fn test_be_uint() {
        assert_eq!(be_uint(&[0x13, 0xA2, 0x00]).unwrap(), 0x13_A200);
        assert!(be_uint(&[]).is_err());
        assert!(be_uint(&[0; 9]).is_err());
    }

    #[tokio::test]
    async fn test_open_probes_local_device() {
        let (mut transport, _radio) = open_transport(TransportConfig::default()).await;

        assert_eq!(transport.state(), LinkState::Open);
        let local = transport.local_device().unwrap();
        assert_eq!(local.endpoint.address64.to_hex(), "0013A20040ABCDEF");
        assert_eq!(local.endpoint.address16.to_hex(), "1234");

        transport.close().await.unwrap();
        assert_eq!(transport.state(), LinkState::Closed);
        assert!(transport.local_device().is_none());
    }

    #[tokio::test]
    async fn test_open_twice_is_noop() {
        let (mut transport, _radio) = open_transport(TransportConfig::default()).await;
        transport.open().await.unwrap();
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_open_failure_sets_failed() {
        let mut transport = RadioTransport::new(MockLink::unplugged(), TransportConfig::default());
        let mut events = transport.subscribe();

        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, Error::TransportOpen { ref port, .. } if port == "mock"));
        assert_eq!(transport.state(), LinkState::Failed);

        assert!(matches!(
            events.recv().await,
            Some(Event::StateChanged(LinkState::Opening))
        ));
        assert!(matches!(
            events.recv().await,
            Some(Event::StateChanged(LinkState::Failed))
        ));

        // Failed -> Closed
        transport.close().await.unwrap();
        assert_eq!(transport.state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_module_fails_open() {
        let (link, radio) = MockLink::pair();
        radio.mute_at();
        let mut transport = RadioTransport::new(link, TransportConfig::default());

        let err = transport.open().await.unwrap_err();
        match err {
            Error::TransportOpen { cause, .. } => {
                assert!(matches!(*cause, Error::AtTimeout { ref command, .. } if command == "SH"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_close_when_closed_is_noop() {
        let (link, _radio) = MockLink::pair();
        let mut transport = RadioTransport::new(link, TransportConfig::default());
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(transport.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let (link, _radio) = MockLink::pair();
        let transport = RadioTransport::new(link, TransportConfig::default());

        assert!(matches!(
            transport.send_unicast(PEER, b"hi", false).await,
            Err(Error::TransportNotOpen)
        ));
        assert!(matches!(
            transport.send_broadcast(b"hi").await,
            Err(Error::TransportNotOpen)
        ));
    }

    #[tokio::test]
    async fn test_send_validates_input() {
        let (transport, mut radio) = open_transport(TransportConfig::default()).await;

        assert!(matches!(
            transport.send_unicast("not-an-address", b"hi", false).await,
            Err(Error::InvalidAddress { .. })
        ));
        assert!(matches!(
            transport.send_unicast(PEER, &[0xC3, 0x28], false).await,
            Err(Error::PayloadEncoding(_))
        ));
        assert!(radio.try_request().is_none());
    }

    #[tokio::test]
    async fn test_fire_and_forget_sets_disable_ack() {
        let (transport, mut radio) = open_transport(TransportConfig::default()).await;

        let outcome = transport.send_unicast(PEER, b"hello", false).await.unwrap();
        assert!(outcome.is_none());

        match radio.next_request().await {
            ApiFrame::TransmitRequest {
                frame_id,
                destination64,
                options,
                data,
                ..
            } => {
                assert_eq!(frame_id, NO_RESPONSE_FRAME_ID);
                assert_eq!(destination64.to_hex(), PEER);
                assert!(options.contains(TransmitOptions::DISABLE_ACK));
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_does_not_wait() {
        let config = TransportConfig::default().ack_timeout(Duration::from_secs(60));
        let (transport, _radio) = open_transport(config).await;

        let started = tokio::time::Instant::now();
        transport.send_unicast(PEER, b"x", false).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_broadcast_frame() {
        let (transport, mut radio) = open_transport(TransportConfig::default()).await;
        transport.send_broadcast(b"all").await.unwrap();

        match radio.next_request().await {
            ApiFrame::TransmitRequest {
                frame_id,
                destination64,
                options,
                ..
            } => {
                assert_eq!(frame_id, NO_RESPONSE_FRAME_ID);
                assert!(destination64.is_broadcast());
                assert!(options.contains(TransmitOptions::DISABLE_ACK));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ack_success() {
        let options = TransmitOptions::APS_ENCRYPTION.with(TransmitOptions::DISABLE_ACK);
        let config = TransportConfig::default().ack_options(options);
        let (transport, mut radio) = open_transport(config).await;
        radio.auto_status(DeliveryStatus::Success);

        let outcome = transport
            .send_unicast(PEER, b"ping", true)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_success());
        assert_ne!(outcome.frame_id, NO_RESPONSE_FRAME_ID);

        match radio.next_request().await {
            ApiFrame::TransmitRequest { options, frame_id, .. } => {
                assert_eq!(frame_id, outcome.frame_id);
                assert!(!options.contains(TransmitOptions::DISABLE_ACK));
                assert!(options.contains(TransmitOptions::APS_ENCRYPTION));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ack_failure_is_distinct() {
        let (transport, radio) = open_transport(TransportConfig::default()).await;
        radio.auto_status(DeliveryStatus::AddressNotFound);

        match transport.send_unicast(PEER, b"ping", true).await {
            Err(Error::AckFailed(outcome)) => {
                assert_eq!(outcome.status, DeliveryStatus::AddressNotFound);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let config = TransportConfig::default().ack_timeout(Duration::from_millis(250));
        let (transport, _radio) = open_transport(config).await;

        match transport.send_unicast(PEER, b"ping", true).await {
            Err(Error::AckTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 250),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(transport.shared.correlation.lock().waiters.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_acks_do_not_cross() {
        let (transport, mut radio) = open_transport(TransportConfig::default()).await;

        let first = transport.send_unicast(PEER, b"one", true);
        let second = transport.send_unicast(PEER, b"two", true);

        let answer = async {
            let a = radio.next_request().await;
            let b = radio.next_request().await;
            let (a_id, b_id) = (a.frame_id().unwrap(), b.frame_id().unwrap());
            assert_ne!(a_id, b_id);
            // Answer in reverse order, with different outcomes per payload
            for frame in [b, a] {
                let ApiFrame::TransmitRequest { frame_id, data, .. } = frame else {
                    panic!("expected transmit request");
                };
                let status = if &data[..] == b"one" {
                    DeliveryStatus::Success
                } else {
                    DeliveryStatus::RouteNotFound
                };
                radio.status(frame_id, status).await;
            }
        };

        let (first, second, ()) = tokio::join!(first, second, answer);
        assert!(first.unwrap().unwrap().is_success());
        assert!(matches!(
            second,
            Err(Error::AckFailed(outcome)) if outcome.status == DeliveryStatus::RouteNotFound
        ));
    }

    #[tokio::test]
    async fn test_status_reaches_waiter_and_listener_once() {
        let (transport, radio) = open_transport(TransportConfig::default()).await;
        radio.auto_status(DeliveryStatus::Success);

        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        transport.register_delivery_status_listener(move |o: &DeliveryOutcome| {
            sink.lock().unwrap().push(*o);
            Ok(())
        });

        let outcome = transport.send_unicast(PEER, b"x", true).await.unwrap().unwrap();
        wait_until(|| !statuses.lock().unwrap().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0], outcome);
    }

    #[tokio::test]
    async fn test_cancelled_wait_drops_late_status() {
        let (transport, mut radio) = open_transport(TransportConfig::default()).await;
        let mut events = transport.subscribe();

        let statuses = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        transport.register_delivery_status_listener(move |o: &DeliveryOutcome| {
            sink.lock().unwrap().push(o.frame_id);
            Ok(())
        });

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            transport.send_unicast(PEER, b"x", true),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(transport.shared.correlation.lock().waiters.is_empty());

        let frame_id = radio.next_request().await.frame_id().unwrap();
        radio.status(frame_id, DeliveryStatus::Success).await;

        loop {
            match events.recv().await {
                Some(Event::LateStatus { frame_id: late }) => {
                    assert_eq!(late, frame_id);
                    break;
                }
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
        wait_until(|| statuses.lock().unwrap().as_slice() == [frame_id]).await;

        // Transport is still usable
        radio.auto_status(DeliveryStatus::Success);
        assert!(transport.send_unicast(PEER, b"y", true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_inbound_data_with_rssi() {
        let (transport, radio) = open_transport(TransportConfig::default()).await;
        let seen = collect_data(&transport);

        radio.receive(0x0013_A200_4052_2BAA, "temp=21.5,baro=1013", false).await;
        radio.receive(0x0013_A200_4052_2BAA, "hello all", true).await;
        wait_until(|| seen.lock().unwrap().len() == 2).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].sender.address64.to_hex(), PEER);
        assert_eq!(seen[0].text().unwrap(), "temp=21.5,baro=1013");
        assert!(!seen[0].is_broadcast);
        assert_eq!(seen[0].rssi, Some(-i32::from(MOCK_DB)));
        assert!(seen[1].is_broadcast);
        assert!(seen[0].timestamp <= seen[1].timestamp);
    }

    #[tokio::test]
    async fn test_rssi_absent_when_module_silent() {
        let config = TransportConfig::default().at_timeout(Duration::from_millis(20));
        let (transport, radio) = open_transport(config).await;
        radio.mute_at();
        let seen = collect_data(&transport);

        radio.receive(1, "x", false).await;
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0].rssi, None);
    }

    #[tokio::test]
    async fn test_listener_error_does_not_block_next_message() {
        let config = TransportConfig::default().query_rssi(false);
        let (transport, radio) = open_transport(config).await;
        let mut events = transport.subscribe();

        transport.register_data_listener(|m: &RemoteMessage| {
            if m.text()? == "first" {
                return Err("rejecting first".into());
            }
            Ok(())
        });
        let seen = collect_data(&transport);

        radio.receive(1, "first", false).await;
        radio.receive(1, "second", false).await;
        wait_until(|| seen.lock().unwrap().len() == 2).await;

        let texts: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.text().unwrap().to_owned())
            .collect();
        assert_eq!(texts, ["first", "second"]);

        match events.recv().await {
            Some(Event::ListenerFailed { kind, failure }) => {
                assert_eq!(kind, "data");
                assert_eq!(failure.error, "rejecting first");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_listener_registered_before_open() {
        let (link, radio) = MockLink::pair();
        let mut transport =
            RadioTransport::new(link, TransportConfig::default().query_rssi(false));
        let seen = collect_data(&transport);
        transport.open().await.unwrap();

        radio.receive(1, "early bird", false).await;
        wait_until(|| seen.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn test_noise_between_frames_is_skipped() {
        let config = TransportConfig::default().query_rssi(false);
        let (transport, radio) = open_transport(config).await;
        let seen = collect_data(&transport);

        radio.inject_raw(&[0x00, 0x7E, 0x00, 0x02, 0x90, 0x00, 0x00]).await;
        radio.receive(1, "after noise", false).await;
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0].text().unwrap(), "after noise");
    }

    #[tokio::test]
    async fn test_modem_status_event() {
        let (transport, radio) = open_transport(TransportConfig::default()).await;
        let mut events = transport.subscribe();

        radio.inject(&ApiFrame::ModemStatus { status: 0x02 }).await;
        assert!(matches!(events.recv().await, Some(Event::ModemStatus(0x02))));
    }

    #[tokio::test]
    async fn test_query_parameter() {
        let (transport, _radio) = open_transport(TransportConfig::default()).await;

        let db = transport.query_parameter("DB").await.unwrap();
        assert_eq!(&db[..], &[MOCK_DB]);

        assert!(matches!(
            transport.query_parameter("ZZ").await,
            Err(Error::AtCommand { status: 2, .. })
        ));
        assert!(matches!(
            transport.query_parameter("TOOLONG").await,
            Err(Error::AtCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_unplugged_module_fails_link_and_waiters() {
        let (mut transport, radio) = open_transport(TransportConfig::default()).await;
        let pending = transport.send_unicast(PEER, b"x", true);

        let (result, ()) = tokio::join!(pending, radio.unplug());
        assert!(matches!(result, Err(Error::ChannelClosed)));
        wait_until(|| transport.state() == LinkState::Failed).await;

        assert!(matches!(
            transport.send_broadcast(b"x").await,
            Err(Error::TransportNotOpen)
        ));
        transport.close().await.unwrap();
        assert_eq!(transport.state(), LinkState::Closed);
    }

    #[test]
    fn test_promote_only_from_opening() {
        let transport = RadioTransport::new(MockLink::unplugged(), TransportConfig::default());

        transport.shared.set_state(LinkState::Opening);
        transport.shared.link_lost();
        assert!(!transport.shared.promote_open());
        assert_eq!(transport.state(), LinkState::Failed);

        transport.shared.set_state(LinkState::Opening);
        assert!(transport.shared.promote_open());
        assert_eq!(transport.state(), LinkState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_listener_does_not_delay_ack() {
        let config = TransportConfig::default()
            .query_rssi(false)
            .channel_capacity(2)
            .ack_timeout(Duration::from_millis(300));
        let (transport, radio) = open_transport(config).await;

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        transport.register_data_listener(move |_| {
            std::thread::sleep(Duration::from_millis(100));
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        });

        for n in 0..6 {
            radio.receive(1, &format!("reading {n}"), false).await;
        }
        radio.auto_status(DeliveryStatus::Success);

        let outcome = transport.send_unicast(PEER, b"ping", true).await.unwrap();
        assert!(outcome.unwrap().is_success());
        // Listeners were still working through the backlog
        assert!(handled.load(AtomicOrdering::SeqCst) < 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_listener_keeps_rssi() {
        let config = TransportConfig::default()
            .channel_capacity(1)
            .at_timeout(Duration::from_millis(200));
        let (transport, radio) = open_transport(config).await;

        let rssi = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&rssi);
        transport.register_data_listener(move |m: &RemoteMessage| {
            std::thread::sleep(Duration::from_millis(50));
            sink.lock().unwrap().push(m.rssi);
            Ok(())
        });

        for n in 0..4 {
            radio.receive(1, &format!("reading {n}"), false).await;
        }
        for _ in 0..100 {
            if rssi.lock().unwrap().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(*rssi.lock().unwrap(), vec![Some(-i32::from(MOCK_DB)); 4]);
    }

    #[tokio::test]
    async fn test_cancelled_send_still_writes_whole_frame() {
        let (link, mut radio) = MockLink::pair_with_capacity(8);
        let mut transport = RadioTransport::new(link, TransportConfig::default().query_rssi(false));
        transport.open().await.unwrap();

        let payload = "x".repeat(64);
        let first = transport.send_unicast(PEER, payload.as_bytes(), false);
        assert!(first.now_or_never().is_none());
        transport.send_unicast(PEER, b"second", false).await.unwrap();

        for expected in [payload.as_bytes(), b"second".as_slice()] {
            match radio.next_request().await {
                ApiFrame::TransmitRequest { data, .. } => assert_eq!(&data[..], expected),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }
}
