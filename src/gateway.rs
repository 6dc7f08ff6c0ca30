//! High-level [`Gateway`]: a radio transport with a transmission log.
//!
//! The gateway owns one [`RadioTransport`] and one [`TransmissionStore`].
//! A relay listener on the transport writes each inbound message to the log
//! before handing it to the gateway's own consumers, so a consumer never
//! sees a message the log does not have.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, ListenerError, ListenerId, ListenerSet, Subscription};
use crate::store::{StoreConfig, TransmissionStore};
use crate::transport::{
    Link, LinkState, RadioTransport, SerialConfig, SerialLink, TransportConfig,
};
use crate::types::{
    DeliveryOutcome, LocalDevice, RemoteEndpoint, RemoteMessage, TransmissionRecord,
    current_timestamp,
};

/// Configuration for a [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Transmission log.
    pub store: StoreConfig,
    /// Serial port settings; unused by [`Gateway::with_link`].
    pub serial: SerialConfig,
    /// Radio transport settings.
    pub transport: TransportConfig,
    /// Also log sent frames, with the local module as sender.
    pub log_outbound: bool,
}

impl GatewayConfig {
    /// Creates a configuration for the module on `port` with defaults.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            store: StoreConfig::default(),
            serial: SerialConfig::new(port),
            transport: TransportConfig::default(),
            log_outbound: false,
        }
    }

    /// Sets the log configuration.
    #[must_use]
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the log connection URL, keeping the table name.
    #[must_use]
    pub fn log_url(mut self, url: impl Into<String>) -> Self {
        self.store.url = url.into();
        self
    }

    /// Sets the serial configuration.
    #[must_use]
    pub fn serial(mut self, serial: SerialConfig) -> Self {
        self.serial = serial;
        self
    }

    /// Sets the transport configuration.
    #[must_use]
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Enables or disables logging of sent frames.
    #[must_use]
    pub const fn log_outbound(mut self, enabled: bool) -> Self {
        self.log_outbound = enabled;
        self
    }
}

/// XBee gateway: sends, receives and logs transmissions.
pub struct Gateway {
    transport: RadioTransport,
    store: Arc<TransmissionStore>,
    consumers: Arc<ListenerSet<RemoteMessage>>,
    logging: Arc<AtomicBool>,
    log_outbound: bool,
}

impl Gateway {
    /// Opens the log and prepares a serial transport.
    ///
    /// No radio I/O happens until [`open_and_log`](Self::open_and_log).
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened.
    pub fn start(config: GatewayConfig) -> Result<Self> {
        let link = SerialLink::new(config.serial.clone());
        Self::with_link(link, config)
    }

    /// Opens the log and prepares a transport over `link`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be opened.
    pub fn with_link(link: impl Link + 'static, config: GatewayConfig) -> Result<Self> {
        let store = Arc::new(TransmissionStore::open(&config.store)?);
        let transport = RadioTransport::new(link, config.transport);
        let consumers = Arc::new(ListenerSet::new("consumer"));
        let logging = Arc::new(AtomicBool::new(false));

        transport.register_data_listener(logging_relay(
            Arc::clone(&store),
            Arc::clone(&consumers),
            Arc::clone(&logging),
            transport.events(),
        ));

        Ok(Self {
            transport,
            store,
            consumers,
            logging,
            log_outbound: config.log_outbound,
        })
    }

    /// Opens the radio link and logs every inbound message from now on.
    ///
    /// # Errors
    ///
    /// - [`Error::StoreUnavailable`] after [`shutdown`](Self::shutdown)
    /// - [`Error::TransportOpen`] if the link cannot be opened
    pub async fn open_and_log(&mut self) -> Result<()> {
        if self.store.is_closed() {
            return Err(Error::StoreUnavailable {
                reason: "log closed by shutdown".to_owned(),
            });
        }
        if !self.logging.swap(true, Ordering::SeqCst) {
            tracing::info!("logging inbound messages to table {}", self.store.table());
        }
        self.transport.open().await
    }

    /// Opens the radio link without logging inbound messages.
    ///
    /// Consumers still receive every message. Works after
    /// [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportOpen`] if the link cannot be opened.
    pub async fn open(&mut self) -> Result<()> {
        self.transport.open().await
    }

    /// Closes the link and the log, and stops logging.
    ///
    /// The log is closed even if closing the link fails; the first error is
    /// returned. Consumers stay registered, so a later [`open`](Self::open)
    /// delivers to them unlogged.
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("shutting down gateway");
        let transport = self.transport.close().await;

        self.logging.store(false, Ordering::SeqCst);

        let store = self.store.close();
        if let Err(e) = &transport {
            tracing::warn!("closing link failed: {}", e);
        }
        transport.and(store)
    }

    /// Sends `payload` to the node at the 64-bit hex address `destination`.
    ///
    /// See [`RadioTransport::send_unicast`].
    pub async fn send_unicast(
        &self,
        destination: &str,
        payload: &[u8],
        require_ack: bool,
    ) -> Result<Option<DeliveryOutcome>> {
        let outcome = self
            .transport
            .send_unicast(destination, payload, require_ack)
            .await?;
        self.log_sent(payload, false);
        Ok(outcome)
    }

    /// Broadcasts `payload` to every reachable node.
    ///
    /// See [`RadioTransport::send_broadcast`].
    pub async fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
        self.transport.send_broadcast(payload).await?;
        self.log_sent(payload, true);
        Ok(())
    }

    fn log_sent(&self, payload: &[u8], is_broadcast: bool) {
        if !self.log_outbound {
            return;
        }
        let sender = self
            .transport
            .local_device()
            .map_or_else(RemoteEndpoint::default, |local| local.endpoint);
        let result = std::str::from_utf8(payload)
            .map_err(Error::from)
            .and_then(|text| {
                self.store
                    .insert(&sender, None, is_broadcast, text, current_timestamp())
            });
        if let Err(e) = result {
            tracing::error!("failed to log sent frame: {}", e);
            self.transport.events().dispatch(Event::LogFailed {
                sender: sender.to_string(),
                error: e.to_string(),
            });
        }
    }

    /// Reads the whole log back as messages, oldest first.
    ///
    /// Replayed messages carry no RSSI.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub async fn replay_log(&self) -> Result<Vec<RemoteMessage>> {
        let records = self.records().await?;
        Ok(records
            .iter()
            .map(TransmissionRecord::to_remote_message)
            .collect())
    }

    /// Reads the raw log records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub async fn records(&self) -> Result<Vec<TransmissionRecord>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.scan_all())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Registers a consumer for inbound messages.
    ///
    /// While logging, consumers only see messages that were logged.
    pub fn register_data_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RemoteMessage) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.consumers.register(listener)
    }

    /// Removes a consumer.
    pub fn unregister_data_listener(&self, id: ListenerId) -> bool {
        self.consumers.unregister(id)
    }

    /// Registers a listener for delivery status frames.
    pub fn register_delivery_status_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DeliveryOutcome) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.transport.register_delivery_status_listener(listener)
    }

    /// Removes a delivery status listener.
    pub fn unregister_delivery_status_listener(&self, id: ListenerId) -> bool {
        self.transport.unregister_delivery_status_listener(id)
    }

    /// Subscribes to gateway events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.transport.subscribe()
    }

    /// Returns the link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.transport.state()
    }

    /// Returns the attached module's addresses, once probed.
    #[must_use]
    pub const fn local_device(&self) -> Option<LocalDevice> {
        self.transport.local_device()
    }

    /// Returns the underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &RadioTransport {
        &self.transport
    }

    /// Returns the transmission log.
    #[must_use]
    pub fn store(&self) -> &TransmissionStore {
        &self.store
    }
}

/// Builds the transport listener that logs, then forwards to consumers.
fn logging_relay(
    store: Arc<TransmissionStore>,
    consumers: Arc<ListenerSet<RemoteMessage>>,
    logging: Arc<AtomicBool>,
    events: EventDispatcher,
) -> impl Fn(&RemoteMessage) -> std::result::Result<(), ListenerError> + Send + Sync + 'static {
    move |message: &RemoteMessage| {
        if logging.load(Ordering::SeqCst) {
            match store.log_message(message) {
                Ok(id) => tracing::debug!("logged message {} from {}", id, message.sender),
                Err(e) => {
                    tracing::error!("failed to log message from {}: {}", message.sender, e);
                    events.dispatch(Event::LogFailed {
                        sender: message.sender.to_string(),
                        error: e.to_string(),
                    });
                    return Ok(());
                }
            }
        }

        let failures = consumers.dispatch(message);
        events.report("consumer", failures);
        Ok(())
    }
}
