//! Serial/USB link implementation.
//!
//! This module opens the serial port an XBee module is attached to.

use futures::future::BoxFuture;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use crate::error::{Error, Result};
use crate::transport::{BoxedStream, Link};

/// Default baud rate for XBee modules.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default flow control (the modules ship with RTS/CTS enabled).
pub const DEFAULT_FLOW_CONTROL: FlowControl = FlowControl::Hardware;

/// Configuration for a serial link.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Flow control.
    pub flow_control: FlowControl,
    /// Data bits.
    pub data_bits: DataBits,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Parity.
    pub parity: Parity,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings (8N1).
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            flow_control: DEFAULT_FLOW_CONTROL,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the flow control.
    #[must_use]
    pub const fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Sets the parity.
    #[must_use]
    pub const fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Sets the stop bits.
    #[must_use]
    pub const fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }
}

/// Serial link to an XBee module.
#[derive(Debug, Clone)]
pub struct SerialLink {
    config: SerialConfig,
}

impl SerialLink {
    /// Creates a serial link with the given configuration.
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    /// Creates a serial link for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Returns the link configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Link for SerialLink {
    fn name(&self) -> &str {
        &self.config.port
    }

    fn open(&self) -> BoxFuture<'_, Result<BoxedStream>> {
        let config = self.config.clone();
        Box::pin(async move {
            tracing::info!(
                "opening serial port {} at {} baud",
                config.port,
                config.baud_rate
            );

            // Opening a tty can stall on the driver; keep it off the async
            // workers. The stream still registers with this runtime's reactor.
            let handle = tokio::runtime::Handle::current();
            let stream = tokio::task::spawn_blocking(move || {
                let _guard = handle.enter();
                tokio_serial::new(&config.port, config.baud_rate)
                    .flow_control(config.flow_control)
                    .data_bits(config.data_bits)
                    .stop_bits(config.stop_bits)
                    .parity(config.parity)
                    .open_native_async()
            })
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
