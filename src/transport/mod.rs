//! Transport layer for radio communication.
//!
//! A [`Link`] produces an opened byte stream to the module; the
//! [`RadioTransport`] drives API frames over it. Serial is the only real
//! link; tests plug in an in-memory one.

pub mod radio;
pub mod serial;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A bidirectional byte stream to the module.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// Boxed link stream.
pub type BoxedStream = Box<dyn LinkStream>;

/// Trait for link implementations.
pub trait Link: Send + Sync {
    /// Human-readable link name, e.g. the port path.
    fn name(&self) -> &str;

    /// Opens the link.
    ///
    /// Implementations must not block the calling task; blocking driver
    /// calls belong on the blocking worker pool.
    fn open(&self) -> BoxFuture<'_, Result<BoxedStream>>;
}

/// Lifecycle state of a [`RadioTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No link.
    #[default]
    Closed,
    /// Open in progress.
    Opening,
    /// Ready to send and receive.
    Open,
    /// Close in progress.
    Closing,
    /// Open failed or the link died; call `close` to reset.
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub use radio::{RadioTransport, TransportConfig};
pub use serial::{SerialConfig, SerialLink, list_ports};
