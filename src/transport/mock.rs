//! In-memory link and a scripted module for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{ApiFrame, DeliveryStatus, FrameDecoder, ReceiveOptions, encode_frame};
use crate::transport::{BoxedStream, Link};
use crate::types::{Address16, Address64};

pub(crate) const MOCK_SH: [u8; 4] = [0x00, 0x13, 0xA2, 0x00];
pub(crate) const MOCK_SL: [u8; 4] = [0x40, 0xAB, 0xCD, 0xEF];
pub(crate) const MOCK_MY: [u8; 2] = [0x12, 0x34];
pub(crate) const MOCK_DB: u8 = 0x28;

const NO_AUTO_STATUS: u8 = 0xFF;

/// Link whose streams are ends of in-memory pipes, handed out in order.
pub(crate) struct MockLink {
    streams: SyncMutex<VecDeque<DuplexStream>>,
    capacity: usize,
}

impl MockLink {
    /// Creates a link and the module on the other end of it.
    pub(crate) fn pair() -> (Self, MockRadio) {
        Self::pair_with_capacity(4096)
    }

    /// Like [`pair`](Self::pair) with a pipe buffering at most `capacity`
    /// bytes in each direction.
    pub(crate) fn pair_with_capacity(capacity: usize) -> (Self, MockRadio) {
        let link = Self {
            streams: SyncMutex::new(VecDeque::new()),
            capacity,
        };
        let radio = link.spare();
        (link, radio)
    }

    /// Creates a link that always fails to open.
    pub(crate) fn unplugged() -> Self {
        Self {
            streams: SyncMutex::new(VecDeque::new()),
            capacity: 0,
        }
    }

    /// Queues another module for the next open of this link.
    pub(crate) fn spare(&self) -> MockRadio {
        let (host, device) = tokio::io::duplex(self.capacity);
        self.streams.lock().push_back(host);
        MockRadio::spawn(device)
    }
}

impl Link for MockLink {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&self) -> BoxFuture<'_, Result<BoxedStream>> {
        let stream = self.streams.lock().pop_front();
        Box::pin(async move {
            let stream = stream.ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no module attached",
                ))
            })?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

struct Settings {
    answer_at: AtomicBool,
    auto_status: AtomicU8,
}

/// Scripted module: answers AT queries, records transmit requests and
/// injects inbound frames on demand.
pub(crate) struct MockRadio {
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    requests: mpsc::UnboundedReceiver<ApiFrame>,
    settings: Arc<Settings>,
    task: JoinHandle<()>,
}

impl MockRadio {
    fn spawn(stream: DuplexStream) -> Self {
        let (mut reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let settings = Arc::new(Settings {
            answer_at: AtomicBool::new(true),
            auto_status: AtomicU8::new(NO_AUTO_STATUS),
        });
        let (request_tx, requests) = mpsc::unbounded_channel();

        let task_writer = Arc::clone(&writer);
        let task_settings = Arc::clone(&settings);
        let task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 512];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.feed(&buf[..n]);
                while let Ok(Some(data)) = decoder.decode() {
                    let Ok(frame) = ApiFrame::parse(&data) else {
                        continue;
                    };
                    if let Some(reply) = reply_to(&frame, &task_settings) {
                        write(&task_writer, &reply).await;
                    }
                    if matches!(frame, ApiFrame::TransmitRequest { .. }) {
                        let _ = request_tx.send(frame);
                    }
                }
            }
        });

        Self {
            writer,
            requests,
            settings,
            task,
        }
    }

    /// Stops answering AT commands.
    pub(crate) fn mute_at(&self) {
        self.settings.answer_at.store(false, Ordering::SeqCst);
    }

    /// Answers every acknowledged transmit request with `status`.
    pub(crate) fn auto_status(&self, status: DeliveryStatus) {
        self.settings
            .auto_status
            .store(status.code(), Ordering::SeqCst);
    }

    /// Writes a frame towards the host.
    pub(crate) async fn inject(&self, frame: &ApiFrame) {
        write(&self.writer, frame).await;
    }

    /// Writes raw bytes towards the host.
    pub(crate) async fn inject_raw(&self, bytes: &[u8]) {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.unwrap();
    }

    /// Delivers an RF packet from `source`.
    pub(crate) async fn receive(&self, source: u64, payload: &str, broadcast: bool) {
        let options = if broadcast {
            ReceiveOptions::BROADCAST
        } else {
            ReceiveOptions::ACKNOWLEDGED
        };
        self.inject(&ApiFrame::ReceivePacket {
            source64: Address64::new(source),
            source16: Address16::new(0x7D84),
            options,
            data: Bytes::copy_from_slice(payload.as_bytes()),
        })
        .await;
    }

    /// Reports the delivery status of `frame_id`.
    pub(crate) async fn status(&self, frame_id: u8, status: DeliveryStatus) {
        self.inject(&status_frame(frame_id, status)).await;
    }

    /// Waits for the next transmit request the host sent.
    pub(crate) async fn next_request(&mut self) -> ApiFrame {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("no transmit request")
            .expect("mock radio stopped")
    }

    /// Returns a transmit request if one is already queued.
    pub(crate) fn try_request(&mut self) -> Option<ApiFrame> {
        self.requests.try_recv().ok()
    }

    /// Simulates unplugging the module.
    pub(crate) async fn unplug(self) {
        self.task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl Drop for MockRadio {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn status_frame(frame_id: u8, status: DeliveryStatus) -> ApiFrame {
    ApiFrame::TransmitStatus {
        frame_id,
        destination16: Address16::new(0x7D84),
        retry_count: 0,
        delivery_status: status,
        discovery_status: 0,
    }
}

fn reply_to(frame: &ApiFrame, settings: &Settings) -> Option<ApiFrame> {
    match frame {
        ApiFrame::AtCommand {
            frame_id, command, ..
        } if settings.answer_at.load(Ordering::SeqCst) => {
            let (status, data): (u8, &[u8]) = match command {
                b"SH" => (0, &MOCK_SH),
                b"SL" => (0, &MOCK_SL),
                b"MY" => (0, &MOCK_MY),
                b"DB" => (0, &[MOCK_DB]),
                _ => (2, &[]),
            };
            Some(ApiFrame::AtCommandResponse {
                frame_id: *frame_id,
                command: *command,
                status,
                data: Bytes::copy_from_slice(data),
            })
        }
        ApiFrame::TransmitRequest { frame_id, .. } if *frame_id != 0 => {
            let code = settings.auto_status.load(Ordering::SeqCst);
            (code != NO_AUTO_STATUS).then(|| status_frame(*frame_id, DeliveryStatus::from_byte(code)))
        }
        _ => None,
    }
}

async fn write(writer: &Mutex<WriteHalf<DuplexStream>>, frame: &ApiFrame) {
    let bytes = encode_frame(&frame.encode()).unwrap();
    let mut writer = writer.lock().await;
    // The host may already be gone
    let _ = writer.write_all(&bytes).await;
}
