//! Client for the KVM hardware-control service.
//!
//! One TCP connection is shared by every tool call. Each request is written
//! as one JSON line and its response read back before the connection lock is
//! released, so concurrent callers never interleave bytes on the wire.
//!
//! The connection is re-established on demand (one attempt per call). Requests
//! themselves are never resent: keystrokes and clicks are not idempotent.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use kvm_mcp_core::error::KvmError;
use kvm_mcp_core::input::{InputDirective, KeySequenceStep};
use kvm_mcp_core::protocol::{
    CapturedFrame, FramePayload, MouseButton, Point, ServiceCommand, ServiceRequest,
    ServiceResponse,
};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time to wait for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for the TCP connect to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum response size in bytes. Frames arrive base64-encoded in one line.
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// State of the connection to the KVM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    /// A connect attempt is in progress.
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Reconnecting => 2,
        }
    }
}

/// Shared view of the connection state, readable without the connection lock.
#[derive(Debug, Clone, Default)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Acknowledgement of a multi-request input operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputAck {
    /// Number of requests the service acknowledged.
    pub requests: usize,
}

/// Client timeouts.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: DEFAULT_REQUEST_TIMEOUT,
            connect: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Client for communicating with the KVM service.
pub struct ServiceClient {
    addr: String,
    timeouts: Timeouts,
    connection: Arc<Mutex<Option<BufReader<TcpStream>>>>,
    state: StateCell,
}

impl ServiceClient {
    /// Create a client. No connection is made until the first request.
    pub fn new(addr: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            addr: addr.into(),
            timeouts,
            connection: Arc::new(Mutex::new(None)),
            state: StateCell::default(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Send one command and wait for its response payload.
    ///
    /// The exchange runs in its own task holding the connection lock. If the
    /// caller stops waiting, the exchange still completes and its result is
    /// discarded, leaving the connection at a request boundary.
    pub async fn request(&self, command: ServiceCommand) -> Result<Option<Value>, KvmError> {
        let action = command.action();
        let request_timeout = self.timeouts.request + typing_time(&command);
        let request = ServiceRequest {
            id: Uuid::new_v4().to_string(),
            command,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| KvmError::Protocol(format!("failed to serialize request: {}", e)))?;
        line.push('\n');

        let exchange = Exchange {
            addr: self.addr.clone(),
            connect_timeout: self.timeouts.connect,
            request_timeout,
            state: self.state.clone(),
            id: request.id,
            action,
            line,
        };

        let guard = self.connection.clone().lock_owned().await;
        self.spawn_exchange(exchange.run(guard)).await
    }

    /// Run an exchange task to completion. If the task dies before
    /// finishing, the stream position is unknown and the connection is reset.
    async fn spawn_exchange<F>(&self, task: F) -> Result<Option<Value>, KvmError>
    where
        F: Future<Output = Result<Option<Value>, KvmError>> + Send + 'static,
    {
        match tokio::spawn(task).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Request task failed, dropping connection: {}", e);
                *self.connection.lock().await = None;
                self.state.set(ConnectionState::Disconnected);
                Err(KvmError::ConnectionLost(format!("request task failed: {}", e)))
            }
        }
    }

    /// Send input directives in order, each acknowledged before the next.
    ///
    /// On failure nothing after the failing directive is sent, and the error
    /// reports how many directives went through.
    pub async fn send_input(
        &self,
        directives: &[InputDirective],
        char_delay_ms: Option<u32>,
    ) -> Result<InputAck, KvmError> {
        let total = directives.len();
        for (completed, directive) in directives.iter().enumerate() {
            let command = ServiceCommand::from_directive(directive, char_delay_ms);
            if let Err(e) = self.request(command).await {
                return Err(KvmError::partial(completed, total, e));
            }
        }
        Ok(InputAck { requests: total })
    }

    /// Send key steps in order, pausing after each step for its delay.
    pub async fn send_key_sequence(&self, steps: &[KeySequenceStep]) -> Result<InputAck, KvmError> {
        let total = steps.len();
        for (completed, step) in steps.iter().enumerate() {
            let command = ServiceCommand::from_directive(&step.directive(), None);
            if let Err(e) = self.request(command).await {
                return Err(KvmError::partial(completed, total, e));
            }
            if step.delay_ms > 0 && completed + 1 < total {
                tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
            }
        }
        Ok(InputAck { requests: total })
    }

    /// Press a single key (a `KeyPress` directive).
    pub async fn send_key(&self, directive: &InputDirective) -> Result<(), KvmError> {
        self.request(ServiceCommand::from_directive(directive, None))
            .await
            .map(|_| ())
    }

    pub async fn move_mouse(&self, x: i32, y: i32, relative: bool) -> Result<(), KvmError> {
        self.request(ServiceCommand::MouseMove { x, y, relative })
            .await
            .map(|_| ())
    }

    pub async fn click(&self, button: MouseButton, at: Option<Point>) -> Result<(), KvmError> {
        self.request(ServiceCommand::MouseClick {
            button,
            x: at.map(|p| p.x),
            y: at.map(|p| p.y),
        })
        .await
        .map(|_| ())
    }

    pub async fn drag(&self, from: Point, to: Point, button: MouseButton) -> Result<(), KvmError> {
        self.request(ServiceCommand::MouseDrag { from, to, button })
            .await
            .map(|_| ())
    }

    pub async fn scroll(&self, amount: i8) -> Result<(), KvmError> {
        self.request(ServiceCommand::MouseScroll { amount })
            .await
            .map(|_| ())
    }

    /// Fetch the latest frame from the capture device.
    pub async fn capture_frame(&self, quality: u8) -> Result<CapturedFrame, KvmError> {
        let payload = self
            .request(ServiceCommand::CaptureFrame { quality })
            .await?
            .ok_or_else(|| KvmError::Protocol("capture_frame returned no frame".into()))?;
        decode_frame(payload)
    }

    pub async fn device_info(&self) -> Result<Value, KvmError> {
        self.request_value(ServiceCommand::GetDeviceInfo).await
    }

    pub async fn list_capture_devices(&self) -> Result<Value, KvmError> {
        self.request_value(ServiceCommand::ListCaptureDevices).await
    }

    pub async fn set_capture_device(&self, device: &str) -> Result<Value, KvmError> {
        self.request_value(ServiceCommand::SetCaptureDevice {
            device: device.to_string(),
        })
        .await
    }

    pub async fn set_capture_resolution(&self, width: u32, height: u32) -> Result<Value, KvmError> {
        self.request_value(ServiceCommand::SetCaptureResolution { width, height })
            .await
    }

    async fn request_value(&self, command: ServiceCommand) -> Result<Value, KvmError> {
        Ok(self.request(command).await?.unwrap_or(Value::Null))
    }
}

/// Extra response time for a `type_text` request. The service replies only
/// after the last character is typed.
fn typing_time(command: &ServiceCommand) -> Duration {
    match command {
        ServiceCommand::TypeText {
            text,
            char_delay_ms: Some(delay),
        } => {
            let chars = u64::try_from(text.chars().count()).unwrap_or(u64::MAX);
            Duration::from_millis(chars.saturating_mul(u64::from(*delay)))
        }
        _ => Duration::ZERO,
    }
}

/// Decode a frame payload into raw image bytes.
fn decode_frame(payload: Value) -> Result<CapturedFrame, KvmError> {
    let frame: FramePayload = serde_json::from_value(payload)
        .map_err(|e| KvmError::Protocol(format!("invalid frame payload: {}", e)))?;
    let bytes = general_purpose::STANDARD
        .decode(frame.data.as_bytes())
        .map_err(|e| KvmError::Protocol(format!("invalid frame data: {}", e)))?;
    Ok(CapturedFrame {
        format: frame.format,
        width: frame.width,
        height: frame.height,
        bytes,
    })
}

/// One request/response round trip, owned by its own task.
struct Exchange {
    addr: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    state: StateCell,
    id: String,
    action: &'static str,
    line: String,
}

impl Exchange {
    async fn run(
        self,
        mut connection: OwnedMutexGuard<Option<BufReader<TcpStream>>>,
    ) -> Result<Option<Value>, KvmError> {
        if connection.is_none() {
            *connection = Some(self.connect().await?);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(KvmError::ConnectionLost("no connection after connect".into()));
        };

        let result = timeout(self.request_timeout, round_trip(stream, &self.line)).await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("{} failed, dropping connection: {}", self.action, e);
                *connection = None;
                self.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                // The service state is unknown after a timeout; start fresh next call
                warn!(
                    "{} timed out after {:?}, dropping connection",
                    self.action, self.request_timeout
                );
                *connection = None;
                self.state.set(ConnectionState::Disconnected);
                return Err(KvmError::Timeout(self.request_timeout));
            }
        };

        if response.id != self.id {
            *connection = None;
            self.state.set(ConnectionState::Disconnected);
            return Err(KvmError::Protocol(format!(
                "response id '{}' does not match request id '{}'",
                response.id, self.id
            )));
        }

        if response.ok {
            Ok(response.payload)
        } else {
            let message = response
                .error
                .unwrap_or_else(|| "no reason given".to_string());
            debug!("{} rejected by service: {}", self.action, message);
            Err(KvmError::Rejected {
                action: self.action.to_string(),
                message,
            })
        }
    }

    /// Make one connect attempt.
    async fn connect(&self) -> Result<BufReader<TcpStream>, KvmError> {
        self.state.set(ConnectionState::Reconnecting);
        debug!("Connecting to KVM service at {}", self.addr);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(KvmError::ServiceUnavailable {
                    addr: self.addr.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(KvmError::ServiceUnavailable {
                    addr: self.addr.clone(),
                    reason: format!("connect timed out after {:?}", self.connect_timeout),
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        self.state.set(ConnectionState::Connected);
        info!("Connected to KVM service at {}", self.addr);
        Ok(BufReader::new(stream))
    }
}

/// Write one request line and read one response line.
async fn round_trip(
    stream: &mut BufReader<TcpStream>,
    line: &str,
) -> Result<ServiceResponse, KvmError> {
    debug!("Sending: {} bytes", line.len());
    let writer = stream.get_mut();
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| KvmError::ConnectionLost(format!("failed to write request: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| KvmError::ConnectionLost(format!("failed to flush request: {}", e)))?;

    let mut response_line = String::new();
    let bytes_read = read_line_bounded(stream, &mut response_line, MAX_RESPONSE_SIZE).await?;
    if bytes_read == 0 {
        return Err(KvmError::ConnectionLost(
            "service closed the connection".into(),
        ));
    }
    debug!("Received: {} bytes", bytes_read);

    serde_json::from_str(response_line.trim())
        .map_err(|e| KvmError::Protocol(format!("invalid response: {}", e)))
}

/// Read a line with a maximum size limit.
///
/// Returns the number of bytes read (0 means EOF before any data).
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize, KvmError> {
    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .map_err(|e| KvmError::ConnectionLost(format!("failed to read response: {}", e)))?;

        if available.is_empty() {
            if bytes.is_empty() {
                return Ok(0);
            }
            // EOF in the middle of a line: the response is truncated
            return Err(KvmError::ConnectionLost(
                "service closed the connection mid-response".into(),
            ));
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            return Err(KvmError::Protocol(format!(
                "response too large: exceeded {} byte limit",
                max_size
            )));
        }

        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;
        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes)
        .map_err(|e| KvmError::Protocol(format!("invalid UTF-8 in response: {}", e)))?;
    buf.push_str(line);
    Ok(total)
}
