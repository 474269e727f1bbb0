//! Test doubles: a scripted KVM service on a loopback port and fake
//! recognition engines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use kvm_mcp_core::error::KvmError;
use kvm_mcp_core::protocol::{CapturedFrame, ServiceCommand, ServiceRequest, ServiceResponse};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::ocr::Recognizer;

/// How the fake service answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Option<Value>),
    Reject(String),
    /// Close the connection without answering.
    Drop,
    /// Never answer; keep the connection open.
    Silent,
    /// Answer successfully after a pause.
    Delayed(Duration),
    /// Answer with an id that does not match the request.
    WrongId,
    /// Write this line verbatim.
    Raw(String),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Ok(None)
    }

    pub fn payload(value: Value) -> Self {
        Reply::Ok(Some(value))
    }

    /// A JPEG frame whose image bytes are `bytes`.
    pub fn frame(bytes: &[u8]) -> Self {
        Reply::payload(json!({
            "format": "jpeg",
            "data": general_purpose::STANDARD.encode(bytes),
            "width": 640,
            "height": 480,
        }))
    }
}

type Script = dyn Fn(usize, &ServiceCommand) -> Reply + Send + Sync;

#[derive(Default)]
struct Record {
    commands: Vec<ServiceCommand>,
    arrivals: Vec<Instant>,
}

#[derive(Default)]
struct Shared {
    record: Mutex<Record>,
    connections: AtomicUsize,
    malformed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A KVM service stand-in that answers according to a script.
///
/// The script sees the zero-based index of each request (counted across all
/// connections) and its command.
pub struct FakeService {
    addr: String,
    shared: Arc<Shared>,
}

impl FakeService {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(usize, &ServiceCommand) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake service");
        let addr = listener
            .local_addr()
            .expect("fake service address")
            .to_string();
        let shared = Arc::new(Shared::default());
        let script: Arc<Script> = Arc::new(script);

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    stream,
                    accept_shared.clone(),
                    script.clone(),
                ));
            }
        });

        Self { addr, shared }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Commands received so far, in arrival order.
    pub fn commands(&self) -> Vec<ServiceCommand> {
        self.shared.record.lock().unwrap().commands.clone()
    }

    pub fn arrival_times(&self) -> Vec<Instant> {
        self.shared.record.lock().unwrap().arrivals.clone()
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Lines that were not a valid request.
    pub fn malformed(&self) -> usize {
        self.shared.malformed.load(Ordering::SeqCst)
    }

    /// Largest number of received-but-unanswered requests seen at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    shared: Arc<Shared>,
    script: Arc<Script>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, ServiceRequest)>();

    // Reader runs ahead of the responder so pipelined requests are visible
    let reader_shared = shared.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let request: ServiceRequest = match serde_json::from_str(line.trim()) {
                Ok(request) => request,
                Err(_) => {
                    reader_shared.malformed.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
            };
            let in_flight = reader_shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            reader_shared
                .max_in_flight
                .fetch_max(in_flight, Ordering::SeqCst);
            let index = {
                let mut record = reader_shared.record.lock().unwrap();
                record.commands.push(request.command.clone());
                record.arrivals.push(Instant::now());
                record.commands.len() - 1
            };
            if tx.send((index, request)).is_err() {
                break;
            }
        }
    });

    while let Some((index, request)) = rx.recv().await {
        let reply = script(index, &request.command);
        let response = match reply {
            Reply::Ok(payload) => ServiceResponse::success(request.id, payload),
            Reply::Reject(message) => ServiceResponse::failure(request.id, message),
            Reply::Drop => {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            Reply::Silent => continue,
            Reply::Delayed(delay) => {
                tokio::time::sleep(delay).await;
                ServiceResponse::success(request.id, None)
            }
            Reply::WrongId => ServiceResponse::success(format!("{}-other", request.id), None),
            Reply::Raw(line) => {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                if write_half
                    .write_all(format!("{}\n", line).as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }
        };

        let mut line = serde_json::to_string(&response).expect("serialize response");
        line.push('\n');
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        if write_half.write_all(line.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Recognizer that reads frame bytes as UTF-8 text.
pub struct EchoRecognizer;

#[async_trait]
impl Recognizer for EchoRecognizer {
    async fn recognize(&self, frame: &CapturedFrame) -> Result<String, KvmError> {
        String::from_utf8(frame.bytes.clone())
            .map_err(|e| KvmError::RecognitionFailed(e.to_string()))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Recognizer that always fails.
pub struct FailingRecognizer;

#[async_trait]
impl Recognizer for FailingRecognizer {
    async fn recognize(&self, _frame: &CapturedFrame) -> Result<String, KvmError> {
        Err(KvmError::RecognitionFailed("engine crashed".into()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}
