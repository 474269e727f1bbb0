//! Capture and recognize pipeline.
//!
//! Fetches frames from the KVM service, optionally keeps a copy on disk, and
//! hands them to the recognizer. Recognition runs after the service exchange
//! has completed, so it never holds the connection.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage};
use kvm_mcp_core::error::KvmError;
use kvm_mcp_core::input::parse_tagged_text;
use kvm_mcp_core::protocol::{CapturedFrame, FrameFormat};
use tracing::{debug, info, warn};

use crate::ocr::Recognizer;
use crate::service::ServiceClient;

/// JPEG quality requested from the service.
pub const CAPTURE_QUALITY: u8 = 85;

/// Largest image handed back to the agent.
pub const MAX_TRANSPORT_BYTES: usize = 10_000_000;

const MIN_REENCODE_QUALITY: u8 = 20;
const REENCODE_QUALITY_STEP: u8 = 15;
const DOWNSCALED_QUALITY: u8 = 60;

/// Why a frame was captured; used to name capture-log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTag {
    Capture,
    Ocr,
    Exec,
}

impl CaptureTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureTag::Capture => "capture",
            CaptureTag::Ocr => "ocr",
            CaptureTag::Exec => "exec",
        }
    }
}

/// Directory that receives a copy of every captured frame.
#[derive(Debug, Clone)]
pub struct CaptureLog {
    dir: PathBuf,
}

impl CaptureLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a frame captured now.
    fn path_for(&self, tag: CaptureTag, format: FrameFormat) -> PathBuf {
        let ts = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        self.dir
            .join(format!("{}_{}.{}", ts, tag.as_str(), format.extension()))
    }

    /// Write a frame. Failures are logged, never returned.
    pub async fn save(&self, tag: CaptureTag, frame: &CapturedFrame) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(
                "Failed to create capture log dir {}: {}",
                self.dir.display(),
                e
            );
            return None;
        }
        let path = self.path_for(tag, frame.format);
        match tokio::fs::write(&path, &frame.bytes).await {
            Ok(()) => {
                info!("Capture log saved: {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to save capture log {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Reads the target screen: raw frames or recognized text.
pub struct ScreenReader {
    client: Arc<ServiceClient>,
    recognizer: Arc<dyn Recognizer>,
    capture_log: Option<CaptureLog>,
}

impl ScreenReader {
    pub fn new(
        client: Arc<ServiceClient>,
        recognizer: Arc<dyn Recognizer>,
        capture_log: Option<CaptureLog>,
    ) -> Self {
        Self {
            client,
            recognizer,
            capture_log,
        }
    }

    /// Fetch one frame and log it if a capture log is configured.
    pub async fn capture(&self, tag: CaptureTag) -> Result<CapturedFrame, KvmError> {
        let frame = self.client.capture_frame(CAPTURE_QUALITY).await?;
        debug!(
            "Captured {}x{} {:?} frame ({} bytes)",
            frame.width,
            frame.height,
            frame.format,
            frame.bytes.len()
        );
        if let Some(log) = &self.capture_log {
            log.save(tag, &frame).await;
        }
        Ok(frame)
    }

    /// Wait, capture, and return the text on screen.
    pub async fn capture_and_recognize(&self, wait: Duration) -> Result<String, KvmError> {
        self.read_text(wait, CaptureTag::Ocr).await
    }

    /// Send tagged input, wait for the target to react, then read the screen.
    ///
    /// The input is parsed before anything is sent; a malformed tag sends nothing.
    pub async fn execute_and_read(&self, input: &str, wait: Duration) -> Result<String, KvmError> {
        let directives = parse_tagged_text(input)?;
        self.client.send_input(&directives, None).await?;
        self.read_text(wait, CaptureTag::Exec).await
    }

    async fn read_text(&self, wait: Duration, tag: CaptureTag) -> Result<String, KvmError> {
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let frame = self.capture(tag).await?;
        debug!("Recognizing text with {}", self.recognizer.name());
        self.recognizer.recognize(&frame).await
    }
}

/// Image bytes ready to hand to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportImage {
    pub bytes: Vec<u8>,
    pub format: FrameFormat,
}

/// Shrink a frame until it fits in `max_bytes`.
///
/// Frames already within the limit pass through untouched. Larger ones are
/// re-encoded as JPEG at decreasing quality, then at half size.
pub fn fit_for_transport(
    frame: &CapturedFrame,
    max_bytes: usize,
) -> Result<TransportImage, KvmError> {
    if frame.bytes.len() <= max_bytes {
        return Ok(TransportImage {
            bytes: frame.bytes.clone(),
            format: frame.format,
        });
    }

    let image = image::load_from_memory(&frame.bytes)
        .map_err(|e| KvmError::Protocol(format!("undecodable frame: {}", e)))?;

    let mut quality = CAPTURE_QUALITY;
    let mut bytes = encode_jpeg(&image, quality)?;
    while bytes.len() > max_bytes && quality > MIN_REENCODE_QUALITY {
        quality = quality.saturating_sub(REENCODE_QUALITY_STEP);
        bytes = encode_jpeg(&image, quality)?;
    }

    if bytes.len() > max_bytes {
        let half = image.resize_exact(
            (image.width() / 2).max(1),
            (image.height() / 2).max(1),
            FilterType::Triangle,
        );
        bytes = encode_jpeg(&half, DOWNSCALED_QUALITY)?;
    }

    debug!(
        "Re-encoded {} byte frame to {} bytes",
        frame.bytes.len(),
        bytes.len()
    );
    Ok(TransportImage {
        bytes,
        format: FrameFormat::Jpeg,
    })
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, KvmError> {
    let rgb = image.to_rgb8();
    let mut buffer = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buffer), quality);
        encoder
            .encode(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                ColorType::Rgb8.into(),
            )
            .map_err(|e| KvmError::Protocol(format!("failed to encode frame as JPEG: {}", e)))?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Timeouts;
    use crate::testing::{EchoRecognizer, FailingRecognizer, FakeService, Reply};
    use image::{ImageFormat, Rgb, RgbImage};
    use kvm_mcp_core::protocol::ServiceCommand;

    fn reader_for(service: &FakeService, recognizer: Arc<dyn Recognizer>) -> ScreenReader {
        let client = Arc::new(ServiceClient::new(service.addr(), Timeouts::default()));
        ScreenReader::new(client, recognizer, None)
    }

    fn screen_says(text: &'static str) -> impl Fn(usize, &ServiceCommand) -> Reply {
        move |_, command: &ServiceCommand| match command {
            ServiceCommand::CaptureFrame { .. } => Reply::frame(text.as_bytes()),
            _ => Reply::ok(),
        }
    }

    fn noise_png(width: u32, height: u32) -> Vec<u8> {
        let mut seed: u32 = 0x2545_f491;
        let img = RgbImage::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let [a, b, c, _] = seed.to_le_bytes();
            Rgb([a, b, c])
        });
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        png
    }

    #[tokio::test]
    async fn test_execute_and_read_returns_screen_text() {
        let service = FakeService::start(screen_says("Mon Jan 1")).await;
        let reader = reader_for(&service, Arc::new(EchoRecognizer));

        let text = reader
            .execute_and_read("date{enter}", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(text, "Mon Jan 1");

        let commands = service.commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(
            commands[0],
            ServiceCommand::TypeText {
                text: "date".into(),
                char_delay_ms: None,
            }
        );
        assert_eq!(commands[1].action(), "key_press");
        assert_eq!(
            commands[2],
            ServiceCommand::CaptureFrame {
                quality: CAPTURE_QUALITY
            }
        );
    }

    #[tokio::test]
    async fn test_execute_and_read_waits_before_capture() {
        let service = FakeService::start(screen_says("done")).await;
        let reader = reader_for(&service, Arc::new(EchoRecognizer));

        reader
            .execute_and_read("make{enter}", Duration::from_millis(150))
            .await
            .unwrap();
        let arrivals = service.arrival_times();
        assert!(arrivals[2] - arrivals[1] >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_malformed_input_sends_nothing() {
        let service = FakeService::start(screen_says("unused")).await;
        let reader = reader_for(&service, Arc::new(EchoRecognizer));

        let err = reader
            .execute_and_read("date{entr}", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::MalformedTag(_)));
        assert!(service.commands().is_empty());
        assert_eq!(service.connections(), 0);
    }

    #[tokio::test]
    async fn test_empty_screen_is_not_an_error() {
        let service = FakeService::start(screen_says("")).await;
        let reader = reader_for(&service, Arc::new(EchoRecognizer));

        let text = reader.capture_and_recognize(Duration::ZERO).await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn test_recognition_failure_is_distinct_from_capture_failure() {
        let service = FakeService::start(screen_says("x")).await;
        let reader = reader_for(&service, Arc::new(FailingRecognizer));
        let err = reader
            .capture_and_recognize(Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::RecognitionFailed(_)));

        let service = FakeService::start(|_, _| Reply::Reject("capture device closed".into())).await;
        let reader = reader_for(&service, Arc::new(EchoRecognizer));
        let err = reader
            .capture_and_recognize(Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_capture_log_writes_tagged_file() {
        let dir = std::env::temp_dir().join(format!("kvm-mcp-log-{}", uuid::Uuid::new_v4()));
        let service = FakeService::start(screen_says("frame")).await;
        let client = Arc::new(ServiceClient::new(service.addr(), Timeouts::default()));
        let reader = ScreenReader::new(
            client,
            Arc::new(EchoRecognizer),
            Some(CaptureLog::new(&dir)),
        );

        reader.capture(CaptureTag::Capture).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("_capture.jpg"), "got {}", names[0]);
        assert_eq!(std::fs::read(dir.join(&names[0])).unwrap(), b"frame");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_capture_log_failure_does_not_fail_capture() {
        // A regular file where the directory should be
        let file = std::env::temp_dir().join(format!("kvm-mcp-log-{}", uuid::Uuid::new_v4()));
        std::fs::write(&file, b"").unwrap();

        let log = CaptureLog::new(file.join("nested"));
        let frame = CapturedFrame {
            format: FrameFormat::Png,
            width: 1,
            height: 1,
            bytes: vec![1, 2, 3],
        };
        assert!(log.save(CaptureTag::Ocr, &frame).await.is_none());

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn test_small_frame_passes_through() {
        let frame = CapturedFrame {
            format: FrameFormat::Png,
            width: 8,
            height: 8,
            bytes: noise_png(8, 8),
        };
        let image = fit_for_transport(&frame, MAX_TRANSPORT_BYTES).unwrap();
        assert_eq!(image.format, FrameFormat::Png);
        assert_eq!(image.bytes, frame.bytes);
    }

    #[test]
    fn test_oversized_frame_is_reencoded_then_halved() {
        let frame = CapturedFrame {
            format: FrameFormat::Png,
            width: 64,
            height: 48,
            bytes: noise_png(64, 48),
        };
        // No JPEG of this noise fits in 16 bytes, so every step runs
        let image = fit_for_transport(&frame, 16).unwrap();
        assert_eq!(image.format, FrameFormat::Jpeg);

        let decoded = image::load_from_memory(&image.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn test_reencoding_stops_once_it_fits() {
        let frame = CapturedFrame {
            format: FrameFormat::Png,
            width: 64,
            height: 48,
            bytes: noise_png(64, 48),
        };
        let limit = frame.bytes.len() - 1;
        let image = fit_for_transport(&frame, limit).unwrap();
        assert_eq!(image.format, FrameFormat::Jpeg);
        assert!(image.bytes.len() <= limit);
    }

    #[test]
    fn test_undecodable_oversized_frame() {
        let frame = CapturedFrame {
            format: FrameFormat::Jpeg,
            width: 1,
            height: 1,
            bytes: vec![0; 32],
        };
        let err = fit_for_transport(&frame, 8).unwrap_err();
        assert!(matches!(err, KvmError::Protocol(_)));
    }
}
