//! Text recognition for captured frames.
//!
//! The engine is the `tesseract` executable, located once at startup. Frames
//! are preprocessed for terminal text (high contrast, dark-on-light,
//! binarized, upscaled) before being piped to it.

use std::ffi::OsStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat};
use kvm_mcp_core::error::KvmError;
use kvm_mcp_core::protocol::CapturedFrame;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Turns a frame into text.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, frame: &CapturedFrame) -> Result<String, KvmError>;

    fn name(&self) -> &str;
}

const ENGINE_ARGS: [&str; 6] = ["stdin", "stdout", "--oem", "3", "--psm", "6"];

#[cfg(windows)]
const ENGINE_FILE: &str = "tesseract.exe";
#[cfg(not(windows))]
const ENGINE_FILE: &str = "tesseract";

const WINDOWS_INSTALL_PATHS: [&str; 2] = [
    r"C:\Program Files\Tesseract-OCR\tesseract.exe",
    r"C:\Program Files (x86)\Tesseract-OCR\tesseract.exe",
];

const CONTRAST_FACTOR: f32 = 2.0;
const INVERT_BELOW_MEAN: f64 = 128.0;
const BINARIZE_THRESHOLD: u8 = 180;
const UPSCALE: u32 = 2;

/// Locate the recognition engine.
///
/// Never fails: when no engine is found, the returned recognizer reports
/// `RecognitionUnavailable` on use so that capture-only tools keep working.
pub fn probe(override_cmd: Option<&Path>) -> Arc<dyn Recognizer> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    match locate_engine(override_cmd, &path_var) {
        Ok(cmd) => {
            info!("Text recognition engine: {}", cmd.display());
            Arc::new(TesseractRecognizer::new(cmd))
        }
        Err(reason) => {
            warn!("Text recognition disabled: {}", reason);
            Arc::new(UnavailableRecognizer::new(reason))
        }
    }
}

/// Resolve the engine executable: override, then `PATH`, then Windows defaults.
fn locate_engine(override_cmd: Option<&Path>, path_var: &OsStr) -> Result<PathBuf, String> {
    if let Some(cmd) = override_cmd {
        if cmd.is_file() {
            return Ok(cmd.to_path_buf());
        }
        // A bare name is resolved through PATH like any other command
        if cmd.components().count() == 1 {
            if let Some(found) = search_path(cmd.as_os_str(), path_var) {
                return Ok(found);
            }
        }
        return Err(format!("{} not found", cmd.display()));
    }

    if let Some(found) = search_path(OsStr::new(ENGINE_FILE), path_var) {
        return Ok(found);
    }

    WINDOWS_INSTALL_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| "tesseract not found on PATH".to_string())
}

fn search_path(file: &OsStr, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(file))
        .find(|candidate| candidate.is_file())
}

/// Recognizer backed by the `tesseract` executable.
pub struct TesseractRecognizer {
    cmd: PathBuf,
}

impl TesseractRecognizer {
    pub fn new(cmd: PathBuf) -> Self {
        Self { cmd }
    }
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    async fn recognize(&self, frame: &CapturedFrame) -> Result<String, KvmError> {
        let bytes = frame.bytes.clone();
        let png = tokio::task::spawn_blocking(move || preprocess(&bytes))
            .await
            .map_err(|e| KvmError::RecognitionFailed(format!("preprocessing task failed: {}", e)))??;

        debug!("Running {} on {} byte image", self.cmd.display(), png.len());
        let mut child = Command::new(&self.cmd)
            .args(ENGINE_ARGS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                KvmError::RecognitionUnavailable(format!(
                    "failed to run {}: {}",
                    self.cmd.display(),
                    e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&png)
                .await
                .map_err(|e| KvmError::RecognitionFailed(format!("failed to feed image: {}", e)))?;
            // Dropping stdin closes the pipe so the engine sees EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| KvmError::RecognitionFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(KvmError::RecognitionFailed(format!(
                "{} exited with {}: {}",
                self.cmd.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(postprocess(&String::from_utf8_lossy(&output.stdout)))
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}

/// Stands in for a missing engine.
pub struct UnavailableRecognizer {
    reason: String,
}

impl UnavailableRecognizer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Recognizer for UnavailableRecognizer {
    async fn recognize(&self, _frame: &CapturedFrame) -> Result<String, KvmError> {
        Err(KvmError::RecognitionUnavailable(self.reason.clone()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

/// Prepare a frame for recognition. Returns PNG bytes.
fn preprocess(bytes: &[u8]) -> Result<Vec<u8>, KvmError> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| KvmError::RecognitionFailed(format!("failed to decode frame: {}", e)))?;
    let prepared = prepare_gray(decoded.to_luma8());

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(prepared)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| KvmError::RecognitionFailed(format!("failed to encode image: {}", e)))?;
    Ok(png)
}

fn prepare_gray(mut img: GrayImage) -> GrayImage {
    enhance_contrast(&mut img, CONTRAST_FACTOR);

    // 3x3 sharpen: center 32, neighbors -2, normalized by 16
    let kernel: [f32; 9] = [
        -2.0 / 16.0,
        -2.0 / 16.0,
        -2.0 / 16.0,
        -2.0 / 16.0,
        32.0 / 16.0,
        -2.0 / 16.0,
        -2.0 / 16.0,
        -2.0 / 16.0,
        -2.0 / 16.0,
    ];
    let mut img = imageops::filter3x3(&img, &kernel);

    // Light-on-dark terminals become dark-on-light
    if mean_brightness(&img) < INVERT_BELOW_MEAN {
        imageops::invert(&mut img);
    }

    for pixel in img.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > BINARIZE_THRESHOLD { 255 } else { 0 };
    }

    let (width, height) = img.dimensions();
    imageops::resize(&img, width * UPSCALE, height * UPSCALE, FilterType::Lanczos3)
}

fn mean_brightness(img: &GrayImage) -> f64 {
    let count = img.as_raw().len();
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = img.as_raw().iter().map(|&v| u64::from(v)).sum();
    sum as f64 / count as f64
}

/// Scale each pixel's distance from the mean by `factor`.
fn enhance_contrast(img: &mut GrayImage, factor: f32) {
    let mean = mean_brightness(img) as f32;
    for pixel in img.pixels_mut() {
        let value = mean + (f32::from(pixel.0[0]) - mean) * factor;
        pixel.0[0] = value.round().clamp(0.0, 255.0) as u8;
    }
}

fn blank_runs() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{4,}").ok()).as_ref()
}

/// Misreads that are safe to correct in terminal output.
const CORRECTIONS: [(&str, &str); 3] = [(" |s ", " ls "), (" |s\n", " ls\n"), ("\n|s ", "\nls ")];

/// Clean up engine output.
pub fn postprocess(raw: &str) -> String {
    let stripped: Vec<&str> = raw.split('\n').map(str::trim_end).collect();
    let joined = stripped.join("\n");
    let mut text = match blank_runs() {
        Some(re) => re.replace_all(&joined, "\n\n\n").into_owned(),
        None => joined,
    };
    for (wrong, right) in CORRECTIONS {
        text = text.replace(wrong, right);
    }
    text.trim().to_string()
}
