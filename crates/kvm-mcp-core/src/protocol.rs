//! Wire protocol for the KVM hardware-control service.
//!
//! Requests and responses are single-line JSON objects separated by `\n`.
//! Every request carries an `id` that the matching response echoes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::input::{InputDirective, ModifierSet};

/// A request from this client to the KVM service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: String,
    pub command: ServiceCommand,
}

/// Operations the KVM service can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServiceCommand {
    /// Type text using the target keyboard layout.
    TypeText {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        char_delay_ms: Option<u32>,
    },
    /// Press and release a single key with modifiers held.
    KeyPress { key: String, modifiers: ModifierSet },
    /// Move the pointer, absolute or relative.
    MouseMove { x: i32, y: i32, relative: bool },
    /// Click a button, optionally moving to a position first.
    MouseClick {
        button: MouseButton,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
    },
    /// Press at `from`, move to `to`, release.
    MouseDrag {
        from: Point,
        to: Point,
        button: MouseButton,
    },
    /// Scroll the wheel; positive is up.
    MouseScroll { amount: i8 },
    /// Fetch the latest captured frame.
    CaptureFrame { quality: u8 },
    GetDeviceInfo,
    ListCaptureDevices,
    SetCaptureDevice { device: String },
    SetCaptureResolution { width: u32, height: u32 },
}

impl ServiceCommand {
    /// Build the request that performs one input directive.
    pub fn from_directive(directive: &InputDirective, char_delay_ms: Option<u32>) -> Self {
        match directive {
            InputDirective::Literal { text } => ServiceCommand::TypeText {
                text: text.clone(),
                char_delay_ms,
            },
            InputDirective::KeyPress { key, modifiers } => ServiceCommand::KeyPress {
                key: key.clone(),
                modifiers: modifiers.clone(),
            },
        }
    }

    /// The wire name of this operation, for logs and error messages.
    pub fn action(&self) -> &'static str {
        match self {
            ServiceCommand::TypeText { .. } => "type_text",
            ServiceCommand::KeyPress { .. } => "key_press",
            ServiceCommand::MouseMove { .. } => "mouse_move",
            ServiceCommand::MouseClick { .. } => "mouse_click",
            ServiceCommand::MouseDrag { .. } => "mouse_drag",
            ServiceCommand::MouseScroll { .. } => "mouse_scroll",
            ServiceCommand::CaptureFrame { .. } => "capture_frame",
            ServiceCommand::GetDeviceInfo => "get_device_info",
            ServiceCommand::ListCaptureDevices => "list_capture_devices",
            ServiceCommand::SetCaptureDevice { .. } => "set_capture_device",
            ServiceCommand::SetCaptureResolution { .. } => "set_capture_resolution",
        }
    }
}

/// Mouse button.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

/// Screen coordinate in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A response from the KVM service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceResponse {
    pub fn success(id: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(message.into()),
        }
    }
}

/// Image encoding of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    Jpeg,
    Png,
}

impl FrameFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
            FrameFormat::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "jpg",
            FrameFormat::Png => "png",
        }
    }
}

/// Frame payload as sent on the wire (image bytes base64-encoded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePayload {
    pub format: FrameFormat,
    pub data: String,
    pub width: u32,
    pub height: u32,
}

/// A decoded frame. Transient: handed to the recognizer or the caller and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub format: FrameFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}
