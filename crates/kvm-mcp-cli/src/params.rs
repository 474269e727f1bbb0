//! Argument types for the agent tools.
//!
//! Deserialization checks presence and types; ranges are checked by the
//! dispatcher before any service contact.

use kvm_mcp_core::protocol::{MouseButton, Point};
use rmcp::schemars::{self, JsonSchema};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TypeTextParams {
    /// Text with optional {tag} sequences, e.g. "ls -la{enter}". Tags: {enter},
    /// {tab}, {escape}, {f1}-{f12}, {0xNN} raw HID keycodes, {mod+key} combos
    /// such as {ctrl+c} or {shift+0x87}. Type braces with {lbrace} / {rbrace}.
    pub text: String,
    /// Delay between characters in milliseconds
    #[serde(default)]
    pub char_delay_ms: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendKeyParams {
    /// Key name: a-z, 0-9, enter, tab, escape, backspace, delete, up, down,
    /// left, right, home, end, pageup, pagedown, f1-f12, space, insert,
    /// printscreen, or 0xNN
    pub key: String,
    /// Modifier keys: ctrl, shift, alt, win
    #[serde(default)]
    pub modifiers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct KeyStepParams {
    /// Key name
    pub key: String,
    /// Modifier keys
    #[serde(default)]
    pub modifiers: Vec<String>,
    /// Delay after this step in milliseconds
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendKeySequenceParams {
    /// Key steps to execute in order
    pub steps: Vec<KeyStepParams>,
    /// Delay for steps without their own delay_ms (default: 100)
    #[serde(default)]
    pub default_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MouseMoveParams {
    /// X coordinate (screen pixels, or offset when relative)
    pub x: i32,
    /// Y coordinate (screen pixels, or offset when relative)
    pub y: i32,
    /// Move relative to the current position (default: false)
    #[serde(default)]
    pub relative: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ButtonParam {
    #[default]
    Left,
    Right,
    Middle,
}

impl From<ButtonParam> for MouseButton {
    fn from(button: ButtonParam) -> Self {
        match button {
            ButtonParam::Left => MouseButton::Left,
            ButtonParam::Right => MouseButton::Right,
            ButtonParam::Middle => MouseButton::Middle,
        }
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MouseClickParams {
    /// Mouse button (default: left)
    #[serde(default)]
    pub button: ButtonParam,
    /// X coordinate to click at; give both x and y or neither
    #[serde(default)]
    pub x: Option<i32>,
    /// Y coordinate to click at; give both x and y or neither
    #[serde(default)]
    pub y: Option<i32>,
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
pub struct PointParams {
    pub x: i32,
    pub y: i32,
}

impl From<PointParams> for Point {
    fn from(p: PointParams) -> Self {
        Point::new(p.x, p.y)
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MouseDragParams {
    /// Where to press the button
    pub from: PointParams,
    /// Where to release the button
    pub to: PointParams,
    /// Mouse button (default: left)
    #[serde(default)]
    pub button: ButtonParam,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MouseScrollParams {
    /// Scroll amount: positive scrolls up, negative down (-127 to 127)
    pub amount: i32,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteAndReadParams {
    /// Tagged text to send, usually ending in {enter}, e.g. "uname -a{enter}"
    pub text: String,
    /// Milliseconds to wait for output before reading the screen (default: 1000)
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SetCaptureDeviceParams {
    /// Device index (e.g. "0") or path (e.g. "/dev/video0")
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SetCaptureResolutionParams {
    /// Capture width in pixels (e.g. 1920)
    pub width: u32,
    /// Capture height in pixels (e.g. 1080)
    pub height: u32,
}
