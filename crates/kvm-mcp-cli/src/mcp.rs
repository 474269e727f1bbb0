//! MCP server exposing the KVM tools over stdio.

use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose, Engine as _};
use kvm_mcp_core::error::{ApiError, KvmError};
use rmcp::handler::server::{router::tool::ToolRouter, wrapper::Parameters};
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use tracing::{error, info};

use crate::dispatch::{Dispatcher, ToolOutput};
use crate::params::{
    ExecuteAndReadParams, MouseClickParams, MouseDragParams, MouseMoveParams, MouseScrollParams,
    SendKeyParams, SendKeySequenceParams, SetCaptureDeviceParams, SetCaptureResolutionParams,
    TypeTextParams,
};

const INSTRUCTIONS: &str = "Controls a physical PC through a serial HID keyboard/mouse and an HDMI \
capture device. Prefer get_screen_text over capture_screen for text content; images cost many \
tokens. Use execute_and_read to run a shell command and read its output in one step.";

#[derive(Clone)]
pub struct KvmMcpServer {
    tool_router: ToolRouter<Self>,
    dispatcher: Arc<Dispatcher>,
}

impl KvmMcpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            dispatcher,
        }
    }
}

/// Turn a dispatch result into a tool result. Domain errors become error
/// results for the agent, never protocol errors.
fn respond(tool: &str, start: Instant, result: Result<ToolOutput, KvmError>) -> CallToolResult {
    match result {
        Ok(ToolOutput::Text(text)) => {
            info!(tool, elapsed_ms = start.elapsed().as_millis(), "ok");
            CallToolResult::success(vec![Content::text(text)])
        }
        Ok(ToolOutput::Image { bytes, mime_type }) => {
            info!(
                tool,
                elapsed_ms = start.elapsed().as_millis(),
                bytes = bytes.len(),
                "ok"
            );
            let data = general_purpose::STANDARD.encode(bytes);
            CallToolResult::success(vec![Content::image(data, mime_type.to_string())])
        }
        Err(e) => {
            let api = ApiError::from(&e);
            error!(tool, code = %api.code, "{}", e);
            CallToolResult::error(vec![Content::text(api.to_string())])
        }
    }
}

#[tool_router]
impl KvmMcpServer {
    #[tool(
        description = "Type text on the target PC. Supports inline tags: {enter}, {tab}, {f5}, {0x87} (raw HID keycode), {ctrl+c}, {shift+0x87}. Type literal braces with {lbrace} / {rbrace}. Example: \"ls -la{enter}\""
    )]
    async fn type_text(
        &self,
        Parameters(params): Parameters<TypeTextParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "type_text",
            start,
            self.dispatcher.type_text(params).await,
        ))
    }

    #[tool(description = "Send a single key press with optional modifier keys (e.g. Ctrl+C, Alt+F4).")]
    async fn send_key(
        &self,
        Parameters(params): Parameters<SendKeyParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "send_key",
            start,
            self.dispatcher.send_key(params).await,
        ))
    }

    #[tool(
        description = "Send a sequence of key presses with per-step delays. All steps are validated before the first is sent."
    )]
    async fn send_key_sequence(
        &self,
        Parameters(params): Parameters<SendKeySequenceParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "send_key_sequence",
            start,
            self.dispatcher.send_key_sequence(params).await,
        ))
    }

    #[tool(description = "Move the mouse cursor on the target PC, absolute or relative.")]
    async fn mouse_move(
        &self,
        Parameters(params): Parameters<MouseMoveParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "mouse_move",
            start,
            self.dispatcher.mouse_move(params).await,
        ))
    }

    #[tool(description = "Click a mouse button on the target PC, optionally at a position.")]
    async fn mouse_click(
        &self,
        Parameters(params): Parameters<MouseClickParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "mouse_click",
            start,
            self.dispatcher.mouse_click(params).await,
        ))
    }

    #[tool(
        description = "Drag from one position to another: press at `from`, move to `to`, release. Useful for selecting text and moving windows."
    )]
    async fn mouse_drag(
        &self,
        Parameters(params): Parameters<MouseDragParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "mouse_drag",
            start,
            self.dispatcher.mouse_drag(params).await,
        ))
    }

    #[tool(description = "Scroll the mouse wheel on the target PC. Positive scrolls up.")]
    async fn mouse_scroll(
        &self,
        Parameters(params): Parameters<MouseScrollParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "mouse_scroll",
            start,
            self.dispatcher.mouse_scroll(params).await,
        ))
    }

    #[tool(
        description = "Capture the target PC screen and return it as an image. Images consume many tokens; prefer get_screen_text for text."
    )]
    async fn capture_screen(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "capture_screen",
            start,
            self.dispatcher.capture_screen().await,
        ))
    }

    #[tool(description = "Capture the target PC screen and extract its text with OCR.")]
    async fn get_screen_text(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "get_screen_text",
            start,
            self.dispatcher.get_screen_text().await,
        ))
    }

    #[tool(
        description = "Send tagged text (e.g. \"uname -a{enter}\"), wait for output, then capture the screen and return its text."
    )]
    async fn execute_and_read(
        &self,
        Parameters(params): Parameters<ExecuteAndReadParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "execute_and_read",
            start,
            self.dispatcher.execute_and_read(params).await,
        ))
    }

    #[tool(description = "Show status and device information for the serial adapter and capture device.")]
    async fn get_device_info(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "get_device_info",
            start,
            self.dispatcher.get_device_info().await,
        ))
    }

    #[tool(description = "List available video capture devices with their index and name.")]
    async fn list_capture_devices(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "list_capture_devices",
            start,
            self.dispatcher.list_capture_devices().await,
        ))
    }

    #[tool(
        description = "Switch the active capture device by index or path. Use list_capture_devices first."
    )]
    async fn set_capture_device(
        &self,
        Parameters(params): Parameters<SetCaptureDeviceParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "set_capture_device",
            start,
            self.dispatcher.set_capture_device(params).await,
        ))
    }

    #[tool(
        description = "Change the capture resolution, e.g. 1920x1080 or 1280x720. The device may pick the nearest supported mode."
    )]
    async fn set_capture_resolution(
        &self,
        Parameters(params): Parameters<SetCaptureResolutionParams>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        Ok(respond(
            "set_capture_resolution",
            start,
            self.dispatcher.set_capture_resolution(params).await,
        ))
    }
}

#[tool_handler]
impl ServerHandler for KvmMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(INSTRUCTIONS.to_string()),
            ..Default::default()
        }
    }
}
