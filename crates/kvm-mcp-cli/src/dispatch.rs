//! Tool dispatch.
//!
//! One method per agent tool. Each validates its arguments, performs exactly
//! one logical operation, and shapes the result. Used by both the MCP server
//! and the one-shot CLI commands.

use std::sync::Arc;
use std::time::Duration;

use kvm_mcp_core::error::KvmError;
use kvm_mcp_core::input::{parse_tagged_text, resolve_key, KeySequenceStep};
use kvm_mcp_core::protocol::{MouseButton, Point};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::capture::{fit_for_transport, CaptureTag, ScreenReader, MAX_TRANSPORT_BYTES};
use crate::params::{
    ExecuteAndReadParams, MouseClickParams, MouseDragParams, MouseMoveParams, MouseScrollParams,
    SendKeyParams, SendKeySequenceParams, SetCaptureDeviceParams, SetCaptureResolutionParams,
    TypeTextParams,
};
use crate::service::ServiceClient;

pub const DEFAULT_STEP_DELAY_MS: u64 = 100;
pub const MAX_STEP_DELAY_MS: u64 = 10_000;
pub const DEFAULT_EXEC_WAIT_MS: u64 = 1_000;
pub const MAX_EXEC_WAIT_MS: u64 = 60_000;
const SCROLL_RANGE: std::ops::RangeInclusive<i32> = -127..=127;

/// Result of a successful tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Text(String),
    Image {
        bytes: Vec<u8>,
        mime_type: &'static str,
    },
}

fn text(s: impl Into<String>) -> ToolOutput {
    ToolOutput::Text(s.into())
}

fn invalid(msg: impl Into<String>) -> KvmError {
    KvmError::InvalidArgument(msg.into())
}

pub struct Dispatcher {
    client: Arc<ServiceClient>,
    screen: ScreenReader,
}

impl Dispatcher {
    pub fn new(client: Arc<ServiceClient>, screen: ScreenReader) -> Self {
        Self { client, screen }
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    pub async fn type_text(&self, params: TypeTextParams) -> Result<ToolOutput, KvmError> {
        if params.text.is_empty() {
            return Err(invalid("text must not be empty"));
        }
        let directives = parse_tagged_text(&params.text)?;
        debug!("type_text: {} directives", directives.len());
        self.client
            .send_input(&directives, params.char_delay_ms)
            .await?;
        Ok(text(format!(
            "Typed {} characters",
            params.text.chars().count()
        )))
    }

    pub async fn send_key(&self, params: SendKeyParams) -> Result<ToolOutput, KvmError> {
        let directive = resolve_key(&params.key, &params.modifiers)?;
        self.client.send_key(&directive).await?;
        Ok(text(format!("Sent: {}", directive)))
    }

    pub async fn send_key_sequence(
        &self,
        params: SendKeySequenceParams,
    ) -> Result<ToolOutput, KvmError> {
        if params.steps.is_empty() {
            return Err(invalid("steps must not be empty"));
        }
        let default_delay = params.default_delay_ms.unwrap_or(DEFAULT_STEP_DELAY_MS);

        // Validate every step before sending the first
        let steps = params
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let delay_ms = step.delay_ms.unwrap_or(default_delay);
                if delay_ms > MAX_STEP_DELAY_MS {
                    return Err(invalid(format!(
                        "step {}: delay_ms {} exceeds {}",
                        i, delay_ms, MAX_STEP_DELAY_MS
                    )));
                }
                Ok(KeySequenceStep::new(&step.key, &step.modifiers, delay_ms)?)
            })
            .collect::<Result<Vec<_>, KvmError>>()?;

        let ack = self.client.send_key_sequence(&steps).await?;
        Ok(text(format!("Sent {} key steps", ack.requests)))
    }

    pub async fn mouse_move(&self, params: MouseMoveParams) -> Result<ToolOutput, KvmError> {
        self.client
            .move_mouse(params.x, params.y, params.relative)
            .await?;
        let how = if params.relative { "by" } else { "to" };
        Ok(text(format!(
            "Moved mouse {} {}",
            how,
            Point::new(params.x, params.y)
        )))
    }

    pub async fn mouse_click(&self, params: MouseClickParams) -> Result<ToolOutput, KvmError> {
        let at = match (params.x, params.y) {
            (Some(x), Some(y)) => Some(Point::new(x, y)),
            (None, None) => None,
            _ => return Err(invalid("x and y must be given together")),
        };
        let button = MouseButton::from(params.button);
        self.client.click(button, at).await?;
        Ok(match at {
            Some(point) => text(format!("Clicked {} at {}", button.as_str(), point)),
            None => text(format!("Clicked {}", button.as_str())),
        })
    }

    pub async fn mouse_drag(&self, params: MouseDragParams) -> Result<ToolOutput, KvmError> {
        let from = Point::from(params.from);
        let to = Point::from(params.to);
        let button = MouseButton::from(params.button);
        self.client.drag(from, to, button).await?;
        Ok(text(format!(
            "Dragged {} from {} to {}",
            button.as_str(),
            from,
            to
        )))
    }

    pub async fn mouse_scroll(&self, params: MouseScrollParams) -> Result<ToolOutput, KvmError> {
        if !SCROLL_RANGE.contains(&params.amount) {
            return Err(invalid(format!(
                "amount {} is outside -127..=127",
                params.amount
            )));
        }
        let amount =
            i8::try_from(params.amount).map_err(|_| invalid("amount does not fit in a byte"))?;
        self.client.scroll(amount).await?;
        let direction = if amount > 0 { "up" } else { "down" };
        Ok(text(format!(
            "Scrolled {} by {}",
            direction,
            amount.unsigned_abs()
        )))
    }

    pub async fn capture_screen(&self) -> Result<ToolOutput, KvmError> {
        let frame = self.screen.capture(CaptureTag::Capture).await?;
        let image = tokio::task::spawn_blocking(move || {
            fit_for_transport(&frame, MAX_TRANSPORT_BYTES)
        })
        .await
        .map_err(|e| KvmError::Protocol(format!("image encoding task failed: {}", e)))??;
        Ok(ToolOutput::Image {
            mime_type: image.format.mime_type(),
            bytes: image.bytes,
        })
    }

    pub async fn get_screen_text(&self) -> Result<ToolOutput, KvmError> {
        let screen = self.screen.capture_and_recognize(Duration::ZERO).await?;
        Ok(text(screen))
    }

    pub async fn execute_and_read(
        &self,
        params: ExecuteAndReadParams,
    ) -> Result<ToolOutput, KvmError> {
        if params.text.is_empty() {
            return Err(invalid("text must not be empty"));
        }
        let wait_ms = params.wait_ms.unwrap_or(DEFAULT_EXEC_WAIT_MS);
        if wait_ms > MAX_EXEC_WAIT_MS {
            return Err(invalid(format!(
                "wait_ms {} exceeds {}",
                wait_ms, MAX_EXEC_WAIT_MS
            )));
        }
        let screen = self
            .screen
            .execute_and_read(&params.text, Duration::from_millis(wait_ms))
            .await?;
        Ok(text(screen))
    }

    pub async fn get_device_info(&self) -> Result<ToolOutput, KvmError> {
        let mut info = self.client.device_info().await?;
        if let Value::Object(map) = &mut info {
            map.insert(
                "bridge".to_string(),
                json!({
                    "service": self.client.addr(),
                    "connection": self.client.state().as_str(),
                }),
            );
        }
        Ok(text(pretty(&info)?))
    }

    pub async fn list_capture_devices(&self) -> Result<ToolOutput, KvmError> {
        let result = self.client.list_capture_devices().await?;
        let devices = match result.get("devices") {
            Some(devices) => devices.clone(),
            None => result,
        };
        let empty = match &devices {
            Value::Array(list) => list.is_empty(),
            Value::Null => true,
            _ => false,
        };
        if empty {
            return Ok(text("No capture devices found."));
        }
        Ok(text(pretty(&devices)?))
    }

    pub async fn set_capture_device(
        &self,
        params: SetCaptureDeviceParams,
    ) -> Result<ToolOutput, KvmError> {
        let id = params.id.trim();
        if id.is_empty() {
            return Err(invalid("id must not be empty"));
        }
        let result = self.client.set_capture_device(id).await?;
        info!("Capture device switched to {}", id);

        let mut message = format!("Switched to device {}", id);
        if let Some((width, height)) = reported_size(&result) {
            message.push_str(&format!(": {}x{}", width, height));
            if let Some(backend) = result
                .get("info")
                .and_then(|i| i.get("backend"))
                .and_then(Value::as_str)
            {
                message.push_str(&format!(" ({})", backend));
            }
        }
        Ok(text(message))
    }

    pub async fn set_capture_resolution(
        &self,
        params: SetCaptureResolutionParams,
    ) -> Result<ToolOutput, KvmError> {
        if params.width == 0 || params.height == 0 {
            return Err(invalid("width and height must be positive"));
        }
        let result = self
            .client
            .set_capture_resolution(params.width, params.height)
            .await?;
        let requested = format!("{}x{}", params.width, params.height);
        Ok(match reported_size(&result) {
            Some((width, height)) => text(format!(
                "Resolution set: {}x{} (requested {})",
                width, height, requested
            )),
            None => text(format!("Resolution set: {}", requested)),
        })
    }
}

/// Width and height the service reports under `info`.
fn reported_size(result: &Value) -> Option<(u64, u64)> {
    let info = result.get("info")?;
    Some((
        info.get("width")?.as_u64()?,
        info.get("height")?.as_u64()?,
    ))
}

fn pretty(value: &Value) -> Result<String, KvmError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| KvmError::Protocol(format!("failed to render payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ButtonParam, KeyStepParams, PointParams};
    use crate::service::Timeouts;
    use crate::testing::{EchoRecognizer, FakeService, Reply};
    use kvm_mcp_core::input::Modifier;
    use kvm_mcp_core::protocol::ServiceCommand;

    fn dispatcher_for(service: &FakeService) -> Dispatcher {
        let client = Arc::new(ServiceClient::new(service.addr(), Timeouts::default()));
        let screen = ScreenReader::new(client.clone(), Arc::new(EchoRecognizer), None);
        Dispatcher::new(client, screen)
    }

    fn as_text(output: ToolOutput) -> String {
        match output {
            ToolOutput::Text(s) => s,
            other => panic!("expected text, got {:?}", other),
        }
    }

    async fn ok_service() -> FakeService {
        FakeService::start(|_, _| Reply::ok()).await
    }

    #[tokio::test]
    async fn test_type_text() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let out = dispatcher
            .type_text(TypeTextParams {
                text: "ls -la{enter}".into(),
                char_delay_ms: Some(30),
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Typed 13 characters");
        assert_eq!(
            service.commands(),
            vec![
                ServiceCommand::TypeText {
                    text: "ls -la".into(),
                    char_delay_ms: Some(30),
                },
                ServiceCommand::KeyPress {
                    key: "enter".into(),
                    modifiers: Default::default(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_text_never_connects() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let err = dispatcher
            .type_text(TypeTextParams {
                text: "a{unknownkey}b".into(),
                char_delay_ms: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::MalformedTag(_)));
        assert_eq!(service.connections(), 0);
    }

    #[tokio::test]
    async fn test_send_key() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let out = dispatcher
            .send_key(SendKeyParams {
                key: "c".into(),
                modifiers: vec!["ctrl".into()],
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Sent: ctrl+c");
        assert_eq!(
            service.commands()[0],
            ServiceCommand::KeyPress {
                key: "c".into(),
                modifiers: [Modifier::Ctrl].into_iter().collect(),
            }
        );
    }

    #[tokio::test]
    async fn test_send_key_unknown_modifier() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let err = dispatcher
            .send_key(SendKeyParams {
                key: "c".into(),
                modifiers: vec!["hyper".into()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::MalformedTag(_)));
        assert_eq!(service.connections(), 0);
    }

    #[tokio::test]
    async fn test_key_sequence_validates_all_steps_first() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let err = dispatcher
            .send_key_sequence(SendKeySequenceParams {
                steps: vec![
                    KeyStepParams {
                        key: "a".into(),
                        modifiers: vec![],
                        delay_ms: None,
                    },
                    KeyStepParams {
                        key: "nosuchkey".into(),
                        modifiers: vec![],
                        delay_ms: None,
                    },
                ],
                default_delay_ms: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::MalformedTag(_)));
        assert!(service.commands().is_empty());
    }

    #[tokio::test]
    async fn test_key_sequence_uses_default_delay() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let step = |key: &str, delay_ms| KeyStepParams {
            key: key.into(),
            modifiers: vec![],
            delay_ms,
        };
        let out = dispatcher
            .send_key_sequence(SendKeySequenceParams {
                steps: vec![step("a", None), step("b", Some(0)), step("c", None)],
                default_delay_ms: Some(120),
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Sent 3 key steps");

        let arrivals = service.arrival_times();
        assert!(arrivals[1] - arrivals[0] >= Duration::from_millis(120));
        assert!(arrivals[2] - arrivals[1] < Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_key_sequence_rejects_empty_and_long_delays() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let err = dispatcher
            .send_key_sequence(SendKeySequenceParams {
                steps: vec![],
                default_delay_ms: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::InvalidArgument(_)));

        let err = dispatcher
            .send_key_sequence(SendKeySequenceParams {
                steps: vec![KeyStepParams {
                    key: "a".into(),
                    modifiers: vec![],
                    delay_ms: Some(MAX_STEP_DELAY_MS + 1),
                }],
                default_delay_ms: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::InvalidArgument(_)));
        assert_eq!(service.connections(), 0);
    }

    #[tokio::test]
    async fn test_mouse_texts() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let out = dispatcher
            .mouse_move(MouseMoveParams {
                x: 100,
                y: 200,
                relative: false,
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Moved mouse to (100, 200)");

        let out = dispatcher
            .mouse_move(MouseMoveParams {
                x: -5,
                y: 10,
                relative: true,
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Moved mouse by (-5, 10)");

        let out = dispatcher
            .mouse_click(MouseClickParams {
                button: ButtonParam::Left,
                x: Some(3),
                y: Some(4),
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Clicked left at (3, 4)");

        let out = dispatcher
            .mouse_click(MouseClickParams {
                button: ButtonParam::Right,
                x: None,
                y: None,
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Clicked right");

        let out = dispatcher
            .mouse_scroll(MouseScrollParams { amount: -3 })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Scrolled down by 3");
    }

    #[tokio::test]
    async fn test_drag_is_one_request() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        let out = dispatcher
            .mouse_drag(MouseDragParams {
                from: PointParams { x: 10, y: 20 },
                to: PointParams { x: 300, y: 400 },
                button: ButtonParam::Left,
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Dragged left from (10, 20) to (300, 400)");
        assert_eq!(
            service.commands(),
            vec![ServiceCommand::MouseDrag {
                from: Point::new(10, 20),
                to: Point::new(300, 400),
                button: MouseButton::Left,
            }]
        );
    }

    #[tokio::test]
    async fn test_range_checks_never_connect() {
        let service = ok_service().await;
        let dispatcher = dispatcher_for(&service);

        for amount in [128, -128, 1000] {
            let err = dispatcher
                .mouse_scroll(MouseScrollParams { amount })
                .await
                .unwrap_err();
            assert!(matches!(err, KvmError::InvalidArgument(_)));
        }

        let err = dispatcher
            .mouse_click(MouseClickParams {
                button: ButtonParam::Left,
                x: Some(1),
                y: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::InvalidArgument(_)));

        let err = dispatcher
            .set_capture_resolution(SetCaptureResolutionParams {
                width: 0,
                height: 720,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::InvalidArgument(_)));

        let err = dispatcher
            .execute_and_read(ExecuteAndReadParams {
                text: "ls{enter}".into(),
                wait_ms: Some(MAX_EXEC_WAIT_MS + 1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::InvalidArgument(_)));

        let err = dispatcher
            .set_capture_device(SetCaptureDeviceParams { id: "  ".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, KvmError::InvalidArgument(_)));

        assert_eq!(service.connections(), 0);
    }

    #[tokio::test]
    async fn test_capture_screen_returns_image() {
        let service = FakeService::start(|_, command| match command {
            ServiceCommand::CaptureFrame { .. } => Reply::frame(b"\xff\xd8small"),
            _ => Reply::ok(),
        })
        .await;
        let dispatcher = dispatcher_for(&service);

        let out = dispatcher.capture_screen().await.unwrap();
        assert_eq!(
            out,
            ToolOutput::Image {
                bytes: b"\xff\xd8small".to_vec(),
                mime_type: "image/jpeg",
            }
        );
    }

    #[tokio::test]
    async fn test_execute_and_read_default_wait() {
        let service = FakeService::start(|_, command| match command {
            ServiceCommand::CaptureFrame { .. } => Reply::frame(b"Mon Jan 1"),
            _ => Reply::ok(),
        })
        .await;
        let dispatcher = dispatcher_for(&service);

        let start = std::time::Instant::now();
        let out = dispatcher
            .execute_and_read(ExecuteAndReadParams {
                text: "date{enter}".into(),
                wait_ms: None,
            })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Mon Jan 1");
        assert!(start.elapsed() >= Duration::from_millis(DEFAULT_EXEC_WAIT_MS));
    }

    #[tokio::test]
    async fn test_device_info_pretty_json() {
        let service = FakeService::start(|_, _| {
            Reply::payload(json!({"serial": {"connected": true}, "capture": {"width": 1920}}))
        })
        .await;
        let dispatcher = dispatcher_for(&service);

        let out = as_text(dispatcher.get_device_info().await.unwrap());
        assert!(out.contains('\n'));
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["capture"]["width"], 1920);
        assert_eq!(parsed["bridge"]["connection"], "connected");
        assert_eq!(parsed["bridge"]["service"], service.addr());
    }

    #[tokio::test]
    async fn test_list_capture_devices() {
        let service = FakeService::start(|index, _| {
            if index == 0 {
                Reply::payload(json!({"devices": []}))
            } else {
                Reply::payload(json!({"devices": [{"index": 0, "name": "USB Video"}]}))
            }
        })
        .await;
        let dispatcher = dispatcher_for(&service);

        let out = as_text(dispatcher.list_capture_devices().await.unwrap());
        assert_eq!(out, "No capture devices found.");

        let out = as_text(dispatcher.list_capture_devices().await.unwrap());
        assert!(out.contains("USB Video"));
    }

    #[tokio::test]
    async fn test_capture_settings_texts() {
        let service = FakeService::start(|_, command| match command {
            ServiceCommand::SetCaptureDevice { .. } => Reply::payload(
                json!({"info": {"width": 1280, "height": 720, "backend": "v4l2"}}),
            ),
            ServiceCommand::SetCaptureResolution { .. } => {
                Reply::payload(json!({"info": {"width": 1280, "height": 720}}))
            }
            _ => Reply::ok(),
        })
        .await;
        let dispatcher = dispatcher_for(&service);

        let out = dispatcher
            .set_capture_device(SetCaptureDeviceParams { id: "1".into() })
            .await
            .unwrap();
        assert_eq!(as_text(out), "Switched to device 1: 1280x720 (v4l2)");
        assert_eq!(
            service.commands()[0],
            ServiceCommand::SetCaptureDevice { device: "1".into() }
        );

        let out = dispatcher
            .set_capture_resolution(SetCaptureResolutionParams {
                width: 1920,
                height: 1080,
            })
            .await
            .unwrap();
        assert_eq!(
            as_text(out),
            "Resolution set: 1280x720 (requested 1920x1080)"
        );
    }
}
