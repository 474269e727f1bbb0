//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Drive a physical PC through a serial HID KVM.
///
/// `serve` runs the MCP server on stdio for AI agents. The other commands
/// run a single tool against the KVM service and exit, which is handy for
/// checking the setup by hand.
#[derive(Debug, Parser)]
#[command(name = "kvm-mcp", version)]
pub struct Cli {
    /// KVM service host [env: SHKVM_API_HOST] [default: 127.0.0.1]
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// KVM service port [env: SHKVM_API_PORT] [default: 9329]
    #[arg(long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the MCP server on stdin/stdout
    #[command(after_help = "\
Example MCP client configuration:
  {
    \"mcpServers\": {
      \"kvm\": { \"command\": \"kvm-mcp\", \"args\": [\"serve\"] }
    }
  }")]
    Serve,

    /// Type tagged text on the target
    #[command(
        name = "type",
        after_help = "\
Examples:
  kvm-mcp type 'ls -la{enter}'          # Type a command and press Enter
  kvm-mcp type '{ctrl+c}'               # Interrupt
  kvm-mcp type '{lbrace}x{rbrace}'      # Literal braces
  kvm-mcp type --char-delay 50 'slow'   # 50ms between characters"
    )]
    Type(TypeArgs),

    /// Press a key, key combination, or key sequence
    #[command(after_long_help = "\
Keys:
  Named:       enter, tab, escape, backspace, delete, insert, space
  Navigation:  up, down, left, right, home, end, pageup, pagedown
  Function:    f1 .. f12
  Raw HID:     0x00 .. 0xff
  Modifiers:   ctrl+<key>, alt+<key>, shift+<key>, win+<key>

Key Sequences:
  Space-separated keys are sent in order with --delay between them.

Examples:
  kvm-mcp key enter
  kvm-mcp key ctrl+alt+delete
  kvm-mcp key \"win+r\"
  kvm-mcp key \"escape : w q enter\" --delay 50")]
    Key(KeyArgs),

    /// Read the screen text with OCR
    Read,

    /// Send tagged text, wait, then read the screen text
    #[command(after_help = "\
Examples:
  kvm-mcp exec 'uname -a{enter}'
  kvm-mcp exec --wait 3000 'make{enter}'")]
    Exec(ExecArgs),

    /// Save a screen capture to a file
    Screenshot(ScreenshotArgs),

    /// Show serial adapter and capture device information
    Info,

    /// List video capture devices
    Devices,
}

#[derive(Debug, clap::Args)]
pub struct TypeArgs {
    /// Text with optional {tag} sequences
    pub text: String,

    /// Delay between characters in milliseconds
    #[arg(long, value_name = "MS")]
    pub char_delay: Option<u32>,
}

#[derive(Debug, clap::Args)]
pub struct KeyArgs {
    /// Key or combo (ctrl+c), or several separated by spaces
    pub keys: String,

    /// Delay between keys of a sequence in milliseconds
    #[arg(short, long, default_value_t = 100, value_name = "MS")]
    pub delay: u64,
}

#[derive(Debug, clap::Args)]
pub struct ExecArgs {
    /// Tagged text to send, usually ending in {enter}
    pub text: String,

    /// Milliseconds to wait before reading the screen
    #[arg(short, long, default_value_t = 1000, value_name = "MS")]
    pub wait: u64,
}

#[derive(Debug, clap::Args)]
pub struct ScreenshotArgs {
    /// Output file; the extension should match the frame format (.jpg or .png)
    pub path: PathBuf,
}
