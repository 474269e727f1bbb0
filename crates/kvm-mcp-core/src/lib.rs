//! Core types and logic for kvm-mcp.
//!
//! This crate holds the parts of the KVM bridge that do not touch the
//! network or the recognition engine. It is used by the MCP server and the
//! one-shot CLI commands.
//!
//! # Modules
//!
//! - [`input`]: Tagged-text parsing (`ls{enter}`, `{ctrl+c}`) and key vocabulary
//! - [`protocol`]: JSON-line request/response protocol of the KVM service
//! - [`error`]: Error taxonomy with actionable suggestions for AI consumers
//!
//! # Tag syntax
//!
//! | Input | Directives |
//! |-------|------------|
//! | `ls -la{enter}` | type `ls -la`, press Enter |
//! | `{ctrl+c}` | press C with Ctrl held |
//! | `{shift+0x87}` | press HID keycode 0x87 with Shift held |
//! | `{lbrace}x{rbrace}` | type `{x}` |
//!
//! Unknown keys, empty tags and stray braces are errors, never literals.

pub mod error;
pub mod input;
pub mod protocol;
