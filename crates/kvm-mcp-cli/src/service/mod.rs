//! Connection to the KVM hardware-control service.

pub mod client;

// Public API - used by main.rs and the tool dispatcher
pub use client::{ServiceClient, Timeouts};
