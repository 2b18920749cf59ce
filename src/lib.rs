//! wbconsole - browser workbench console.
//!
//! Each WebSocket connection to `/console/ws` gets its own process on a fresh
//! pseudo-terminal, bridged byte-for-byte. A bounded [`session::SessionRegistry`]
//! tracks live sessions and a reaper reclaims dead or idle ones.

pub mod api;
pub mod bridge;
pub mod config;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod tui;
