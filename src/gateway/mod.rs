//! Subprocess authorization gateway.
//!
//! A loopback HTTP server the agent's `PreToolUse` hook calls before every
//! tool invocation. The gateway correlates hook calls with the current
//! task, auto-approves repeated tool fingerprints within one task, and
//! forwards everything else to the originating channel through the
//! notification router.

pub mod server;
pub mod state;

pub use server::serve;
pub use state::GatewayState;
