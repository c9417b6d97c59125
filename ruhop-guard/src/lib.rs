//! Ruhop Guard
//!
//! Leak-safe orchestration of a tunnel adapter and its kill-switch, shared by
//! the CLI and any future front end.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐                                        │
//! │  │   ruhop-cli     │                                        │
//! │  └────────┬────────┘                                        │
//! │           ▼                                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   ruhop-guard                          │ │
//! │  │  - Guard (connect / disconnect ordering)               │ │
//! │  │  - Config (TOML configuration)                         │ │
//! │  │  - ErrorKind (unified error classification)            │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Library Layer                            │
//! │  ┌─────────────────┐    ┌─────────────────┐                 │
//! │  │  hop-firewall   │    │    hop-tun      │                 │
//! │  │  - Kill-switch  │    │  - Adapter      │                 │
//! │  │  - Transactions │    │  - netsh        │                 │
//! │  │  - WFP          │    │  - Routes       │                 │
//! │  └─────────────────┘    └─────────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod guard;
pub mod state;

pub use config::{CommonConfig, Config, KillSwitchConfig, RouteConfig, TunnelConfig};
pub use error::{Error, ErrorKind, Result};
pub use guard::{open_tunnel, Guard, TUNNEL_PERMIT_NAME};
pub use state::GuardState;
