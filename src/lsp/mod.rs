//! Pooled, containerized language servers.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐ WebSocket ┌───────────────────────────────────────────────┐
//! │  Editor  │ ────────> │  session.rs  (SessionManager)                 │
//! │ (Monaco) │ <──────── │    │  workspace key → bridge, conn → key      │
//! └──────────┘           │    │                                          │
//!                        │    │ ContainerPool::acquire()/release()       │
//!                        │    v                                          │
//!                        │  pool.rs   (ContainerPool, SaturationSnapshot)│
//!                        │    │  ContainerRuntime (docker CLI)           │
//!                        │    │                                          │
//!                        │    │ BridgeFactory::create() → start()        │
//!                        │    v                                          │
//!                        │  bridge.rs (Bridge trait, LspBridge)          │
//!                        │       docker exec -i … jdtls  ⇄  framing.rs   │
//!                        └───────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `framing`    | `Content-Length` message framing on the stdio pipe      |
//! | `naming`     | Workspace keys, sanitized paths, container names        |
//! | `runtime`    | `ContainerRuntime` trait + `DockerCli`                  |
//! | `connection` | `ClientConnection` handles and broadcast `ConnectionSet`|
//! | `prewarm`    | Login-triggered warm-up with cooldown and saturation gate|

pub mod bridge;
pub mod connection;
pub mod framing;
pub mod naming;
pub mod pool;
pub mod prewarm;
pub mod runtime;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{Bridge, BridgeFactory, DockerBridgeFactory, LspBridge};
pub use connection::{ClientConnection, Outbound};
pub use pool::{ContainerPool, SaturationSnapshot};
pub use prewarm::{PrewarmService, TaskSpawner, TokioSpawner};
pub use runtime::{ContainerRuntime, DockerCli};
pub use session::SessionManager;
