//! Unit Spawner
//!
//! Gives every inbound TCP connection its own disposable container. Each
//! accepted client is rate limited per source address, gets a freshly
//! started unit with a private host port mapping, has its bytes relayed to
//! that unit, and the unit is stopped and removed when the session ends.
//!
//! # Key Features
//!
//! - **One unit per connection** - nothing is shared between clients
//! - **Per-address rate limiting** - bursts are delayed, never rejected
//! - **No orphans** - clients that leave before provisioning never get a unit,
//!   and teardown runs on every exit path
//! - **Optional reuse** - keep a client's unit warm between sessions
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use unit_spawner::{DockerRuntime, Spawner, SpawnerConfig};
//!
//! # async fn run() -> unit_spawner::Result<()> {
//! let config = SpawnerConfig::builder()
//!     .image("sshd")
//!     .listen_port(1337)
//!     .container_port("22/tcp")
//!     .rate_limit_ms(1000)
//!     .build()?;
//!
//! let runtime = Arc::new(DockerRuntime::connect(&config.docker_socket)?);
//! let spawner = Spawner::new(config, runtime)?;
//! let handle = spawner.start().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown(spawner.config().shutdown_grace()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod network;
pub mod pool;
pub mod proxy;
pub mod rate_limit;
pub mod runtime;
pub mod session;
pub mod unit;

pub use config::SpawnerConfig;
pub use error::{Error, Result};
pub use lifecycle::{UnitGuard, UnitManager};
pub use listener::{Spawner, SpawnerHandle};
pub use proxy::SessionEnd;
pub use rate_limit::RateLimiter;
pub use runtime::{ContainerRuntime, DockerRuntime, UnitSpec};
pub use session::SessionOutcome;
pub use unit::{ExecutionUnit, UnitState};
