//! Luabox library
//!
//! Embeds a Lua runtime inside a host process and constrains it so that
//! untrusted scripts run with bounded memory, instructions, and output. The
//! host owns scheduling; each sandbox is single-threaded and exclusively
//! owns its engine, buffers, and counters.
//!
//! ```no_run
//! use luabox::{Sandbox, SandboxConfig, UsageStat, UsageType};
//!
//! let mut sandbox = Sandbox::new(SandboxConfig::default()).unwrap();
//! sandbox.init("function process(n) output(n * 2) return 0 end").unwrap();
//! let status = sandbox.invoke(21).unwrap();
//! assert_eq!(status, 0);
//! assert_eq!(sandbox.take_output(), b"42");
//! let peak = sandbox.usage(UsageType::Memory, UsageStat::Maximum);
//! assert!(peak > 0);
//! ```

pub mod config;
pub mod error;
pub mod library;
pub mod output;
pub mod sandbox;
pub mod serialize;
pub mod usage;

mod require;

// Re-export commonly used types
pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use sandbox::{Sandbox, State};
pub use usage::{UsageStat, UsageType};
