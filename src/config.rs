//! Sandbox configuration
//!
//! A sandbox is configured once at construction; none of these fields can be
//! changed afterwards.

use std::path::PathBuf;

/// Configuration for a single sandbox instance
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum engine memory in bytes (0 = unbounded)
    pub memory_limit: u64,

    /// Maximum bytecode instructions per run (0 = unbounded)
    pub instruction_limit: u64,

    /// Maximum output bytes buffered between drains (0 = unbounded)
    pub output_limit: u64,

    /// Root directory for external modules (None = external modules disabled)
    pub module_path: Option<PathBuf>,

    /// File used by the host to snapshot guest globals across restarts.
    /// Stored verbatim; the sandbox core never reads or writes it.
    pub preservation_path: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            memory_limit: 8 * 1024 * 1024,
            instruction_limit: 1_000_000,
            output_limit: 64 * 1024,
            module_path: None,
            preservation_path: None,
        }
    }
}

impl SandboxConfig {
    /// Configuration with every ceiling disabled. Intended for trusted
    /// scripts and tests only.
    pub fn unbounded() -> Self {
        SandboxConfig {
            memory_limit: 0,
            instruction_limit: 0,
            output_limit: 0,
            module_path: None,
            preservation_path: None,
        }
    }
}
