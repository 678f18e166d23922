//! Shared test utilities for ClassPoints test suites
//!
//! # Modules
//!
//! - [`workspace`]: Temporary workspaces with a `.classpoints` directory
//! - [`cli`]: Command builders with pre-configured environments
//! - [`logging`]: Test logging configuration
//! - [`fixtures`]: Record bodies and remote documents for sync tests
//! - [`assertions`]: Domain-specific assertion helpers
//!
//! # Example
//!
//! ```rust,no_run
//! use cp_test_helpers::prelude::*;
//!
//! let workspace = init_workspace();
//! classpoints_command()
//!     .current_dir(workspace.path())
//!     .arg("queue")
//!     .assert()
//!     .success();
//! ```

pub mod assertions;
pub mod cli;
pub mod fixtures;
pub mod logging;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::cli::{classpoints_command, command_for};
    pub use crate::fixtures::*;
    pub use crate::logging::{init_test_logging, suppress_logs};
    pub use crate::workspace::{init_workspace, temp_dir, workspace_with_config};
}
