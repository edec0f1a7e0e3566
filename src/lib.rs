//! self-iterate library crate
//!
//! A staged-mutation pipeline: proposed changes to a source tree are
//! validated, staged in a shadow workspace, reviewed as diffs, and only
//! applied (with a backup) after approval.

pub mod command;
pub mod config;
pub mod diff;
pub mod error;
pub mod patcher;
pub mod policy;
pub mod service;
pub mod session;
pub mod state;
pub mod util;
pub mod verify;
pub mod workspace;

pub use config::Config;
pub use error::{ErrorKind, PipelineError};
pub use session::{Pipeline, ProposeRequest};
