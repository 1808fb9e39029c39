//! Core domain model, configuration, traits, and validation for hostd.
//! No transport and no process spawning within this crate.

pub mod audit;
pub mod config;
pub mod descriptor;
pub mod errors;
pub mod plugin;
pub mod services;
pub mod session;
pub mod validate;

pub use crate::audit::{AuditEvent, AuditKind, AuditSink, NullAuditSink};
pub use crate::config::{Config, LogLevel};
pub use crate::descriptor::{ResourceDescriptor, ToolDescriptor};
pub use crate::errors::{HostdError, Result, ValidationError};
pub use crate::plugin::Plugin;
pub use crate::services::{NoServices, ServiceState, ServiceStateProvider};
pub use crate::session::Session;
pub use crate::validate::validate_arguments;
