//! Register-based virtual machine for the xray scripting language.
//!
//! [`vm::Vm`] owns the register stack and call frames and interprets a
//! compiled [`xr_core::Proto`] directly; it has no dependency on `xr-compiler`
//! — pairing compilation and execution (and turning a [`error::VmError`]
//! into user-facing diagnostics) is the CLI's job, not this crate's.

mod builtins;
pub mod error;
pub mod frame;
mod vm;

pub use error::{TraceFrame, VmError, VmResult};
pub use frame::Frame;
pub use vm::Vm;
