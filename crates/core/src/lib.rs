//! Value and object model for the xray scripting language.
//!
//! # Architecture
//!
//! [`Value`] is a tagged union: primitives (`null`, `bool`, `i64`, `f64`) are
//! stored inline, everything else is a reference-counted heap object behind
//! [`object::ObjHeader`]. There is no mark-and-sweep collector here — object
//! lifetime is delegated to `Rc`, with the header's `next` link and `marked`
//! bit kept wired up but unused, reserved for a future tracing collector.
//!
//! # Example
//!
//! ```
//! use xr_core::value::Value;
//!
//! let a = Value::int(2);
//! let b = Value::int(3);
//! assert!(a.is_truthy());
//! assert!(!Value::null().is_truthy());
//! ```

pub mod array;
pub mod class;
pub mod closure;
pub mod config;
pub mod instance;
pub mod intern;
pub mod map;
pub mod object;
pub mod opcode;
pub mod proto;
pub mod upvalue;
pub mod value;

pub use class::Class;
pub use closure::Closure;
pub use config::VmConfig;
pub use instance::Instance;
pub use intern::Interner;
pub use object::ObjHeader;
pub use opcode::{Instruction, OpCode};
pub use proto::Proto;
pub use upvalue::Upvalue;
pub use value::Value;
