//! Builds immutable [`xr_core::Proto`] values out of a growable scratch
//! structure during compilation.
//!
//! `Proto` itself lives in `xr-core` because it is mutually recursive with
//! `Value` (a `Value::Closure` holds an `Rc<Proto>`, and a `Proto`'s
//! constant pool holds `Value`s) — Rust crates cannot form a dependency
//! cycle, so the two runtime types share a crate. This crate is the
//! write-side complement: nothing here is read by the VM.

pub mod builder;

pub use builder::ProtoBuilder;
