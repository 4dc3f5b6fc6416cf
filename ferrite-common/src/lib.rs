//! Common types and utilities for ferrite, a dynamic binary
//! instrumentation framework.
//!
//! This crate carries the pieces shared by the debug-info readers and the
//! process-attach layer:
//!
//! - [`ByteView`], a smart pointer over the raw bytes of an object file,
//!   backed either by a memory mapping or an owned buffer.
//! - [`Arch`], a descriptor for the CPU architectures the framework can
//!   instrument.
//!
//! The crate also re-exports [`CodeId`] from the `debugid` crate, which is
//! the canonical representation of a GNU build identifier.

#![warn(missing_docs)]

mod byteview;
mod types;

pub use crate::byteview::*;
pub use crate::types::*;

pub use debugid::CodeId;
