//! Debug-info acquisition for ferrite, a dynamic binary instrumentation
//! framework.
//!
//! Given a [`DebugInfo`] describing an object mapped into the
//! instrumented process (its filename plus the validated memory
//! mappings), [`read_elf_debug_info`] reads the object file from disk,
//! discovers its ELF section layout, correlates the file's static
//! addresses with the run-time mappings, extracts the symbol tables,
//! locates and validates any separate or alternate debuginfo companion,
//! and hands the debug sections to the line-number and call-frame
//! readers.
//!
//! ```no_run
//! use ferrite_debuginfo::{read_elf_debug_info, Config, DebugInfo, Mapping, TargetPolicy};
//!
//! let maps = vec![
//!     Mapping { avma: 0x400000, size: 0x2000, foff: 0, rx: true, rw: false },
//!     Mapping { avma: 0x602000, size: 0x1000, foff: 0x2000, rx: false, rw: true },
//! ];
//! let mut di = DebugInfo::new("/usr/lib/libfoo.so.1", maps);
//! if read_elf_debug_info(&mut di, &TargetPolicy::amd64_linux(), &Config::default()) {
//!     println!("{} symbols from {}", di.symtab.len(), di.soname.as_deref().unwrap());
//! }
//! ```

#![warn(missing_docs)]

mod base;
mod companion;
mod debuginfo;
mod dwarf;
mod elf;
mod error;
mod image;
mod layout;
mod reader;
mod symbols;
mod target;

pub use crate::base::{CfiRecord, Config, LineRow, Mapping, Symbol, SymbolTable};
pub use crate::debuginfo::{
    AvmaRange, DebugInfo, EhFrameRecord, SectionRecord, MAX_EHFRAME_SECTIONS,
};
pub use crate::dwarf::Endian;
pub use crate::elf::is_elf_object;
pub use crate::error::ElfError;
pub use crate::image::{Image, ImageError, ImageSlice};
pub use crate::reader::read_elf_debug_info;
pub use crate::target::{MergeStrategy, OpdPolicy, PltPolicy, TargetPolicy, ZeroSizePolicy};
