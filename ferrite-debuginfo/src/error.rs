//! Errors raised while acquiring ELF debug info.

use thiserror::Error;

use crate::image::ImageError;

/// An error encountered while reading debug info from an ELF object.
///
/// Structural errors abort the whole acquisition: the caller records the
/// error, resets any partially populated state and reports failure.
/// The companion-resolution kinds ([`ElfError::CompanionMismatch`],
/// [`ElfError::CompanionOpenFailed`]) never abort anything; they name the
/// reasons a candidate debug file is passed over, for callers that want
/// to report why an object ended up without debug info.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ElfError {
    /// The main object image could not be opened.
    #[error("connection to image failed")]
    ImageOpen(#[source] ImageError),

    /// The image does not parse as an ELF object for the target.
    #[error("invalid ELF header")]
    NotElf,

    /// A header table extends past the end of the image. The payload
    /// names the table (and the file, for companion images).
    #[error("missing or invalid ELF {0}")]
    HeaderOutOfRange(&'static str),

    /// PT_LOAD entries are not in ascending address order.
    #[error("ELF program headers are not in ascending order")]
    ProgramHeadersDisordered,

    /// A loadable segment has no matching memory mapping.
    #[error("ELF section outside all mapped regions")]
    SegmentUnmapped,

    /// A section's file range exceeds the image size.
    #[error("ELF section extends beyond image end")]
    SectionOutOfRange,

    /// A section's `sh_addralign` is not zero or a power of two.
    #[error("ELF section contains invalid sh_addralign value")]
    BadAlignment,

    /// A recognised section is present but not mapped the way the target
    /// requires it to be.
    #[error("cannot make sense of {0} section mapping")]
    SectionMappingMismatch(&'static str),

    /// A companion image carries a section that is already present in the
    /// main file.
    #[error("debuginfo section {0} duplicates a section in the main ELF file")]
    DuplicateSection(&'static str),

    /// The dynamic table's string-table address does not resolve to a
    /// valid file offset.
    #[error("invalid DT_STRTAB offset")]
    InvalidStrtabOffset,

    /// A companion candidate's build-id or CRC-32 disagrees with the
    /// requested value. Non-fatal: the next candidate is tried.
    #[error("debuginfo file does not match the main object")]
    CompanionMismatch,

    /// No companion debug file could be found. Non-fatal when no
    /// companion was advertised.
    #[error("no matching debuginfo file found")]
    CompanionOpenFailed,
}
