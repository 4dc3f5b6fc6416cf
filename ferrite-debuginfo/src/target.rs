//! Per-target policies for reading ELF objects.
//!
//! The targets differ in a handful of places: which ELF machine and class
//! to expect, whether `.plt` is mapped as code or data, whether symbols in
//! `.opd` are function descriptors to dereference, what to do with
//! zero-sized symbols, and whether the symbol tables need the ppc64
//! merging pass. A [`TargetPolicy`] bundles those decisions so the readers
//! can stay free of target conditionals.

use ferrite_common::Arch;
use goblin::elf::header;

/// How to treat a symbol whose address lies inside `.opd`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpdPolicy {
    /// Such a symbol is a reference into the function-descriptor table of
    /// some other object; drop it.
    Reject,
    /// The symbol is a function descriptor; dereference it to find the
    /// entry point and TOC pointer (ppc64).
    Dereference,
}

/// Where a `.plt` section is expected to be mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PltPolicy {
    /// In an rx segment (most targets).
    Code,
    /// In an rw segment (ppc32).
    Data,
    /// In an rw segment, or legitimately not mapped at all (ppc64).
    DataOrUnmapped,
}

/// What to do with a symbol whose `st_size` is zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroSizePolicy {
    /// Drop the symbol.
    Reject,
    /// Keep the symbol and pretend it has this size. Android's libc and
    /// linker carry hand-written assembly without `.size` directives, and
    /// interception needs those symbols; the storage layer trims the
    /// bogus size against the following symbol.
    Assume(u32),
}

/// Which symbol-table reading strategy to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Emit symbols as they are accepted.
    Linear,
    /// Collect symbols into an ordered set keyed by `(address, name)`,
    /// folding function-descriptor entries into their function-body
    /// counterparts (ppc64).
    OrderedMerge,
}

/// The target descriptor consulted by the ELF readers.
#[derive(Clone, Debug)]
pub struct TargetPolicy {
    /// The CPU architecture.
    pub arch: Arch,
    /// Whether object files are little-endian.
    pub little_endian: bool,
    /// `.opd` handling.
    pub opd: OpdPolicy,
    /// `.plt` mapping expectation.
    pub plt: PltPolicy,
    /// Zero-sized symbol handling.
    pub zero_size: ZeroSizePolicy,
    /// Symbol-table reading strategy.
    pub merge: MergeStrategy,
}

impl TargetPolicy {
    fn new(arch: Arch, little_endian: bool) -> Self {
        TargetPolicy {
            arch,
            little_endian,
            opd: OpdPolicy::Reject,
            plt: PltPolicy::Code,
            zero_size: ZeroSizePolicy::Reject,
            merge: MergeStrategy::Linear,
        }
    }

    /// x86 Linux.
    pub fn x86_linux() -> Self {
        TargetPolicy::new(Arch::X86, true)
    }

    /// x86-64 Linux.
    pub fn amd64_linux() -> Self {
        TargetPolicy::new(Arch::Amd64, true)
    }

    /// ARM Linux.
    pub fn arm_linux() -> Self {
        TargetPolicy::new(Arch::Arm, true)
    }

    /// 32-bit PowerPC Linux. `.plt` lives in the data segment.
    pub fn ppc32_linux() -> Self {
        TargetPolicy {
            plt: PltPolicy::Data,
            ..TargetPolicy::new(Arch::Ppc, false)
        }
    }

    /// 64-bit PowerPC Linux: function descriptors in `.opd`, `.plt` in
    /// the data segment or absent, and the merging symbol reader.
    pub fn ppc64_linux() -> Self {
        TargetPolicy {
            opd: OpdPolicy::Dereference,
            plt: PltPolicy::DataOrUnmapped,
            merge: MergeStrategy::OrderedMerge,
            ..TargetPolicy::new(Arch::Ppc64, false)
        }
    }

    /// s390x Linux.
    pub fn s390x_linux() -> Self {
        TargetPolicy::new(Arch::S390x, false)
    }

    /// 32-bit MIPS Linux (little-endian).
    pub fn mips32_linux() -> Self {
        TargetPolicy::new(Arch::Mips, true)
    }

    /// 64-bit MIPS Linux (little-endian).
    pub fn mips64_linux() -> Self {
        TargetPolicy::new(Arch::Mips64, true)
    }

    /// x86 Android: like Linux, but zero-sized symbols are retained with
    /// an assumed size.
    pub fn x86_android() -> Self {
        TargetPolicy {
            zero_size: ZeroSizePolicy::Assume(2048),
            ..TargetPolicy::new(Arch::X86, true)
        }
    }

    /// ARM Android: like Linux, but zero-sized symbols are retained with
    /// an assumed size.
    pub fn arm_android() -> Self {
        TargetPolicy {
            zero_size: ZeroSizePolicy::Assume(2048),
            ..TargetPolicy::new(Arch::Arm, true)
        }
    }

    /// The ELF class byte expected in `e_ident`.
    pub fn elf_class(&self) -> u8 {
        if self.arch.is_64bit() {
            2 // ELFCLASS64
        } else {
            1 // ELFCLASS32
        }
    }

    /// The data encoding byte expected in `e_ident`.
    pub fn elf_data(&self) -> u8 {
        if self.little_endian {
            1 // ELFDATA2LSB
        } else {
            2 // ELFDATA2MSB
        }
    }

    /// The machine expected in `e_machine`.
    pub fn elf_machine(&self) -> u16 {
        match self.arch {
            Arch::X86 => header::EM_386,
            Arch::Amd64 => header::EM_X86_64,
            Arch::Arm => header::EM_ARM,
            Arch::Ppc => header::EM_PPC,
            Arch::Ppc64 => header::EM_PPC64,
            Arch::S390x => header::EM_S390,
            Arch::Mips => header::EM_MIPS,
            Arch::Mips64 => header::EM_MIPS,
            _ => unreachable!("unhandled Arch variant"),
        }
    }

    /// The size in bytes of a symbol-table entry for this class.
    pub fn sym_entry_size(&self) -> u64 {
        if self.arch.is_64bit() {
            goblin::elf64::sym::SIZEOF_SYM as u64
        } else {
            goblin::elf32::sym::SIZEOF_SYM as u64
        }
    }
}
