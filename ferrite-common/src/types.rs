//! Target architecture descriptors.

use std::fmt;
use std::str::FromStr;

/// An error returned for an unknown [`Arch`] name.
#[derive(Debug)]
pub struct UnknownArchError;

impl fmt::Display for UnknownArchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown architecture")
    }
}

impl std::error::Error for UnknownArchError {}

/// A CPU architecture the framework can instrument.
///
/// The variants cover the Linux targets supported by the instrumentation
/// core. The architecture decides the ELF class expected from an object
/// file and, together with the OS flavour, the per-target policies applied
/// while reading symbols.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
#[non_exhaustive]
pub enum Arch {
    /// 32-bit x86.
    X86,
    /// 64-bit x86-64 (amd64).
    Amd64,
    /// 32-bit little-endian ARM.
    Arm,
    /// 32-bit big-endian PowerPC.
    Ppc,
    /// 64-bit big-endian PowerPC with function descriptors.
    Ppc64,
    /// 64-bit s390x.
    S390x,
    /// 32-bit MIPS.
    Mips,
    /// 64-bit MIPS.
    Mips64,
}

impl Arch {
    /// Returns the name of the architecture.
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::Amd64 => "amd64",
            Arch::Arm => "arm",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
            Arch::S390x => "s390x",
            Arch::Mips => "mips",
            Arch::Mips64 => "mips64",
        }
    }

    /// The size in bytes of a pointer on this architecture.
    pub fn pointer_size(self) -> usize {
        match self {
            Arch::X86 | Arch::Arm | Arch::Ppc | Arch::Mips => 4,
            Arch::Amd64 | Arch::Ppc64 | Arch::S390x | Arch::Mips64 => 8,
        }
    }

    /// Whether object files for this architecture are 64-bit ELF.
    pub fn is_64bit(self) -> bool {
        self.pointer_size() == 8
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = UnknownArchError;

    fn from_str(string: &str) -> Result<Arch, UnknownArchError> {
        Ok(match string {
            "x86" => Arch::X86,
            "amd64" | "x86_64" => Arch::Amd64,
            "arm" => Arch::Arm,
            "ppc" => Arch::Ppc,
            "ppc64" => Arch::Ppc64,
            "s390x" => Arch::S390x,
            "mips" => Arch::Mips,
            "mips64" => Arch::Mips64,
            _ => return Err(UnknownArchError),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_names() {
        for arch in [
            Arch::X86,
            Arch::Amd64,
            Arch::Arm,
            Arch::Ppc,
            Arch::Ppc64,
            Arch::S390x,
            Arch::Mips,
            Arch::Mips64,
        ] {
            assert_eq!(arch.name().parse::<Arch>().unwrap(), arch);
        }
    }

    #[test]
    fn test_pointer_size() {
        assert_eq!(Arch::X86.pointer_size(), 4);
        assert_eq!(Arch::Ppc64.pointer_size(), 8);
        assert!(Arch::Amd64.is_64bit());
        assert!(!Arch::Arm.is_64bit());
    }
}
