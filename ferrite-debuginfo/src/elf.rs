//! ELF identification and raw header access.

use goblin::container::Ctx;
use goblin::elf::header::{self, Header};
use goblin::elf::program_header::{ProgramHeader, PT_LOAD, PT_NOTE};
use goblin::elf::section_header::{SectionHeader, SHN_UNDEF, SHT_NOTE};
use goblin::elf::{note, Elf};
use scroll::Pread;

use crate::error::ElfError;
use crate::image::Image;
use crate::target::TargetPolicy;

// e_ident indices and values not re-exported by goblin.
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const EV_CURRENT: u8 = 1;

/// Parses the ELF header at the start of the image.
pub(crate) fn parse_header(img: &Image) -> Result<Header, ElfError> {
    Elf::parse_header(img.data()).map_err(|_| ElfError::NotElf)
}

/// Builds the parsing context (class and byte order) for an ELF header.
pub(crate) fn parse_ctx(header: &Header) -> Result<Ctx, ElfError> {
    let container = header.container().map_err(|_| ElfError::NotElf)?;
    let endianness = header.endianness().map_err(|_| ElfError::NotElf)?;
    Ok(Ctx::new(container, endianness))
}

/// Identifies an ELF object file by peering at its header.
///
/// The image must carry the ELF magic, match the target's class, byte
/// order and machine, be an executable or shared object (or a relocatable
/// object if `rel_ok`), and carry section headers. Program headers are
/// required except for relocatable objects.
pub fn is_elf_object(img: &Image, target: &TargetPolicy, rel_ok: bool) -> bool {
    let header = match parse_header(img) {
        Ok(header) => header,
        Err(_) => return false,
    };

    let mut ok = true;
    ok &= &header.e_ident[..header::SELFMAG] == header::ELFMAG;
    ok &= header.e_ident[EI_CLASS] == target.elf_class()
        && header.e_ident[EI_DATA] == target.elf_data()
        && header.e_ident[EI_VERSION] == EV_CURRENT;
    ok &= header.e_type == header::ET_EXEC
        || header.e_type == header::ET_DYN
        || (rel_ok && header.e_type == header::ET_REL);
    ok &= header.e_machine == target.elf_machine();
    ok &= header.e_version == EV_CURRENT as u32;
    ok &= header.e_shstrndx != SHN_UNDEF as u16;
    ok &= header.e_shoff != 0 && header.e_shnum != 0;
    ok &= (header.e_phoff != 0 && header.e_phnum != 0) || header.e_type == header::ET_REL;

    ok
}

/// Checks that a header table with `nent` entries of `ent_size` bytes at
/// `offset` lies inside the image.
pub(crate) fn validate_table(
    img: &Image,
    offset: u64,
    nent: u64,
    ent_size: u64,
    what: &'static str,
) -> Result<(), ElfError> {
    if nent == 0 || !img.is_valid(offset, nent.saturating_mul(ent_size)) {
        return Err(ElfError::HeaderOutOfRange(what));
    }
    Ok(())
}

/// Rounds an ELF note field length up to its 4-byte boundary.
fn note_align(len: u32) -> u64 {
    ((len as u64) + 3) & !3
}

/// Scans the notes in `[start, start + len)` for a `"GNU"` note of type
/// `NT_GNU_BUILD_ID` and returns its descriptor bytes.
fn scan_notes(img: &Image, start: u64, len: u64, little_endian: bool) -> Option<Vec<u8>> {
    let data = img.data();
    let endian = if little_endian { scroll::LE } else { scroll::BE };
    let limit = start.checked_add(len)?;
    let mut offset = start;
    while offset < limit {
        let namesz: u32 = data.pread_with(offset as usize, endian).ok()?;
        let descsz: u32 = data.pread_with(offset as usize + 4, endian).ok()?;
        let n_type: u32 = data.pread_with(offset as usize + 8, endian).ok()?;
        let name_offset = offset + 12;
        let desc_offset = name_offset + note_align(namesz);

        if n_type == note::NT_GNU_BUILD_ID && img.cstr_matches(name_offset, b"GNU") {
            return Some(img.get(desc_offset, descsz as u64)?.to_vec());
        }

        offset = desc_offset + note_align(descsz);
    }
    None
}

/// Searches an ELF image for a GNU build identifier note.
///
/// Depending on the compiler and linker, the build ID can be declared in
/// a PT_NOTE program header entry, an SHT_NOTE section, or both. Program
/// headers are searched first; sections are only consulted for
/// relocatable objects or when `search_shdrs` is set, since a separate
/// debug file may carry no (or corrupted) program headers.
pub(crate) fn find_build_id_note(
    img: &Image,
    target: &TargetPolicy,
    rel_ok: bool,
    search_shdrs: bool,
) -> Option<Vec<u8>> {
    if !is_elf_object(img, target, rel_ok) {
        return None;
    }

    let header = parse_header(img).ok()?;
    let ctx = parse_ctx(&header).ok()?;
    let little_endian = target.little_endian;

    if header.e_phnum != 0 {
        let phdrs = ProgramHeader::parse(
            img.data(),
            header.e_phoff as usize,
            header.e_phnum as usize,
            ctx,
        )
        .ok()?;
        for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_NOTE) {
            if let Some(desc) = scan_notes(img, phdr.p_offset, phdr.p_filesz, little_endian) {
                return Some(desc);
            }
        }
    }

    if !rel_ok && !search_shdrs {
        return None;
    }

    let shdrs = SectionHeader::parse(
        img.data(),
        header.e_shoff as usize,
        header.e_shnum as usize,
        ctx,
    )
    .ok()?;
    for shdr in shdrs.iter().filter(|shdr| shdr.sh_type == SHT_NOTE) {
        if let Some(desc) = scan_notes(img, shdr.sh_offset, shdr.sh_size, little_endian) {
            return Some(desc);
        }
    }

    None
}

/// Finds the file offset corresponding to `svma` by using the program
/// headers, honouring each segment's alignment slop at the front.
pub(crate) fn file_offset_from_svma(phdrs: &[ProgramHeader], svma: u64) -> Option<u64> {
    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        if svma >= (phdr.p_vaddr & phdr.p_align.wrapping_neg())
            && svma < phdr.p_vaddr.wrapping_add(phdr.p_filesz)
        {
            return Some(svma.wrapping_sub(phdr.p_vaddr).wrapping_add(phdr.p_offset));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    /// Builds a bare 64-bit little-endian ELF header image.
    fn minimal_header(e_type: u16, e_machine: u16) -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(&header::ELFMAG[..]);
        data[EI_CLASS] = 2;
        data[EI_DATA] = 1;
        data[EI_VERSION] = 1;
        data[16..18].copy_from_slice(&e_type.to_le_bytes());
        data[18..20].copy_from_slice(&e_machine.to_le_bytes());
        data[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        data[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        data[40..48].copy_from_slice(&64u64.to_le_bytes()); // e_shoff
        data[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        data[60..62].copy_from_slice(&1u16.to_le_bytes()); // e_shnum
        data[62..64].copy_from_slice(&1u16.to_le_bytes()); // e_shstrndx
        data
    }

    #[test]
    fn test_identify() {
        let target = TargetPolicy::amd64_linux();

        let img = Image::from_vec("t", minimal_header(header::ET_DYN, header::EM_X86_64));
        assert!(is_elf_object(&img, &target, false));

        // Wrong machine.
        let img = Image::from_vec("t", minimal_header(header::ET_DYN, header::EM_AARCH64));
        assert!(!is_elf_object(&img, &target, false));

        // Relocatable objects only pass with rel_ok.
        let img = Image::from_vec("t", minimal_header(header::ET_REL, header::EM_X86_64));
        assert!(!is_elf_object(&img, &target, false));
        assert!(is_elf_object(&img, &target, true));

        // Truncated image.
        let img = Image::from_vec("t", b"\x7fELF".to_vec());
        assert!(!is_elf_object(&img, &target, false));
    }

    #[test]
    fn test_file_offset_from_svma() {
        let mut phdr = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: 0,
            p_offset: 0x200,
            p_vaddr: 0x1200,
            p_paddr: 0,
            p_filesz: 0x400,
            p_memsz: 0x400,
            p_align: 0x1000,
        };

        // Alignment slop in front of p_vaddr still resolves.
        assert_eq!(file_offset_from_svma(&[phdr.clone()], 0x1000), Some(0));
        assert_eq!(file_offset_from_svma(&[phdr.clone()], 0x1300), Some(0x300));
        // Past p_filesz.
        assert_eq!(file_offset_from_svma(&[phdr.clone()], 0x1600), None);

        phdr.p_type = PT_NOTE;
        assert_eq!(file_offset_from_svma(&[phdr], 0x1300), None);
    }

    #[test]
    fn test_note_align() {
        assert_eq!(note_align(0), 0);
        assert_eq!(note_align(1), 4);
        assert_eq!(note_align(4), 4);
        assert_eq!(note_align(5), 8);
    }
}
