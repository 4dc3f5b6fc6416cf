//! Section and segment discovery.
//!
//! The first stage of acquisition reconciles the object file's program
//! headers against the process's memory mappings, producing a list of
//! [`RangeAndBias`] load ranges. The section headers are then classified
//! by name against those ranges, filling in the section records of the
//! [`DebugInfo`].

use goblin::container::Ctx;
use goblin::elf::dynamic::{Dynamic, DT_SONAME, DT_STRTAB};
use goblin::elf::program_header::{ProgramHeader, PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::section_header::{SectionHeader, SHT_NOBITS};
use tracing::{trace, warn};

use crate::base::Mapping;
use crate::debuginfo::{DebugInfo, EhFrameRecord, SectionRecord, MAX_EHFRAME_SECTIONS};
use crate::elf::file_offset_from_svma;
use crate::error::ElfError;
use crate::image::Image;
use crate::target::{PltPolicy, TargetPolicy};

/// An SVMA interval covered by a loadable segment that matched a memory
/// mapping, together with the bias translating it to run-time addresses.
///
/// Normally an object provides one rx and one rw range, but various ELF
/// mangling tools create objects with several of each, hence the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RangeAndBias {
    /// First SVMA covered.
    pub svma_base: u64,
    /// One past the last SVMA covered.
    pub svma_limit: u64,
    /// `avma - svma`, in wrapping arithmetic.
    pub bias: u64,
    /// Whether this range is executable (rx) rather than writable (rw).
    pub exec: bool,
}

impl RangeAndBias {
    pub(crate) fn contains(&self, svma: u64) -> bool {
        svma >= self.svma_base && svma < self.svma_limit
    }
}

/// Walks the PT_LOAD entries, pairing each with the memory mappings that
/// cover its file-offset window.
///
/// Fails if the PT_LOAD entries are not in ascending address order, or if
/// a segment with memory footprint matches no mapping at all.
pub(crate) fn scan_load_segments(
    phdrs: &[ProgramHeader],
    maps: &[Mapping],
) -> Result<Vec<RangeAndBias>, ElfError> {
    let mut ranges = Vec::new();
    let mut prev_svma = 0u64;

    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        if phdr.p_vaddr < prev_svma {
            return Err(ElfError::ProgramHeadersDisordered);
        }
        prev_svma = phdr.p_vaddr;

        if phdr.p_memsz == 0 {
            continue;
        }

        let mut loaded = false;
        for map in maps.iter().filter(|map| map.rx || map.rw) {
            if phdr.p_offset >= map.foff
                && phdr.p_offset < map.foff + map.size
                && phdr.p_offset + phdr.p_filesz <= map.foff + map.size
            {
                let bias = map
                    .avma
                    .wrapping_sub(map.foff)
                    .wrapping_add(phdr.p_offset)
                    .wrapping_sub(phdr.p_vaddr);
                let item = RangeAndBias {
                    svma_base: phdr.p_vaddr,
                    svma_limit: phdr.p_vaddr + phdr.p_memsz,
                    bias,
                    exec: false,
                };
                if map.rw && (phdr.p_flags & (PF_R | PF_W)) == (PF_R | PF_W) {
                    ranges.push(item);
                    trace!(svma = phdr.p_vaddr, bias, "PT_LOAD acquired as rw");
                    loaded = true;
                }
                if map.rx && (phdr.p_flags & (PF_R | PF_X)) == (PF_R | PF_X) {
                    ranges.push(RangeAndBias { exec: true, ..item });
                    trace!(svma = phdr.p_vaddr, bias, "PT_LOAD acquired as rx");
                    loaded = true;
                }
            }
        }

        if !loaded {
            return Err(ElfError::SegmentUnmapped);
        }
    }

    Ok(ranges)
}

/// Extracts `DT_SONAME` from the first dynamic segment, resolving the
/// dynamic string table's address through the load segments.
///
/// Returns `Ok(None)` when the object carries no soname. A string table
/// address that resolves to a file offset outside the image is a fatal
/// error.
pub(crate) fn find_soname(
    img: &Image,
    phdrs: &[ProgramHeader],
    ctx: Ctx,
) -> Result<Option<String>, ElfError> {
    let dynamic = match Dynamic::parse(img.data(), phdrs, ctx) {
        Ok(Some(dynamic)) => dynamic,
        _ => return Ok(None),
    };

    let mut stroff = None;
    let mut strtab_offset = None;

    for dyn_entry in &dynamic.dyns {
        match dyn_entry.d_tag {
            DT_SONAME => stroff = Some(dyn_entry.d_val),
            DT_STRTAB => {
                if let Some(offset) = file_offset_from_svma(phdrs, dyn_entry.d_val) {
                    if strtab_offset.is_none() {
                        // Check for obviously bogus offsets.
                        if !img.is_valid(offset, 1) {
                            return Err(ElfError::InvalidStrtabOffset);
                        }
                        strtab_offset = Some(offset);
                    }
                }
            }
            _ => {}
        }
    }

    match (stroff, strtab_offset) {
        (Some(stroff), Some(strtab_offset)) => {
            let soname = img
                .read_cstr(strtab_offset + stroff)
                .map(|name| String::from_utf8_lossy(name).into_owned());
            if let Some(ref soname) = soname {
                trace!(soname = %soname, "found soname");
            }
            Ok(soname)
        }
        _ => Ok(None),
    }
}

fn acquire(record: &mut SectionRecord, svma: u64, size: u64, bias: u64) {
    record.present = true;
    record.svma = svma;
    record.avma = svma.wrapping_add(bias);
    record.size = size;
    record.bias = bias;
    record.debug_svma = svma;
    record.debug_bias = bias;
}

/// Classifies the section headers against the load ranges, recording the
/// layout of every recognised section on the `DebugInfo`.
///
/// A recognised section mapped differently than the target expects is a
/// fatal error; unrecognised sections are ignored.
pub(crate) fn classify_sections(
    di: &mut DebugInfo,
    img: &Image,
    shdrs: &[SectionHeader],
    shstrtab_offset: u64,
    ranges: &[RangeAndBias],
    target: &TargetPolicy,
) -> Result<(), ElfError> {
    // A `.bss` (or `.sbss`) directly following its dynamic counterpart
    // extends the existing record instead of replacing it.
    let mut dynbss_present = false;
    let mut sdynbss_present = false;

    for shdr in shdrs {
        let name = match img.read_cstr(shstrtab_offset + shdr.sh_name as u64) {
            Some(name) => name,
            None => continue,
        };
        let svma = shdr.sh_addr;
        let foff = shdr.sh_offset;
        let size = shdr.sh_size;
        let align = shdr.sh_addralign;
        let nobits = shdr.sh_type == SHT_NOBITS;

        let inrx = ranges.iter().find(|rng| rng.exec && rng.contains(svma));
        let inrw = ranges.iter().find(|rng| !rng.exec && rng.contains(svma));

        trace!(
            name = %String::from_utf8_lossy(name),
            svma,
            foff,
            size,
            inrx = inrx.is_some(),
            inrw = inrw.is_some(),
            "section header"
        );

        // SHT_NOBITS sections have zero size in the file.
        if foff >= img.size() || foff + (if nobits { 0 } else { size }) > img.size() {
            return Err(ElfError::SectionOutOfRange);
        }

        if align > 0 && !align.is_power_of_two() {
            return Err(ElfError::BadAlignment);
        }

        // Ignore zero sized sections.
        if size == 0 {
            continue;
        }

        match name {
            b".text" => match inrx {
                Some(rng) if !di.text.present => {
                    acquire(&mut di.text, svma, size, rng.bias);
                    trace!(avma = di.text.avma, bias = di.text.bias, "acquired .text");
                }
                _ => return Err(ElfError::SectionMappingMismatch(".text")),
            },

            b".data" => match inrw {
                Some(rng) if !di.data.present => acquire(&mut di.data, svma, size, rng.bias),
                _ => return Err(ElfError::SectionMappingMismatch(".data")),
            },

            b".sdata" => match inrw {
                Some(rng) if !di.sdata.present => acquire(&mut di.sdata, svma, size, rng.bias),
                _ => return Err(ElfError::SectionMappingMismatch(".sdata")),
            },

            b".rodata" => match inrx {
                Some(rng) if !di.rodata.present => acquire(&mut di.rodata, svma, size, rng.bias),
                _ => return Err(ElfError::SectionMappingMismatch(".rodata")),
            },

            b".dynbss" => {
                if let (Some(rng), false) = (inrw, di.bss.present) {
                    dynbss_present = true;
                    acquire(&mut di.bss, svma, size, rng.bias);
                }
            }

            b".bss" => {
                if inrw.is_some() && dynbss_present {
                    dynbss_present = false;
                    if di.bss.svma + di.bss.size != svma {
                        return Err(ElfError::SectionMappingMismatch(".bss"));
                    }
                    di.bss.size += size;
                } else if let (Some(rng), false) = (inrw, di.bss.present) {
                    acquire(&mut di.bss, svma, size, rng.bias);
                } else if inrx.is_some() && inrw.is_none() && !di.bss.present {
                    // The file contains a .bss, but it got mapped r-x
                    // only. Pretend we never saw it.
                    di.bss = SectionRecord::default();
                    warn!(
                        filename = %di.filename,
                        "file's .bss is mapped r-x only - ignoring .bss syms"
                    );
                } else if inrw.is_none() && inrx.is_none() && !di.bss.present {
                    // Present in the file but not mapped. Ignore.
                    di.bss = SectionRecord::default();
                } else {
                    return Err(ElfError::SectionMappingMismatch(".bss"));
                }
            }

            b".sdynbss" => {
                if let (Some(rng), false) = (inrw, di.sbss.present) {
                    sdynbss_present = true;
                    acquire(&mut di.sbss, svma, size, rng.bias);
                }
            }

            b".sbss" => {
                if inrw.is_some() && sdynbss_present {
                    sdynbss_present = false;
                    if di.sbss.svma + di.sbss.size != svma {
                        return Err(ElfError::SectionMappingMismatch(".sbss"));
                    }
                    di.sbss.size += size;
                } else if let (Some(rng), false) = (inrw, di.sbss.present) {
                    acquire(&mut di.sbss, svma, size, rng.bias);
                } else {
                    return Err(ElfError::SectionMappingMismatch(".sbss"));
                }
            }

            b".got" => match inrw {
                Some(rng) if !di.got.present => {
                    di.got.present = true;
                    di.got.avma = svma.wrapping_add(rng.bias);
                    di.got.size = size;
                }
                _ => return Err(ElfError::SectionMappingMismatch(".got")),
            },

            b".got.plt" => match inrw {
                Some(rng) if !di.gotplt.present => {
                    di.gotplt.present = true;
                    di.gotplt.avma = svma.wrapping_add(rng.bias);
                    di.gotplt.size = size;
                }
                _ if size != 0 => return Err(ElfError::SectionMappingMismatch(".got.plt")),
                _ => {}
            },

            // The PLT lands in different segments on different targets.
            b".plt" => match target.plt {
                PltPolicy::Code => match inrx {
                    Some(rng) if !di.plt.present => {
                        di.plt.present = true;
                        di.plt.avma = svma.wrapping_add(rng.bias);
                        di.plt.size = size;
                    }
                    _ => return Err(ElfError::SectionMappingMismatch(".plt")),
                },
                PltPolicy::Data => match inrw {
                    Some(rng) if !di.plt.present => {
                        di.plt.present = true;
                        di.plt.avma = svma.wrapping_add(rng.bias);
                        di.plt.size = size;
                    }
                    _ => return Err(ElfError::SectionMappingMismatch(".plt")),
                },
                PltPolicy::DataOrUnmapped => {
                    if let (Some(rng), false) = (inrw, di.plt.present) {
                        di.plt.present = true;
                        di.plt.avma = svma.wrapping_add(rng.bias);
                        di.plt.size = size;
                    } else if inrw.is_none() && inrx.is_none() && size > 0 && !di.plt.present {
                        // Present in the file but not mapped; evidently
                        // not required on this target.
                        di.plt.present = true;
                        di.plt.avma = 0;
                        di.plt.size = 0;
                    } else {
                        return Err(ElfError::SectionMappingMismatch(".plt"));
                    }
                }
            },

            b".opd" => match inrw {
                Some(rng) if !di.opd.present => {
                    di.opd.present = true;
                    di.opd.avma = svma.wrapping_add(rng.bias);
                    di.opd.size = size;
                }
                _ => return Err(ElfError::SectionMappingMismatch(".opd")),
            },

            // .eh_frame is usually mapped rx; fall back to rw if not.
            b".eh_frame" => {
                let rng = match (inrx, inrw) {
                    (Some(rng), _) | (None, Some(rng)) => rng,
                    (None, None) => return Err(ElfError::SectionMappingMismatch(".eh_frame")),
                };
                if di.ehframe.len() >= MAX_EHFRAME_SECTIONS {
                    return Err(ElfError::SectionMappingMismatch(".eh_frame"));
                }
                di.ehframe.push(EhFrameRecord {
                    avma: svma.wrapping_add(rng.bias),
                    size,
                });
            }

            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    use crate::base::Mapping;

    fn phdr(p_type: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64) -> ProgramHeader {
        ProgramHeader {
            p_type,
            p_flags: flags,
            p_offset: offset,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: filesz,
            p_memsz: filesz,
            p_align: 0x1000,
        }
    }

    fn shdr(name: usize, sh_type: u32, addr: u64, offset: u64, size: u64) -> SectionHeader {
        SectionHeader {
            sh_name: name,
            sh_type,
            sh_flags: 0,
            sh_addr: addr,
            sh_offset: offset,
            sh_size: size,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 8,
            sh_entsize: 0,
        }
    }

    fn rx_map(avma: u64, size: u64, foff: u64) -> Mapping {
        Mapping {
            avma,
            size,
            foff,
            rx: true,
            rw: false,
        }
    }

    fn rw_map(avma: u64, size: u64, foff: u64) -> Mapping {
        Mapping {
            avma,
            size,
            foff,
            rx: false,
            rw: true,
        }
    }

    #[test]
    fn test_scan_load_segments() {
        let phdrs = vec![
            phdr(PT_LOAD, PF_R | PF_X, 0, 0, 0x1500),
            phdr(PT_LOAD, PF_R | PF_W, 0x2000, 0x2000, 0x40),
        ];
        let maps = vec![rx_map(0x400000, 0x2000, 0), rw_map(0x602000, 0x1000, 0x2000)];

        let ranges = scan_load_segments(&phdrs, &maps).unwrap();
        assert_eq!(
            ranges,
            vec![
                RangeAndBias {
                    svma_base: 0,
                    svma_limit: 0x1500,
                    bias: 0x400000,
                    exec: true,
                },
                RangeAndBias {
                    svma_base: 0x2000,
                    svma_limit: 0x2040,
                    bias: 0x600000,
                    exec: false,
                },
            ]
        );
    }

    #[test]
    fn test_scan_rejects_disorder() {
        let phdrs = vec![
            phdr(PT_LOAD, PF_R | PF_X, 0x2000, 0x2000, 0x100),
            phdr(PT_LOAD, PF_R | PF_W, 0, 0, 0x100),
        ];
        let maps = vec![rx_map(0x400000, 0x3000, 0)];
        assert!(matches!(
            scan_load_segments(&phdrs, &maps),
            Err(ElfError::ProgramHeadersDisordered)
        ));
    }

    #[test]
    fn test_scan_rejects_unmapped_segment() {
        let phdrs = vec![phdr(PT_LOAD, PF_R | PF_X, 0x8000, 0x8000, 0x100)];
        let maps = vec![rx_map(0x400000, 0x2000, 0)];
        assert!(matches!(
            scan_load_segments(&phdrs, &maps),
            Err(ElfError::SegmentUnmapped)
        ));
    }

    #[test]
    fn test_scan_skips_empty_segment() {
        let phdrs = vec![phdr(PT_LOAD, PF_R | PF_X, 0x8000, 0x8000, 0)];
        let maps = vec![rx_map(0x400000, 0x2000, 0)];
        assert_eq!(scan_load_segments(&phdrs, &maps).unwrap(), vec![]);
    }

    /// Classifies against a string table laid out as
    /// `\0.text\0.dynbss\0.bss\0` at image offset 0.
    fn classify(
        names: &[u8],
        shdrs: &[SectionHeader],
        ranges: &[RangeAndBias],
    ) -> Result<DebugInfo, ElfError> {
        let mut di = DebugInfo::new("test.so", vec![]);
        let mut data = names.to_vec();
        data.resize(0x4000, 0);
        let img = Image::from_vec("test.so", data);
        let target = TargetPolicy::amd64_linux();
        classify_sections(&mut di, &img, shdrs, 0, ranges, &target)?;
        Ok(di)
    }

    #[test]
    fn test_bss_merges_with_dynbss() {
        let names = b"\0.dynbss\0.bss\0";
        let rw = RangeAndBias {
            svma_base: 0x2000,
            svma_limit: 0x3000,
            bias: 0x600000,
            exec: false,
        };
        let shdrs = vec![
            shdr(1, SHT_NOBITS, 0x2100, 0x100, 0x80),
            shdr(9, SHT_NOBITS, 0x2180, 0x100, 0x40),
        ];

        let di = classify(names, &shdrs, &[rw]).unwrap();
        assert!(di.bss.present);
        assert_eq!(di.bss.svma, 0x2100);
        assert_eq!(di.bss.size, 0xc0);
        assert_eq!(di.bss.avma, 0x602100);
    }

    #[test]
    fn test_bss_merge_requires_abutment() {
        let names = b"\0.dynbss\0.bss\0";
        let rw = RangeAndBias {
            svma_base: 0x2000,
            svma_limit: 0x3000,
            bias: 0x600000,
            exec: false,
        };
        let shdrs = vec![
            shdr(1, SHT_NOBITS, 0x2100, 0x100, 0x80),
            shdr(9, SHT_NOBITS, 0x2200, 0x100, 0x40),
        ];

        assert!(matches!(
            classify(names, &shdrs, &[rw]),
            Err(ElfError::SectionMappingMismatch(".bss"))
        ));
    }

    #[test]
    fn test_bss_rx_only_is_dropped() {
        let names = b"\0.bss\0";
        let rx = RangeAndBias {
            svma_base: 0x1000,
            svma_limit: 0x2000,
            bias: 0x400000,
            exec: true,
        };
        let shdrs = vec![shdr(1, SHT_NOBITS, 0x1100, 0x100, 0x80)];

        let di = classify(names, &shdrs, &[rx]).unwrap();
        assert!(!di.bss.present);
        assert_eq!(di.bss.size, 0);
    }

    #[test]
    fn test_text_requires_rx() {
        let names = b"\0.text\0";
        let rw = RangeAndBias {
            svma_base: 0x1000,
            svma_limit: 0x2000,
            bias: 0x400000,
            exec: false,
        };
        let shdrs = vec![shdr(1, 1 /* SHT_PROGBITS */, 0x1100, 0x100, 0x80)];

        assert!(matches!(
            classify(names, &shdrs, &[rw]),
            Err(ElfError::SectionMappingMismatch(".text"))
        ));
    }

    #[test]
    fn test_bad_alignment_is_fatal() {
        let rx = RangeAndBias {
            svma_base: 0x1000,
            svma_limit: 0x2000,
            bias: 0x400000,
            exec: true,
        };
        let mut section = shdr(1, 1, 0x1100, 0x100, 0x80);
        section.sh_addralign = 24;

        assert!(matches!(
            classify(b"\0.text\0", &[section], &[rx]),
            Err(ElfError::BadAlignment)
        ));
    }

    #[test]
    fn test_zero_sized_section_skipped() {
        let names = b"\0.text\0";
        let shdrs = vec![shdr(1, 1, 0x1100, 0x100, 0)];
        let di = classify(names, &shdrs, &[]).unwrap();
        assert!(!di.text.present);
    }
}
