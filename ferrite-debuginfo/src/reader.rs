//! The central ELF debug-info acquisition pipeline.
//!
//! For the object described by a [`DebugInfo`], this locates the ELF
//! sections, reconciles them with the process's memory mappings, reads
//! the symbol tables, finds and validates any separate or alternate
//! debuginfo companion, and feeds the call-frame and line readers.
//!
//! Local variable naming sticks to one convention throughout: things from
//! the main ELF file are `*_m*`, from the debuginfo companion `*_d*`, and
//! from the alternate companion `*_a*`.

use goblin::elf::program_header::ProgramHeader;
use goblin::elf::section_header::{SectionHeader, SHT_NOBITS};
use tracing::{debug, trace, warn};

use crate::base::Config;
use crate::companion;
use crate::debuginfo::{DebugInfo, SectionRecord};
use crate::dwarf::{self, DwarfSlices};
use crate::elf;
use crate::error::ElfError;
use crate::image::{Image, ImageSlice};
use crate::layout;
use crate::symbols::read_symbol_table;
use crate::target::TargetPolicy;

/// The interesting sections, each located in exactly one of the main,
/// debug or alt-debug images.
#[derive(Default)]
struct SectionClaims<'a> {
    dynsym: Option<ImageSlice<'a>>,
    dynstr: Option<ImageSlice<'a>>,
    symtab: Option<ImageSlice<'a>>,
    strtab: Option<ImageSlice<'a>>,
    debuglink: Option<ImageSlice<'a>>,
    debugaltlink: Option<ImageSlice<'a>>,
    stab: Option<ImageSlice<'a>>,
    stabstr: Option<ImageSlice<'a>>,
    debug_line: Option<ImageSlice<'a>>,
    debug_info: Option<ImageSlice<'a>>,
    debug_types: Option<ImageSlice<'a>>,
    debug_abbrev: Option<ImageSlice<'a>>,
    debug_str: Option<ImageSlice<'a>>,
    debug_ranges: Option<ImageSlice<'a>>,
    debug_loc: Option<ImageSlice<'a>>,
    debug_frame: Option<ImageSlice<'a>>,
    dwarf1_debug: Option<ImageSlice<'a>>,
    dwarf1_line: Option<ImageSlice<'a>>,
    opd: Option<ImageSlice<'a>>,
    ehframe: Vec<ImageSlice<'a>>,
    debug_line_alt: Option<ImageSlice<'a>>,
    debug_info_alt: Option<ImageSlice<'a>>,
    debug_abbrev_alt: Option<ImageSlice<'a>>,
    debug_str_alt: Option<ImageSlice<'a>>,
}

/// The bytes of an optional slice; absent sections read as empty.
fn data_of<'a>(slice: Option<ImageSlice<'a>>) -> &'a [u8] {
    slice.map_or(&[], |slice| slice.data())
}

/// Builds a slice for a section after checking its file range.
/// SHT_NOBITS sections have zero size in the file.
fn slice_for<'a>(img: &'a Image, shdr: &SectionHeader) -> Result<ImageSlice<'a>, ElfError> {
    let nobits = shdr.sh_type == SHT_NOBITS;
    if shdr.sh_offset + (if nobits { 0 } else { shdr.sh_size }) > img.size() {
        return Err(ElfError::SectionOutOfRange);
    }
    ImageSlice::new(img, shdr.sh_offset, shdr.sh_size).ok_or(ElfError::SectionOutOfRange)
}

fn main_slot<'c, 'a>(
    claims: &'c mut SectionClaims<'a>,
    name: &[u8],
) -> Option<&'c mut Option<ImageSlice<'a>>> {
    Some(match name {
        b".dynsym" => &mut claims.dynsym,
        b".dynstr" => &mut claims.dynstr,
        b".symtab" => &mut claims.symtab,
        b".strtab" => &mut claims.strtab,
        b".gnu_debuglink" => &mut claims.debuglink,
        b".gnu_debugaltlink" => &mut claims.debugaltlink,
        b".stab" => &mut claims.stab,
        b".stabstr" => &mut claims.stabstr,
        b".debug_line" => &mut claims.debug_line,
        b".debug_info" => &mut claims.debug_info,
        b".debug_types" => &mut claims.debug_types,
        b".debug_abbrev" => &mut claims.debug_abbrev,
        b".debug_str" => &mut claims.debug_str,
        b".debug_ranges" => &mut claims.debug_ranges,
        b".debug_loc" => &mut claims.debug_loc,
        b".debug_frame" => &mut claims.debug_frame,
        b".debug" => &mut claims.dwarf1_debug,
        b".line" => &mut claims.dwarf1_line,
        b".opd" => &mut claims.opd,
        _ => return None,
    })
}

/// Rewrites a main-file section record with the addresses the companion
/// file states for it, deriving the companion bias from the main bias
/// plus the difference in SVMAs. That takes care of prelinking effects.
fn correlate_debug_section(
    record: &mut SectionRecord,
    err_name: &'static str,
    shdr: &SectionHeader,
) -> Result<(), ElfError> {
    if !record.present {
        return Ok(());
    }
    if record.size != shdr.sh_size {
        return Err(ElfError::SectionMappingMismatch(err_name));
    }
    record.debug_svma = shdr.sh_addr;
    record.debug_bias = record
        .bias
        .wrapping_add(record.svma)
        .wrapping_sub(record.debug_svma);
    trace!(
        "acquiring {err_name} debug svma {:#x}, debug bias {:#x}",
        record.debug_svma,
        record.debug_bias
    );
    Ok(())
}

/// Validates a companion debug image, correlates the main file's section
/// addresses with it, and claims the sections that only it carries.
fn process_debug_image<'a>(
    di: &mut DebugInfo,
    claims: &mut SectionClaims<'a>,
    dimg: &'a Image,
) -> Result<(), ElfError> {
    let header_d = elf::parse_header(dimg)?;
    let ctx = elf::parse_ctx(&header_d)?;

    elf::validate_table(
        dimg,
        header_d.e_phoff,
        header_d.e_phnum as u64,
        header_d.e_phentsize as u64,
        "program header table (debuginfo file)",
    )?;
    elf::validate_table(
        dimg,
        header_d.e_shoff,
        header_d.e_shnum as u64,
        header_d.e_shentsize as u64,
        "section header table (debuginfo file)",
    )?;

    let shdrs_d = SectionHeader::parse(
        dimg.data(),
        header_d.e_shoff as usize,
        header_d.e_shnum as usize,
        ctx,
    )
    .map_err(|_| ElfError::HeaderOutOfRange("section header table (debuginfo file)"))?;

    let shstrtab_doff = shdrs_d
        .get(header_d.e_shstrndx as usize)
        .map(|shdr| shdr.sh_offset)
        .ok_or(ElfError::HeaderOutOfRange(
            "section header string table (debuginfo file)",
        ))?;
    if !dimg.is_valid(shstrtab_doff, 1) {
        return Err(ElfError::HeaderOutOfRange(
            "section header string table (debuginfo file)",
        ));
    }

    let need_symtab = claims.symtab.is_none();
    let need_stabs = claims.stab.is_none();
    let need_dwarf2 = claims.debug_info.is_none();
    let need_dwarf1 = claims.dwarf1_debug.is_none();

    for shdr in &shdrs_d {
        let name = match dimg.read_cstr(shstrtab_doff + shdr.sh_name as u64) {
            Some(name) => name,
            None => continue,
        };

        // Rewrite the addresses of sections also present in the main
        // file.
        match name {
            b".text" => correlate_debug_section(&mut di.text, ".text", shdr)?,
            b".data" => correlate_debug_section(&mut di.data, ".data", shdr)?,
            b".sdata" => correlate_debug_section(&mut di.sdata, ".sdata", shdr)?,
            b".rodata" => correlate_debug_section(&mut di.rodata, ".rodata", shdr)?,
            b".bss" => correlate_debug_section(&mut di.bss, ".bss", shdr)?,
            b".sbss" => correlate_debug_section(&mut di.sbss, ".sbss", shdr)?,
            _ => {}
        }

        // Claim the sections the main file did not carry.
        let claimed = match name {
            b".symtab" if need_symtab => Some((&mut claims.symtab, ".symtab")),
            b".strtab" if need_symtab => Some((&mut claims.strtab, ".strtab")),
            b".stab" if need_stabs => Some((&mut claims.stab, ".stab")),
            b".stabstr" if need_stabs => Some((&mut claims.stabstr, ".stabstr")),
            b".debug_line" if need_dwarf2 => Some((&mut claims.debug_line, ".debug_line")),
            b".debug_info" if need_dwarf2 => Some((&mut claims.debug_info, ".debug_info")),
            b".debug_types" if need_dwarf2 => Some((&mut claims.debug_types, ".debug_types")),
            b".debug_abbrev" if need_dwarf2 => Some((&mut claims.debug_abbrev, ".debug_abbrev")),
            b".debug_str" if need_dwarf2 => Some((&mut claims.debug_str, ".debug_str")),
            b".debug_ranges" if need_dwarf2 => Some((&mut claims.debug_ranges, ".debug_ranges")),
            b".debug_loc" if need_dwarf2 => Some((&mut claims.debug_loc, ".debug_loc")),
            b".debug_frame" if need_dwarf2 => Some((&mut claims.debug_frame, ".debug_frame")),
            b".gnu_debugaltlink" if need_dwarf2 => {
                Some((&mut claims.debugaltlink, ".gnu_debugaltlink"))
            }
            b".debug" if need_dwarf1 => Some((&mut claims.dwarf1_debug, ".debug")),
            b".line" if need_dwarf1 => Some((&mut claims.dwarf1_line, ".line")),
            _ => None,
        };
        if let Some((slot, err_name)) = claimed {
            if slot.is_some() {
                return Err(ElfError::DuplicateSection(err_name));
            }
            let slice = slice_for(dimg, shdr)?;
            trace!(
                "{err_name:>18}: dioff {} .. {}",
                slice.offset(),
                slice.offset() + slice.size()
            );
            *slot = Some(slice);
        }
    }

    Ok(())
}

/// Validates an alternate debug image and claims its DWARF sections.
fn process_alt_image<'a>(
    claims: &mut SectionClaims<'a>,
    aimg: &'a Image,
) -> Result<(), ElfError> {
    let header_a = elf::parse_header(aimg)?;
    let ctx = elf::parse_ctx(&header_a)?;

    elf::validate_table(
        aimg,
        header_a.e_shoff,
        header_a.e_shnum as u64,
        header_a.e_shentsize as u64,
        "section header table (alternate debuginfo file)",
    )?;

    let shdrs_a = SectionHeader::parse(
        aimg.data(),
        header_a.e_shoff as usize,
        header_a.e_shnum as usize,
        ctx,
    )
    .map_err(|_| ElfError::HeaderOutOfRange("section header table (alternate debuginfo file)"))?;

    let shstrtab_aoff = shdrs_a
        .get(header_a.e_shstrndx as usize)
        .map(|shdr| shdr.sh_offset)
        .ok_or(ElfError::HeaderOutOfRange(
            "section header string table (alternate debuginfo file)",
        ))?;
    if !aimg.is_valid(shstrtab_aoff, 1) {
        return Err(ElfError::HeaderOutOfRange(
            "section header string table (alternate debuginfo file)",
        ));
    }

    for shdr in &shdrs_a {
        let name = match aimg.read_cstr(shstrtab_aoff + shdr.sh_name as u64) {
            Some(name) => name,
            None => continue,
        };
        let claimed = match name {
            b".debug_line" => Some((&mut claims.debug_line_alt, ".debug_line")),
            b".debug_info" => Some((&mut claims.debug_info_alt, ".debug_info")),
            b".debug_abbrev" => Some((&mut claims.debug_abbrev_alt, ".debug_abbrev")),
            b".debug_str" => Some((&mut claims.debug_str_alt, ".debug_str")),
            _ => None,
        };
        if let Some((slot, err_name)) = claimed {
            if slot.is_some() {
                return Err(ElfError::DuplicateSection(err_name));
            }
            *slot = Some(slice_for(aimg, shdr)?);
        }
    }

    Ok(())
}

fn acquire(di: &mut DebugInfo, target: &TargetPolicy, cfg: &Config) -> Result<(), ElfError> {
    if cfg.verbosity > 1 || cfg.trace_redir {
        debug!("Reading syms from {}", di.filename);
    }

    // The attach layer must have recorded usable rx and rw mappings.
    debug_assert!(di.maps.iter().any(|map| map.rx && map.size > 0));
    debug_assert!(di.maps.iter().any(|map| map.rw && map.size > 0));

    // Connect to the primary object image. It stays connected only for
    // the duration of this call.
    let mimg = Image::from_local_file(&di.filename).map_err(ElfError::ImageOpen)?;
    let mut dimg: Option<Image> = None;
    let mut aimg: Option<Image> = None;
    let mut claims = SectionClaims::default();

    if !elf::is_elf_object(&mimg, target, false) {
        return Err(ElfError::NotElf);
    }

    let header_m = elf::parse_header(&mimg)?;
    let ctx = elf::parse_ctx(&header_m)?;

    trace!("------ Basic facts about the object ------");
    trace!(
        "object: size {}  phoff {} x{}  shoff {} x{}",
        mimg.size(),
        header_m.e_phoff,
        header_m.e_phnum,
        header_m.e_shoff,
        header_m.e_shnum
    );

    elf::validate_table(
        &mimg,
        header_m.e_phoff,
        header_m.e_phnum as u64,
        header_m.e_phentsize as u64,
        "program header table",
    )?;
    elf::validate_table(
        &mimg,
        header_m.e_shoff,
        header_m.e_shnum as u64,
        header_m.e_shentsize as u64,
        "section header table",
    )?;

    let phdrs_m = ProgramHeader::parse(
        mimg.data(),
        header_m.e_phoff as usize,
        header_m.e_phnum as usize,
        ctx,
    )
    .map_err(|_| ElfError::HeaderOutOfRange("program header table"))?;
    let shdrs_m = SectionHeader::parse(
        mimg.data(),
        header_m.e_shoff as usize,
        header_m.e_shnum as usize,
        ctx,
    )
    .map_err(|_| ElfError::HeaderOutOfRange("section header table"))?;

    let shstrtab_moff = shdrs_m
        .get(header_m.e_shstrndx as usize)
        .map(|shdr| shdr.sh_offset)
        .ok_or(ElfError::HeaderOutOfRange("section header string table"))?;
    if !mimg.is_valid(shstrtab_moff, 1) {
        return Err(ElfError::HeaderOutOfRange("section header string table"));
    }

    // Pair the PT_LOAD entries with the memory mappings, and find the
    // soname. Objects without one get "NONE" so that redirect specs
    // always have a pattern to match against.
    let ranges = layout::scan_load_segments(&phdrs_m, &di.maps)?;
    let soname = layout::find_soname(&mimg, &phdrs_m, ctx)?;
    di.soname = Some(soname.unwrap_or_else(|| "NONE".to_string()));

    layout::classify_sections(di, &mimg, &shdrs_m, shstrtab_moff, &ranges, target)?;

    // Walk the section headers again, recording a slice for every
    // interesting section. The .eh_frame slices land in discovery order,
    // which keeps them aligned with the records made during
    // classification.
    for shdr in &shdrs_m {
        let name = match mimg.read_cstr(shstrtab_moff + shdr.sh_name as u64) {
            Some(name) => name,
            None => continue,
        };
        if name == b".eh_frame" {
            if shdr.sh_size == 0 {
                continue;
            }
            let slice = slice_for(&mimg, shdr)?;
            if claims.ehframe.len() < crate::debuginfo::MAX_EHFRAME_SECTIONS {
                claims.ehframe.push(slice);
            }
            continue;
        }
        if let Some(slot) = main_slot(&mut claims, name) {
            let slice = slice_for(&mimg, shdr)?;
            trace!(
                "{:>18}: ioff {} .. {}",
                String::from_utf8_lossy(name),
                slice.offset(),
                slice.offset() + slice.size()
            );
            *slot = Some(slice);
        }
    }

    // See if we can find a companion debug image matching either the
    // build-id or the debuglink CRC. If the main image advertises
    // neither, don't even bother to look.
    let buildid = companion::find_buildid(&mimg, target, false, false);
    if buildid.is_some() || claims.debuglink.is_some() {
        let parsed = claims
            .debuglink
            .as_ref()
            .and_then(|slice| companion::parse_debuglink(slice, target.little_endian));
        dimg = match parsed {
            Some((debugname, crc)) => companion::find_debug_file(
                &di.filename,
                buildid.as_deref(),
                Some(&debugname),
                crc,
                false,
                target,
                cfg,
            ),
            None => companion::find_debug_file(
                &di.filename,
                buildid.as_deref(),
                None,
                0,
                false,
                target,
                cfg,
            ),
        };
        if dimg.is_none() {
            debug!("{} for {}", ElfError::CompanionOpenFailed, di.filename);
        }
    }

    // Last-ditch: an unvalidated companion, if the user asked for one.
    if dimg.is_none() && cfg.allow_mismatched_debuginfo {
        dimg = companion::find_debug_file_ad_hoc(&di.filename, cfg);
    }

    if let Some(ref dimg_ref) = dimg {
        if elf::is_elf_object(dimg_ref, target, false) {
            process_debug_image(di, &mut claims, dimg_ref)?;
        }
    }

    // Look for an alternate (dwz) debug image named by
    // .gnu_debugaltlink, wherever that section came from.
    if let Some(ref altlink) = claims.debugaltlink {
        if let Some(altid) = companion::parse_debugaltlink(altlink) {
            aimg = companion::find_debug_file(&di.filename, Some(&altid), None, 0, true, target, cfg);
        }
    }

    if let Some(ref aimg_ref) = aimg {
        if elf::is_elf_object(aimg_ref, target, true) {
            process_alt_image(&mut claims, aimg_ref)?;
        }
    }

    // Read the symbol tables. The static table's strings may live in the
    // debug image, in which case the companion's section addresses apply
    // to its entries.
    let symtab_in_debug = match (claims.symtab, dimg.as_ref()) {
        (Some(symtab), Some(dimg_ref)) => symtab.is_from(dimg_ref),
        _ => false,
    };
    read_symbol_table(
        di,
        "symbol table",
        claims.symtab,
        claims.strtab,
        claims.opd,
        symtab_in_debug,
        ctx,
        target,
        cfg,
    );
    read_symbol_table(
        di,
        "dynamic symbol table",
        claims.dynsym,
        claims.dynstr,
        claims.opd,
        false,
        ctx,
        target,
        cfg,
    );

    // Call-frame info: all .eh_frame instances first, then .debug_frame.
    let endian = dwarf::endian_for(target);
    let address_size = target.arch.pointer_size() as u8;
    let ehframe_records = di.ehframe.clone();
    for (slice, record) in claims.ehframe.iter().zip(ehframe_records.iter()) {
        debug_assert_eq!(slice.size(), record.size);
        dwarf::read_callframe_info(di, slice.data(), endian, address_size, record.avma, true);
    }
    if let Some(ref debug_frame) = claims.debug_frame {
        dwarf::read_callframe_info(di, debug_frame.data(), endian, address_size, 0, false);
    }

    // Line info needs the DWARF triumvirate; .debug_str alone may be
    // absent (icc has been seen to omit it).
    if claims.debug_info.is_some()
        && claims.debug_abbrev.is_some()
        && claims.debug_line.is_some()
    {
        let slices = DwarfSlices {
            debug_info: data_of(claims.debug_info),
            debug_abbrev: data_of(claims.debug_abbrev),
            debug_line: data_of(claims.debug_line),
            debug_str: data_of(claims.debug_str),
            alt_info: data_of(claims.debug_info_alt),
            alt_abbrev: data_of(claims.debug_abbrev_alt),
            alt_line: data_of(claims.debug_line_alt),
            alt_str: data_of(claims.debug_str_alt),
        };
        dwarf::read_line_info(di, &slices, endian, di.text.debug_bias);

        if cfg.read_var_info {
            // Variable type/location info is the DIE reader's job; it
            // picks up the same slices in the type-info pass.
            trace!("variable info requested for {}", di.filename);
        }
    }

    di.symtab.canonicalise();

    Ok(())
}

/// Reads debug info for the object described by `di`.
///
/// On success the `DebugInfo`'s soname, section layout, symbol table,
/// call-frame info and line info are populated and `true` is returned.
/// On failure every acquired field is reset, the error is recorded in
/// `di.symerr`, and `false` is returned; a rerun afterwards behaves like
/// a first run.
pub fn read_elf_debug_info(di: &mut DebugInfo, target: &TargetPolicy, cfg: &Config) -> bool {
    di.symerr = None;
    match acquire(di, target, cfg) {
        Ok(()) => {
            di.have_dinfo = true;
            true
        }
        Err(err) => {
            warn!(
                "warning: {err}; no symbols or debug info loaded for {}",
                di.filename
            );
            di.reset_acquired();
            di.symerr = Some(err);
            false
        }
    }
}
