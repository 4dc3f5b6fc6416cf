//! Symbol extraction.
//!
//! Each symbol-table entry is run through a filter that decides whether it
//! is worth collecting, works out which section it belongs to, and
//! translates its address into the instrumented process's address space.
//!
//! For most targets the accepted entries are emitted as they come. On
//! ppc64 a symbol's address may point at a function descriptor in `.opd`
//! instead of the function body; the descriptor is dereferenced to find
//! the entry point and TOC pointer, and a merging pass folds the
//! descriptor-derived entry and the function-body entry for the same
//! `(address, name)` into one symbol carrying the real size and TOC
//! pointer of the function.

use std::collections::BTreeMap;

use goblin::container::Ctx;
use goblin::elf::sym::{
    Sym, Symtab, STB_GLOBAL, STB_LOCAL, STB_WEAK, STT_FILE, STT_FUNC, STT_GNU_IFUNC, STT_NOTYPE,
    STT_OBJECT, STT_SECTION,
};
use tracing::{debug, trace};

use crate::base::{Config, Symbol};
use crate::debuginfo::{DebugInfo, SectionRecord};
use crate::image::ImageSlice;
use crate::target::{MergeStrategy, OpdPolicy, TargetPolicy, ZeroSizePolicy};

/// A symbol accepted by the filter, with the name still borrowed from the
/// string-table image.
struct SymInfo<'d> {
    name: &'d [u8],
    avma: u64,
    size: u32,
    tocptr: u64,
    from_opd: bool,
    is_text: bool,
    is_ifunc: bool,
}

/// A symbol held back during the ppc64 merging pass. Keyed externally by
/// `(avma, name)`.
struct PendingSym {
    tocptr: u64,
    size: u32,
    from_opd: bool,
    is_text: bool,
    is_ifunc: bool,
}

fn section_svma_bias(record: &SectionRecord, in_debug: bool) -> (u64, u64) {
    if in_debug {
        (record.debug_svma, record.debug_bias)
    } else {
        (record.svma, record.bias)
    }
}

/// Decides whether a symbol should be collected and, if so, produces its
/// canonical form.
///
/// The address as stated in the symbol table is an SVMA; it is attributed
/// to one of the recognised sections by range and biased with that
/// section's bias (the companion file's addresses when the table came
/// from a debug image). Entries that are nameless, zero-sized,
/// zero-valued, or that point into the GOT or PLT are references to
/// symbols defined elsewhere and are dropped.
#[allow(clippy::too_many_arguments)]
fn get_elf_symbol_info<'d>(
    di: &DebugInfo,
    target: &TargetPolicy,
    sym: &Sym,
    strtab: &ImageSlice<'d>,
    symtab_in_debug: bool,
    opd: Option<&ImageSlice<'d>>,
    opd_bias: u64,
) -> Option<SymInfo<'d>> {
    let sym_svma = sym.st_value;
    let strtab_img = strtab.image();
    let mut name_ioff = strtab.offset() + sym.st_name as u64;

    let mut avma = sym_svma;
    let mut is_text = true;
    let mut tocptr = 0u64;
    let mut from_opd = false;
    let mut is_ifunc = false;

    // Clamp the size into a signed 32-bit range, mapping the occasional
    // negative size to 1.
    let mut size: u32 = {
        let size = sym.st_size as i64;
        if size < 0 {
            1
        } else {
            size.min(i32::MAX as i64) as u32
        }
    };

    // Is it of the right flavour at all?
    let mut plausible = matches!(sym.st_bind(), STB_GLOBAL | STB_LOCAL | STB_WEAK)
        && matches!(
            sym.st_type(),
            STT_FUNC | STT_OBJECT | STT_GNU_IFUNC
        );

    // Attribute the symbol to a section by SVMA and bias it accordingly.
    // Goes wrong if the deduced section address ranges are wrong.
    let (text_svma, text_bias) = section_svma_bias(&di.text, symtab_in_debug);
    let (data_svma, data_bias) = section_svma_bias(&di.data, symtab_in_debug);
    let (sdata_svma, sdata_bias) = section_svma_bias(&di.sdata, symtab_in_debug);
    let (rodata_svma, rodata_bias) = section_svma_bias(&di.rodata, symtab_in_debug);
    let (bss_svma, bss_bias) = section_svma_bias(&di.bss, symtab_in_debug);
    let (sbss_svma, sbss_bias) = section_svma_bias(&di.sbss, symtab_in_debug);

    let in_section =
        |record: &SectionRecord, svma: u64| record.present && record.size > 0 && sym_svma >= svma && sym_svma < svma + record.size;

    if in_section(&di.text, text_svma) {
        is_text = true;
        avma = avma.wrapping_add(text_bias);
    } else if in_section(&di.data, data_svma) {
        is_text = false;
        avma = avma.wrapping_add(data_bias);
    } else if in_section(&di.sdata, sdata_svma) {
        is_text = false;
        avma = avma.wrapping_add(sdata_bias);
    } else if in_section(&di.rodata, rodata_svma) {
        is_text = false;
        avma = avma.wrapping_add(rodata_bias);
    } else if in_section(&di.bss, bss_svma) {
        is_text = false;
        avma = avma.wrapping_add(bss_bias);
    } else if in_section(&di.sbss, sbss_svma) {
        is_text = false;
        avma = avma.wrapping_add(sbss_bias);
    } else {
        // Assume it's in .text.
        is_text = true;
        avma = avma.wrapping_add(text_bias);
    }

    if is_text && sym.st_type() == STT_GNU_IFUNC {
        is_ifunc = true;
    }

    // Allow STT_NOTYPE in the very special case where the address points
    // into .opd and the descriptor-chasing below will resolve it.
    if !plausible
        && target.opd == OpdPolicy::Dereference
        && is_text
        && sym.st_type() == STT_NOTYPE
        && size > 0
        && di.opd.contains(avma)
    {
        plausible = true;
    }

    if !plausible {
        return None;
    }

    // Ignore if nameless.
    match strtab_img.get_u8(name_ioff) {
        Some(0) | None => {
            trace!("    ignore -- nameless");
            return None;
        }
        Some(_) => {}
    }

    // Ignore if zero-sized, unless the target retains such symbols with
    // an assumed size (the storage layer trims the overlap later).
    if size == 0 {
        match target.zero_size {
            ZeroSizePolicy::Assume(assumed) => size = assumed,
            ZeroSizePolicy::Reject => {
                trace!("    ignore -- size=0");
                return None;
            }
        }
    }

    // Rejecting zero values significantly reduces the number of junk
    // symbols with overlapping address ranges.
    if sym.st_value == 0 {
        trace!("    ignore -- valu=0");
        return None;
    }

    // If it's apparently in a GOT or PLT, it's really a reference to a
    // symbol defined elsewhere.
    if di.got.contains(avma) {
        trace!("    ignore -- in GOT");
        return None;
    }
    if di.plt.contains(avma) {
        trace!("    ignore -- in PLT");
        return None;
    }

    // A symbol in .opd is the address of a function descriptor, not of
    // code. Targets without descriptors drop it; ppc64 dereferences it
    // to find the entry point and the TOC pointer.
    let mut is_in_opd = false;
    if di.opd.contains(avma) {
        match target.opd {
            OpdPolicy::Reject => {
                trace!("    ignore -- in OPD");
                return None;
            }
            OpdPolicy::Dereference => {
                if avma % 8 != 0 {
                    trace!("    ignore -- not 8-aligned");
                    return None;
                }

                let offset_in_opd = avma - di.opd.avma;
                let opd = opd?;
                let descr_ioff = opd.offset() + offset_in_opd;
                let opd_img = opd.image();
                if !opd_img.is_valid(descr_ioff, 16) {
                    trace!("    ignore -- invalid OPD fn_descr offset");
                    return None;
                }

                // The descriptor is (entry, toc, env); env is not needed.
                // Both words are biased with the caller-supplied opd
                // bias.
                let entry = opd_img.get_u64(descr_ioff, target.little_endian)?;
                let toc = opd_img.get_u64(descr_ioff + 8, target.little_endian)?;
                avma = entry.wrapping_add(opd_bias);
                tocptr = toc.wrapping_add(opd_bias);
                from_opd = true;
                is_in_opd = true;
            }
        }
    }

    // Pre-"dotless"-ABI ppc64 objects prefix code symbols outside .opd
    // with a dot; strip it.
    if target.opd == OpdPolicy::Dereference
        && di.opd.size > 0
        && !is_in_opd
        && strtab_img.get_u8(name_ioff) == Some(b'.')
    {
        name_ioff += 1;
    }

    // If no part of the symbol falls within the mapped ranges, ignore
    // it. Text symbols only need to land in some rx mapping, not in
    // .text itself.
    let hi = avma.wrapping_add(size as u64);
    if is_text {
        if di.find_rx_mapping(avma, hi).is_none() {
            trace!(avma, size, "    ignore -- outside rx mapping");
            return None;
        }
    } else {
        let in_data = di.data.overlaps_avma(avma, hi);
        let in_sdata = di.sdata.overlaps_avma(avma, hi);
        let in_rodata = di.rodata.overlaps_avma(avma, hi);
        let in_bss = di.bss.overlaps_avma(avma, hi);
        let in_sbss = di.sbss.overlaps_avma(avma, hi);
        if !(in_data || in_sdata || in_rodata || in_bss || in_sbss) {
            trace!(avma, size, "    ignore -- outside data svma ranges");
            return None;
        }
    }

    // Never let a symbol's range touch .opd; redirection relies on
    // descriptor addresses staying out of the symbol table.
    if target.opd == OpdPolicy::Dereference && di.opd.overlaps(avma, hi) {
        trace!(avma, size, "    ignore -- overlaps .opd");
        return None;
    }

    let name = strtab_img.read_cstr(name_ioff)?;

    Some(SymInfo {
        name,
        avma,
        size,
        tocptr,
        from_opd,
        is_text,
        is_ifunc,
    })
}

/// Logs one raw symbol-table entry before filtering.
fn trace_raw_symbol(index: usize, sym: &Sym, strtab: &ImageSlice<'_>, ppc64_format: bool) {
    let bind = match sym.st_bind() {
        STB_LOCAL => "LOC",
        STB_GLOBAL => "GLO",
        STB_WEAK => "WEA",
        _ => "???",
    };
    let typ = match sym.st_type() {
        STT_NOTYPE => "NOT",
        STT_OBJECT => "OBJ",
        STT_FUNC => "FUN",
        STT_SECTION => "SEC",
        STT_FILE => "FIL",
        _ => "???",
    };
    let name = strtab
        .image()
        .read_cstr(strtab.offset() + sym.st_name as u64)
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .unwrap_or_else(|| "NONAME".into());
    let space = if ppc64_format { "                  " } else { "" };
    trace!(
        "raw symbol [{index:4}]: {bind} {typ}: svma {:#010x}, {space}sz {:4}  {name}",
        sym.st_value,
        sym.st_size,
    );
}

/// Reads one ELF symbol table (normal or dynamic), appending accepted
/// symbols to the `DebugInfo`'s table.
///
/// `symtab_in_debug` says whether the table (and its strings) came from
/// the debug companion, in which case the companion's section addresses
/// apply. The `.opd` slice and `opd_bias` feed the descriptor chasing on
/// ppc64.
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_symbol_table(
    di: &mut DebugInfo,
    tab_name: &str,
    symtab: Option<ImageSlice<'_>>,
    strtab: Option<ImageSlice<'_>>,
    opd: Option<ImageSlice<'_>>,
    symtab_in_debug: bool,
    ctx: Ctx,
    target: &TargetPolicy,
    cfg: &Config,
) {
    let (symtab, strtab) = match (symtab, strtab) {
        (Some(symtab), Some(strtab)) => (symtab, strtab),
        _ => {
            debug!("   object doesn't have a {tab_name}");
            return;
        }
    };

    let count = (symtab.size() / target.sym_entry_size()) as usize;
    let syms = match Symtab::parse(symtab.image().data(), symtab.offset() as usize, count, ctx) {
        Ok(syms) => syms,
        Err(_) => {
            debug!("   object has an unreadable {tab_name}");
            return;
        }
    };

    trace!("--- reading {tab_name} ({count} entries) ---");

    match target.merge {
        MergeStrategy::Linear => {
            // Entry 0 is the reserved null symbol.
            for (index, sym) in syms.iter().enumerate().skip(1) {
                if cfg.trace_symtab {
                    trace_raw_symbol(index, &sym, &strtab, false);
                }
                if let Some(info) =
                    get_elf_symbol_info(di, target, &sym, &strtab, symtab_in_debug, opd.as_ref(), di.text.bias)
                {
                    // The TOC pointer has no role except on ppc64, which
                    // uses the merging reader.
                    debug_assert_eq!(info.tocptr, 0);
                    di.symtab.add(Symbol {
                        avma: info.avma,
                        tocptr: info.tocptr,
                        name: String::from_utf8_lossy(info.name).into_owned(),
                        size: info.size,
                        is_text: info.is_text,
                        is_ifunc: info.is_ifunc,
                    });
                }
            }
        }

        MergeStrategy::OrderedMerge => {
            // Both the synthetic .opd-redirect entry and the real
            // function-body entry for the same function land on the same
            // (avma, name) key; fix up the size and TOC pointer once
            // both have been seen. Name comparison goes through the
            // string-table image, so the keys borrow it.
            let mut pending: BTreeMap<(u64, &[u8]), PendingSym> = BTreeMap::new();

            for (index, sym) in syms.iter().enumerate().skip(1) {
                if cfg.trace_symtab {
                    trace_raw_symbol(index, &sym, &strtab, true);
                }
                let info = match get_elf_symbol_info(
                    di,
                    target,
                    &sym,
                    &strtab,
                    symtab_in_debug,
                    opd.as_ref(),
                    di.text.bias,
                ) {
                    Some(info) => info,
                    None => continue,
                };

                match pending.get_mut(&(info.avma, info.name)) {
                    Some(prev) => {
                        if prev.from_opd
                            && !info.from_opd
                            && (prev.size == 24 || prev.size == 16)
                            && info.size != prev.size
                        {
                            // The earlier entry was an opd-redirect whose
                            // size is the descriptor size; the new entry
                            // carries the real function size.
                            prev.size = info.size;
                        } else if !prev.from_opd
                            && info.from_opd
                            && (info.size == 24 || info.size == 16)
                            && prev.tocptr == 0
                        {
                            // The earlier entry was the function body;
                            // the opd entry contributes the TOC pointer.
                            prev.tocptr = info.tocptr;
                        }
                        // Anything else carries no new information.
                    }
                    None => {
                        pending.insert(
                            (info.avma, info.name),
                            PendingSym {
                                tocptr: info.tocptr,
                                size: info.size,
                                from_opd: info.from_opd,
                                is_text: info.is_text,
                                is_ifunc: info.is_ifunc,
                            },
                        );
                    }
                }
            }

            for ((avma, name), pending_sym) in pending {
                di.symtab.add(Symbol {
                    avma,
                    tocptr: pending_sym.tocptr,
                    name: String::from_utf8_lossy(name).into_owned(),
                    size: pending_sym.size,
                    is_text: pending_sym.is_text,
                    is_ifunc: pending_sym.is_ifunc,
                });
            }
        }
    }
}
