//! The downstream DWARF readers fed by the orchestrator.
//!
//! Call-frame information is read from every `.eh_frame` instance (at its
//! run-time address) and from `.debug_frame`; line numbers are read by
//! walking each compilation unit's line program. Errors in either reader
//! are not structural: whatever was decoded up to the error is kept and
//! the rest of the section is skipped.

use fallible_iterator::FallibleIterator;
use gimli::UnwindSection;
use tracing::debug;

use crate::base::{CfiRecord, LineRow};
use crate::debuginfo::DebugInfo;
use crate::target::TargetPolicy;

pub use gimli::RunTimeEndian as Endian;

type Slice<'a> = gimli::read::EndianSlice<'a, Endian>;

/// The byte order gimli should assume for a target.
pub(crate) fn endian_for(target: &TargetPolicy) -> Endian {
    if target.little_endian {
        Endian::Little
    } else {
        Endian::Big
    }
}

fn scan_frame_entries<'d, S>(
    di: &mut DebugInfo,
    section: &S,
    bases: &gimli::BaseAddresses,
    is_ehframe: bool,
) where
    S: UnwindSection<Slice<'d>>,
{
    let mut entries = section.entries(bases);
    loop {
        match entries.next() {
            Ok(None) => break,
            Ok(Some(gimli::CieOrFde::Cie(_))) => {}
            Ok(Some(gimli::CieOrFde::Fde(partial))) => match partial.parse(S::cie_from_offset) {
                Ok(fde) => di.cfi.push(CfiRecord {
                    initial_avma: fde.initial_address(),
                    len: fde.len(),
                    is_ehframe,
                }),
                Err(err) => {
                    debug!("warning: {err} whilst reading call frame info");
                    break;
                }
            },
            Err(err) => {
                debug!("warning: {err} whilst reading call frame info");
                break;
            }
        }
    }
}

/// Reads call-frame info from one `.eh_frame` or `.debug_frame` slice.
///
/// `avma` is the run-time address of the section; `.eh_frame` encodings
/// can be relative to it. `.debug_frame` is read with an assumed address
/// of zero.
pub(crate) fn read_callframe_info(
    di: &mut DebugInfo,
    data: &[u8],
    endian: Endian,
    address_size: u8,
    avma: u64,
    is_ehframe: bool,
) {
    if is_ehframe {
        let mut section = gimli::EhFrame::new(data, endian);
        section.set_address_size(address_size);
        let bases = gimli::BaseAddresses::default().set_eh_frame(avma);
        scan_frame_entries(di, &section, &bases, true);
    } else {
        let mut section = gimli::DebugFrame::new(data, endian);
        section.set_address_size(address_size);
        let bases = gimli::BaseAddresses::default();
        scan_frame_entries(di, &section, &bases, false);
    }
}

/// The section data handed to the line reader. Empty slices stand for
/// absent sections.
#[derive(Clone, Copy, Default)]
pub(crate) struct DwarfSlices<'a> {
    pub debug_info: &'a [u8],
    pub debug_abbrev: &'a [u8],
    pub debug_line: &'a [u8],
    pub debug_str: &'a [u8],
    /// Sections of the alternate (dwz-deduplicated) object, if any.
    pub alt_info: &'a [u8],
    pub alt_abbrev: &'a [u8],
    pub alt_line: &'a [u8],
    pub alt_str: &'a [u8],
}

impl DwarfSlices<'_> {
    fn has_alt(&self) -> bool {
        !self.alt_info.is_empty()
            || !self.alt_abbrev.is_empty()
            || !self.alt_line.is_empty()
            || !self.alt_str.is_empty()
    }
}

/// Walks every compilation unit's line-number program, appending one row
/// per statement to the `DebugInfo`.
///
/// `bias` translates the DWARF's stated addresses into run-time
/// addresses. When alternate sections are present they are attached as
/// the supplementary object, so string references into the alternate
/// file resolve.
pub(crate) fn read_line_info<'a>(
    di: &mut DebugInfo,
    slices: &DwarfSlices<'a>,
    endian: Endian,
    bias: u64,
) {
    let load = |id: gimli::SectionId| -> Result<Slice<'a>, gimli::Error> {
        let data = match id {
            gimli::SectionId::DebugInfo => slices.debug_info,
            gimli::SectionId::DebugAbbrev => slices.debug_abbrev,
            gimli::SectionId::DebugLine => slices.debug_line,
            gimli::SectionId::DebugStr => slices.debug_str,
            _ => &[],
        };
        Ok(gimli::EndianSlice::new(data, endian))
    };
    let mut dwarf = match gimli::Dwarf::load(load) {
        Ok(dwarf) => dwarf,
        Err(err) => {
            debug!("warning: {err} whilst loading debug info");
            return;
        }
    };

    if slices.has_alt() {
        let load_alt = |id: gimli::SectionId| -> Result<Slice<'a>, gimli::Error> {
            let data = match id {
                gimli::SectionId::DebugInfo => slices.alt_info,
                gimli::SectionId::DebugAbbrev => slices.alt_abbrev,
                gimli::SectionId::DebugLine => slices.alt_line,
                gimli::SectionId::DebugStr => slices.alt_str,
                _ => &[],
            };
            Ok(gimli::EndianSlice::new(data, endian))
        };
        if let Err(err) = dwarf.load_sup(load_alt) {
            debug!("warning: {err} whilst loading alternate debug info");
        }
    }

    let headers: Vec<_> = match dwarf.units().collect() {
        Ok(headers) => headers,
        Err(err) => {
            debug!("warning: {err} whilst reading line info");
            return;
        }
    };
    for header in headers {
        let unit = match dwarf.unit(header) {
            Ok(unit) => unit,
            Err(err) => {
                debug!("warning: {err} whilst reading line info");
                continue;
            }
        };
        let program = match unit.line_program.clone() {
            Some(program) => program,
            None => continue,
        };

        let mut rows = program.rows();
        loop {
            match rows.next_row() {
                Ok(None) => break,
                Ok(Some((header, row))) => {
                    if row.end_sequence() {
                        continue;
                    }
                    let line = match row.line() {
                        Some(line) => line.get(),
                        None => continue,
                    };
                    let file = row
                        .file(header)
                        .and_then(|file| dwarf.attr_string(&unit, file.path_name()).ok())
                        .map(|name| String::from_utf8_lossy(name.slice()).into_owned())
                        .unwrap_or_default();
                    di.lines.push(LineRow {
                        avma: row.address().wrapping_add(bias),
                        file,
                        line,
                    });
                }
                Err(err) => {
                    debug!("warning: {err} whilst reading line info");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    /// A hand-assembled `.eh_frame` with one CIE, one FDE covering
    /// `[0x401000, 0x401100)`, and the zero terminator.
    fn sample_eh_frame() -> Vec<u8> {
        let mut data = Vec::new();

        // CIE: length 12, id 0, version 1, augmentation "", code align 1,
        // data align -8, return address register 16, three nops.
        data.extend_from_slice(&12u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(1);
        data.push(0);
        data.push(0x01);
        data.push(0x78);
        data.push(16);
        data.extend_from_slice(&[0, 0, 0]);

        // FDE: length 20, CIE pointer (distance back to the CIE), then
        // absolute initial location and range.
        data.extend_from_slice(&20u32.to_le_bytes());
        data.extend_from_slice(&20u32.to_le_bytes());
        data.extend_from_slice(&0x0040_1000u64.to_le_bytes());
        data.extend_from_slice(&0x100u64.to_le_bytes());

        // Terminator.
        data.extend_from_slice(&0u32.to_le_bytes());

        data
    }

    #[test]
    fn test_read_eh_frame() {
        let mut di = DebugInfo::default();
        let data = sample_eh_frame();
        read_callframe_info(&mut di, &data, Endian::Little, 8, 0x7000_0000, true);

        assert_eq!(
            di.cfi,
            vec![CfiRecord {
                initial_avma: 0x40_1000,
                len: 0x100,
                is_ehframe: true,
            }]
        );
    }

    /// A hand-assembled DWARF 4 pair of `.debug_info`/`.debug_abbrev`
    /// plus a `.debug_line` program yielding a single row.
    fn sample_line_sections() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        // Abbrev 1: DW_TAG_compile_unit, no children, DW_AT_stmt_list
        // with DW_FORM_sec_offset.
        let abbrev = vec![0x01, 0x11, 0x00, 0x10, 0x17, 0x00, 0x00, 0x00];

        let mut info = Vec::new();
        info.extend_from_slice(&12u32.to_le_bytes()); // unit_length
        info.extend_from_slice(&4u16.to_le_bytes()); // version
        info.extend_from_slice(&0u32.to_le_bytes()); // abbrev offset
        info.push(8); // address size
        info.push(0x01); // abbrev code
        info.extend_from_slice(&0u32.to_le_bytes()); // DW_AT_stmt_list

        let mut line = Vec::new();
        line.extend_from_slice(&52u32.to_le_bytes()); // unit_length
        line.extend_from_slice(&4u16.to_le_bytes()); // version
        line.extend_from_slice(&27u32.to_le_bytes()); // header_length
        line.push(1); // minimum_instruction_length
        line.push(1); // maximum_operations_per_instruction
        line.push(1); // default_is_stmt
        line.push(0xfb); // line_base -5
        line.push(14); // line_range
        line.push(13); // opcode_base
        line.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]);
        line.push(0); // no include directories
        line.extend_from_slice(b"a.c\0");
        line.extend_from_slice(&[0, 0, 0]); // dir, mtime, length
        line.push(0); // end of file names
        // DW_LNE_set_address 0x401000
        line.extend_from_slice(&[0x00, 0x09, 0x02]);
        line.extend_from_slice(&0x0040_1000u64.to_le_bytes());
        // DW_LNS_advance_line +2, DW_LNS_copy
        line.extend_from_slice(&[0x03, 0x02, 0x01]);
        // DW_LNS_advance_pc 0x10, DW_LNE_end_sequence
        line.extend_from_slice(&[0x02, 0x10, 0x00, 0x01, 0x01]);

        (info, abbrev, line)
    }

    #[test]
    fn test_read_line_info() {
        let (info, abbrev, line) = sample_line_sections();
        let slices = DwarfSlices {
            debug_info: &info,
            debug_abbrev: &abbrev,
            debug_line: &line,
            ..DwarfSlices::default()
        };

        let mut di = DebugInfo::default();
        read_line_info(&mut di, &slices, Endian::Little, 0x1000);

        assert_eq!(
            di.lines,
            vec![LineRow {
                avma: 0x40_2000,
                file: "a.c".into(),
                line: 3,
            }]
        );
    }
}
