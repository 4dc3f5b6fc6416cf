//! Locating and validating separate debuginfo companions.
//!
//! A stripped object advertises its debug companion either through a GNU
//! build-id note or a `.gnu_debuglink` section naming a file and its
//! CRC-32. The search tries the well-known filesystem locations in order
//! and, when configured, an extra search path and a debuginfo server.
//! Every candidate is validated against the advertised build-id or CRC
//! before being accepted; a failed candidate is simply dropped and the
//! next location tried.

use debugid::CodeId;
use tracing::{debug, trace};

use crate::base::Config;
use crate::elf::find_build_id_note;
use crate::error::ElfError;
use crate::image::{Image, ImageSlice};
use crate::target::TargetPolicy;

/// Extracts the object's build-id as a lowercase hex string.
pub(crate) fn find_buildid(
    img: &Image,
    target: &TargetPolicy,
    rel_ok: bool,
    search_shdrs: bool,
) -> Option<String> {
    find_build_id_note(img, target, rel_ok, search_shdrs)
        .filter(|desc| !desc.is_empty())
        .map(|desc| CodeId::from_binary(&desc).to_string())
}

/// Parses a `.gnu_debuglink` payload: a NUL-terminated filename, padding
/// to the next 4-byte boundary, then the companion's CRC-32.
pub(crate) fn parse_debuglink(
    slice: &ImageSlice<'_>,
    little_endian: bool,
) -> Option<(String, u32)> {
    let img = slice.image();
    let name_len = img.cstr_len(slice.offset())?;
    let crc_offset = (name_len + 1 + 3) & !3;
    if crc_offset + 4 > slice.size() {
        return None;
    }

    let crc = img.get_u32(slice.offset() + crc_offset, little_endian)?;
    let name = img
        .read_cstr(slice.offset())
        .map(|name| String::from_utf8_lossy(name).into_owned())?;
    Some((name, crc))
}

/// Parses a `.gnu_debugaltlink` payload: a NUL-terminated path followed
/// by the raw build-id of the alternate object. Returns the build-id as
/// lowercase hex.
pub(crate) fn parse_debugaltlink(slice: &ImageSlice<'_>) -> Option<String> {
    let data = slice.data();
    let nul = data.iter().position(|&byte| byte == 0)?;
    let buildid = &data[nul + 1..];
    if buildid.is_empty() {
        return None;
    }
    Some(CodeId::from_binary(buildid).to_string())
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Opens a candidate debug file, rejecting it unless it matches the
/// requested build-id (when given) or the requested CRC-32 (otherwise).
/// A rejection is never fatal; the caller moves on to the next
/// candidate.
///
/// With `server` set, `name` is a plain basename fetched from the
/// debuginfo server; otherwise it is a path in the local filesystem.
fn open_debug_file(
    name: &str,
    buildid: Option<&str>,
    crc: u32,
    rel_ok: bool,
    server: Option<&str>,
    target: &TargetPolicy,
    cfg: &Config,
) -> Result<Image, ElfError> {
    let dimg = match server {
        Some(server) => Image::from_server(name, server).map_err(ElfError::ImageOpen)?,
        None => Image::from_local_file(name).map_err(ElfError::ImageOpen)?,
    };

    if cfg.verbosity > 1 {
        match server {
            Some(server) => debug!("  Considering {name} on server {server} .."),
            None => debug!("  Considering {name} .."),
        }
    }

    if let Some(buildid) = buildid {
        // The debug file's own program headers may be absent or broken,
        // so note sections are searched as well.
        let debug_buildid = find_buildid(&dimg, target, rel_ok, true);
        if debug_buildid.as_deref() != Some(buildid) {
            debug!(
                "  .. build-id mismatch (found {} wanted {buildid})",
                debug_buildid.as_deref().unwrap_or("none")
            );
            return Err(ElfError::CompanionMismatch);
        }
        debug!("  .. build-id is valid");
    } else {
        let calccrc = dimg.gnu_debuglink_crc32();
        if calccrc != crc {
            debug!("  .. CRC mismatch (computed {calccrc:08x} wanted {crc:08x})");
            return Err(ElfError::CompanionMismatch);
        }
        debug!("  .. CRC is valid");
    }

    Ok(dimg)
}

/// Tries to find a separate debug file for the given object.
///
/// A build-id, when present, names the canonical location under
/// `/usr/lib/debug/.build-id/`. Failing that, a CRC-validated debuglink
/// name is searched next to the object, in its `.debug` subdirectory,
/// under `/usr/lib/debug`, under the extra debuginfo path, and finally on
/// the debuginfo server.
pub(crate) fn find_debug_file(
    objpath: &str,
    buildid: Option<&str>,
    debugname: Option<&str>,
    crc: u32,
    rel_ok: bool,
    target: &TargetPolicy,
    cfg: &Config,
) -> Option<Image> {
    let extrapath = cfg
        .extra_debuginfo_path
        .as_ref()
        .map(|path| path.to_string_lossy().into_owned());
    let serverpath = cfg.debuginfo_server.as_deref();

    if let Some(buildid) = buildid {
        if buildid.len() >= 2 {
            let debugpath = format!(
                "/usr/lib/debug/.build-id/{}/{}.debug",
                &buildid[..2],
                &buildid[2..]
            );
            if let Ok(dimg) =
                open_debug_file(&debugpath, Some(buildid), 0, rel_ok, None, target, cfg)
            {
                trace!("------ Found a debuginfo file: {debugpath}");
                return Some(dimg);
            }
        }
    }

    let debugname = match debugname {
        Some(debugname) if !rel_ok => debugname,
        _ => return None,
    };

    let objdir = match objpath.rfind('/') {
        Some(index) => &objpath[..index],
        None => objpath,
    };

    let mut candidates = vec![
        format!("{objdir}/{debugname}"),
        format!("{objdir}/.debug/{debugname}"),
        format!("/usr/lib/debug{objdir}/{debugname}"),
    ];
    if let Some(ref extrapath) = extrapath {
        candidates.push(format!("{extrapath}{objdir}/{debugname}"));
    }

    for debugpath in &candidates {
        if let Ok(dimg) = open_debug_file(debugpath, None, crc, rel_ok, None, target, cfg) {
            trace!("------ Found a debuginfo file: {debugpath}");
            return Some(dimg);
        }
    }

    if let Some(serverpath) = serverpath {
        // When looking on the debuginfo server, always just pass the
        // basename.
        let basename = basename(debugname);
        if let Ok(dimg) =
            open_debug_file(basename, None, crc, rel_ok, Some(serverpath), target, cfg)
        {
            trace!("------ Found a debuginfo file: {basename} on {serverpath}");
            return Some(dimg);
        }
    }

    None
}

/// Last-ditch companion search: check only the extra debuginfo path and
/// the debuginfo server, without any consistency check. Only used with
/// `allow_mismatched_debuginfo`; the caller very likely fails later if
/// the companion does not actually match.
pub(crate) fn find_debug_file_ad_hoc(objpath: &str, cfg: &Config) -> Option<Image> {
    if let Some(ref extrapath) = cfg.extra_debuginfo_path {
        let debugpath = format!("{}/{objpath}", extrapath.to_string_lossy());
        if let Ok(dimg) = Image::from_local_file(&debugpath) {
            if cfg.verbosity > 1 {
                debug!("  Using (POSSIBLY MISMATCHED) {debugpath}");
            }
            trace!("------ Found an ad_hoc debuginfo file: {debugpath}");
            return Some(dimg);
        }
    }

    if let Some(ref serverpath) = cfg.debuginfo_server {
        let basename = basename(objpath);
        if let Ok(dimg) = Image::from_server(basename, serverpath) {
            if cfg.verbosity > 1 {
                debug!("  Using (POSSIBLY MISMATCHED) {basename} on {serverpath}");
            }
            trace!("------ Found an ad_hoc debuginfo file: {basename} on {serverpath}");
            return Some(dimg);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn test_parse_debuglink() {
        // "foo.debug\0" + 2 bytes padding + CRC.
        let mut payload = b"foo.debug\0\0\0".to_vec();
        payload.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        let img = Image::from_vec("t", payload);
        let slice = ImageSlice::new(&img, 0, img.size()).unwrap();

        let (name, crc) = parse_debuglink(&slice, true).unwrap();
        assert_eq!(name, "foo.debug");
        assert_eq!(crc, 0xdead_beef);
    }

    #[test]
    fn test_parse_debuglink_truncated() {
        let img = Image::from_vec("t", b"foo.debug\0\0\0".to_vec());
        let slice = ImageSlice::new(&img, 0, img.size()).unwrap();
        assert!(parse_debuglink(&slice, true).is_none());
    }

    #[test]
    fn test_parse_debugaltlink() {
        let mut payload = b"../../.dwz/libfoo.debug\0".to_vec();
        payload.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        let img = Image::from_vec("t", payload);
        let slice = ImageSlice::new(&img, 0, img.size()).unwrap();

        assert_eq!(parse_debugaltlink(&slice).unwrap(), "aabbcc");

        let img = Image::from_vec("t", b"path-only\0".to_vec());
        let slice = ImageSlice::new(&img, 0, img.size()).unwrap();
        assert!(parse_debugaltlink(&slice).is_none());
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/usr/lib/libfoo.so"), "libfoo.so");
        assert_eq!(basename("libfoo.so"), "libfoo.so");
    }

    /// A minimal ELF carrying only an NT_GNU_BUILD_ID note.
    fn elf_with_buildid(desc: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 144];
        data[0..4].copy_from_slice(b"\x7fELF");
        data[4] = 2; // ELFCLASS64
        data[5] = 1; // ELFDATA2LSB
        data[6] = 1; // EV_CURRENT
        data[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        data[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        data[20..24].copy_from_slice(&1u32.to_le_bytes());
        data[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        data[40..48].copy_from_slice(&64u64.to_le_bytes()); // e_shoff
        data[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        data[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        data[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
        data[60..62].copy_from_slice(&1u16.to_le_bytes()); // e_shnum
        data[62..64].copy_from_slice(&1u16.to_le_bytes()); // e_shstrndx

        // One PT_NOTE segment pointing at the note at offset 120.
        let filesz = (12 + 4 + ((desc.len() + 3) & !3)) as u64;
        data[64..68].copy_from_slice(&4u32.to_le_bytes()); // PT_NOTE
        data[68..72].copy_from_slice(&4u32.to_le_bytes()); // PF_R
        data[72..80].copy_from_slice(&120u64.to_le_bytes());
        data[96..104].copy_from_slice(&filesz.to_le_bytes());
        data[104..112].copy_from_slice(&filesz.to_le_bytes());

        data[120..124].copy_from_slice(&4u32.to_le_bytes());
        data[124..128].copy_from_slice(&(desc.len() as u32).to_le_bytes());
        data[128..132].copy_from_slice(&3u32.to_le_bytes()); // NT_GNU_BUILD_ID
        data[132..136].copy_from_slice(b"GNU\0");
        data[136..136 + desc.len()].copy_from_slice(desc);
        data
    }

    #[test]
    fn test_open_debug_file_validates_buildid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cand.debug");
        std::fs::write(&path, elf_with_buildid(&[0xaa, 0xbb, 0xdd])).unwrap();
        let path = path.to_str().unwrap();
        let target = TargetPolicy::amd64_linux();
        let cfg = Config::default();

        // The candidate's build-id disagrees with the requested one.
        assert!(matches!(
            open_debug_file(path, Some("aabbcc"), 0, false, None, &target, &cfg),
            Err(ElfError::CompanionMismatch)
        ));
        // Byte-for-byte match is accepted.
        assert!(open_debug_file(path, Some("aabbdd"), 0, false, None, &target, &cfg).is_ok());
    }

    #[test]
    fn test_open_debug_file_validates_crc() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cand.debug");
        std::fs::write(&path, b"123456789").unwrap();
        let path = path.to_str().unwrap();
        let target = TargetPolicy::amd64_linux();
        let cfg = Config::default();

        assert!(open_debug_file(path, None, 0xcbf4_3926, false, None, &target, &cfg).is_ok());
        assert!(matches!(
            open_debug_file(path, None, 0xdead_beef, false, None, &target, &cfg),
            Err(ElfError::CompanionMismatch)
        ));
    }

    #[test]
    fn test_find_debug_file_missing() {
        let cfg = Config::default();
        let target = TargetPolicy::amd64_linux();
        assert!(find_debug_file(
            "/nonexistent/libfoo.so",
            None,
            Some("libfoo.so.debug"),
            0,
            false,
            &target,
            &cfg,
        )
        .is_none());
    }
}
