//! The executable image as seen by the loader: a segment table plus what is
//! needed to start it. ELF decoding itself is delegated to `xmas_elf`.

use std::convert::Infallible;
use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use xmas_elf::header;
use xmas_elf::program::{self, ProgramHeader};
use xmas_elf::ElfFile;

use crate::arith;
use crate::error::LoaderError;
use crate::rt;
use crate::segment::{Segment, SegmentPerms, SegmentTable};
use crate::stack;

/// Location of the program header table inside the loaded image, for the
/// auxiliary vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeaders {
    pub addr: u64,
    pub entry_size: u16,
    pub count: u16,
}

#[derive(Debug)]
pub struct ExecutableImage {
    path: String,
    entry: u64,
    program_headers: Option<ProgramHeaders>,
    segments: SegmentTable,
}

impl ExecutableImage {
    pub fn new(path: impl Into<String>, entry: u64, segments: SegmentTable) -> Self {
        ExecutableImage {
            path: path.into(),
            entry,
            program_headers: None,
            segments,
        }
    }

    pub fn with_program_headers(mut self, headers: ProgramHeaders) -> Self {
        self.program_headers = Some(headers);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn program_headers(&self) -> Option<ProgramHeaders> {
        self.program_headers
    }

    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }
}

pub fn parse(path: &Path) -> Result<ExecutableImage, LoaderError> {
    let name = path.display().to_string();
    let file = File::open(path).map_err(|source| LoaderError::Open {
        path: name.clone(),
        source,
    })?;
    parse_file(&name, &file)
}

/// Parses through an already open descriptor, so the table describes exactly
/// the file that later backs the faults even if `name` is replaced meanwhile.
pub fn parse_file(name: &str, file: &File) -> Result<ExecutableImage, LoaderError> {
    let read_err = |source| LoaderError::Read {
        path: name.to_string(),
        source,
    };
    let len = file.metadata().map_err(read_err)?.len();
    let len = arith::checked_usize(len).ok_or_else(|| LoaderError::Parse {
        path: name.to_string(),
        reason: format!("file size 0x{len:x} does not fit the address space"),
    })?;

    let mut bytes = vec![0u8; len];
    file.read_exact_at(&mut bytes, 0).map_err(read_err)?;
    parse_bytes(name, &bytes, rt::page_size())
}

fn host_machine() -> Option<header::Machine> {
    if cfg!(target_arch = "x86_64") {
        Some(header::Machine::X86_64)
    } else if cfg!(target_arch = "aarch64") {
        Some(header::Machine::AArch64)
    } else {
        None
    }
}

/// Builds the segment table for an in-memory ELF file.
///
/// Every `PT_LOAD` header with a non-zero memory size becomes one segment, in
/// header order, widened down to a page boundary. Images whose segments would
/// share a page are rejected, since the fault path relies on each page
/// belonging to exactly one segment.
pub fn parse_bytes(name: &str, bytes: &[u8], page_size: usize) -> Result<ExecutableImage, LoaderError> {
    let malformed = |reason: &str| LoaderError::Parse {
        path: name.to_string(),
        reason: reason.to_string(),
    };
    let unsupported = |reason: &str| LoaderError::Unsupported {
        path: name.to_string(),
        reason: reason.to_string(),
    };

    let elf = ElfFile::new(bytes).map_err(malformed)?;

    if elf.header.pt1.class() != header::Class::SixtyFour {
        return Err(unsupported("only 64-bit images are supported"));
    }
    if elf.header.pt1.data() != header::Data::LittleEndian {
        return Err(unsupported("only little-endian images are supported"));
    }
    if elf.header.pt2.type_().as_type() != header::Type::Executable {
        return Err(unsupported("only statically linked ET_EXEC images can be demand-loaded"));
    }
    let machine = elf.header.pt2.machine().as_machine();
    if Some(machine) != host_machine() {
        return Err(unsupported(&format!("machine {machine:?} does not match the host")));
    }

    let mut segments = Vec::new();
    let mut loads: Vec<(u64, u64, u64)> = Vec::new();
    let mut phdr_vaddr = None;

    for index in 0..elf.header.pt2.ph_count() {
        let ph = elf.program_header(index).map_err(malformed)?;
        match ph.get_type().map_err(malformed)? {
            program::Type::Load => {
                if ph.mem_size() == 0 {
                    continue;
                }
                segments.push(normalize(&ph, bytes.len(), page_size, name)?);
                loads.push((ph.offset(), ph.virtual_addr(), ph.file_size()));
            }
            program::Type::Phdr => phdr_vaddr = Some(ph.virtual_addr()),
            program::Type::Interp => {
                return Err(unsupported("dynamically linked images (PT_INTERP) are not supported"));
            }
            // The image's libc mprotects its RELRO range during startup,
            // before those pages have ever been touched, and exits on failure.
            program::Type::GnuRelro => {
                return Err(unsupported("PT_GNU_RELRO images are not supported; link with -z norelro"));
            }
            _ => {}
        }
    }

    if segments.is_empty() {
        return Err(LoaderError::NoLoadableSegments {
            path: name.to_string(),
        });
    }
    check_disjoint(&segments, page_size, name)?;

    let ph_offset = elf.header.pt2.ph_offset();
    let phdr_addr = phdr_vaddr.or_else(|| {
        loads
            .iter()
            .find(|(off, _, filesz)| ph_offset >= *off && ph_offset < off.saturating_add(*filesz))
            .map(|(off, vaddr, _)| vaddr + (ph_offset - off))
    });

    let mut image = ExecutableImage::new(name, elf.header.pt2.entry_point(), SegmentTable::new(segments));
    if let Some(addr) = phdr_addr {
        image = image.with_program_headers(ProgramHeaders {
            addr,
            entry_size: elf.header.pt2.ph_entry_size(),
            count: elf.header.pt2.ph_count(),
        });
    }

    log::info!(
        "parsed {name}: entry=0x{:x} segments={}",
        image.entry(),
        image.segments().len()
    );
    Ok(image)
}

fn normalize(ph: &ProgramHeader, file_len: usize, page_size: usize, name: &str) -> Result<Segment, LoaderError> {
    let malformed = |reason: String| LoaderError::Parse {
        path: name.to_string(),
        reason,
    };

    let too_big = || malformed(format!("segment at 0x{:x} does not fit the address space", ph.virtual_addr()));
    let vaddr = arith::checked_usize(ph.virtual_addr()).ok_or_else(too_big)?;
    let mem_size = arith::checked_usize(ph.mem_size()).ok_or_else(too_big)?;
    let file_size = arith::checked_usize(ph.file_size()).ok_or_else(too_big)?;
    let offset = ph.offset();

    if file_size > mem_size {
        return Err(malformed(format!(
            "segment at 0x{vaddr:x} has file size 0x{file_size:x} > memory size 0x{mem_size:x}"
        )));
    }
    if vaddr.checked_add(mem_size).is_none() {
        return Err(too_big());
    }
    let file_end = arith::checked_usize(offset).and_then(|off| off.checked_add(file_size));
    if file_end.map_or(true, |end| end > file_len) {
        return Err(malformed(format!(
            "segment at 0x{vaddr:x} reads past the end of the file (offset 0x{offset:x}, size 0x{file_size:x})"
        )));
    }

    let delta = arith::align_offset(vaddr, page_size);
    if (offset % page_size as u64) as usize != delta {
        return Err(LoaderError::Unsupported {
            path: name.to_string(),
            reason: format!("segment at 0x{vaddr:x} has offset 0x{offset:x} not congruent to its address"),
        });
    }

    Ok(Segment::new(
        vaddr - delta,
        mem_size + delta,
        offset - delta as u64,
        file_size + delta,
        SegmentPerms::from_elf_flags(ph.flags()),
    ))
}

fn check_disjoint(segments: &[Segment], page_size: usize, name: &str) -> Result<(), LoaderError> {
    let mut order: Vec<usize> = (0..segments.len()).collect();
    order.sort_by_key(|&i| segments[i].vaddr);

    for pair in order.windows(2) {
        let (first, second) = (&segments[pair[0]], &segments[pair[1]]);
        let first_end = arith::align_up(first.end(), page_size).unwrap_or(usize::MAX);
        if first_end > second.vaddr {
            return Err(LoaderError::OverlappingSegments {
                path: name.to_string(),
                first: pair[0].min(pair[1]),
                second: pair[0].max(pair[1]),
                page: second.vaddr,
            });
        }
    }
    Ok(())
}

/// Builds the initial stack and jumps to the entry point. No image page is
/// touched here; the first instruction fetch is the first fault.
pub fn start(image: &ExecutableImage, argv: &[OsString]) -> Result<Infallible, LoaderError> {
    if !rt::ENTER_SUPPORTED {
        return Err(LoaderError::UnsupportedArch(env::consts::ARCH));
    }

    let envp: Vec<OsString> = env::vars_os()
        .map(|(key, value)| {
            let mut pair = key;
            pair.push("=");
            pair.push(value);
            pair
        })
        .collect();

    let sp = stack::build_initial_stack(image, argv, &envp, rt::page_size())?;
    log::info!("entering {} at 0x{:x} (sp=0x{sp:x})", image.path(), image.entry());
    unsafe { rt::enter(image.entry(), sp) }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const PG: usize = 0x1000;

    #[cfg(target_arch = "x86_64")]
    const HOST_MACHINE: u16 = 62;
    #[cfg(target_arch = "aarch64")]
    const HOST_MACHINE: u16 = 183;
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    const HOST_MACHINE: u16 = 0;

    pub struct Phdr {
        pub p_type: u32,
        pub flags: u32,
        pub offset: u64,
        pub vaddr: u64,
        pub filesz: u64,
        pub memsz: u64,
    }

    pub fn load(flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> Phdr {
        Phdr {
            p_type: 1,
            flags,
            offset,
            vaddr,
            filesz,
            memsz,
        }
    }

    /// Minimal ELF64 little-endian file: header, program headers, then zero
    /// padding up to `file_len`.
    pub fn elf_bytes(e_type: u16, machine: u16, entry: u64, phdrs: &[Phdr], file_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&e_type.to_le_bytes());
        out.extend_from_slice(&machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&(phdrs.len() as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        for ph in phdrs {
            out.extend_from_slice(&ph.p_type.to_le_bytes());
            out.extend_from_slice(&ph.flags.to_le_bytes());
            out.extend_from_slice(&ph.offset.to_le_bytes());
            out.extend_from_slice(&ph.vaddr.to_le_bytes());
            out.extend_from_slice(&ph.vaddr.to_le_bytes());
            out.extend_from_slice(&ph.filesz.to_le_bytes());
            out.extend_from_slice(&ph.memsz.to_le_bytes());
            out.extend_from_slice(&(PG as u64).to_le_bytes());
        }

        if out.len() < file_len {
            out.resize(file_len, 0);
        }
        out
    }

    fn exec(phdrs: &[Phdr], file_len: usize) -> Vec<u8> {
        elf_bytes(2, HOST_MACHINE, 0x40_1000, phdrs, file_len)
    }

    #[test]
    fn parses_load_segments_in_order() {
        let bytes = exec(
            &[
                load(0x5, 0, 0x40_0000, 0x1800, 0x1800),
                load(0x6, 0x2000, 0x40_3000, 0x100, 0x3000),
            ],
            0x3000,
        );
        let image = parse_bytes("prog", &bytes, PG).unwrap();

        assert_eq!(image.entry(), 0x40_1000);
        assert_eq!(image.segments().len(), 2);

        let text = image.segments().get(0).unwrap();
        assert_eq!(text.vaddr, 0x40_0000);
        assert_eq!(text.mem_size, 0x1800);
        assert_eq!(text.file_size, 0x1800);
        assert_eq!(text.perms, SegmentPerms::READ | SegmentPerms::EXEC);

        let data = image.segments().get(1).unwrap();
        assert_eq!(data.file_offset, 0x2000);
        assert_eq!(data.file_size, 0x100);
        assert_eq!(data.mem_size, 0x3000);
        assert_eq!(data.perms, SegmentPerms::READ | SegmentPerms::WRITE);

        let headers = image.program_headers().unwrap();
        assert_eq!(headers.addr, 0x40_0040);
        assert_eq!(headers.count, 2);
        assert_eq!(headers.entry_size, 56);
    }

    #[test]
    fn widens_unaligned_segments_to_page_boundaries() {
        let bytes = exec(&[load(0x6, 0x1e10, 0x40_2e10, 0x100, 0x400)], 0x2000);
        let image = parse_bytes("prog", &bytes, PG).unwrap();
        let seg = image.segments().get(0).unwrap();

        assert_eq!(seg.vaddr, 0x40_2000);
        assert_eq!(seg.file_offset, 0x1000);
        assert_eq!(seg.file_size, 0xe10 + 0x100);
        assert_eq!(seg.mem_size, 0xe10 + 0x400);
    }

    #[test]
    fn skips_empty_load_segments() {
        let bytes = exec(
            &[load(0x4, 0, 0x40_0000, 0x100, 0x100), load(0x6, 0, 0x50_0000, 0, 0)],
            0x1000,
        );
        assert_eq!(parse_bytes("prog", &bytes, PG).unwrap().segments().len(), 1);
    }

    #[test]
    fn rejects_file_size_larger_than_memory_size() {
        let bytes = exec(&[load(0x4, 0, 0x40_0000, 0x200, 0x100)], 0x1000);
        assert!(matches!(parse_bytes("prog", &bytes, PG), Err(LoaderError::Parse { .. })));
    }

    #[test]
    fn rejects_segments_sharing_a_page() {
        let bytes = exec(
            &[
                load(0x5, 0, 0x40_0000, 0x800, 0x800),
                load(0x6, 0x900, 0x40_0900, 0x100, 0x100),
            ],
            0x1000,
        );
        assert!(matches!(
            parse_bytes("prog", &bytes, PG),
            Err(LoaderError::OverlappingSegments {
                first: 0,
                second: 1,
                page: 0x40_0000,
                ..
            })
        ));
    }

    #[test]
    fn rejects_file_extent_past_eof() {
        let bytes = exec(&[load(0x4, 0x1000, 0x40_0000, 0x2000, 0x2000)], 0x1000);
        assert!(matches!(parse_bytes("prog", &bytes, PG), Err(LoaderError::Parse { .. })));
    }

    #[test]
    fn rejects_incongruent_offset() {
        let bytes = exec(&[load(0x4, 0x10, 0x40_0000, 0x100, 0x100)], 0x1000);
        assert!(matches!(parse_bytes("prog", &bytes, PG), Err(LoaderError::Unsupported { .. })));
    }

    #[test]
    fn rejects_shared_objects() {
        let bytes = elf_bytes(3, HOST_MACHINE, 0x1000, &[load(0x5, 0, 0, 0x100, 0x100)], 0x1000);
        assert!(matches!(parse_bytes("lib.so", &bytes, PG), Err(LoaderError::Unsupported { .. })));
    }

    #[test]
    fn rejects_images_without_load_segments() {
        let bytes = exec(&[], 0x100);
        assert!(matches!(
            parse_bytes("prog", &bytes, PG),
            Err(LoaderError::NoLoadableSegments { .. })
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_bytes("junk", b"definitely not an executable, but long enough to hold a header......", PG),
            Err(LoaderError::Parse { .. })
        ));
    }

    #[test]
    fn rejects_relro_images() {
        let relro = Phdr {
            p_type: 0x6474_e552,
            flags: 0x4,
            offset: 0x1000,
            vaddr: 0x40_1000,
            filesz: 0x100,
            memsz: 0x100,
        };
        let bytes = exec(&[load(0x6, 0x1000, 0x40_1000, 0x100, 0x100), relro], 0x2000);
        match parse_bytes("prog", &bytes, PG) {
            Err(LoaderError::Unsupported { reason, .. }) => assert!(reason.contains("PT_GNU_RELRO")),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = parse(Path::new("/nonexistent/lazyload-test-image")).unwrap_err();
        assert!(matches!(err, LoaderError::Open { .. }));
    }

    #[test]
    fn parses_through_the_open_descriptor() {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&exec(&[load(0x5, 0, 0x40_0000, 0x800, 0x800)], 0x1000))
            .unwrap();
        let file = File::open(tmp.path()).unwrap();

        // Replace the path with something unparseable after opening.
        let path = tmp.path().to_path_buf();
        drop(tmp);
        std::fs::write(&path, b"not an elf").unwrap();

        let image = parse_file("prog", &file).unwrap();
        assert_eq!(image.segments().len(), 1);
        assert_eq!(image.entry(), 0x40_1000);
        assert!(parse(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
