use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;

use crate::arith::align_down;
use crate::error::LoaderError;
use crate::image::ExecutableImage;
use crate::rt;

const STACK_SIZE: usize = 8 * 1024 * 1024;

/// Maps a fresh stack and lays out `argc`, `argv`, `envp` and the auxiliary
/// vector on it. Returns the initial stack pointer.
pub fn build_initial_stack(
    image: &ExecutableImage,
    argv: &[OsString],
    envp: &[OsString],
    page_size: usize,
) -> Result<usize, LoaderError> {
    let random = random_bytes()?;
    let base = rt::rt_mmap_rw(STACK_SIZE, libc::MAP_STACK)
        .map_err(|e| LoaderError::StackSetup(format!("mmap of {STACK_SIZE} bytes failed: {e}")))?;
    let region = unsafe { std::slice::from_raw_parts_mut(base, STACK_SIZE) };

    let layout = StackLayout {
        argv,
        envp,
        auxv: auxv_for(image, page_size),
        random,
    };
    layout.write(region, base as usize)
}

fn auxv_for(image: &ExecutableImage, page_size: usize) -> Vec<(u64, u64)> {
    let mut auxv = Vec::with_capacity(6);
    if let Some(headers) = image.program_headers() {
        auxv.push((libc::AT_PHDR as u64, headers.addr));
        auxv.push((libc::AT_PHENT as u64, u64::from(headers.entry_size)));
        auxv.push((libc::AT_PHNUM as u64, u64::from(headers.count)));
    }
    auxv.push((libc::AT_PAGESZ as u64, page_size as u64));
    auxv.push((libc::AT_ENTRY as u64, image.entry()));
    auxv
}

/// The image's libc seeds its stack protector and pointer guard from these.
fn random_bytes() -> Result<[u8; 16], LoaderError> {
    let mut out = [0u8; 16];
    rt::rt_getrandom(&mut out).map_err(|e| LoaderError::StackSetup(format!("getrandom failed: {e}")))?;
    Ok(out)
}

/// Contents of the initial process stack, independent of where it lives.
pub struct StackLayout<'a> {
    pub argv: &'a [OsString],
    pub envp: &'a [OsString],
    /// Entries besides `AT_RANDOM`, `AT_EXECFN` and the terminator, which
    /// `write` adds itself.
    pub auxv: Vec<(u64, u64)>,
    pub random: [u8; 16],
}

impl StackLayout<'_> {
    /// Writes the layout into `region`, which is mapped at `region_base`.
    /// Strings go at the top, vectors below them; the returned stack pointer
    /// is 16-byte aligned and points at `argc`.
    pub fn write(&self, region: &mut [u8], region_base: usize) -> Result<usize, LoaderError> {
        let mut stack = StackWriter {
            cursor: region.len(),
            region,
            base: region_base,
        };

        let random_addr = stack.push_bytes(&self.random)?;
        let argv_ptrs = self
            .argv
            .iter()
            .map(|arg| stack.push_cstr(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp_ptrs = self
            .envp
            .iter()
            .map(|var| stack.push_cstr(var.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut words = Vec::with_capacity(argv_ptrs.len() + envp_ptrs.len() + 2 * self.auxv.len() + 10);
        words.push(argv_ptrs.len() as u64);
        words.extend(argv_ptrs.iter().copied());
        words.push(0);
        words.extend(envp_ptrs.iter().copied());
        words.push(0);
        for &(key, value) in &self.auxv {
            words.extend([key, value]);
        }
        words.extend([libc::AT_RANDOM as u64, random_addr]);
        if let Some(&execfn) = argv_ptrs.first() {
            words.extend([libc::AT_EXECFN as u64, execfn]);
        }
        words.extend([libc::AT_NULL as u64, 0]);

        stack.push_words(&words)
    }
}

struct StackWriter<'a> {
    region: &'a mut [u8],
    base: usize,
    cursor: usize,
}

impl StackWriter<'_> {
    fn reserve(&mut self, len: usize) -> Result<usize, LoaderError> {
        self.cursor = self
            .cursor
            .checked_sub(len)
            .ok_or_else(|| LoaderError::StackSetup("startup stack overflow".to_string()))?;
        Ok(self.cursor)
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<u64, LoaderError> {
        let off = self.reserve(bytes.len())?;
        self.region[off..off + bytes.len()].copy_from_slice(bytes);
        Ok((self.base + off) as u64)
    }

    fn push_cstr(&mut self, bytes: &[u8]) -> Result<u64, LoaderError> {
        let off = self.reserve(bytes.len() + 1)?;
        self.region[off..off + bytes.len()].copy_from_slice(bytes);
        self.region[off + bytes.len()] = 0;
        Ok((self.base + off) as u64)
    }

    /// Places `words` so the first one lands on a 16-byte aligned address.
    fn push_words(&mut self, words: &[u64]) -> Result<usize, LoaderError> {
        let overflow = || LoaderError::StackSetup("startup stack overflow".to_string());
        let top = self.base + self.cursor;
        let bytes = words.len() * 8;
        let sp = top.checked_sub(bytes).map(|sp| align_down(sp, 16)).ok_or_else(overflow)?;
        if sp < self.base {
            return Err(overflow());
        }

        let mut off = sp - self.base;
        for word in words {
            self.region[off..off + 8].copy_from_slice(&word.to_le_bytes());
            off += 8;
        }
        self.cursor = sp - self.base;
        Ok(sp)
    }
}
