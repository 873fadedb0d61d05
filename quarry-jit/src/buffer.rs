//! The code buffer: bytes, labels, fixups, and the write-then-execute
//! mapping.
//!
//! Code and data share one buffer. Forward references go through rel32
//! fixups (jumps, calls, RIP-relative leas) resolved before mapping, and
//! through 8-byte absolute relocations (pointer globals, embedded labels)
//! patched once the final base address is known.

use quarry_khir::BackendError;

/// An offset-to-be into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// `(patch_at, target)`: rel32 relative to the end of the 4-byte slot.
    rel32_fixups: Vec<(usize, Label)>,
    /// `(patch_at, target)`: absolute 8-byte slots, patched after mapping.
    abs64_relocs: Vec<(usize, Label)>,
    /// First byte of the text section; everything before it (mutable
    /// globals included) stays writable after finalisation.
    code_start: usize,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            labels: Vec::new(),
            rel32_fixups: Vec::new(),
            abs64_relocs: Vec::new(),
            code_start: 0,
        }
    }

    /// Ends the data section: code emitted from here on lands on its own
    /// pages and is the only part flipped to read-execute.
    pub fn begin_code(&mut self) {
        self.align(PAGE_SIZE);
        self.code_start = self.bytes.len();
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Binds `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0 as usize].is_none());
        self.labels[label.0 as usize] = Some(self.bytes.len());
    }

    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels[label.0 as usize]
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Emits a 4-byte slot that will hold `target - end_of_slot`.
    pub fn emit_rel32(&mut self, target: Label) {
        self.rel32_fixups.push((self.bytes.len(), target));
        self.emit_u32(0);
    }

    /// Emits an 8-byte slot that will hold the absolute address of
    /// `target` once the buffer is mapped.
    pub fn emit_abs64(&mut self, target: Label) {
        self.abs64_relocs.push((self.bytes.len(), target));
        self.emit_u64(0);
    }

    /// Overwrites a previously emitted 32-bit immediate in place.
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Pads with zero bytes to the given alignment.
    pub fn align(&mut self, align: usize) {
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
    }

    /// Resolves fixups and maps the buffer read-execute.
    pub fn finalize(mut self) -> Result<ExecBuffer, BackendError> {
        for &(at, target) in &self.rel32_fixups {
            let offset = self.labels[target.0 as usize]
                .ok_or_else(|| BackendError::BackendBuildFailed("unbound label".into()))?;
            let rel = offset as i64 - (at as i64 + 4);
            let rel = i32::try_from(rel).map_err(|_| {
                BackendError::BackendBuildFailed("jump displacement overflow".into())
            })?;
            self.bytes[at..at + 4].copy_from_slice(&rel.to_le_bytes());
        }

        let exec = ExecBuffer::map(&self.bytes, self.code_start, |base, bytes| {
            for &(at, target) in &self.abs64_relocs {
                let offset = self.labels[target.0 as usize]
                    .ok_or_else(|| BackendError::BackendBuildFailed("unbound label".into()))?;
                let addr = base as u64 + offset as u64;
                bytes[at..at + 8].copy_from_slice(&addr.to_le_bytes());
            }
            Ok(())
        })?;
        Ok(exec)
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Executable memory owned by the backend instance.
#[derive(Debug)]
pub struct ExecBuffer {
    base: *mut u8,
    len: usize,
}

// Only the generated code itself writes into the mapping (its data
// pages), and the driver is single-threaded.
unsafe impl Send for ExecBuffer {}
unsafe impl Sync for ExecBuffer {}

const PAGE_SIZE: usize = 4096;

impl ExecBuffer {
    fn map(
        bytes: &[u8],
        code_start: usize,
        relocate: impl FnOnce(*mut u8, &mut [u8]) -> Result<(), BackendError>,
    ) -> Result<Self, BackendError> {
        let len = bytes.len().div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;

        // SAFETY: anonymous private mapping, length checked above.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(BackendError::BackendBuildFailed("mmap failed".into()));
        }
        let base = base.cast::<u8>();

        // SAFETY: the mapping is writable and at least `bytes.len()` long.
        let slice = unsafe { std::slice::from_raw_parts_mut(base, len) };
        slice[..bytes.len()].copy_from_slice(bytes);
        if let Err(e) = relocate(base, slice) {
            // SAFETY: unmapping the region mapped above.
            unsafe { libc::munmap(base.cast(), len) };
            return Err(e);
        }

        // SAFETY: flipping the fully written text pages to read-execute;
        // the data pages in front stay read-write.
        debug_assert_eq!(code_start % PAGE_SIZE, 0);
        let rc = unsafe {
            libc::mprotect(
                base.add(code_start).cast(),
                len - code_start,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            // SAFETY: unmapping the region mapped above.
            unsafe { libc::munmap(base.cast(), len) };
            return Err(BackendError::BackendBuildFailed("mprotect failed".into()));
        }

        Ok(Self { base, len })
    }

    /// Address of the byte at `offset`.
    pub fn entry(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.len);
        // SAFETY: offset checked against the mapping length.
        unsafe { self.base.add(offset) }
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        // SAFETY: unmapping the region owned by this buffer.
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}
