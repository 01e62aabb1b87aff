use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{MemoryError, Result};

/// Word-granular backing storage for one mapped GPU range.
///
/// All accesses go through atomics: whole-word accesses are single loads/stores, partial-word
/// writes merge with a compare-exchange loop so concurrent writers of neighbouring bytes never
/// clobber each other.
pub struct Region {
    gpu_base: u64,
    size: u64,
    words: Box<[AtomicU32]>,
}

impl Region {
    pub fn new(gpu_base: u64, size: u64) -> Self {
        let word_count = size.div_ceil(4) as usize;
        let words = (0..word_count).map(|_| AtomicU32::new(0)).collect();
        Self {
            gpu_base,
            size,
            words,
        }
    }

    pub fn gpu_base(&self) -> u64 {
        self.gpu_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, gpu_address: u64, len: u64) -> bool {
        gpu_address >= self.gpu_base
            && gpu_address
                .checked_add(len)
                .is_some_and(|end| end <= self.gpu_base + self.size)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    fn check_word(&self, offset: u64, len: u64) -> Result<usize> {
        self.check_range(offset, len)?;
        if offset % 4 != 0 {
            return Err(MemoryError::Unaligned {
                address: self.gpu_base + offset,
                alignment: 4,
            });
        }
        Ok((offset / 4) as usize)
    }

    pub fn load_u32(&self, offset: u64) -> Result<u32> {
        let index = self.check_word(offset, 4)?;
        Ok(self.words[index].load(Ordering::Acquire))
    }

    pub fn store_u32(&self, offset: u64, value: u32) -> Result<()> {
        let index = self.check_word(offset, 4)?;
        self.words[index].store(value, Ordering::Release);
        Ok(())
    }

    /// Low word first; the two halves are not published atomically as a pair.
    pub fn load_u64(&self, offset: u64) -> Result<u64> {
        let index = self.check_word(offset, 8)?;
        let lo = self.words[index].load(Ordering::Acquire) as u64;
        let hi = self.words[index + 1].load(Ordering::Acquire) as u64;
        Ok(lo | (hi << 32))
    }

    pub fn store_u64(&self, offset: u64, value: u64) -> Result<()> {
        let index = self.check_word(offset, 8)?;
        self.words[index + 1].store((value >> 32) as u32, Ordering::Release);
        self.words[index].store(value as u32, Ordering::Release);
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len() as u64)?;

        let mut pos = offset as usize;
        let mut done = 0;
        while done < dst.len() {
            let in_word = pos % 4;
            let n = (4 - in_word).min(dst.len() - done);
            let bytes = self.words[pos / 4].load(Ordering::Acquire).to_le_bytes();
            dst[done..done + n].copy_from_slice(&bytes[in_word..in_word + n]);
            done += n;
            pos += n;
        }
        Ok(())
    }

    pub fn write_bytes(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len() as u64)?;

        let mut pos = offset as usize;
        let mut done = 0;
        while done < src.len() {
            let in_word = pos % 4;
            let n = (4 - in_word).min(src.len() - done);
            let word = &self.words[pos / 4];
            if n == 4 {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&src[done..done + 4]);
                word.store(u32::from_le_bytes(bytes), Ordering::Release);
            } else {
                let part = &src[done..done + n];
                let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                    let mut bytes = old.to_le_bytes();
                    bytes[in_word..in_word + n].copy_from_slice(part);
                    Some(u32::from_le_bytes(bytes))
                });
            }
            done += n;
            pos += n;
        }
        Ok(())
    }

    pub(crate) fn word(&self, index: usize) -> &AtomicU32 {
        &self.words[index]
    }

    pub fn fill(&self, value: u32) {
        for word in self.words.iter() {
            word.store(value, Ordering::Release);
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("gpu_base", &format_args!("{:#x}", self.gpu_base))
            .field("size", &self.size)
            .finish()
    }
}
