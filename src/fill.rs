// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Thread-parallel memory fill.
//
// Workers paint the whole result buffer with the background colour before
// the volume read, because the store writes only covered voxels and leaves
// gaps untouched. For large buffers that paint is worth parallelising; the
// entry points here split the buffer into disjoint chunks and fill them
// from scoped threads.

use crate::dtype::DType;

/// Buffers smaller than this are filled inline; thread spawn overhead
/// dominates below ~1 MiB.
const MIN_PARALLEL_BYTES: usize = 1 << 20;

fn effective_threads(requested: usize, len_bytes: usize) -> usize {
    if requested <= 1 || len_bytes < MIN_PARALLEL_BYTES {
        return 1;
    }
    requested
}

/// Fill `buf` with `value`, using up to `threads` worker threads.
pub fn fill_u8(buf: &mut [u8], value: u8, threads: usize) {
    let threads = effective_threads(threads, buf.len());
    if threads == 1 {
        buf.fill(value);
        return;
    }
    let chunk = (buf.len() - 1) / threads + 1;
    std::thread::scope(|s| {
        for part in buf.chunks_mut(chunk) {
            s.spawn(move || part.fill(value));
        }
    });
}

/// Fill `words` with `value`, using up to `threads` worker threads.
pub fn fill_u64(words: &mut [u64], value: u64, threads: usize) {
    let threads = effective_threads(threads, words.len() * 8);
    if threads == 1 {
        words.fill(value);
        return;
    }
    let chunk = (words.len() - 1) / threads + 1;
    std::thread::scope(|s| {
        for part in words.chunks_mut(chunk) {
            s.spawn(move || part.fill(value));
        }
    });
}

/// Scalar fallback: repeat the element bit pattern across the buffer.
/// `value` is truncated to the element width.
fn fill_scalar(buf: &mut [u8], elem_size: usize, value: u64) {
    let pattern = value.to_le_bytes();
    let pattern = &pattern[..elem_size];
    for chunk in buf.chunks_exact_mut(elem_size) {
        chunk.copy_from_slice(pattern);
    }
}

/// Fill a result buffer with a background value, dispatched by element width.
///
/// Policy:
/// 1. `value == 0` — any dtype degenerates to a byte fill of zero.
/// 2. 8-byte integral elements — 64-bit word fill, provided the buffer base
///    is 8-byte-aligned and its length a multiple of 8.
/// 3. 1-byte elements — byte fill of `value & 0xFF`.
/// 4. Anything else — scalar single-threaded fill.
pub fn fill_background(buf: &mut [u8], dtype: DType, value: u64, threads: usize) {
    if value == 0 {
        fill_u8(buf, 0, threads);
        return;
    }

    let elem_size = dtype.size_of();
    match elem_size {
        8 if dtype.is_integral() => {
            // Alignment precondition for the word fill; mmap'd result
            // buffers always satisfy it, arbitrary slices may not.
            let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u64>() };
            if prefix.is_empty() && suffix.is_empty() {
                fill_u64(words, value, threads);
            } else {
                fill_scalar(buf, elem_size, value);
            }
        }
        1 => fill_u8(buf, (value & 0xFF) as u8, threads),
        _ => fill_scalar(buf, elem_size, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u8_fill_small_and_parallel() {
        let mut buf = vec![0u8; 4096];
        fill_u8(&mut buf, 7, 4);
        assert!(buf.iter().all(|&b| b == 7));

        let mut big = vec![0u8; MIN_PARALLEL_BYTES + 13];
        fill_u8(&mut big, 0xAB, 4);
        assert!(big.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn u64_fill() {
        let mut words = vec![0u64; 1000];
        fill_u64(&mut words, 0xDEAD_BEEF_0000_0001, 2);
        assert!(words.iter().all(|&w| w == 0xDEAD_BEEF_0000_0001));
    }

    #[test]
    fn background_zero_any_dtype() {
        let mut buf = vec![0xFFu8; 64];
        fill_background(&mut buf, DType::F32, 0, 1);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn background_u64_nonzero() {
        let mut words = vec![0u64; 128];
        let nbytes = words.len() * 8;
        let buf = unsafe {
            std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, nbytes)
        };
        fill_background(buf, DType::U64, 42, 1);
        assert!(words.iter().all(|&w| w == 42));
    }

    #[test]
    fn background_u8_truncates() {
        let mut buf = vec![0u8; 32];
        fill_background(&mut buf, DType::U8, 0x1_07, 1);
        assert!(buf.iter().all(|&b| b == 0x07));
    }

    #[test]
    fn background_u16_scalar_pattern() {
        let mut buf = vec![0u8; 16];
        fill_background(&mut buf, DType::U16, 0x0102, 1);
        for pair in buf.chunks_exact(2) {
            assert_eq!(pair, &[0x02, 0x01]); // little-endian element pattern
        }
    }

    #[test]
    fn background_misaligned_u64_falls_back() {
        let mut words = vec![0u64; 9];
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, 72)
        };
        // Offset by one byte from an 8-aligned base: cannot be word-filled.
        let buf = &mut bytes[1..65];
        fill_background(buf, DType::U64, 3, 1);
        for chunk in buf.chunks_exact(8) {
            assert_eq!(u64::from_le_bytes(chunk.try_into().unwrap()), 3);
        }
    }
}
