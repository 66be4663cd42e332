//! Bit-shuffle transform and the bslz4 block format.
//!
//! A buffer of `n` elements of `elem_size` bytes is cut into blocks of
//! [`block_elements`] elements. Each block is bit-transposed (bit `k` of byte
//! `j` of every element is gathered into row `j * 8 + k`), LZ4 compressed and
//! written as a 4-byte big-endian compressed length followed by the LZ4 block.
//! A trailing partial block is rounded down to a multiple of eight elements;
//! the remaining `< 8` elements are appended uncompressed.
//!
//! The output matches `bshuf_compress_lz4` with the default block size, which
//! is what the stream consumer's decompressor expects after the 12-byte
//! header written by [`super::bslz4_header`].

use crate::error::{DetectorError, DetectorResult};

/// Target block size in bytes.
pub const TARGET_BLOCK_BYTES: usize = 8192;
/// Block lengths are multiples of this many elements.
const BLOCKED_MULT: usize = 8;
/// Smallest default block, in elements.
const MIN_BLOCK_ELEMENTS: usize = 128;

/// Default number of elements per block for a given element size.
pub fn block_elements(elem_size: usize) -> usize {
    let block = TARGET_BLOCK_BYTES / elem_size.max(1);
    let block = block - block % BLOCKED_MULT;
    block.max(MIN_BLOCK_ELEMENTS)
}

/// Bit-transposes `input` (a whole number of 8-element groups) into `out`.
pub fn bitshuffle(input: &[u8], elem_size: usize, out: &mut [u8]) {
    let n = input.len() / elem_size;
    debug_assert_eq!(n % BLOCKED_MULT, 0);
    let row_bytes = n / 8;
    out.iter_mut().for_each(|b| *b = 0);
    for i in 0..n {
        let element = &input[i * elem_size..(i + 1) * elem_size];
        for (j, &byte) in element.iter().enumerate() {
            if byte == 0 {
                continue;
            }
            for k in 0..8 {
                if (byte >> k) & 1 == 1 {
                    let row = j * 8 + k;
                    out[row * row_bytes + i / 8] |= 1 << (i % 8);
                }
            }
        }
    }
}

/// Inverse of [`bitshuffle`].
pub fn bitunshuffle(input: &[u8], elem_size: usize, out: &mut [u8]) {
    let n = input.len() / elem_size;
    let row_bytes = n / 8;
    out.iter_mut().for_each(|b| *b = 0);
    for row in 0..elem_size * 8 {
        let (j, k) = (row / 8, row % 8);
        let bits = &input[row * row_bytes..(row + 1) * row_bytes];
        for (q, &packed) in bits.iter().enumerate() {
            if packed == 0 {
                continue;
            }
            for m in 0..8 {
                if (packed >> m) & 1 == 1 {
                    let i = q * 8 + m;
                    out[i * elem_size + j] |= 1 << k;
                }
            }
        }
    }
}

fn block_sizes(n: usize, block: usize) -> impl Iterator<Item = usize> {
    let full = n / block;
    let last = n % block;
    let last = last - last % BLOCKED_MULT;
    std::iter::repeat(block)
        .take(full)
        .chain((last > 0).then_some(last))
}

/// Bit-shuffles and LZ4 compresses `raw` block by block (no header).
pub fn compress(raw: &[u8], elem_size: usize) -> DetectorResult<Vec<u8>> {
    if elem_size == 0 || raw.len() % elem_size != 0 {
        return Err(DetectorError::Encode(format!(
            "buffer of {} bytes is not a whole number of {elem_size}-byte elements",
            raw.len()
        )));
    }
    let n = raw.len() / elem_size;
    let block = block_elements(elem_size);
    let mut out = Vec::with_capacity(raw.len() / 2 + 64);
    let mut shuffled = vec![0u8; block * elem_size];

    let mut offset = 0;
    for size in block_sizes(n, block) {
        let bytes = size * elem_size;
        let chunk = &raw[offset..offset + bytes];
        bitshuffle(chunk, elem_size, &mut shuffled[..bytes]);
        let compressed = lz4_flex::block::compress(&shuffled[..bytes]);
        let len = u32::try_from(compressed.len())
            .map_err(|_| DetectorError::Encode("compressed block exceeds 4 GiB".into()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&compressed);
        offset += bytes;
    }
    // Leftover elements are copied verbatim
    out.extend_from_slice(&raw[offset..]);
    Ok(out)
}

/// Inverse of [`compress`]. `total_bytes` is the uncompressed size and
/// `block_bytes` the block size recorded in the header.
pub fn decompress(
    data: &[u8],
    elem_size: usize,
    total_bytes: usize,
    block_bytes: usize,
) -> DetectorResult<Vec<u8>> {
    if elem_size == 0 || total_bytes % elem_size != 0 {
        return Err(DetectorError::Decode(format!(
            "{total_bytes} bytes is not a whole number of {elem_size}-byte elements"
        )));
    }
    let n = total_bytes / elem_size;
    let block = if block_bytes == 0 {
        block_elements(elem_size)
    } else {
        block_bytes / elem_size
    };
    if block == 0 || block % BLOCKED_MULT != 0 {
        return Err(DetectorError::Decode(format!("invalid block size {block_bytes}")));
    }

    let mut out = Vec::with_capacity(total_bytes);
    let mut shuffled = Vec::with_capacity(block * elem_size);
    let mut pos = 0;
    for size in block_sizes(n, block) {
        let header = data
            .get(pos..pos + 4)
            .ok_or_else(|| DetectorError::Decode("truncated block header".into()))?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        pos += 4;
        let compressed = data
            .get(pos..pos + len)
            .ok_or_else(|| DetectorError::Decode("truncated block".into()))?;
        pos += len;

        let bytes = size * elem_size;
        shuffled.clear();
        shuffled.extend(
            lz4_flex::block::decompress(compressed, bytes)
                .map_err(|e| DetectorError::Decode(format!("LZ4 decompression failed: {e}")))?,
        );
        if shuffled.len() != bytes {
            return Err(DetectorError::Decode(format!(
                "block decompressed to {} bytes, expected {bytes}",
                shuffled.len()
            )));
        }
        let start = out.len();
        out.resize(start + bytes, 0);
        bitunshuffle(&shuffled, elem_size, &mut out[start..]);
    }

    let leftover = total_bytes - out.len();
    let tail = data
        .get(pos..pos + leftover)
        .ok_or_else(|| DetectorError::Decode("truncated leftover elements".into()))?;
    out.extend_from_slice(tail);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_block_sizes_match_8k_target() {
        assert_eq!(block_elements(1), 8192);
        assert_eq!(block_elements(2), 4096);
        assert_eq!(block_elements(4), 2048);
        assert_eq!(block_elements(1024), 128);
    }

    #[test]
    fn bitshuffle_gathers_bit_planes() {
        // Eight one-byte elements: only element 0 has bit 0 set, element 7 has bit 7 set.
        let input = [0x01, 0, 0, 0, 0, 0, 0, 0x80];
        let mut out = [0u8; 8];
        bitshuffle(&input, 1, &mut out);
        assert_eq!(out[0], 0x01); // bit plane 0 holds element 0
        assert_eq!(out[7], 0x80); // bit plane 7 holds element 7
        assert!(out[1..7].iter().all(|&b| b == 0));
    }

    #[test]
    fn bitshuffle_orders_rows_by_byte_then_bit() {
        // Sixteen two-byte elements, all equal to 0x0100: only bit 0 of byte 1 is set.
        let input: Vec<u8> = (0..16).flat_map(|_| 0x0100u16.to_le_bytes()).collect();
        let mut out = vec![0u8; input.len()];
        bitshuffle(&input, 2, &mut out);
        // Row 8 (byte 1, bit 0) spans two bytes and is fully set
        assert_eq!(&out[16..18], &[0xFF, 0xFF]);
        assert_eq!(out.iter().filter(|&&b| b != 0).count(), 2);
    }

    #[test]
    fn unshuffle_inverts_shuffle() {
        let input: Vec<u8> = (0..64u32).flat_map(|v| v.wrapping_mul(2654435761).to_le_bytes()).collect();
        let mut shuffled = vec![0u8; input.len()];
        let mut restored = vec![0u8; input.len()];
        bitshuffle(&input, 4, &mut shuffled);
        bitunshuffle(&shuffled, 4, &mut restored);
        assert_eq!(restored, input);
    }

    #[test]
    fn compress_handles_partial_blocks_and_leftovers() {
        // 4096 + 24 + 3 elements of 2 bytes: one full block, one partial, three raw leftovers
        let n = 4096 + 24 + 3;
        let raw: Vec<u8> = (0..n as u32).flat_map(|v| ((v % 977) as u16).to_le_bytes()).collect();
        let compressed = compress(&raw, 2).unwrap();
        assert_eq!(&compressed[compressed.len() - 6..], &raw[raw.len() - 6..]);
        let restored = decompress(&compressed, 2, raw.len(), TARGET_BLOCK_BYTES).unwrap();
        assert_eq!(restored, raw);
    }

    #[test]
    fn tiny_buffers_are_stored_raw() {
        let raw = [1u8, 0, 2, 0, 3, 0];
        let compressed = compress(&raw, 2).unwrap();
        assert_eq!(compressed, raw);
        assert_eq!(decompress(&compressed, 2, 6, TARGET_BLOCK_BYTES).unwrap(), raw);
    }

    #[test]
    fn decompress_rejects_truncated_input() {
        let raw = vec![7u8; 4096];
        let compressed = compress(&raw, 4).unwrap();
        let err = decompress(&compressed[..compressed.len() - 1], 4, raw.len(), TARGET_BLOCK_BYTES)
            .unwrap_err();
        assert!(matches!(err, DetectorError::Decode(_)));
    }
}
