//! Pixel packing kernels
//!
//! Readback memory has rows padded to the GPU pack alignment and, for YUV
//! outputs, still carries full-resolution chroma. These kernels turn it into
//! the tightly packed layout the output expects. All words are little endian.

use crate::types::{FrameLayout, PackOp};

const Y10: u32 = 0x0000_03FF;
const CB10: u32 = 0x000F_FC00;
const CR10: u32 = 0x3FF0_0000;

/// Copy `rows` rows from `src` to `dst`, honouring both row strides
///
/// Only `min(src_row, dst_row)` bytes of each row are copied, so readback
/// padding never reaches the output. Rows that do not fit either buffer are
/// skipped.
pub fn pack_buffer_copy(src: &[u8], src_row: usize, dst: &mut [u8], dst_row: usize, rows: usize) {
    if src_row == 0 || dst_row == 0 {
        return;
    }
    let width = src_row.min(dst_row);
    let rows = rows.min(src.len() / src_row).min(dst.len() / dst_row);
    if src_row == dst_row {
        let n = rows * src_row;
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }
    for (s, d) in src
        .chunks(src_row)
        .zip(dst.chunks_mut(dst_row))
        .take(rows)
    {
        d[..width].copy_from_slice(&s[..width]);
    }
}

/// 4:4:4 YCbCr bytes (Y, Cb, Cr per pixel) to 8-bit 4:2:2
///
/// `cb_first` selects Cb Y0 Cr Y1 (UYVY) over Y0 Cb Y1 Cr (YUY2). Chroma is
/// taken from the even pixel; an odd trailing pixel is paired with itself.
pub fn subsample_422_8bit(
    src: &[u8],
    src_row: usize,
    dst: &mut [u8],
    dst_row: usize,
    width: usize,
    rows: usize,
    cb_first: bool,
) {
    for (s, d) in src
        .chunks(src_row)
        .zip(dst.chunks_mut(dst_row))
        .take(rows)
    {
        for (pair, out) in d.chunks_exact_mut(4).take(width.div_ceil(2)).enumerate() {
            let x = pair * 2;
            let a = &s[x * 3..x * 3 + 3];
            let b = if x + 1 < width {
                &s[(x + 1) * 3..(x + 1) * 3 + 3]
            } else {
                a
            };
            if cb_first {
                out.copy_from_slice(&[a[1], a[0], a[2], b[0]]);
            } else {
                out.copy_from_slice(&[a[0], a[1], b[0], a[2]]);
            }
        }
    }
}

fn read_word(bytes: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn write_word(bytes: &mut [u8], index: usize, word: u32) {
    let at = index * 4;
    bytes[at..at + 4].copy_from_slice(&word.to_le_bytes());
}

/// 2_10_10_10 reversed words (Y low, Cb, Cr high) to v210
///
/// Six pixels become four words. Rows are padded to 48-pixel groups; a
/// partial group repeats its last pixel.
pub fn subsample_422_10bit(
    src: &[u8],
    src_row: usize,
    dst: &mut [u8],
    dst_row: usize,
    width: usize,
    rows: usize,
) {
    if width == 0 {
        return;
    }
    for (s, d) in src
        .chunks(src_row)
        .zip(dst.chunks_mut(dst_row))
        .take(rows)
    {
        d.fill(0);
        let groups = width.div_ceil(6);
        for group in 0..groups {
            let px = |i: usize| read_word(s, (group * 6 + i).min(width - 1));
            let y = |i: usize| px(i) & Y10;
            let cb = |i: usize| (px(i) & CB10) >> 10;
            let cr = |i: usize| (px(i) & CR10) >> 20;

            let words = [
                cb(0) | y(0) << 10 | cr(0) << 20,
                y(1) | cb(2) << 10 | y(2) << 20,
                cr(2) | y(3) << 10 | cb(4) << 20,
                y(4) | cr(4) << 10 | y(5) << 20,
            ];
            for (i, word) in words.into_iter().enumerate() {
                write_word(d, group * 4 + i, word);
            }
        }
    }
}

/// 2_10_10_10 reversed words (R low) to 10_10_10_2 words (R high)
pub fn convert_abgr10_to_rgba10(
    src: &[u8],
    src_row: usize,
    dst: &mut [u8],
    dst_row: usize,
    width: usize,
    rows: usize,
) {
    for (s, d) in src
        .chunks(src_row)
        .zip(dst.chunks_mut(dst_row))
        .take(rows)
    {
        for x in 0..width {
            let w = read_word(s, x);
            let r = w & Y10;
            let g = (w & CB10) >> 10;
            let b = (w & CR10) >> 20;
            let a = w >> 30;
            write_word(d, x, r << 22 | g << 12 | b << 2 | a);
        }
    }
}

fn y10_to_16(y: u32) -> u16 {
    let norm = (y as f32 - 64.0) / (940.0 - 64.0);
    (norm * (60160.0 - 4096.0) + 4096.0).round().clamp(0.0, 65535.0) as u16
}

fn c10_to_16(c: u32) -> u16 {
    let norm = (c as f32 - 512.0) / (960.0 - 64.0);
    (norm * (61440.0 - 4096.0) + 32768.0).round().clamp(0.0, 65535.0) as u16
}

/// 2_10_10_10 reversed words (Y low, Cb, Cr high) to P216
///
/// Writes a plane of 16-bit Y rows followed by a plane of interleaved 16-bit
/// Cb Cr rows, both with stride `dst_row`. Video range is rescaled from 10
/// to 16 bits. Chroma is taken from the even pixel; an odd trailing pixel is
/// paired with itself.
pub fn convert_yuv444_10bit_to_p216(
    src: &[u8],
    src_row: usize,
    dst: &mut [u8],
    dst_row: usize,
    width: usize,
    rows: usize,
) {
    if width == 0 || dst_row == 0 {
        return;
    }
    let rows = rows.min(dst.len() / (2 * dst_row));
    let (luma, chroma) = dst.split_at_mut(rows * dst_row);
    for ((s, y_row), c_row) in src
        .chunks(src_row)
        .zip(luma.chunks_mut(dst_row))
        .zip(chroma.chunks_mut(dst_row))
        .take(rows)
    {
        let put = |row: &mut [u8], at: usize, value: u16| {
            row[at * 2..at * 2 + 2].copy_from_slice(&value.to_le_bytes());
        };
        for x in 0..width.div_ceil(2) * 2 {
            let w = read_word(s, x.min(width - 1));
            put(y_row, x, y10_to_16(w & Y10));
            if x % 2 == 0 {
                put(c_row, x, c10_to_16((w & CB10) >> 10));
                put(c_row, x + 1, c10_to_16((w & CR10) >> 20));
            }
        }
    }
}

/// Turn one readback image into output bytes
pub fn pack(op: PackOp, layout: &FrameLayout, src: &[u8], dst: &mut [u8]) {
    let width = layout.width as usize;
    let rows = layout.height as usize;
    let (src_row, dst_row) = (layout.readback_row_bytes, layout.output_row_bytes);
    match op {
        PackOp::Copy => pack_buffer_copy(src, src_row, dst, dst_row, rows),
        PackOp::Subsample8 { cb_first } => {
            subsample_422_8bit(src, src_row, dst, dst_row, width, rows, cb_first)
        }
        PackOp::Subsample10 => subsample_422_10bit(src, src_row, dst, dst_row, width, rows),
        PackOp::Abgr10ToRgba10 => convert_abgr10_to_rgba10(src, src_row, dst, dst_row, width, rows),
        PackOp::P216 => convert_yuv444_10bit_to_p216(src, src_row, dst, dst_row, width, rows),
    }
}
