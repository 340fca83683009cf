//! LSB-first bit-field extraction for Athena packet payloads.
//!
//! Athena packs its samples at odd widths (14-bit EEG, 20-bit optical) with
//! no byte alignment.  Fields are laid out back to back starting at bit 0 of
//! the first byte, least-significant bit first within every byte:
//!
//! ```text
//! byte 0          byte 1
//! 7 6 5 4 3 2 1 0 7 6 5 4 3 2 1 0
//! b7 ...       b0 . . b13 ...  b8      ← first 14-bit field
//! ```
//!
//! Both extractors are total: they never index past the slice and simply
//! return fewer values when the input is short.

/// Largest field width the extractors support.
pub const MAX_BIT_WIDTH: usize = 32;

/// Unpack consecutive `bit_width`-bit unsigned integers from `data`.
///
/// Returns `floor(data.len() * 8 / bit_width)` values; a trailing partial
/// field is dropped.  A `bit_width` of 0 or above [`MAX_BIT_WIDTH`] yields an
/// empty vector.
///
/// ```
/// # use athena_rs::bits::extract_unsigned;
/// // 0x0c, 0x02 → low 14 bits = 0x020c
/// assert_eq!(extract_unsigned(&[0x0c, 0x02], 14), vec![0x020c]);
/// ```
pub fn extract_unsigned(data: &[u8], bit_width: usize) -> Vec<u32> {
    if bit_width == 0 || bit_width > MAX_BIT_WIDTH {
        return Vec::new();
    }
    let count = data.len() * 8 / bit_width;
    let mut out = Vec::with_capacity(count);

    // Shift register: bytes enter at the top, fields leave from the bottom.
    let mut acc: u64 = 0;
    let mut held = 0usize;
    let mut bytes = data.iter();
    let mask: u64 = (1u64 << bit_width) - 1;

    for _ in 0..count {
        while held < bit_width {
            // `count` guarantees enough bytes remain for every full field.
            let Some(&b) = bytes.next() else {
                return out;
            };
            acc |= u64::from(b) << held;
            held += 8;
        }
        out.push((acc & mask) as u32);
        acc >>= bit_width;
        held -= bit_width;
    }
    out
}

/// Unpack consecutive `bit_width`-bit two's-complement integers from `data`.
///
/// Uses [`extract_unsigned`] and sign-extends each field: a raw value at or
/// above `2^(bit_width − 1)` becomes `raw − 2^bit_width`.
///
/// ```
/// # use athena_rs::bits::extract_signed;
/// assert_eq!(extract_signed(&[0xff, 0xff, 0x01, 0x00], 16), vec![-1, 1]);
/// ```
pub fn extract_signed(data: &[u8], bit_width: usize) -> Vec<i32> {
    extract_unsigned(data, bit_width)
        .into_iter()
        .map(|raw| sign_extend(raw, bit_width))
        .collect()
}

fn sign_extend(raw: u32, bit_width: usize) -> i32 {
    let raw = i64::from(raw);
    let half = 1i64 << (bit_width - 1);
    let v = if raw >= half { raw - (1i64 << bit_width) } else { raw };
    v as i32
}
