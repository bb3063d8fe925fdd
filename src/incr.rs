//! Big-endian byte-sequence increment.
//!
//! Treats a fixed-width byte string as an unsigned big-endian integer and
//! materializes runs of consecutive values. The sorted sets use this to fill
//! freshly inserted ranges in one pass.

/// Increment `b` in place as a big-endian integer, wrapping on overflow.
pub fn increment_in_place(b: &mut [u8]) {
    for byte in b.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Fill `data` with consecutive big-endian values starting at `base`.
///
/// `data[i*w..(i+1)*w]` receives `base + i` modulo `2^(8w)` where `w` is
/// `base.len()`. Widths 4, 8 and 16 take integer fast paths; any other
/// width falls back to a ripple-carry copy loop.
///
/// Panics if `data.len()` is not a multiple of `base.len()`; record slots
/// are a caller invariant, not an input.
pub fn increment_bytes(base: &[u8], data: &mut [u8]) {
    assert!(
        !base.is_empty() && data.len() % base.len() == 0,
        "invalid data length"
    );

    match base.len() {
        4 => fill_u32(base, data),
        8 => fill_u64(base, data),
        16 => fill_u128(base, data),
        _ => fill_fallback(base, data),
    }
}

fn fill_u32(base: &[u8], data: &mut [u8]) {
    let mut value = u32::from_be_bytes(base.try_into().expect("width checked by caller"));
    for chunk in data.chunks_exact_mut(4) {
        chunk.copy_from_slice(&value.to_be_bytes());
        value = value.wrapping_add(1);
    }
}

fn fill_u64(base: &[u8], data: &mut [u8]) {
    let mut value = u64::from_be_bytes(base.try_into().expect("width checked by caller"));
    for chunk in data.chunks_exact_mut(8) {
        chunk.copy_from_slice(&value.to_be_bytes());
        value = value.wrapping_add(1);
    }
}

fn fill_u128(base: &[u8], data: &mut [u8]) {
    let mut value = u128::from_be_bytes(base.try_into().expect("width checked by caller"));
    for chunk in data.chunks_exact_mut(16) {
        chunk.copy_from_slice(&value.to_be_bytes());
        value = value.wrapping_add(1);
    }
}

fn fill_fallback(base: &[u8], data: &mut [u8]) {
    let mut current = base.to_vec();
    for chunk in data.chunks_exact_mut(base.len()) {
        chunk.copy_from_slice(&current);
        increment_in_place(&mut current);
    }
}
