//! OS-backed randomness for jitter and trace sampling.

/// Uniform sample in `[0, 1)`.
///
/// Falls back to `0.5` if the OS entropy source is unavailable; callers only
/// use this for jitter and sampling, never for anything security-relevant.
pub fn unit_f64() -> f64 {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        return 0.5;
    }
    (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_in_unit_interval() {
        for _ in 0..1_000 {
            let x = unit_f64();
            assert!((0.0..1.0).contains(&x), "sample out of range: {x}");
        }
    }
}
