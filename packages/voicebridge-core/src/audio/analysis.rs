//! PCM16 signal statistics and corrective filters.
//!
//! Everything here operates on PCM16 little-endian byte buffers. The
//! endianness probe compares signal statistics of a buffer against its
//! byte-swapped twin: genuine speech has moderate RMS and near-zero DC
//! offset, while byte-swapped speech reads as loud noise centred off zero.

/// Maximum probe window in bytes (~60 ms at 8 kHz PCM16).
pub const ENDIAN_PROBE_WINDOW_BYTES: usize = 960;

/// Root-mean-square amplitude of PCM16 little-endian samples.
pub fn rms(pcm: &[u8]) -> u32 {
    let mut sum_sq: u64 = 0;
    let mut count: u64 = 0;
    for pair in pcm.chunks_exact(2) {
        let sample = i64::from(i16::from_le_bytes([pair[0], pair[1]]));
        sum_sq += (sample * sample) as u64;
        count += 1;
    }
    if count == 0 {
        return 0;
    }
    ((sum_sq / count) as f64).sqrt() as u32
}

/// Mean sample value (DC offset) of PCM16 little-endian samples.
pub fn dc_offset(pcm: &[u8]) -> i32 {
    let mut sum: i64 = 0;
    let mut count: i64 = 0;
    for pair in pcm.chunks_exact(2) {
        sum += i64::from(i16::from_le_bytes([pair[0], pair[1]]));
        count += 1;
    }
    if count == 0 {
        return 0;
    }
    (sum / count) as i32
}

/// Swaps the byte order of every 16-bit sample.
///
/// A trailing odd byte is carried through unchanged.
pub fn byteswap(pcm: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len());
    let pairs = pcm.chunks_exact(2);
    let tail = pairs.remainder();
    for pair in pairs {
        out.push(pair[1]);
        out.push(pair[0]);
    }
    out.extend_from_slice(tail);
    out
}

/// Adds a constant bias to every PCM16 sample, saturating at the i16 range.
pub fn apply_bias(pcm: &[u8], bias: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len());
    for pair in pcm.chunks_exact(2) {
        let sample = i32::from(i16::from_le_bytes([pair[0], pair[1]]));
        let biased = (sample + bias).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        out.extend_from_slice(&biased.to_le_bytes());
    }
    out
}

/// Decides whether a PCM16 buffer is more plausible byte-swapped.
///
/// Examines at most [`ENDIAN_PROBE_WINDOW_BYTES`]. Swapped wins when either:
/// - its RMS dominates: `rms_swapped ≥ max(1024, 4 × rms_native)`, or
/// - the native buffer carries a large DC offset the swapped one lacks:
///   `|dc_native| ≥ 8 × |dc_swapped|` and `rms_swapped ≥ max(256, rms_native / 2)`.
pub fn probe_endianness(pcm: &[u8]) -> bool {
    let window = &pcm[..pcm.len().min(ENDIAN_PROBE_WINDOW_BYTES)];
    if window.len() < 2 {
        return false;
    }

    let swapped = byteswap(window);
    let rms_native = rms(window);
    let rms_swapped = rms(&swapped);
    let dc_native = dc_offset(window).unsigned_abs();
    let dc_swapped = dc_offset(&swapped).unsigned_abs();

    if rms_swapped >= 1024.max(4 * rms_native.max(1)) {
        return true;
    }
    dc_native >= 8 * dc_swapped.max(1) && rms_swapped >= 256.max(rms_native / 2)
}

/// First-order DC-blocking filter: `y[n] = x[n] − x[n−1] + r·y[n−1]`.
///
/// State persists across chunks so the filter stays continuous over a
/// whole stream. `r = 0.995` gives a ~6 Hz corner at 8 kHz.
#[derive(Debug, Clone, Copy, Default)]
pub struct DcBlocker {
    last_x: i32,
    last_y: i32,
}

impl DcBlocker {
    const R: f32 = 0.995;

    pub fn new() -> Self {
        Self::default()
    }

    /// Filters a PCM16 little-endian buffer in place of a copy.
    pub fn process(&mut self, pcm: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(pcm.len());
        let (mut x1, mut y1) = (self.last_x, self.last_y);
        for pair in pcm.chunks_exact(2) {
            let x0 = i32::from(i16::from_le_bytes([pair[0], pair[1]]));
            let y0 = (x0 - x1 + (Self::R * y1 as f32) as i32)
                .clamp(i32::from(i16::MIN), i32::from(i16::MAX));
            out.extend_from_slice(&(y0 as i16).to_le_bytes());
            x1 = x0;
            y1 = y0;
        }
        self.last_x = x1;
        self.last_y = y1;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Sine-ish test tone at the given amplitude.
    fn tone(amplitude: i16, len: usize) -> Vec<u8> {
        let samples: Vec<i16> = (0..len)
            .map(|i| {
                let phase = i as f32 * 0.25;
                (phase.sin() * f32::from(amplitude)) as i16
            })
            .collect();
        pcm(&samples)
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&pcm(&[0; 160])), 0);
    }

    #[test]
    fn rms_of_constant_equals_magnitude() {
        assert_eq!(rms(&pcm(&[1000; 160])), 1000);
        assert_eq!(rms(&pcm(&[-1000; 160])), 1000);
    }

    #[test]
    fn dc_offset_of_constant() {
        assert_eq!(dc_offset(&pcm(&[512; 100])), 512);
        assert_eq!(dc_offset(&pcm(&[-512; 100])), -512);
    }

    #[test]
    fn byteswap_is_involution() {
        let input = tone(8000, 100);
        assert_eq!(byteswap(&byteswap(&input)), input);
    }

    #[test]
    fn byteswap_keeps_odd_tail() {
        let out = byteswap(&[1, 2, 3]);
        assert_eq!(out, vec![2, 1, 3]);
    }

    #[test]
    fn bias_saturates() {
        let out = apply_bias(&pcm(&[32000]), 2000);
        assert_eq!(i16::from_le_bytes([out[0], out[1]]), i16::MAX);
    }

    #[test]
    fn probe_prefers_native_for_normal_speech() {
        // Loud zero-DC signal: swapped view gains no RMS advantage and the
        // native view has no DC offset to correct.
        let samples: Vec<i16> = (0..240)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect();
        assert!(!probe_endianness(&pcm(&samples)));
    }

    #[test]
    fn probe_detects_swapped_speech() {
        // Bytes [0x40, 0x00] read natively as 64 but byte-swapped as 16384:
        // the buffer is only plausible in the swapped order.
        let suspect: Vec<u8> = std::iter::repeat([0x40u8, 0x00u8])
            .take(240)
            .flatten()
            .collect();
        assert_eq!(rms(&suspect), 64);
        assert_eq!(rms(&byteswap(&suspect)), 16384);
        assert!(probe_endianness(&suspect));
    }

    #[test]
    fn probe_detects_dc_heavy_native_view() {
        // Native view: constant-ish ~4200 with a large DC offset. Swapped
        // view: ±16384-ish centred signal. The RMS criterion just misses
        // (16384 < 4 × 4224) but the DC criterion catches it.
        let suspect: Vec<u8> = (0..240)
            .flat_map(|i| {
                if i % 2 == 0 {
                    [0x40u8, 0x10u8]
                } else {
                    [0xC0u8, 0x10u8]
                }
            })
            .collect();
        let swapped = byteswap(&suspect);
        assert!(rms(&swapped) < 4 * rms(&suspect));
        assert!(dc_offset(&suspect).unsigned_abs() >= 8 * dc_offset(&swapped).unsigned_abs());
        assert!(probe_endianness(&suspect));
    }

    #[test]
    fn probe_on_empty_is_false() {
        assert!(!probe_endianness(&[]));
        assert!(!probe_endianness(&[0x01]));
    }

    #[test]
    fn dc_blocker_removes_constant_offset() {
        let mut blocker = DcBlocker::new();
        // Feed a long constant-offset signal; output should decay to ~0.
        let mut last = 0i16;
        for _ in 0..50 {
            let out = blocker.process(&pcm(&[1000; 160]));
            let tail = &out[out.len() - 2..];
            last = i16::from_le_bytes([tail[0], tail[1]]);
        }
        assert!(last.abs() < 50, "residual DC after decay: {last}");
    }

    #[test]
    fn dc_blocker_passes_transitions() {
        let mut blocker = DcBlocker::new();
        let out = blocker.process(&pcm(&[0, 10000]));
        let second = i16::from_le_bytes([out[2], out[3]]);
        assert!(second > 9000, "step transition attenuated: {second}");
    }
}
