//! Length-accurate linear resampling for PCM16 little-endian audio.
//!
//! The resampler is deliberately simple: telephony audio tops out at 8 kHz of
//! useful bandwidth, so linear interpolation between neighbouring samples is
//! transparent for this material while keeping the output length exactly
//! predictable (`ceil(input_samples × dst/src)` samples per chunk).
//!
//! State carries the last sample of the previous chunk so that chunk
//! boundaries interpolate against real history instead of repeating the
//! first sample of the new chunk.

/// Carried state for chunked resampling.
///
/// Holds the final sample of the previous chunk; the next chunk's first
/// output samples interpolate from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleState {
    pub last_sample: i16,
}

/// Resamples PCM16 little-endian audio from `src_hz` to `dst_hz`.
///
/// Returns the converted bytes and the state to pass with the next chunk.
/// When `src_hz == dst_hz` the input is returned unchanged and the state
/// resets to `None`. Supported rates are anything non-zero; callers in this
/// crate use 8000/16000/24000/48000.
///
/// Output length contract: `ceil(input_samples × dst_hz / src_hz)` samples.
pub fn resample(
    pcm: &[u8],
    src_hz: u32,
    dst_hz: u32,
    state: Option<ResampleState>,
) -> (Vec<u8>, Option<ResampleState>) {
    if src_hz == dst_hz || src_hz == 0 || dst_hz == 0 {
        return (pcm.to_vec(), None);
    }

    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|p| i16::from_le_bytes([p[0], p[1]]))
        .collect();
    if samples.is_empty() {
        return (Vec::new(), state);
    }

    let in_n = samples.len() as u64;
    let out_n = (in_n * u64::from(dst_hz)).div_ceil(u64::from(src_hz)) as usize;

    // Virtual source array: [prev, s0, s1, …, s(n-1)]. Output position i
    // maps to (i+1)·src/dst source samples past `prev`, clamped at the end
    // of the chunk.
    let prev = state.map_or(samples[0], |s| s.last_sample);
    let sample_at = |idx: usize| -> i32 {
        if idx == 0 {
            i32::from(prev)
        } else {
            i32::from(samples[(idx - 1).min(samples.len() - 1)])
        }
    };

    let mut out = Vec::with_capacity(out_n * 2);
    for i in 0..out_n {
        let pos_num = (i as u64 + 1) * u64::from(src_hz);
        let idx = (pos_num / u64::from(dst_hz)) as usize;
        let frac_num = pos_num % u64::from(dst_hz);

        let value = if frac_num == 0 {
            sample_at(idx)
        } else {
            let s0 = sample_at(idx);
            let s1 = sample_at(idx + 1);
            s0 + ((s1 - s0) * frac_num as i32) / dst_hz as i32
        };
        out.extend_from_slice(&(value as i16).to_le_bytes());
    }

    let next_state = ResampleState {
        last_sample: samples[samples.len() - 1],
    };
    (out, Some(next_state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn same_rate_is_identity_with_null_state() {
        let input = pcm(&[1, 2, 3, 4]);
        let (out, state) = resample(&input, 8000, 8000, None);
        assert_eq!(out, input);
        assert_eq!(state, None);
    }

    #[test]
    fn upsample_doubles_length() {
        let input = pcm(&[0, 1000, 2000, 3000]);
        let (out, state) = resample(&input, 8000, 16000, None);
        assert_eq!(out.len(), input.len() * 2);
        assert_eq!(state, Some(ResampleState { last_sample: 3000 }));
    }

    #[test]
    fn downsample_halves_length() {
        let input = pcm(&[0, 1000, 2000, 3000, 4000, 5000, 6000, 7000]);
        let (out, _) = resample(&input, 16000, 8000, None);
        assert_eq!(out.len(), input.len() / 2);
    }

    #[test]
    fn odd_ratio_rounds_up() {
        // 5 samples at 8k → 24k: ceil(5 × 3) = 15 samples.
        let input = pcm(&[0, 1, 2, 3, 4]);
        let (out, _) = resample(&input, 8000, 24000, None);
        assert_eq!(out.len() / 2, 15);

        // 5 samples at 24k → 8k: ceil(5 / 3) = 2 samples.
        let (out, _) = resample(&input, 24000, 8000, None);
        assert_eq!(out.len() / 2, 2);
    }

    #[test]
    fn chunked_length_matches_whole_within_one_sample_per_chunk() {
        let full: Vec<i16> = (0..480).map(|i| (i * 13 % 2000) as i16).collect();
        let input = pcm(&full);

        let (whole, _) = resample(&input, 8000, 16000, None);

        let mut state = None;
        let mut chunked = Vec::new();
        for chunk in input.chunks(100) {
            let (out, next) = resample(chunk, 8000, 16000, state);
            chunked.extend_from_slice(&out);
            state = next;
        }
        // ceil() per chunk may add at most one sample per chunk boundary.
        let chunks = input.len().div_ceil(100);
        assert!(
            chunked.len().abs_diff(whole.len()) <= chunks * 2,
            "chunked={} whole={}",
            chunked.len(),
            whole.len()
        );
    }

    #[test]
    fn state_carries_across_chunk_boundary() {
        // A ramp split in two must stay monotone at the seam when upsampled.
        let first = pcm(&[0, 100, 200, 300]);
        let second = pcm(&[400, 500, 600, 700]);

        let (out1, state) = resample(&first, 8000, 16000, None);
        let (out2, _) = resample(&second, 8000, 16000, state);

        let all: Vec<i16> = out1
            .iter()
            .chain(out2.iter())
            .copied()
            .collect::<Vec<u8>>()
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        for window in all.windows(2) {
            assert!(
                window[1] >= window[0],
                "ramp not monotone at seam: {:?}",
                all
            );
        }
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let (out, state) = resample(&[], 8000, 16000, None);
        assert!(out.is_empty());
        assert_eq!(state, None);
    }
}
