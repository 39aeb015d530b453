//! Audio codec and conditioning primitives.
//!
//! Conversion between the G.711 telephony encodings and PCM16, linear
//! resampling with carried state, and the signal statistics used by the
//! endianness probes and DC correction in the streaming path.

pub mod analysis;
pub mod g711;
pub mod resample;

pub use analysis::{
    apply_bias, byteswap, dc_offset, probe_endianness, rms, DcBlocker, ENDIAN_PROBE_WINDOW_BYTES,
};
pub use g711::{alaw_to_pcm16le, mulaw_to_pcm16le, pcm16le_to_mulaw};
pub use resample::{resample, ResampleState};
