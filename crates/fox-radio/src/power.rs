/// Keeps log10 finite on an all-zero buffer.
const POWER_EPSILON: f64 = 1e-20;

/// Mean power of interleaved unsigned 8-bit IQ samples, in dB relative to
/// full scale on one axis.
///
/// Each byte maps to [-1, 1] around the 127.5 midpoint, so a full-scale
/// complex sample reads about +3 dB and a silent input about -200 dB. A
/// trailing unpaired byte is ignored.
pub fn iq_power_db(iq: &[u8]) -> f64 {
    let pairs = iq.len() / 2;
    if pairs == 0 {
        return 10.0 * POWER_EPSILON.log10();
    }
    let sum: f64 = iq
        .chunks_exact(2)
        .map(|p| {
            let i = (p[0] as f64 - 127.5) / 127.5;
            let q = (p[1] as f64 - 127.5) / 127.5;
            i * i + q * q
        })
        .sum();
    10.0 * (sum / pairs as f64 + POWER_EPSILON).log10()
}
