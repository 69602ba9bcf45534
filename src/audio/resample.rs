// Sample rate conversion using rubato
// Used for the optional fixed decode rate and for matching the output device rate

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use crate::error::{Error, Result};

/// Resample a mono buffer from `input_rate` to `output_rate`.
///
/// The resampler's filter delay is trimmed and the tail flushed, so the
/// result has `round(len * output_rate / input_rate)` samples.
pub fn resample_mono(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    if input_rate == 0 || output_rate == 0 {
        return Err(Error::InvalidParameter(format!(
            "Cannot resample between {} Hz and {} Hz",
            input_rate, output_rate
        )));
    }

    if input_rate == output_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let ratio = output_rate as f64 / input_rate as f64;
    let expected_len = (input.len() as f64 * ratio).round() as usize;

    debug!(
        "Resampling {} samples from {}Hz to {}Hz",
        input.len(),
        input_rate,
        output_rate
    );

    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0, // no runtime ratio changes
        PolynomialDegree::Septic,
        input.len(),
        1,
    )
    .map_err(|e| Error::Decode(format!("Failed to create resampler: {}", e)))?;

    let delay = resampler.output_delay();

    let mut output = resampler
        .process(&[input], None)
        .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?
        .remove(0);

    // Flush what the filter is still holding
    let tail = resampler
        .process_partial(None::<&[&[f32]]>, None)
        .map_err(|e| Error::Decode(format!("Resampler flush failed: {}", e)))?
        .remove(0);
    output.extend_from_slice(&tail);

    let mut output: Vec<f32> = output.into_iter().skip(delay).collect();
    output.resize(expected_len, 0.0);

    Ok(output)
}
