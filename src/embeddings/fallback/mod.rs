// Fallback vectors
// Low-amplitude noise returned when a real embedding cannot be produced. Never
// all-zero, and statistically far from any real embedding so it can be rejected.


use rand::Rng;

/// Components are drawn uniformly from `[-FALLBACK_AMPLITUDE, FALLBACK_AMPLITUDE]`
pub const FALLBACK_AMPLITUDE: f32 = 1e-4;

/// Vectors with mean |x| below this look like fallback noise
///
/// A unit-norm embedding of dimension d has mean |x| near 0.8 / sqrt(d), which stays
/// above 0.01 for every dimension up to 4096.
const MAX_FALLBACK_MEAN_ABS: f64 = 1e-3;
const MAX_FALLBACK_VARIANCE: f64 = 1e-6;

#[inline]
pub fn fallback_vector(dimension: usize) -> Vec<f32> {
    let mut rng = rand::rng();
    let mut vector: Vec<f32> = (0..dimension)
        .map(|_| rng.random_range(-FALLBACK_AMPLITUDE..=FALLBACK_AMPLITUDE))
        .collect();

    if vector.iter().all(|&x| x == 0.0) {
        if let Some(first) = vector.first_mut() {
            *first = FALLBACK_AMPLITUDE;
        }
    }
    vector
}

/// Detect the fallback signature: very low mean magnitude and very low variance
///
/// Empty and all-zero vectors are treated as fallback too; neither can be indexed.
#[inline]
pub fn looks_like_fallback(vector: &[f32]) -> bool {
    if vector.is_empty() {
        return true;
    }

    let n = vector.len() as f64;
    let mean = vector.iter().map(|&x| f64::from(x)).sum::<f64>() / n;
    let mean_abs = vector.iter().map(|&x| f64::from(x).abs()).sum::<f64>() / n;
    let variance = vector
        .iter()
        .map(|&x| (f64::from(x) - mean).powi(2))
        .sum::<f64>()
        / n;

    mean_abs < MAX_FALLBACK_MEAN_ABS && variance < MAX_FALLBACK_VARIANCE
}
