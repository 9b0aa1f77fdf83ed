//! Turning logits into probabilities.

/// Numerically stable softmax.
///
/// The max logit is subtracted before exponentiating. A zero denominator
/// yields an all-zero vector instead of NaNs.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0; logits.len()];
    let Some(max) = logits.iter().copied().reduce(f32::max) else {
        return out;
    };

    let mut sum = 0.0f64;
    for (slot, &v) in out.iter_mut().zip(logits) {
        let e = f64::from(v - max).exp();
        *slot = e as f32;
        sum += e;
    }
    if sum == 0.0 || !sum.is_finite() {
        out.iter_mut().for_each(|v| *v = 0.0);
        return out;
    }
    let inv = (1.0 / sum) as f32;
    out.iter_mut().for_each(|v| *v *= inv);
    out
}

/// Index and value of the first maximum.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    let (first, rest) = values.split_first()?;
    let mut best = (0, *first);
    for (i, &v) in rest.iter().enumerate() {
        if v > best.1 {
            best = (i + 1, v);
        }
    }
    Some(best)
}
