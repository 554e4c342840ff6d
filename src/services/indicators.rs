/// Simple moving average aligned with `values`.
/// - `None` until `window` values have been seen
/// - `Some(avg)` afterwards
pub fn sma(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }

    // Running sum; subtract the value that falls out of the window.
    values
        .iter()
        .enumerate()
        .scan(0.0_f64, move |sum, (i, &v)| {
            *sum += v;
            if i >= window {
                *sum -= values[i - window];
            }
            Some((i + 1 >= window).then(|| *sum / window as f64))
        })
        .collect()
}

/// Apply `f` to every full trailing window. Leading positions are `None`.
pub fn rolling<F>(values: &[f64], window: usize, f: F) -> Vec<Option<f64>>
where
    F: Fn(&[f64]) -> f64,
{
    if window == 0 || window > values.len() {
        return vec![None; values.len()];
    }

    std::iter::repeat(None)
        .take(window - 1)
        .chain(values.windows(window).map(|w| Some(f(w))))
        .collect()
}

/// Exponentially weighted mean with `alpha = 2 / (span + 1)`, recursive form.
///
/// Missing inputs before the first observation stay missing. A missing input
/// after that carries the previous value forward.
pub fn ewm(values: &[Option<f64>], span: usize) -> Vec<Option<f64>> {
    let alpha = 2.0 / (span.max(1) as f64 + 1.0);

    values
        .iter()
        .scan(None::<f64>, move |prev, v| {
            let next = match (*prev, *v) {
                (None, x) => x,
                (Some(p), Some(x)) => Some(alpha * x + (1.0 - alpha) * p),
                (Some(p), None) => Some(p),
            };
            *prev = next;
            Some(next)
        })
        .collect()
}

/// Quantile with linear interpolation between closest ranks.
/// Returns `None` for an empty slice. Non-finite values are ignored.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Percent change from the previous value; the first element is 0.
pub fn pct_change(values: &[f64]) -> Vec<f64> {
    std::iter::once(0.0)
        .chain(values.windows(2).map(|w| {
            if w[0] != 0.0 {
                w[1] / w[0] - 1.0
            } else {
                0.0
            }
        }))
        .take(values.len())
        .collect()
}
