use crate::quantization::cache::CalibrationView;
use crate::quantization::config::Granularity;

/// `(min, max)` of a slice. Empty slices give `(0, 0)`.
pub fn extrema(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Per-row `(min, max)` of a calibration view.
pub fn row_extrema(view: &CalibrationView) -> (Vec<f32>, Vec<f32>) {
    view.iter_rows().map(extrema).unzip()
}

/// Pull the minimum of a non-negative unit down to exactly zero.
pub fn anchor_non_negative(min_val: &mut [f32]) {
    for m in min_val.iter_mut().filter(|m| **m >= 0.0) {
        *m = 0.0;
    }
}

/// Mean squared error between `pred` and `tgt`, one value per row of `view`
/// for channelwise statistics, a single value for layerwise.
pub fn mse_loss(pred: &[f32], tgt: &CalibrationView, granularity: Granularity) -> Vec<f32> {
    let sq = |(p, t): (&f32, &f32)| (p - t) * (p - t);
    match granularity {
        Granularity::Channelwise => pred
            .chunks(tgt.cols().max(1))
            .zip(tgt.iter_rows())
            .map(|(p, t)| p.iter().zip(t).map(sq).sum::<f32>() / t.len().max(1) as f32)
            .collect(),
        Granularity::Layerwise => {
            let total = pred.iter().zip(tgt.data()).map(sq).sum::<f32>();
            vec![total / tgt.numel().max(1) as f32]
        }
    }
}

/// Clip every row to its `[lo, hi]`, snap to the `scale` grid and return the
/// reconstruction.
pub fn clip_round_trip(
    view: &CalibrationView,
    min_val: &[f32],
    max_val: &[f32],
    scale: &[f32],
) -> Vec<f32> {
    let mut out = Vec::with_capacity(view.numel());
    for (r, row) in view.iter_rows().enumerate() {
        let (lo, hi, s) = (min_val[r], max_val[r], scale[r]);
        out.extend(row.iter().map(|&x| (x.clamp(lo, hi) / s).round_ties_even() * s));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::cache::CalibrationCache;
    use crate::Tensor;

    fn view(data: Vec<f32>, shape: &[usize], granularity: Granularity) -> CalibrationView {
        let mut cache = CalibrationCache::new(Some(0));
        cache.add(&Tensor::new(data, shape)).unwrap();
        cache.get_data_for_calibration(granularity).unwrap()
    }

    #[test]
    fn test_extrema() {
        assert_eq!(extrema(&[3.0, -2.0, 5.0]), (-2.0, 5.0));
        assert_eq!(extrema(&[]), (0.0, 0.0));
    }

    #[test]
    fn test_anchor_non_negative() {
        let mut m = vec![0.5, -1.0, 0.0];
        anchor_non_negative(&mut m);
        assert_eq!(m, vec![0.0, -1.0, 0.0]);
    }

    #[test]
    fn test_mse_loss_by_granularity() {
        let v = view(vec![0.0, 0.0, 1.0, 1.0], &[2, 2], Granularity::Channelwise);
        let pred = vec![1.0, 1.0, 1.0, 1.0];
        assert_eq!(mse_loss(&pred, &v, Granularity::Channelwise), vec![1.0, 0.0]);

        let v = view(vec![0.0, 0.0, 1.0, 1.0], &[2, 2], Granularity::Layerwise);
        assert_eq!(mse_loss(&pred, &v, Granularity::Layerwise), vec![0.5]);
    }

    #[test]
    fn test_clip_round_trip() {
        let v = view(vec![-3.0, 0.26, 0.74, 9.0], &[1, 4], Granularity::Layerwise);
        let out = clip_round_trip(&v, &[-1.0], &[1.0], &[0.5]);
        assert_eq!(out, vec![-1.0, 0.5, 0.5, 1.0]);
    }
}
