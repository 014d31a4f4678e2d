use ndarray::prelude::*;
use ndarray::{Data, Zip};

/// Dice overlap `2|A∩B| / (|A|+|B|)` of the foreground. NaN when the ground
/// truth is empty, so empty slices never count as perfect or failed.
pub fn dice<S1, S2, D>(pred: &ArrayBase<S1, D>, gt: &ArrayBase<S2, D>) -> f32
where
    S1: Data<Elem = bool>,
    S2: Data<Elem = bool>,
    D: Dimension,
{
    let mut inter = 0usize;
    let mut pred_sum = 0usize;
    let mut gt_sum = 0usize;
    Zip::from(pred).and(gt).for_each(|&p, &g| {
        pred_sum += p as usize;
        gt_sum += g as usize;
        inter += (p && g) as usize;
    });

    if gt_sum == 0 {
        return f32::NAN;
    }
    2.0 * inter as f32 / (pred_sum + gt_sum) as f32
}

/// Per-frame Dice along the last axis of `[H, W, D]` masks, `None` for frames
/// whose ground truth is empty.
pub fn frame_dice(pred: ArrayView3<bool>, gt: ArrayView3<bool>) -> Vec<Option<f32>> {
    pred.axis_iter(Axis(2))
        .zip(gt.axis_iter(Axis(2)))
        .map(|(p, g)| g.iter().any(|&v| v).then(|| dice(&p, &g)))
        .collect()
}

/// Frame with the lowest Dice among scored frames; the earliest wins ties.
pub fn worst_frame(scores: &[Option<f32>]) -> Option<(usize, f32)> {
    let mut worst: Option<(usize, f32)> = None;
    for (idx, score) in scores.iter().enumerate() {
        if let Some(score) = *score {
            if worst.map_or(true, |(_, lowest)| score < lowest) {
                worst = Some((idx, score));
            }
        }
    }
    worst
}

/// Max over non-NaN values, NaN when there are none.
pub fn nan_max<'a>(values: impl IntoIterator<Item = &'a f32>) -> f32 {
    values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold(f32::NAN, |acc, &v| if acc.is_nan() || v > acc { v } else { acc })
}

/// Mean over non-NaN values, NaN when there are none.
pub fn nan_mean<'a>(values: impl IntoIterator<Item = &'a f32>) -> f32 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0f64, 0usize), |(sum, count), &v| (sum + v as f64, count + 1));
    if count == 0 {
        f32::NAN
    } else {
        (sum / count as f64) as f32
    }
}

/// `[volume, object, iteration]` scores, NaN until computed.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTable {
    values: Array3<f32>,
}

impl MetricTable {
    pub fn new(volumes: usize, objects: usize, iterations: usize) -> Self {
        Self {
            values: Array3::from_elem((volumes, objects, iterations), f32::NAN),
        }
    }

    pub fn from_array(values: Array3<f32>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, volume: usize, object: usize, iteration: usize, value: f32) {
        self.values[[volume, object, iteration]] = value;
    }

    pub fn get(&self, volume: usize, object: usize, iteration: usize) -> f32 {
        self.values[[volume, object, iteration]]
    }

    /// `(volumes, objects, iterations)`
    pub fn dim(&self) -> (usize, usize, usize) {
        self.values.dim()
    }

    pub fn values(&self) -> ArrayView3<f32> {
        self.values.view()
    }

    pub fn into_array(self) -> Array3<f32> {
        self.values
    }

    /// Scores of every object for one volume and iteration.
    pub fn iteration_row(&self, volume: usize, iteration: usize) -> Vec<f32> {
        self.values
            .slice(s![volume, .., iteration])
            .iter()
            .copied()
            .collect()
    }

    /// Indices of volumes holding at least one computed entry.
    pub fn computed_volumes(&self) -> Vec<usize> {
        self.values
            .outer_iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|v| !v.is_nan()))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn select_volumes(&self, indices: &[usize]) -> Self {
        Self {
            values: self.values.select(Axis(0), indices),
        }
    }

    /// `[volume, object]` best score over iterations, NaN-safe.
    pub fn best(&self) -> Array2<f32> {
        let (volumes, objects, _) = self.dim();
        Array2::from_shape_fn((volumes, objects), |(v, o)| {
            nan_max(self.values.slice(s![v, o, ..]))
        })
    }

    /// NaN-safe mean over volumes, one value per `[object, iteration]`.
    pub fn mean_over_volumes(&self) -> Array2<f32> {
        let (_, objects, iterations) = self.dim();
        Array2::from_shape_fn((objects, iterations), |(o, i)| {
            nan_mean(self.values.slice(s![.., o, i]))
        })
    }
}

/// NaN-safe mean of `[volume, object]` scores per object.
pub fn mean_per_object(scores: ArrayView2<f32>) -> Vec<f32> {
    scores.axis_iter(Axis(1)).map(|col| nan_mean(col)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dice_of_identical_masks_is_one() {
        let m = array![[true, false], [true, true]];
        assert_eq!(dice(&m, &m), 1.0);
    }

    #[test]
    fn dice_of_disjoint_masks_is_zero() {
        let a = array![[true, false], [false, false]];
        let b = array![[false, false], [false, true]];
        assert_eq!(dice(&a, &b), 0.0);
    }

    #[test]
    fn dice_of_partial_overlap() {
        let a = array![true, true, false, false];
        let b = array![false, true, true, false];
        assert!((dice(&a, &b) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn dice_with_empty_truth_is_nan() {
        let a = array![true, false];
        let b = array![false, false];
        assert!(dice(&a, &b).is_nan());
        assert!(dice(&b, &b).is_nan());
    }

    #[test]
    fn worst_frame_skips_unscored_and_keeps_first_tie() {
        let scores = [None, Some(0.8), Some(0.5), None, Some(0.5)];
        assert_eq!(worst_frame(&scores), Some((2, 0.5)));
        assert_eq!(worst_frame(&[None, None]), None);
    }

    #[test]
    fn frame_dice_scores_only_labelled_frames() {
        let mut gt = Array3::from_elem((2, 2, 3), false);
        gt[[0, 0, 1]] = true;
        gt[[1, 1, 2]] = true;
        let mut pred = gt.clone();
        pred[[1, 1, 2]] = false;

        let scores = frame_dice(pred.view(), gt.view());
        assert_eq!(scores, vec![None, Some(1.0), Some(0.0)]);
    }

    #[test]
    fn uncomputed_entries_stay_nan_and_are_ignored_by_best() {
        let mut table = MetricTable::new(3, 2, 3);
        table.set(0, 0, 0, 0.4);
        table.set(0, 0, 1, 0.7);
        table.set(2, 1, 2, 0.2);

        assert!(table.get(0, 0, 2).is_nan());
        assert_eq!(table.computed_volumes(), vec![0, 2]);

        let best = table.best();
        assert_eq!(best[[0, 0]], 0.7);
        assert!(best[[0, 1]].is_nan());
        assert_eq!(best[[2, 1]], 0.2);
    }

    #[test]
    fn selecting_volumes_drops_all_nan_rows() {
        let mut table = MetricTable::new(3, 1, 1);
        table.set(1, 0, 0, 0.9);
        let kept = table.select_volumes(&table.computed_volumes());
        assert_eq!(kept.dim(), (1, 1, 1));
        assert_eq!(kept.get(0, 0, 0), 0.9);
    }

    #[test]
    fn nan_safe_means() {
        assert!((nan_mean(&[1.0, f32::NAN, 0.0]) - 0.5).abs() < 1e-6);
        assert!(nan_mean(&[f32::NAN]).is_nan());
        assert!(nan_max(&[]).is_nan());

        let best = array![[1.0, f32::NAN], [0.5, f32::NAN]];
        let means = mean_per_object(best.view());
        assert!((means[0] - 0.75).abs() < 1e-6);
        assert!(means[1].is_nan());
    }
}
