use ndarray::prelude::*;

use super::morphology::largest_connected_component;

/// A voxel of a `[H, W, D]` volume; `frame` indexes the last axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedPoint {
    pub row: usize,
    pub col: usize,
    pub frame: usize,
}

/// Voxel of the largest connected component closest to that component's
/// centroid. `None` for an empty mask.
pub fn seed_point_3d(mask: ArrayView3<bool>) -> Option<SeedPoint> {
    let component = largest_connected_component(mask);
    let coords: Vec<[usize; 3]> = component
        .indexed_iter()
        .filter(|(_, &on)| on)
        .map(|((i, j, k), _)| [i, j, k])
        .collect();

    closest_to_centroid(&coords).map(|[row, col, frame]| SeedPoint { row, col, frame })
}

/// 2D variant of [`seed_point_3d`] (8-neighbour connectivity), returns `(row, col)`.
pub fn seed_point_2d(mask: ArrayView2<bool>) -> Option<(usize, usize)> {
    seed_point_3d(mask.insert_axis(Axis(2))).map(|p| (p.row, p.col))
}

fn closest_to_centroid<const N: usize>(coords: &[[usize; N]]) -> Option<[usize; N]> {
    if coords.is_empty() {
        return None;
    }

    let mut centroid = [0f64; N];
    for c in coords {
        for (acc, &v) in centroid.iter_mut().zip(c) {
            *acc += v as f64;
        }
    }
    centroid.iter_mut().for_each(|v| *v /= coords.len() as f64);

    let distance = |c: &[usize; N]| -> f64 {
        c.iter()
            .zip(&centroid)
            .map(|(&v, &m)| (v as f64 - m).powi(2))
            .sum()
    };

    coords
        .iter()
        .min_by(|a, b| distance(a).total_cmp(&distance(b)))
        .copied()
}
