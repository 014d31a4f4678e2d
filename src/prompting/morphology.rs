use std::collections::VecDeque;

use ndarray::prelude::*;

/// Keeps the largest fully connected (26-neighbour) component of `mask`.
/// On equal sizes the component found first in row-major order wins.
pub fn largest_connected_component(mask: ArrayView3<bool>) -> Array3<bool> {
    let (h, w, d) = mask.dim();
    let mut labels = Array3::<u32>::zeros((h, w, d));
    let mut best: Option<(u32, usize)> = None;
    let mut next_label = 0u32;
    let mut queue = VecDeque::new();

    for ((i, j, k), &on) in mask.indexed_iter() {
        if !on || labels[[i, j, k]] != 0 {
            continue;
        }
        next_label += 1;
        labels[[i, j, k]] = next_label;
        queue.push_back((i, j, k));
        let mut size = 0usize;

        while let Some((ci, cj, ck)) = queue.pop_front() {
            size += 1;
            for (ni, nj, nk) in neighbours26((ci, cj, ck), (h, w, d)) {
                if mask[[ni, nj, nk]] && labels[[ni, nj, nk]] == 0 {
                    labels[[ni, nj, nk]] = next_label;
                    queue.push_back((ni, nj, nk));
                }
            }
        }

        if best.map_or(true, |(_, best_size)| size > best_size) {
            best = Some((next_label, size));
        }
    }

    match best {
        Some((label, _)) => labels.mapv(|l| l == label),
        None => Array3::from_elem((h, w, d), false),
    }
}

fn neighbours26(
    (i, j, k): (usize, usize, usize),
    (h, w, d): (usize, usize, usize),
) -> impl Iterator<Item = (usize, usize, usize)> {
    let offsets = [-1isize, 0, 1];
    offsets.into_iter().flat_map(move |di| {
        offsets.into_iter().flat_map(move |dj| {
            offsets.into_iter().filter_map(move |dk| {
                if di == 0 && dj == 0 && dk == 0 {
                    return None;
                }
                let ni = i.checked_add_signed(di).filter(|&v| v < h)?;
                let nj = j.checked_add_signed(dj).filter(|&v| v < w)?;
                let nk = k.checked_add_signed(dk).filter(|&v| v < d)?;
                Some((ni, nj, nk))
            })
        })
    })
}

/// Binary erosion with a `size x size` all-ones structuring element centred at
/// `size / 2`. Pixels outside the frame are treated as background, so anything
/// within reach of the border is eroded away.
pub fn binary_erosion(mask: ArrayView2<bool>, size: usize) -> Array2<bool> {
    if size <= 1 {
        return mask.to_owned();
    }
    // the square element is separable: erode rows, then columns
    let rows = erode_lanes(mask, Axis(1), size);
    erode_lanes(rows.view(), Axis(0), size)
}

fn erode_lanes(mask: ArrayView2<bool>, axis: Axis, size: usize) -> Array2<bool> {
    let before = size / 2;
    let after = size - 1 - before;
    let mut out = Array2::from_elem(mask.dim(), false);

    for (src, mut dst) in mask.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let n = src.len();
        let mut prefix = Vec::with_capacity(n + 1);
        let mut running = 0usize;
        prefix.push(running);
        for &v in src.iter() {
            running += v as usize;
            prefix.push(running);
        }

        for p in before..n.saturating_sub(after) {
            dst[p] = prefix[p + after + 1] - prefix[p - before] == size;
        }
    }

    out
}
