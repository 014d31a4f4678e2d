use ndarray::prelude::*;
use ndarray::Zip;

use super::morphology::binary_erosion;
use super::PromptSet;
use crate::video_predictor::Prompt;

/// Side length of the square element used to erode error regions.
pub const DEFAULT_EROSION_SIZE: usize = 20;

/// Prompts appended by one [`correct_prompts`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Correction {
    pub negative: Option<Prompt>,
    pub positive: Option<Prompt>,
}

impl Correction {
    pub fn is_empty(&self) -> bool {
        self.negative.is_none() && self.positive.is_none()
    }
}

/// Appends a negative click in the eroded false-positive region and a positive
/// click in the eroded false-negative region, each at the pixel closest to the
/// set's first prompt. Either region may be empty after erosion, in which case
/// nothing is added for it.
pub fn correct_prompts(
    pred: ArrayView2<bool>,
    gt: ArrayView2<bool>,
    prompts: &mut PromptSet,
    erosion_size: usize,
) -> Correction {
    let reference = prompts
        .first()
        .map(|p| (p.y as usize, p.x as usize))
        .unwrap_or((0, 0));

    let false_pos = Zip::from(&pred).and(&gt).map_collect(|&p, &g| p && !g);
    let false_neg = Zip::from(&pred).and(&gt).map_collect(|&p, &g| !p && g);

    let mut correction = Correction::default();

    if let Some((row, col)) = nearest_pixel(binary_erosion(false_pos.view(), erosion_size).view(), reference) {
        let prompt = Prompt::negative(col as u32, row as u32);
        prompts.push(prompt);
        correction.negative = Some(prompt);
    }

    if let Some((row, col)) = nearest_pixel(binary_erosion(false_neg.view(), erosion_size).view(), reference) {
        let prompt = Prompt::positive(col as u32, row as u32);
        prompts.push(prompt);
        correction.positive = Some(prompt);
    }

    correction
}

/// Set pixel with the smallest squared distance to `(row, col)`, first in
/// row-major order on ties.
fn nearest_pixel(region: ArrayView2<bool>, (row, col): (usize, usize)) -> Option<(usize, usize)> {
    region
        .indexed_iter()
        .filter(|(_, &on)| on)
        .map(|(idx, _)| idx)
        .min_by_key(|&(i, j)| {
            let di = i as i64 - row as i64;
            let dj = j as i64 - col as i64;
            di * di + dj * dj
        })
}
