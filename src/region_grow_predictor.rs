use std::collections::{BTreeMap, VecDeque};

use candle_core::{Device, Result, Tensor};
use ndarray::prelude::*;
use ndarray::Zip;

use crate::frame_loader::FrameLoader;
use crate::video_predictor::{ObjectMask, PointLabel, Prompt, VideoPredictor, NO_OBJ_SCORE};
use crate::{array2_to_tensor, tensor_to_array2};

/// Default intensity step accepted between neighbouring pixels.
pub const DEFAULT_TOLERANCE: f32 = 10.0;

const FOREGROUND_LOGIT: f32 = 1.0;
const BACKGROUND_LOGIT: f32 = -1.0;

#[derive(Debug, Default)]
struct ObjectState {
    point_inputs: BTreeMap<usize, Vec<Prompt>>,
    cond_frame_outputs: BTreeMap<usize, Array2<bool>>,
    non_cond_frame_outputs: BTreeMap<usize, Array2<bool>>,
}

impl ObjectState {
    fn output(&self, frame_idx: usize) -> Option<&Array2<bool>> {
        self.cond_frame_outputs
            .get(&frame_idx)
            .or_else(|| self.non_cond_frame_outputs.get(&frame_idx))
    }
}

pub struct RegionGrowState {
    frames: Vec<Array2<f32>>,
    video_height: usize,
    video_width: usize,
    objects: BTreeMap<usize, ObjectState>,
}

impl RegionGrowState {
    pub fn reset(&mut self) {
        self.objects.clear();
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// `(height, width)`
    pub fn video_size(&self) -> (usize, usize) {
        (self.video_height, self.video_width)
    }

    pub fn point_inputs(&self, obj_id: usize, frame_idx: usize) -> Option<&[Prompt]> {
        self.objects
            .get(&obj_id)?
            .point_inputs
            .get(&frame_idx)
            .map(Vec::as_slice)
    }
}

/// Intensity region-growing tracker.
///
/// A prompted frame is segmented by growing 4-connected regions from the
/// positive clicks, stepping to a neighbour when its intensity differs by at
/// most `tolerance`. Pixels closer to a negative click than to every positive
/// click are dropped. Propagation re-seeds each frame from the previous
/// frame's mask where the intensity did not change by more than `tolerance`.
pub struct RegionGrowPredictor {
    tolerance: f32,
    device: Device,
}

impl RegionGrowPredictor {
    pub fn new(tolerance: f32, device: Device) -> Self {
        Self { tolerance, device }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    fn grow(&self, frame: &Array2<f32>, seeds: impl IntoIterator<Item = (usize, usize)>) -> Array2<bool> {
        let (h, w) = frame.dim();
        let mut mask = Array2::from_elem((h, w), false);
        let mut queue = VecDeque::new();

        for (r, c) in seeds {
            if r < h && c < w && !mask[[r, c]] {
                mask[[r, c]] = true;
                queue.push_back((r, c));
            }
        }

        while let Some((r, c)) = queue.pop_front() {
            let value = frame[[r, c]];
            let neighbours = [
                (r.wrapping_sub(1), c),
                (r + 1, c),
                (r, c.wrapping_sub(1)),
                (r, c + 1),
            ];
            for (nr, nc) in neighbours {
                if nr < h && nc < w && !mask[[nr, nc]] && (frame[[nr, nc]] - value).abs() <= self.tolerance {
                    mask[[nr, nc]] = true;
                    queue.push_back((nr, nc));
                }
            }
        }

        mask
    }

    fn segment_frame(&self, frame: &Array2<f32>, prompts: &[Prompt]) -> Array2<bool> {
        let (h, w) = frame.dim();
        let clicks = |label: PointLabel| -> Vec<(usize, usize)> {
            prompts
                .iter()
                .filter(|p| p.label == label)
                .map(|p| (p.y as usize, p.x as usize))
                .filter(|&(r, c)| r < h && c < w)
                .collect()
        };
        let positives = clicks(PointLabel::Positive);
        let negatives = clicks(PointLabel::Negative);

        let mut mask = self.grow(frame, positives.iter().copied());
        if negatives.is_empty() {
            return mask;
        }

        let nearest = |points: &[(usize, usize)], r: usize, c: usize| -> i64 {
            points
                .iter()
                .map(|&(pr, pc)| (pr as i64 - r as i64).pow(2) + (pc as i64 - c as i64).pow(2))
                .min()
                .unwrap_or(i64::MAX)
        };
        mask.indexed_iter_mut().for_each(|((r, c), on)| {
            if *on && nearest(&negatives, r, c) < nearest(&positives, r, c) {
                *on = false;
            }
        });
        mask
    }

    fn track(&self, prev_frame: &Array2<f32>, frame: &Array2<f32>, prev_mask: &Array2<bool>) -> Array2<bool> {
        let stable = Zip::from(prev_mask)
            .and(prev_frame)
            .and(frame)
            .map_collect(|&on, &before, &now| on && (now - before).abs() <= self.tolerance);
        let seeds = stable
            .indexed_iter()
            .filter(|(_, &on)| on)
            .map(|(idx, _)| idx);
        self.grow(frame, seeds)
    }

    fn to_logits(&self, mask: &Array2<bool>) -> Result<Tensor> {
        let logits = mask.mapv(|on| if on { FOREGROUND_LOGIT } else { BACKGROUND_LOGIT });
        array2_to_tensor(logits.view(), &self.device)
    }

    fn frame_masks(&self, state: &RegionGrowState, frame_idx: usize) -> Result<Vec<ObjectMask>> {
        let (h, w) = state.video_size();
        state
            .objects
            .iter()
            .map(|(&obj_id, obj)| {
                let mask = match obj.output(frame_idx) {
                    Some(mask) => self.to_logits(mask)?,
                    None => Tensor::full(NO_OBJ_SCORE, (h, w), &self.device)?,
                };
                Ok(ObjectMask { obj_id, mask })
            })
            .collect()
    }
}

impl VideoPredictor for RegionGrowPredictor {
    type State = RegionGrowState;

    fn init_state(&self, frame_loader: Box<dyn FrameLoader>) -> Result<RegionGrowState> {
        let (video_height, video_width) = frame_loader.frame_size();
        let num_frames = frame_loader.total_frames();

        let mut frames = Vec::with_capacity(num_frames);
        for frame_idx in 0..num_frames {
            let frame = tensor_to_array2(&frame_loader.get_frame(frame_idx, &self.device)?)?;
            if frame.dim() != (video_height, video_width) {
                return Err(candle_core::Error::Msg(format!(
                    "frame {frame_idx} has size {:?}, expected {:?}",
                    frame.dim(),
                    (video_height, video_width)
                )));
            }
            frames.push(frame);
        }

        Ok(RegionGrowState {
            frames,
            video_height,
            video_width,
            objects: BTreeMap::new(),
        })
    }

    fn reset_state(&self, state: &mut RegionGrowState) {
        state.reset();
    }

    fn add_new_points(
        &self,
        state: &mut RegionGrowState,
        frame_idx: usize,
        obj_id: usize,
        prompts: &[Prompt],
    ) -> Result<Vec<ObjectMask>> {
        let frame = state.frames.get(frame_idx).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "frame {frame_idx} out of range ({} frames)",
                state.frames.len()
            ))
        })?;

        let obj_state = state.objects.entry(obj_id).or_default();
        let points = obj_state.point_inputs.entry(frame_idx).or_default();
        points.extend_from_slice(prompts);

        let mask = self.segment_frame(frame, points);
        obj_state.cond_frame_outputs.insert(frame_idx, mask);
        obj_state.non_cond_frame_outputs.remove(&frame_idx);

        self.frame_masks(state, frame_idx)
    }

    fn propagate_in_video(
        &self,
        state: &mut RegionGrowState,
        reverse: bool,
    ) -> Result<Vec<(usize, Vec<ObjectMask>)>> {
        let start_frame_idx = state
            .objects
            .values()
            .flat_map(|obj| obj.cond_frame_outputs.keys())
            .min()
            .copied()
            .ok_or_else(|| {
                candle_core::Error::Msg("No input points provided for any object".to_string())
            })?;

        let processing_order: Vec<usize> = if reverse {
            (0..=start_frame_idx).rev().collect()
        } else {
            (start_frame_idx..state.num_frames()).collect()
        };

        let mut results = Vec::with_capacity(processing_order.len());
        let mut prev_frame_idx: Option<usize> = None;

        for &frame_idx in &processing_order {
            for obj_state in state.objects.values_mut() {
                if obj_state.cond_frame_outputs.contains_key(&frame_idx) {
                    continue;
                }
                let tracked = match prev_frame_idx.and_then(|p| obj_state.output(p).map(|m| (p, m))) {
                    Some((p, prev_mask)) => self.track(&state.frames[p], &state.frames[frame_idx], prev_mask),
                    None => Array2::from_elem(state.frames[frame_idx].dim(), false),
                };
                obj_state.non_cond_frame_outputs.insert(frame_idx, tracked);
            }

            results.push((frame_idx, self.frame_masks(state, frame_idx)?));
            prev_frame_idx = Some(frame_idx);
        }

        Ok(results)
    }
}
