use std::collections::btree_map::{BTreeMap, Entry};

use ndarray::prelude::*;

use crate::error::{Error, Result};
use crate::metrics::{dice, frame_dice, worst_frame};
use crate::prompting::{
    correct_prompts, seed_point_2d, seed_point_3d, Correction, PromptBook, DEFAULT_EROSION_SIZE,
};
use crate::video_predictor::{find_object_mask, Prompt, VideoPredictor};
use crate::{mask_from_logits, MASK_THRESHOLD};

#[derive(Debug, Clone)]
pub struct RefinementConfig {
    pub max_iters: usize,
    pub erosion_size: usize,
    pub mask_threshold: f32,
    /// Object id used for every prompt sent to the predictor.
    pub obj_id: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iters: 1,
            erosion_size: DEFAULT_EROSION_SIZE,
            mask_threshold: MASK_THRESHOLD,
            obj_id: 1,
        }
    }
}

/// Outcome of one refinement iteration of one object.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub iteration: usize,
    /// Frame that was seeded and corrected in this iteration.
    pub anchor_frame: usize,
    pub correction: Correction,
    /// Prompts replayed before propagation, over all frames.
    pub num_points: usize,
    pub frame_dice: Vec<Option<f32>>,
    pub worst_frame: Option<(usize, f32)>,
    pub volume_dice: f32,
}

/// Runs the click-refinement loop for one object of a volume.
///
/// Iteration 0 clicks the voxel nearest the object's centroid; each later
/// iteration adds a click at the centre of the ground truth on the frame that
/// scored worst in the previous iteration. After each click the prompted frame
/// is predicted and corrected once, then every prompt is replayed and the
/// masks are propagated through the whole volume.
pub fn refine_object<P: VideoPredictor>(
    predictor: &P,
    state: &mut P::State,
    label: ArrayView3<bool>,
    config: &RefinementConfig,
) -> Result<Vec<IterationResult>> {
    let seed = seed_point_3d(label).ok_or_else(|| Error::Data("object has no voxels".into()))?;

    let mut prompts = PromptBook::default();
    let mut worst: Option<usize> = None;
    let mut results = Vec::with_capacity(config.max_iters);

    for iteration in 0..config.max_iters {
        let (anchor_frame, click) = match (iteration, worst) {
            (0, _) | (_, None) => (seed.frame, Prompt::positive(seed.col as u32, seed.row as u32)),
            (_, Some(frame)) => {
                let (row, col) = seed_point_2d(label.index_axis(Axis(2), frame))
                    .ok_or_else(|| Error::Data(format!("worst frame {frame} has no foreground")))?;
                (frame, Prompt::positive(col as u32, row as u32))
            }
        };
        prompts.frame_mut(anchor_frame).push(click);

        let correction = correct_frame(predictor, state, &mut prompts, anchor_frame, label, config)?;
        let pred = propagate_prompts(predictor, state, &prompts, label.dim(), config)?;

        let frame_scores = frame_dice(pred.view(), label);
        let worst_scored = worst_frame(&frame_scores);
        let volume_dice = dice(&pred, &label);

        log::info!(
            "iter {iteration}, pt_volume_dice {volume_dice:.4}, worst frame {:?}, {} points",
            worst_scored,
            prompts.total_points()
        );

        worst = worst_scored.map(|(frame, _)| frame);
        results.push(IterationResult {
            iteration,
            anchor_frame,
            correction,
            num_points: prompts.total_points(),
            frame_dice: frame_scores,
            worst_frame: worst_scored,
            volume_dice,
        });
    }

    Ok(results)
}

/// Prompts `frame_idx` alone and appends corrective clicks for its errors.
fn correct_frame<P: VideoPredictor>(
    predictor: &P,
    state: &mut P::State,
    prompts: &mut PromptBook,
    frame_idx: usize,
    label: ArrayView3<bool>,
    config: &RefinementConfig,
) -> Result<Correction> {
    let frame_prompts = prompts.frame_mut(frame_idx);

    predictor.reset_state(state);
    let masks = predictor.add_new_points(state, frame_idx, config.obj_id, frame_prompts.as_slice())?;
    let pred = mask_from_logits(find_object_mask(&masks, config.obj_id)?, config.mask_threshold)?;

    let gt = label.index_axis(Axis(2), frame_idx);
    if pred.dim() != gt.dim() {
        return Err(Error::Data(format!(
            "predicted mask {:?} does not match frame size {:?}",
            pred.dim(),
            gt.dim()
        )));
    }

    Ok(correct_prompts(pred.view(), gt, frame_prompts, config.erosion_size))
}

/// Replays every prompt set, then propagates forward and backward. Frames the
/// forward pass produced keep its masks; the backward pass fills the rest.
fn propagate_prompts<P: VideoPredictor>(
    predictor: &P,
    state: &mut P::State,
    prompts: &PromptBook,
    (h, w, d): (usize, usize, usize),
    config: &RefinementConfig,
) -> Result<Array3<bool>> {
    predictor.reset_state(state);
    for (frame_idx, frame_prompts) in prompts.iter() {
        predictor.add_new_points(state, frame_idx, config.obj_id, frame_prompts.as_slice())?;
    }

    let mut segments: BTreeMap<usize, Array2<bool>> = BTreeMap::new();
    for reverse in [false, true] {
        for (frame_idx, masks) in predictor.propagate_in_video(state, reverse)? {
            if let Entry::Vacant(slot) = segments.entry(frame_idx) {
                let logits = find_object_mask(&masks, config.obj_id)?;
                slot.insert(mask_from_logits(logits, config.mask_threshold)?);
            }
        }
    }

    let mut pred = Array3::from_elem((h, w, d), false);
    for (frame_idx, mask) in segments {
        if frame_idx >= d || mask.dim() != (h, w) {
            return Err(Error::Data(format!(
                "propagated frame {frame_idx} with mask {:?} does not fit volume {:?}",
                mask.dim(),
                (h, w, d)
            )));
        }
        pred.index_axis_mut(Axis(2), frame_idx).assign(&mask);
    }
    Ok(pred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_loader::{FrameLoader, VolumeFrameLoader};
    use crate::region_grow_predictor::RegionGrowPredictor;
    use crate::video_predictor::ObjectMask;
    use candle_core::{Device, Tensor};

    /// 24x24x3 ellipsoid label; the image is 200 on its left half, 120 on its
    /// right half and 0 outside, so one click only ever fills one half.
    fn two_tone_sphere() -> (Array3<f32>, Array3<bool>) {
        let label = Array3::from_shape_fn((24, 24, 3), |(i, j, k)| {
            let r = ((i as f32 - 12.0).powi(2) + (j as f32 - 12.0).powi(2)) / 64.0;
            r + (k as f32 - 1.0).powi(2) / 2.25 <= 1.0
        });
        let image = Array3::from_shape_fn((24, 24, 3), |(i, j, k)| match (label[[i, j, k]], j < 12) {
            (false, _) => 0.0,
            (true, true) => 200.0,
            (true, false) => 120.0,
        });
        (image, label)
    }

    fn small_config(max_iters: usize) -> RefinementConfig {
        RefinementConfig {
            max_iters,
            erosion_size: 3,
            ..Default::default()
        }
    }

    #[test]
    fn correction_completes_sphere_and_worst_frame_does_not_regress() {
        let (image, label) = two_tone_sphere();
        let predictor = RegionGrowPredictor::new(10.0, Device::Cpu);
        let mut state = predictor.init_state(Box::new(VolumeFrameLoader::new(image))).unwrap();

        let results = refine_object(&predictor, &mut state, label.view(), &small_config(2)).unwrap();
        assert_eq!(results.len(), 2);

        let first = &results[0];
        assert_eq!(first.anchor_frame, 1);
        assert_eq!(first.correction.positive, Some(Prompt::positive(10, 12)));
        assert_eq!(first.correction.negative, None);
        assert_eq!(first.num_points, 2);
        assert_eq!(first.volume_dice, 1.0);

        let second = &results[1];
        assert_eq!(second.anchor_frame, 0);
        assert_eq!(second.num_points, 4);
        let worst0 = first.worst_frame.unwrap().1;
        let worst1 = second.worst_frame.unwrap().1;
        assert!(worst1 >= worst0);
        assert_eq!(second.volume_dice, 1.0);
    }

    #[test]
    fn without_correction_only_one_half_is_found() {
        let (image, label) = two_tone_sphere();
        let predictor = RegionGrowPredictor::new(10.0, Device::Cpu);
        let mut state = predictor.init_state(Box::new(VolumeFrameLoader::new(image))).unwrap();

        // an element wider than the sphere erases every error region
        let config = RefinementConfig {
            erosion_size: 30,
            ..small_config(1)
        };
        let results = refine_object(&predictor, &mut state, label.view(), &config).unwrap();
        assert!(results[0].correction.is_empty());
        assert!(results[0].volume_dice < 1.0);
        assert!(results[0].volume_dice > 0.0);
    }

    #[test]
    fn empty_object_is_rejected() {
        let predictor = RegionGrowPredictor::new(10.0, Device::Cpu);
        let mut state = predictor
            .init_state(Box::new(VolumeFrameLoader::new(Array3::zeros((4, 4, 2)))))
            .unwrap();
        let label = Array3::from_elem((4, 4, 2), false);
        assert!(matches!(
            refine_object(&predictor, &mut state, label.view(), &small_config(1)),
            Err(Error::Data(_))
        ));
    }

    /// Predicts nothing on prompted frames, everything going forward and
    /// nothing going backward; records the calls it receives.
    struct ScriptedPredictor;

    #[derive(Default)]
    struct ScriptedState {
        size: (usize, usize),
        frames: usize,
        prompted: Vec<usize>,
        calls: Vec<String>,
    }

    impl ScriptedPredictor {
        fn masks(value: f32, size: (usize, usize)) -> Vec<ObjectMask> {
            vec![ObjectMask {
                obj_id: 1,
                mask: Tensor::full(value, size, &Device::Cpu).unwrap(),
            }]
        }
    }

    impl VideoPredictor for ScriptedPredictor {
        type State = ScriptedState;

        fn init_state(&self, frame_loader: Box<dyn FrameLoader>) -> candle_core::Result<ScriptedState> {
            Ok(ScriptedState {
                size: frame_loader.frame_size(),
                frames: frame_loader.total_frames(),
                ..Default::default()
            })
        }

        fn reset_state(&self, state: &mut ScriptedState) {
            state.prompted.clear();
            state.calls.push("reset".into());
        }

        fn add_new_points(
            &self,
            state: &mut ScriptedState,
            frame_idx: usize,
            _obj_id: usize,
            prompts: &[Prompt],
        ) -> candle_core::Result<Vec<ObjectMask>> {
            state.prompted.push(frame_idx);
            state.calls.push(format!("add {frame_idx} x{}", prompts.len()));
            Ok(Self::masks(-1.0, state.size))
        }

        fn propagate_in_video(
            &self,
            state: &mut ScriptedState,
            reverse: bool,
        ) -> candle_core::Result<Vec<(usize, Vec<ObjectMask>)>> {
            state.calls.push(format!("propagate reverse={reverse}"));
            let start = state.prompted.iter().copied().min().unwrap_or(0);
            let order: Vec<usize> = if reverse {
                (0..=start).rev().collect()
            } else {
                (start..state.frames).collect()
            };
            let value = if reverse { -1.0 } else { 1.0 };
            Ok(order.into_iter().map(|f| (f, Self::masks(value, state.size))).collect())
        }
    }

    #[test]
    fn forward_pass_wins_on_shared_frames() {
        let label = Array3::from_elem((8, 8, 3), true);
        let predictor = ScriptedPredictor;
        let mut state = predictor
            .init_state(Box::new(VolumeFrameLoader::new(Array3::zeros((8, 8, 3)))))
            .unwrap();

        let results = refine_object(&predictor, &mut state, label.view(), &small_config(1)).unwrap();
        let result = &results[0];

        assert_eq!(result.anchor_frame, 1);
        // frame 0 only comes from the backward pass, frame 1 from both
        assert_eq!(result.frame_dice, vec![Some(0.0), Some(1.0), Some(1.0)]);
        assert_eq!(result.worst_frame, Some((0, 0.0)));

        assert_eq!(
            state.calls,
            vec![
                "reset",
                "add 1 x1",
                "reset",
                "add 1 x2",
                "propagate reverse=false",
                "propagate reverse=true",
            ]
        );
    }

    #[test]
    fn later_iterations_reseed_the_worst_frame() {
        let label = Array3::from_elem((8, 8, 3), true);
        let predictor = ScriptedPredictor;
        let mut state = predictor
            .init_state(Box::new(VolumeFrameLoader::new(Array3::zeros((8, 8, 3)))))
            .unwrap();

        let results = refine_object(&predictor, &mut state, label.view(), &small_config(2)).unwrap();
        assert_eq!(results[1].anchor_frame, 0);
        // seed + correction on frame 1, reseed + correction on frame 0
        assert_eq!(results[1].num_points, 4);
        assert!(state.calls.iter().any(|c| c == "add 0 x2"));
    }
}
