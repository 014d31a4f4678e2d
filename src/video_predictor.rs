use candle_core::{Result, Tensor};

use crate::frame_loader::FrameLoader;

/// Logit written for objects that have no output on a frame.
pub const NO_OBJ_SCORE: f32 = -1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointLabel {
    Negative,
    Positive,
}

impl PointLabel {
    pub fn as_u8(self) -> u8 {
        match self {
            PointLabel::Negative => 0,
            PointLabel::Positive => 1,
        }
    }
}

/// A click on a frame: `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prompt {
    pub x: u32,
    pub y: u32,
    pub label: PointLabel,
}

impl Prompt {
    pub fn positive(x: u32, y: u32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Positive,
        }
    }

    pub fn negative(x: u32, y: u32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Negative,
        }
    }
}

pub struct ObjectMask {
    pub obj_id: usize,
    /// `[H, W]` mask logits at video resolution.
    pub mask: Tensor,
}

/// A point-promptable video segmentation model.
///
/// Prompts accumulate per `(obj_id, frame_idx)` until `reset_state`. Each call
/// to `propagate_in_video` starts at the earliest prompted frame and walks to
/// the last frame, or back to frame 0 when `reverse` is set.
pub trait VideoPredictor {
    type State;

    fn init_state(&self, frame_loader: Box<dyn FrameLoader>) -> Result<Self::State>;

    fn reset_state(&self, state: &mut Self::State);

    /// Adds prompts on one frame and returns the masks of all tracked objects
    /// on that frame.
    fn add_new_points(
        &self,
        state: &mut Self::State,
        frame_idx: usize,
        obj_id: usize,
        prompts: &[Prompt],
    ) -> Result<Vec<ObjectMask>>;

    fn propagate_in_video(
        &self,
        state: &mut Self::State,
        reverse: bool,
    ) -> Result<Vec<(usize, Vec<ObjectMask>)>>;
}

/// Picks the mask of `obj_id` out of a predictor result.
pub fn find_object_mask(masks: &[ObjectMask], obj_id: usize) -> Result<&Tensor> {
    masks
        .iter()
        .find(|om| om.obj_id == obj_id)
        .map(|om| &om.mask)
        .ok_or_else(|| candle_core::Error::Msg(format!("no mask for object {obj_id}")))
}
