use std::collections::BTreeMap;

use crate::video_predictor::Prompt;

pub mod correction;
pub mod morphology;
pub mod seed;

pub use correction::{correct_prompts, Correction, DEFAULT_EROSION_SIZE};
pub use seed::{seed_point_2d, seed_point_3d, SeedPoint};

/// Ordered clicks on one annotation frame. Only ever appended to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptSet {
    prompts: Vec<Prompt>,
}

impl PromptSet {
    pub fn push(&mut self, prompt: Prompt) {
        self.prompts.push(prompt);
    }

    pub fn first(&self) -> Option<&Prompt> {
        self.prompts.first()
    }

    pub fn get(&self, idx: usize) -> Option<&Prompt> {
        self.prompts.get(idx)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn as_slice(&self) -> &[Prompt] {
        &self.prompts
    }

    /// `(x, y)` coordinates in click order.
    pub fn points(&self) -> Vec<(u32, u32)> {
        self.prompts.iter().map(|p| (p.x, p.y)).collect()
    }

    /// 1 for foreground clicks, 0 for background, in click order.
    pub fn labels(&self) -> Vec<u8> {
        self.prompts.iter().map(|p| p.label.as_u8()).collect()
    }
}

impl From<Vec<Prompt>> for PromptSet {
    fn from(prompts: Vec<Prompt>) -> Self {
        Self { prompts }
    }
}

/// Prompt sets keyed by annotation frame.
#[derive(Debug, Clone, Default)]
pub struct PromptBook {
    frames: BTreeMap<usize, PromptSet>,
}

impl PromptBook {
    pub fn frame_mut(&mut self, frame_idx: usize) -> &mut PromptSet {
        self.frames.entry(frame_idx).or_default()
    }

    pub fn frame(&self, frame_idx: usize) -> Option<&PromptSet> {
        self.frames.get(&frame_idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PromptSet)> {
        self.frames.iter().map(|(&frame, set)| (frame, set))
    }

    pub fn total_points(&self) -> usize {
        self.frames.values().map(PromptSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_counts_points_across_frames() {
        let mut book = PromptBook::default();
        book.frame_mut(3).push(Prompt::positive(1, 2));
        book.frame_mut(3).push(Prompt::negative(4, 5));
        book.frame_mut(0).push(Prompt::positive(7, 7));

        assert_eq!(book.total_points(), 3);
        let frames: Vec<usize> = book.iter().map(|(f, _)| f).collect();
        assert_eq!(frames, vec![0, 3]);
        assert_eq!(book.frame(3).map(PromptSet::labels), Some(vec![1, 0]));
    }
}
