use std::cmp::Ordering;

use crate::scene::light::LightImportance;

pub const MAX_PIXEL_LIGHTS: usize = 4;
pub const MAX_VERTEX_LIGHTS: usize = 4;
const LIGHT_CAPACITY: usize = MAX_PIXEL_LIGHTS + MAX_VERTEX_LIGHTS;

/// Sentinel for "no light".
pub const NO_LIGHT: u32 = u32::MAX;

/// Penalty given to the main light so it ranks first within its importance tier.
pub const MAIN_LIGHT_PENALTY: f32 = -1.0e9;

#[derive(Clone, Copy, Debug)]
pub struct LightAccumulationContext {
    pub importance: LightImportance,
    pub light_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightScore {
    pub tier: u8,
    pub penalty: f32,
    pub light_index: u32,
}

impl LightScore {
    fn compare(&self, other: &LightScore) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then(self.penalty.total_cmp(&other.penalty))
            .then(self.light_index.cmp(&other.light_index))
    }
}

const EMPTY_SCORE: LightScore = LightScore {
    tier: u8::MAX,
    penalty: f32::INFINITY,
    light_index: NO_LIGHT,
};

/// Ranks the lights affecting one drawable and splits them into per-pixel and per-vertex sets.
#[derive(Clone, Copy, Debug)]
pub struct DrawableLightAccumulator {
    lights: [LightScore; LIGHT_CAPACITY],
    len: usize,
    num_important: usize,
    max_pixel_lights: usize,
}

impl Default for DrawableLightAccumulator {
    fn default() -> Self {
        Self {
            lights: [EMPTY_SCORE; LIGHT_CAPACITY],
            len: 0,
            num_important: 0,
            max_pixel_lights: MAX_PIXEL_LIGHTS,
        }
    }
}

impl DrawableLightAccumulator {
    pub fn reset(&mut self, max_pixel_lights: usize) {
        self.len = 0;
        self.num_important = 0;
        self.max_pixel_lights = max_pixel_lights.min(MAX_PIXEL_LIGHTS);
    }

    /// Insert a light keeping the list ordered by (importance tier, penalty, index).
    /// The worst entry falls off once capacity is exceeded.
    pub fn accumulate_light(&mut self, ctx: LightAccumulationContext, penalty: f32) {
        let score = LightScore {
            tier: ctx.importance.tier(),
            penalty,
            light_index: ctx.light_index,
        };
        if ctx.importance == LightImportance::Important {
            self.num_important += 1;
        }

        let position = self.lights[..self.len]
            .iter()
            .position(|existing| score.compare(existing) == Ordering::Less)
            .unwrap_or(self.len);
        if position >= LIGHT_CAPACITY {
            return;
        }

        let last = self.len.min(LIGHT_CAPACITY - 1);
        self.lights.copy_within(position..last, position + 1);
        self.lights[position] = score;
        self.len = (self.len + 1).min(LIGHT_CAPACITY);
    }

    fn first_vertex_light(&self) -> usize {
        self.num_important
            .max(self.max_pixel_lights)
            .min(LIGHT_CAPACITY)
            .min(self.len)
    }

    /// All kept lights, best first.
    pub fn lights(&self) -> &[LightScore] {
        &self.lights[..self.len]
    }

    pub fn pixel_lights(&self) -> &[LightScore] {
        &self.lights[..self.first_vertex_light()]
    }

    pub fn vertex_lights(&self) -> [u32; MAX_VERTEX_LIGHTS] {
        let mut result = [NO_LIGHT; MAX_VERTEX_LIGHTS];
        let first = self.first_vertex_light();
        for (slot, score) in result.iter_mut().zip(&self.lights[first..self.len]) {
            *slot = score.light_index;
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(light_index: u32, importance: LightImportance) -> LightAccumulationContext {
        LightAccumulationContext {
            importance,
            light_index,
        }
    }

    #[test]
    fn lights_are_split_by_penalty() {
        let mut acc = DrawableLightAccumulator::default();
        acc.reset(2);
        for (index, penalty) in [(0, 5.0), (1, 1.0), (2, 3.0), (3, 9.0), (4, 0.5)] {
            acc.accumulate_light(ctx(index, LightImportance::Auto), penalty);
        }
        let pixel: Vec<_> = acc.pixel_lights().iter().map(|s| s.light_index).collect();
        assert_eq!(pixel, vec![4, 1]);
        assert_eq!(acc.vertex_lights(), [2, 0, 3, NO_LIGHT]);
    }

    #[test]
    fn important_lights_win_and_extend_pixel_budget() {
        let mut acc = DrawableLightAccumulator::default();
        acc.reset(1);
        acc.accumulate_light(ctx(0, LightImportance::Auto), 0.1);
        acc.accumulate_light(ctx(1, LightImportance::Important), 50.0);
        acc.accumulate_light(ctx(2, LightImportance::Important), 40.0);
        acc.accumulate_light(ctx(3, LightImportance::NotImportant), 0.0);
        let pixel: Vec<_> = acc.pixel_lights().iter().map(|s| s.light_index).collect();
        assert_eq!(pixel, vec![2, 1]);
        assert_eq!(acc.vertex_lights(), [0, 3, NO_LIGHT, NO_LIGHT]);
    }

    #[test]
    fn equal_penalties_break_ties_by_index() {
        let mut acc = DrawableLightAccumulator::default();
        acc.reset(4);
        acc.accumulate_light(ctx(7, LightImportance::Auto), 1.0);
        acc.accumulate_light(ctx(2, LightImportance::Auto), 1.0);
        let pixel: Vec<_> = acc.pixel_lights().iter().map(|s| s.light_index).collect();
        assert_eq!(pixel, vec![2, 7]);
    }

    #[test]
    fn overflow_drops_the_worst_light() {
        let mut acc = DrawableLightAccumulator::default();
        acc.reset(MAX_PIXEL_LIGHTS);
        for index in 0..(LIGHT_CAPACITY as u32 + 3) {
            acc.accumulate_light(ctx(index, LightImportance::Auto), 100.0 - index as f32);
        }
        assert_eq!(acc.lights().len(), LIGHT_CAPACITY);
        assert!(acc.lights().iter().all(|s| s.light_index >= 3));
        assert_eq!(acc.pixel_lights().len(), MAX_PIXEL_LIGHTS);
    }
}
