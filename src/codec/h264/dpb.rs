// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer of one view layer.
//!
//! A [`DpbList`] is an ordered list of ids into the session's [`FramePool`]. The order is the
//! order frames were appended in, which is the order all searches walk.

use log::debug;

use crate::codec::h264::frame::CodingStructure;
use crate::codec::h264::frame::Frame;
use crate::codec::h264::frame::FrameId;
use crate::codec::h264::frame::FramePool;
use crate::codec::h264::parser::MaxLongTermFrameIdx;

#[derive(Debug, Default)]
pub struct DpbList {
    entries: Vec<FrameId>,
    /// The number of frames the stream needs to be stored.
    dpb_size: usize,
    /// frame_num at which a recovery point makes output safe again.
    recovery_frame_cnt: Option<i32>,
    recovery_point_found: bool,
}

impl DpbList {
    pub fn new() -> Self {
        Default::default()
    }

    /// Frame ids in insertion order.
    pub fn ids(&self) -> impl DoubleEndedIterator<Item = FrameId> + '_ {
        self.entries.iter().copied()
    }

    fn frames<'a>(
        &'a self,
        pool: &'a FramePool,
    ) -> impl Iterator<Item = (FrameId, &'a Frame)> + 'a {
        self.entries.iter().map(move |&id| (id, &pool[id]))
    }

    pub fn append(&mut self, id: FrameId) {
        self.entries.push(id);
    }

    /// Moves `id` to the end of the list, so that searches find it last.
    pub fn move_to_tail(&mut self, id: FrameId) {
        if let Some(pos) = self.entries.iter().position(|&e| e == id) {
            self.entries.remove(pos);
            self.entries.push(id);
        }
    }

    pub fn dpb_size(&self) -> usize {
        self.dpb_size
    }

    pub fn set_dpb_size(&mut self, size: usize) {
        self.dpb_size = size;
    }

    pub fn count_all_frames(&self) -> usize {
        self.entries.len()
    }

    /// Frames still waiting for output or kept as references.
    pub fn count_num_displayable(&self, pool: &FramePool) -> usize {
        self.frames(pool)
            .filter(|(_, f)| f.full && (f.is_reference() || !f.outputted))
            .count()
    }

    /// Returns the number of (short-term, long-term) reference frames. A frame with one field of
    /// each kind counts as short-term.
    pub fn count_active_refs(&self, pool: &FramePool) -> (usize, usize) {
        self.frames(pool).fold((0, 0), |(st, lt), (_, f)| {
            if f.is_short_term_ref() {
                (st + 1, lt)
            } else if f.is_long_term_ref() {
                (st, lt + 1)
            } else {
                (st, lt)
            }
        })
    }

    /// Returns the last disposable frame of the list.
    pub fn get_disposable(&self, pool: &FramePool) -> Option<FrameId> {
        self.frames(pool)
            .filter(|(_, f)| f.is_disposable())
            .map(|(id, _)| id)
            .last()
    }

    pub fn is_disposable_exist(&self, pool: &FramePool) -> bool {
        self.frames(pool).any(|(_, f)| f.is_disposable())
    }

    /// Whether a slot can be freed once the display consumer catches up, or the list still has
    /// room to grow.
    pub fn is_almost_disposable_exist(&self, pool: &FramePool) -> bool {
        self.frames(pool).any(|(_, f)| f.is_almost_disposable()) || self.entries.len() < self.dpb_size
    }

    /// Short-term reference with the smallest FrameNumWrap.
    pub fn find_oldest_short_term_ref(&self, pool: &FramePool) -> Option<FrameId> {
        self.frames(pool)
            .filter(|(_, f)| f.is_short_term_ref())
            .min_by_key(|(_, f)| f.frame_num_wrap)
            .map(|(id, _)| id)
    }

    pub fn find_oldest_long_term_ref(&self, pool: &FramePool) -> Option<FrameId> {
        self.frames(pool)
            .filter(|(_, f)| f.is_long_term_ref())
            .min_by_key(|(_, f)| f.frame_num_wrap)
            .map(|(id, _)| id)
    }

    /// Long-term reference holding `long_term_frame_idx`.
    pub fn find_long_term_ref_idx(
        &self,
        pool: &FramePool,
        long_term_frame_idx: u32,
    ) -> Option<FrameId> {
        self.frames(pool)
            .find(|(_, f)| {
                let is_long_term = match f.structure_for_ref {
                    CodingStructure::Frame => f.is_long_term_ref(),
                    CodingStructure::Field => f.is_long_term_field(0) || f.is_long_term_field(1),
                };
                is_long_term && f.long_term_frame_idx == Some(long_term_frame_idx)
            })
            .map(|(id, _)| id)
    }

    /// First long-term reference whose index exceeds `max`.
    pub fn find_old_long_term_ref(
        &self,
        pool: &FramePool,
        max: MaxLongTermFrameIdx,
    ) -> Option<FrameId> {
        self.frames(pool)
            .find(|(_, f)| {
                f.is_long_term_field(0)
                    && match (max, f.long_term_frame_idx) {
                        (_, None) => false,
                        (MaxLongTermFrameIdx::NoLongTermFrameIndices, Some(_)) => true,
                        (MaxLongTermFrameIdx::Idx(max), Some(idx)) => idx > max,
                    }
            })
            .map(|(id, _)| id)
    }

    /// Short-term picture with the given PicNum, along with the matching field.
    pub fn find_short_term_pic(&self, pool: &FramePool, pic_num: i32) -> Option<(FrameId, usize)> {
        self.frames(pool).find_map(|(id, f)| match f.structure_for_ref {
            CodingStructure::Frame => {
                (f.short_term_mask() == 3 && f.pic_num(0) == pic_num).then_some((id, 0))
            }
            CodingStructure::Field => (0..2)
                .find(|&field| f.is_short_term_field(field) && f.pic_num(field) == pic_num)
                .map(|field| (id, field)),
        })
    }

    /// Long-term picture with the given LongTermPicNum, along with the matching field.
    pub fn find_long_term_pic(&self, pool: &FramePool, pic_num: i32) -> Option<(FrameId, usize)> {
        self.frames(pool).find_map(|(id, f)| match f.structure_for_ref {
            CodingStructure::Frame => (f.long_term_mask() == 3
                && f.long_term_pic_num(0) == pic_num)
                .then_some((id, 0)),
            CodingStructure::Field => (0..2)
                .find(|&field| {
                    f.is_long_term_field(field) && f.long_term_pic_num(field) == pic_num
                })
                .map(|field| (id, field)),
        })
    }

    /// Frames still waiting for output, ordered by (largest reset count, smallest POC). Ties go to
    /// the latest in the list.
    fn find_oldest_matching<P>(&self, pool: &FramePool, pred: P) -> Option<FrameId>
    where
        P: Fn(&Frame) -> bool,
    {
        let mut oldest: Option<FrameId> = None;
        let mut smallest_poc = i32::MAX;
        let mut largest_reset_count = 0;

        for (id, f) in self.frames(pool) {
            if !f.full || f.outputted || !pred(f) {
                continue;
            }

            let reset_count = f.ref_pic_list_reset_count(0);
            let poc = f.min_poc();

            if reset_count > largest_reset_count {
                oldest = Some(id);
                smallest_poc = poc;
                largest_reset_count = reset_count;
            } else if reset_count == largest_reset_count && poc <= smallest_poc {
                oldest = Some(id);
                smallest_poc = poc;
            }
        }

        oldest
    }

    pub fn find_oldest_displayable(&self, pool: &FramePool) -> Option<FrameId> {
        self.find_oldest_matching(pool, |_| true)
    }

    /// Oldest frame whose SEI output delay has elapsed.
    pub fn find_displayable_by_dpb_delay(&self, pool: &FramePool) -> Option<FrameId> {
        self.find_oldest_matching(pool, |f| f.dpb_output_delay == Some(0))
    }

    /// Bumps the reset counter of every frame but `exclude`. Pictures decoded before an IDR or
    /// a memory_management_control_operation 5 thus sort before the ones following it.
    pub fn increase_ref_pic_list_reset_count(&self, pool: &mut FramePool, exclude: Option<FrameId>) {
        for &id in self.entries.iter().filter(|&&id| Some(id) != exclude) {
            pool[id].increase_ref_pic_list_reset_count();
        }
    }

    pub fn recovery_frame_cnt(&self) -> Option<i32> {
        self.recovery_frame_cnt
    }

    /// Records the frame_num a recovery point points to. Once a recovery point was honoured,
    /// only clearing it (`None`) is accepted until the next reset.
    pub fn set_recovery_frame_cnt(&mut self, recovery_frame_cnt: Option<i32>) {
        if self.recovery_point_found && recovery_frame_cnt.is_some() {
            return;
        }

        debug!("Recovery frame count set to {:?}", recovery_frame_cnt);
        self.recovery_frame_cnt = recovery_frame_cnt;
        self.recovery_point_found = true;
    }

    /// Resets every frame of the list. The frames stay in the list and become disposable.
    pub fn reset(&mut self, pool: &mut FramePool) {
        for &id in &self.entries {
            pool[id].reset();
        }

        self.recovery_point_found = false;
        self.recovery_frame_cnt = None;
    }

    /// Drops every entry. Used when a session is closed.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recovery_point_found = false;
        self.recovery_frame_cnt = None;
    }

    /// Logs the state of every frame, for tracing marking decisions.
    pub fn dump(&self, pool: &FramePool) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }

        for (id, f) in self.frames(pool) {
            log::trace!(
                "{} frame_num {} wrap {} poc {:?} st {} lt {} lt_idx {:?} full {} out {} disp {}",
                id,
                f.frame_num,
                f.frame_num_wrap,
                [f.field_poc(0), f.field_poc(1)],
                f.short_term_mask(),
                f.long_term_mask(),
                f.long_term_frame_idx,
                f.full,
                f.outputted,
                f.displayed
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::frame::PictureStructure;

    fn add_frame(pool: &mut FramePool, dpb: &mut DpbList, frame_num: i32) -> FrameId {
        let id = pool.alloc();
        pool[id].init(0, 0, PictureStructure::Frame);
        pool[id].frame_num = frame_num;
        pool[id].frame_num_wrap = frame_num;
        pool[id].set_pic_num(frame_num, 0);
        dpb.append(id);
        id
    }

    #[test]
    fn count_refs() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();

        let a = add_frame(&mut pool, &mut dpb, 0);
        let b = add_frame(&mut pool, &mut dpb, 1);
        add_frame(&mut pool, &mut dpb, 2);

        pool[a].set_short_term_ref(true, 0);
        pool[b].set_long_term_ref(true, 0);
        assert_eq!(dpb.count_active_refs(&pool), (1, 1));
        assert_eq!(dpb.count_all_frames(), 3);
    }

    #[test]
    fn oldest_short_term_is_smallest_wrap() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();

        let a = add_frame(&mut pool, &mut dpb, 14);
        let b = add_frame(&mut pool, &mut dpb, 15);
        let c = add_frame(&mut pool, &mut dpb, 0);
        for id in [a, b, c] {
            pool[id].set_short_term_ref(true, 0);
            pool[id].update_frame_num_wrap(1, 16, PictureStructure::Frame);
        }

        assert_eq!(dpb.find_oldest_short_term_ref(&pool), Some(a));
        assert_eq!(dpb.find_short_term_pic(&pool, -1), Some((b, 0)));
        assert_eq!(dpb.find_short_term_pic(&pool, 7), None);
    }

    #[test]
    fn long_term_lookups() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();

        let a = add_frame(&mut pool, &mut dpb, 0);
        let b = add_frame(&mut pool, &mut dpb, 1);
        for (id, idx) in [(a, 0), (b, 2)] {
            pool[id].set_long_term_ref(true, 0);
            pool[id].long_term_frame_idx = Some(idx);
            pool[id].update_long_term_pic_num(PictureStructure::Frame);
        }

        assert_eq!(dpb.find_long_term_ref_idx(&pool, 2), Some(b));
        assert_eq!(dpb.find_long_term_pic(&pool, 0), Some((a, 0)));
        assert_eq!(
            dpb.find_old_long_term_ref(&pool, MaxLongTermFrameIdx::Idx(1)),
            Some(b)
        );
        assert_eq!(
            dpb.find_old_long_term_ref(&pool, MaxLongTermFrameIdx::NoLongTermFrameIndices),
            Some(a)
        );
        assert_eq!(dpb.find_old_long_term_ref(&pool, MaxLongTermFrameIdx::Idx(2)), None);
    }

    #[test]
    fn field_pictures_are_found_per_field() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();

        let id = pool.alloc();
        pool[id].init(0, 0, PictureStructure::TopField);
        pool[id].frame_num = 2;
        pool[id].set_short_term_ref(true, 1);
        pool[id].update_frame_num_wrap(3, 16, PictureStructure::BottomField);
        dpb.append(id);

        // The second field of a top-first pair is the bottom field: same parity.
        assert_eq!(dpb.find_short_term_pic(&pool, 5), Some((id, 1)));
        assert_eq!(dpb.find_short_term_pic(&pool, 4), None);
    }

    #[test]
    fn output_order_prefers_reset_count_then_poc() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();

        let a = add_frame(&mut pool, &mut dpb, 0);
        let b = add_frame(&mut pool, &mut dpb, 1);
        let c = add_frame(&mut pool, &mut dpb, 2);
        for (id, poc) in [(a, 8), (b, 4), (c, 0)] {
            pool[id].full = true;
            pool[id].set_poc(poc, 0);
            pool[id].set_poc(poc, 1);
        }

        assert_eq!(dpb.find_oldest_displayable(&pool), Some(c));

        // Frames decoded before an IDR go first.
        dpb.increase_ref_pic_list_reset_count(&mut pool, Some(c));
        assert_eq!(dpb.find_oldest_displayable(&pool), Some(b));

        pool[b].outputted = true;
        assert_eq!(dpb.find_oldest_displayable(&pool), Some(a));
        assert_eq!(dpb.find_displayable_by_dpb_delay(&pool), None);

        pool[c].dpb_output_delay = Some(0);
        assert_eq!(dpb.find_displayable_by_dpb_delay(&pool), Some(c));
    }

    #[test]
    fn latest_frame_wins_ties() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();

        let first = add_frame(&mut pool, &mut dpb, 0);
        let second = add_frame(&mut pool, &mut dpb, 1);
        pool[first].full = true;
        pool[second].full = true;

        assert_eq!(dpb.find_oldest_displayable(&pool), Some(second));
    }

    #[test]
    fn disposables() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();
        dpb.set_dpb_size(2);

        let a = add_frame(&mut pool, &mut dpb, 0);
        let b = add_frame(&mut pool, &mut dpb, 1);
        pool[a].full = true;
        pool[b].full = true;
        pool[b].set_short_term_ref(true, 0);

        assert!(!dpb.is_disposable_exist(&pool));
        assert!(!dpb.is_almost_disposable_exist(&pool));

        pool[a].outputted = true;
        assert!(dpb.is_almost_disposable_exist(&pool));
        assert_eq!(dpb.get_disposable(&pool), None);

        pool[a].displayed = true;
        assert_eq!(dpb.get_disposable(&pool), Some(a));
        assert_eq!(dpb.count_num_displayable(&pool), 1);
    }

    #[test]
    fn recovery_point_is_honoured_once() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();

        dpb.set_recovery_frame_cnt(Some(4));
        dpb.set_recovery_frame_cnt(Some(7));
        assert_eq!(dpb.recovery_frame_cnt(), Some(4));

        dpb.set_recovery_frame_cnt(None);
        assert_eq!(dpb.recovery_frame_cnt(), None);

        dpb.reset(&mut pool);
        dpb.set_recovery_frame_cnt(Some(7));
        assert_eq!(dpb.recovery_frame_cnt(), Some(7));
    }

    #[test]
    fn move_to_tail() {
        let mut pool = FramePool::new();
        let mut dpb = DpbList::new();

        let a = add_frame(&mut pool, &mut dpb, 0);
        let b = add_frame(&mut pool, &mut dpb, 1);
        dpb.move_to_tail(a);
        assert_eq!(dpb.ids().collect::<Vec<_>>(), vec![b, a]);
    }
}
