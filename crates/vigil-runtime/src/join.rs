//! Two-stream windowed join
//!
//! Each side keeps its own retention window. An event arriving on one side
//! is paired with every event retained on the other side; the pairs that
//! satisfy the join condition become new rows. Events evicted from a side
//! take their pairs with them, which become old rows.

use chrono::{DateTime, Utc};
use vigil_core::{SharedEvent, WindowSpec};

use crate::window::RetentionWindow;

/// A joined row: the event of stream 0 and the event of stream 1
pub type Pair = [Option<SharedEvent>; 2];

#[derive(Debug, Default)]
pub struct JoinDelta {
    pub new_pairs: Vec<Pair>,
    pub old_pairs: Vec<Pair>,
}

#[derive(Debug)]
pub struct JoinState {
    sides: [RetentionWindow<SharedEvent>; 2],
}

impl JoinState {
    pub fn new(windows: [WindowSpec; 2]) -> Self {
        Self {
            sides: windows.map(RetentionWindow::new),
        }
    }

    /// Add `event` to side `side` (0 or 1) and report the pairs that formed
    /// and the pairs that dissolved with evicted events.
    pub fn insert<F>(&mut self, side: usize, event: SharedEvent, matches: F) -> JoinDelta
    where
        F: Fn(&Pair) -> bool,
    {
        let other = 1 - side;
        let mut delta = JoinDelta::default();

        for evicted in self.sides[side].insert(event.clone()) {
            self.pairs_with(side, &evicted, &matches, &mut delta.old_pairs);
        }
        self.pairs_with(side, &event, &matches, &mut delta.new_pairs);
        // A time window on the other side may have aged out by this event.
        if self.sides[other].is_time_based() {
            for evicted in self.sides[other].expire(event.timestamp) {
                self.pairs_with(other, &evicted, &matches, &mut delta.old_pairs);
            }
        }
        delta
    }

    /// Expire time windows on both sides as of `now`.
    pub fn expire<F>(&mut self, now: DateTime<Utc>, matches: F) -> Vec<Pair>
    where
        F: Fn(&Pair) -> bool,
    {
        let mut old = Vec::new();
        for side in 0..2 {
            for evicted in self.sides[side].expire(now) {
                self.pairs_with(side, &evicted, &matches, &mut old);
            }
        }
        old
    }

    fn pairs_with<F>(&self, side: usize, event: &SharedEvent, matches: &F, out: &mut Vec<Pair>)
    where
        F: Fn(&Pair) -> bool,
    {
        for partner in self.sides[1 - side].iter() {
            let mut pair: Pair = [None, None];
            pair[side] = Some(event.clone());
            pair[1 - side] = Some(partner.clone());
            if matches(&pair) {
                out.push(pair);
            }
        }
    }

    pub fn len(&self, side: usize) -> usize {
        self.sides[side].len()
    }
}
