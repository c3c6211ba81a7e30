//! Pure interval arithmetic behind every structural mutation.
//!
//! Nothing here touches storage. Callers validate pivots and widths against
//! the current tree before handing the resulting [`Shift`] values to a store.

use crate::node::{Boundary, Node};

/// Width of the slot span `[lft, rgt]`.
pub fn width(lft: Boundary, rgt: Boundary) -> Boundary {
    rgt - lft + 1
}

/// One bulk boundary update: every `lft`/`rgt` value inside `[start, end]`
/// moves by `delta`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Shift {
    pub start: Boundary,
    pub end: Boundary,
    pub delta: i64,
}

impl Shift {
    pub fn apply(&self, value: Boundary) -> Boundary {
        if self.covers(value) {
            value + self.delta
        } else {
            value
        }
    }

    pub fn covers(&self, value: Boundary) -> bool {
        self.start <= value && value <= self.end
    }

    pub fn is_noop(&self) -> bool {
        self.delta == 0 || self.start > self.end
    }

    /// Apply the shift to both boundaries of `node`, reporting whether either
    /// changed.
    pub fn apply_to(&self, node: &mut Node) -> bool {
        let lft = self.apply(node.lft);
        let rgt = self.apply(node.rgt);
        let changed = lft != node.lft || rgt != node.rgt;
        node.lft = lft;
        node.rgt = rgt;
        changed
    }
}

/// Open a gap of `width` slots starting at `pivot`.
pub fn insertion_shift(pivot: Boundary, width: Boundary) -> Shift {
    Shift {
        start: pivot,
        end: Boundary::MAX,
        delta: width,
    }
}

/// Close the gap left by `width` slots that started at `old_lft`.
pub fn removal_shift(old_lft: Boundary, width: Boundary) -> Shift {
    Shift {
        start: old_lft + width,
        end: Boundary::MAX,
        delta: -width,
    }
}

/// Delta applied to every boundary of a relocated subtree.
pub fn move_offset(old_lft: Boundary, new_lft: Boundary) -> i64 {
    new_lft - old_lft
}

/// Move the subtree `[lft, rgt]` into `[lft - rgt, 0]`, out of reach of any
/// shift whose start is positive.
pub fn park(lft: Boundary, rgt: Boundary) -> Shift {
    Shift {
        start: lft,
        end: rgt,
        delta: -rgt,
    }
}

/// Bring a parked subtree (see [`park`]) back so its root lands on `pivot`.
pub fn unpark(lft: Boundary, rgt: Boundary, pivot: Boundary) -> Shift {
    let parked_lft = lft - rgt;
    Shift {
        start: parked_lft,
        end: 0,
        delta: move_offset(parked_lft, pivot),
    }
}

/// Pivot for a new last child of `parent`.
pub fn append_pivot(parent: &Node) -> Boundary {
    parent.rgt
}

/// Pivot for a new first child of `parent`.
pub fn prepend_pivot(parent: &Node) -> Boundary {
    parent.lft + 1
}

/// Pivot for a new node directly before `sibling`.
pub fn before_pivot(sibling: &Node) -> Boundary {
    sibling.lft
}

/// Pivot for a new node directly after `sibling`.
pub fn after_pivot(sibling: &Node) -> Boundary {
    sibling.rgt + 1
}

/// Pivot for a new last root, given the largest boundary in the scope.
pub fn root_pivot(max_rgt: Boundary) -> Boundary {
    max_rgt.max(0) + 1
}
