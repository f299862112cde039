/// Rotation/flip state of an image relative to its canonical orientation
///
/// The four states form a Klein four-group. Composition is a table lookup,
/// and the same table drives both corner-point reordering and pixel
/// addressing so footprints and tiles never disagree.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Orientation {
    #[default]
    Normal,
    Rotated180,
    HFlipped,
    VFlipped,
}

use Orientation::*;

/// `TABLE[state][operation]`, indexed by `Orientation::index`.
/// Column 0 (Normal) is only used when composing two states.
const TABLE: [[Orientation; 4]; 4] = [
    [Normal, Rotated180, HFlipped, VFlipped],
    [Rotated180, Normal, VFlipped, HFlipped],
    [HFlipped, VFlipped, Normal, Rotated180],
    [VFlipped, HFlipped, Rotated180, Normal],
];

/// Corner permutation per state. Corners are ordered
/// `[top-left, top-right, bottom-right, bottom-left]`; entry `i` names the
/// source corner that lands at position `i`.
const CORNER_PERMUTATION: [[usize; 4]; 4] = [
    [0, 1, 2, 3],
    [2, 3, 0, 1],
    [1, 0, 3, 2],
    [3, 2, 1, 0],
];

impl Orientation {
    /// The three operations that can be applied
    pub const OPERATIONS: [Orientation; 3] = [Rotated180, HFlipped, VFlipped];

    fn index(self) -> usize {
        match self {
            Normal => 0,
            Rotated180 => 1,
            HFlipped => 2,
            VFlipped => 3,
        }
    }

    /// Apply `operation` to this state.
    pub fn then(self, operation: Orientation) -> Orientation {
        TABLE[self.index()][operation.index()]
    }

    /// The operation that takes `from` to `to`.
    ///
    /// Every element is its own inverse, so this is just their composition.
    pub fn between(from: Orientation, to: Orientation) -> Orientation {
        from.then(to)
    }

    /// Short label used in disk cache file names
    pub fn label(self) -> &'static str {
        match self {
            Normal => "normal",
            Rotated180 => "rot180",
            HFlipped => "hflip",
            VFlipped => "vflip",
        }
    }

    /// Map a pixel of the oriented image back to the native image.
    ///
    /// None of the states swap axes, so dimensions are unchanged.
    pub fn map_pixel(self, x: u32, y: u32, width: u32, height: u32) -> (u32, u32) {
        match self {
            Normal => (x, y),
            Rotated180 => (width - 1 - x, height - 1 - y),
            HFlipped => (width - 1 - x, y),
            VFlipped => (x, height - 1 - y),
        }
    }

    /// Reorder the four corners as they appear after this state.
    pub fn permute<T: Copy>(self, corners: &[T; 4]) -> [T; 4] {
        let perm = CORNER_PERMUTATION[self.index()];
        [
            corners[perm[0]],
            corners[perm[1]],
            corners[perm[2]],
            corners[perm[3]],
        ]
    }
}

/// Reorder footprint corners for a single orientation operation.
pub fn apply_orientation<T: Copy>(corners: &[T; 4], operation: Orientation) -> [T; 4] {
    Normal.then(operation).permute(corners)
}
