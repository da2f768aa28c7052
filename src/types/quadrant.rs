//! Coordinate and quadrant algebra (spec.md §4.1).
//!
//! A [`Quadrant`] is generic over its dimension `D` (2 for quadtrees, 3 for
//! octrees) via a const generic, so the Morton algebra, tree storage and
//! balance kernel are written once instead of duplicated per dimension the
//! way the original C library ships `p4est`/`p8est` as two near-identical
//! libraries.

use crate::constants::{children, faces, insulation, MAXLEVEL, ROOT_LEN};
use smallvec::SmallVec;
use std::cmp::Ordering;

/// An axis-aligned cube `(level, x, y[, z])`. Coordinates are multiples of
/// `side_len(level)` for a *valid* quadrant; an *extended* quadrant (used
/// transiently while transforming across a tree boundary) may carry
/// coordinates outside `[0, ROOT_LEN)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Quadrant<const D: usize> {
    pub level: u8,
    pub coords: [i64; D],
}

impl<const D: usize> Quadrant<D> {
    pub const CHILDREN: usize = 1 << D;
    pub const FACES: usize = 2 * D;
    pub const INSULATION: usize = {
        // 3^D - 1, computed without relying on non-const `usize::pow` in a
        // const context for older toolchains.
        let mut p = 1usize;
        let mut i = 0;
        while i < D {
            p *= 3;
            i += 1;
        }
        p - 1
    };

    pub fn root() -> Self {
        Quadrant {
            level: 0,
            coords: [0; D],
        }
    }

    pub fn side_len(level: u8) -> i64 {
        1i64 << (MAXLEVEL - level)
    }

    /// `true` iff coordinates are aligned to this quadrant's own level and
    /// fall entirely within the (non-extended) root.
    pub fn is_valid(&self) -> bool {
        let side = Self::side_len(self.level);
        self.coords.iter().all(|&c| {
            c >= 0 && c < ROOT_LEN && c % side == 0
        })
    }

    /// `true` for quadrants produced transiently by a face/edge/corner
    /// neighbor lookup that steps outside the root: coordinates are still
    /// aligned, but may lie in `[-ROOT_LEN, 2*ROOT_LEN)`.
    pub fn is_extended(&self) -> bool {
        let side = Self::side_len(self.level);
        self.coords
            .iter()
            .all(|&c| c >= -ROOT_LEN && c < 2 * ROOT_LEN && c.rem_euclid(side) == 0)
    }

    /// Index of this quadrant among its `CHILDREN` siblings (bit `i` set iff
    /// the child lies on the positive side of axis `i`).
    pub fn child_id(&self) -> usize {
        debug_assert!(self.level > 0, "the root quadrant has no child id");
        let shift = (MAXLEVEL - self.level) as u32;
        let mut id = 0usize;
        for (i, &c) in self.coords.iter().enumerate() {
            if (c >> shift) & 1 == 1 {
                id |= 1 << i;
            }
        }
        id
    }

    /// The parent quadrant. Caller must ensure `level > 0`; violating this
    /// is a programming error (spec.md §7.1).
    pub fn parent(&self) -> Self {
        debug_assert!(self.level > 0, "cannot take the parent of the root");
        let parent_level = self.level - 1;
        let mask = !(Self::side_len(parent_level) - 1);
        let mut coords = self.coords;
        for c in coords.iter_mut() {
            *c &= mask;
        }
        Quadrant {
            level: parent_level,
            coords,
        }
    }

    /// The `CHILDREN` children, in child-id order.
    pub fn children_of(&self) -> Vec<Self> {
        debug_assert!(self.level < crate::constants::QMAXLEVEL);
        let child_level = self.level + 1;
        let half = Self::side_len(child_level);
        (0..children(D))
            .map(|id| {
                let mut coords = self.coords;
                for (i, c) in coords.iter_mut().enumerate() {
                    if id & (1 << i) != 0 {
                        *c += half;
                    }
                }
                Quadrant {
                    level: child_level,
                    coords,
                }
            })
            .collect()
    }

    /// The first descendant at `level` (Morton order's minimum in
    /// `[self, self's successor)`).
    pub fn first_descendant(&self, level: u8) -> Self {
        debug_assert!(level >= self.level);
        Quadrant {
            level,
            coords: self.coords,
        }
    }

    /// The last descendant at `level` (Morton order's maximum strictly
    /// inside `self`).
    pub fn last_descendant(&self, level: u8) -> Self {
        debug_assert!(level >= self.level);
        let delta = Self::side_len(self.level) - Self::side_len(level);
        let mut coords = self.coords;
        for c in coords.iter_mut() {
            *c += delta;
        }
        Quadrant { level, coords }
    }

    /// The coarsest quadrant that is an ancestor of (or equal to) both `a`
    /// and `b`.
    pub fn nearest_common_ancestor(a: &Self, b: &Self) -> Self {
        let mut highest_diff: i32 = -1;
        for i in 0..D {
            let x = a.coords[i] ^ b.coords[i];
            if x != 0 {
                let bit = 63 - x.leading_zeros() as i32;
                highest_diff = highest_diff.max(bit);
            }
        }
        let level = if highest_diff < 0 {
            a.level.min(b.level)
        } else {
            let by_diff = (MAXLEVEL as i32 - highest_diff - 1).clamp(0, MAXLEVEL as i32) as u8;
            by_diff.min(a.level).min(b.level)
        };
        let mask = !(Self::side_len(level) - 1);
        let mut coords = a.coords;
        for c in coords.iter_mut() {
            *c &= mask;
        }
        Quadrant { level, coords }
    }

    /// `true` iff `self` is a strict ancestor of `other`.
    pub fn is_ancestor(&self, other: &Self) -> bool {
        if self.level >= other.level {
            return false;
        }
        let mask = !(Self::side_len(self.level) - 1);
        (0..D).all(|i| other.coords[i] & mask == self.coords[i])
    }

    pub fn is_parent_of(&self, other: &Self) -> bool {
        other.level == self.level + 1 && self.is_ancestor(other)
    }

    pub fn is_sibling(&self, other: &Self) -> bool {
        self.level > 0
            && self.level == other.level
            && self != other
            && self.parent() == other.parent()
    }

    /// Interleaved Morton id of `self` truncated to `level` bits of
    /// resolution per axis (`level` must not exceed `self.level`: asking for
    /// finer resolution than the quadrant actually encodes is meaningless).
    pub fn linear_id(&self, level: u8) -> u128 {
        debug_assert!(level <= self.level);
        let mut id: u128 = 0;
        for b in (MAXLEVEL - level..MAXLEVEL).rev() {
            for i in 0..D {
                let bit = (self.coords[i] >> b) & 1;
                id = (id << 1) | bit as u128;
            }
        }
        id
    }

    /// The inverse of [`Quadrant::linear_id`]: reconstruct the quadrant at
    /// `level` whose interleaved id is `id`.
    pub fn set_morton(level: u8, id: u128) -> Self {
        let mut coords = [0i64; D];
        let mut id = id;
        // Bits were pushed MSB-chunk-first in `linear_id`; consume low bits
        // first by walking levels from the deepest back to the shallowest.
        for b in (MAXLEVEL - level..MAXLEVEL).rev() {
            for i in (0..D).rev() {
                let bit = (id & 1) as i64;
                coords[i] |= bit << b;
                id >>= 1;
            }
        }
        Quadrant { level, coords }
    }

    /// Total Morton order: ancestors sort before their descendants; among
    /// quadrants with no ancestor relationship, order follows the
    /// bit-interleaved spatial code.
    pub fn morton_cmp(&self, other: &Self) -> Ordering {
        let mut highest_diff: i32 = -1;
        let mut winner = Ordering::Equal;
        for i in 0..D {
            let x = self.coords[i] ^ other.coords[i];
            if x != 0 {
                let bit = 63 - x.leading_zeros() as i32;
                if bit > highest_diff {
                    highest_diff = bit;
                    winner = if (self.coords[i] >> bit) & 1 == 0 {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    };
                }
            }
        }
        if highest_diff < 0 {
            self.level.cmp(&other.level)
        } else {
            winner
        }
    }

    /// The `face`-neighbor (possibly extended). `face` in `0..FACES`; even
    /// faces are the negative direction of `face/2`, odd faces positive.
    pub fn face_neighbor(&self, face: usize) -> Self {
        debug_assert!(face < Self::FACES);
        let axis = face / 2;
        let sign = if face % 2 == 0 { -1 } else { 1 };
        let side = Self::side_len(self.level);
        let mut coords = self.coords;
        coords[axis] += sign * side;
        Quadrant {
            level: self.level,
            coords,
        }
    }

    /// The `corner`-neighbor (possibly extended). Bit `i` of `corner`
    /// selects the sign of axis `i` (0 = negative, 1 = positive).
    pub fn corner_neighbor(&self, corner: usize) -> Self {
        debug_assert!(corner < Self::CHILDREN);
        let side = Self::side_len(self.level);
        let mut coords = self.coords;
        for (i, c) in coords.iter_mut().enumerate() {
            *c += if corner & (1 << i) != 0 { side } else { -side };
        }
        Quadrant {
            level: self.level,
            coords,
        }
    }

    /// The `edge`-neighbor, 3D only: `edge = free_axis * 4 + combo`, where
    /// `combo` enumerates the four sign combinations of the two axes other
    /// than `free_axis`, in ascending axis order.
    pub fn edge_neighbor(&self, edge: usize) -> Self {
        debug_assert_eq!(D, 3, "edges are only defined for octrees");
        let free_axis = edge / 4;
        let combo = edge % 4;
        let side = Self::side_len(self.level);
        let mut coords = self.coords;
        let mut bit = 0;
        for i in 0..D {
            if i == free_axis {
                continue;
            }
            let sign = if (combo >> bit) & 1 != 0 { 1 } else { -1 };
            coords[i] += sign * side;
            bit += 1;
        }
        Quadrant {
            level: self.level,
            coords,
        }
    }

    /// All `3^D - 1` insulation-layer neighbors (same size), tagged with
    /// their codimension (1 = face, 2 = edge, `D` = corner).
    pub fn insulation_neighbors(&self) -> SmallVec<[(Self, usize); 8]> {
        let side = Self::side_len(self.level);
        let mut out = SmallVec::with_capacity(insulation(D));
        let mut deltas = vec![[0i64; D]];
        for axis in 0..D {
            let mut next = Vec::with_capacity(deltas.len() * 3);
            for d in &deltas {
                for s in [-1i64, 0, 1] {
                    let mut d2 = *d;
                    d2[axis] = s;
                    next.push(d2);
                }
            }
            deltas = next;
        }
        for delta in deltas {
            let codim = delta.iter().filter(|&&s| s != 0).count();
            if codim == 0 {
                continue;
            }
            let mut coords = self.coords;
            for i in 0..D {
                coords[i] += delta[i] * side;
            }
            out.push((
                Quadrant {
                    level: self.level,
                    coords,
                },
                codim,
            ));
        }
        out
    }
}

impl<const D: usize> PartialOrd for Quadrant<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const D: usize> Ord for Quadrant<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.morton_cmp(other)
    }
}

/// The co-dimension up to which 2:1 balance is enforced (spec.md glossary).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectType {
    Face,
    /// 3D only.
    Edge,
    Full,
}

impl ConnectType {
    /// The maximum neighbor codimension this connect type constrains.
    pub fn max_codim(&self, d: usize) -> usize {
        match self {
            ConnectType::Face => 1,
            ConnectType::Edge => {
                debug_assert_eq!(d, 3, "edge-balance only exists in 3D");
                2
            }
            ConnectType::Full => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Q2 = Quadrant<2>;
    type Q3 = Quadrant<3>;

    #[test]
    fn child_and_parent_round_trip() {
        let root = Q2::root();
        for child in root.children_of() {
            assert_eq!(child.parent(), root);
        }
    }

    #[test]
    fn child_id_matches_children_of_order() {
        let root = Q2::root();
        for (id, child) in root.children_of().into_iter().enumerate() {
            assert_eq!(child.child_id(), id);
        }
    }

    #[test]
    fn first_last_descendant_bracket_children() {
        let q = Quadrant::<2> {
            level: 3,
            coords: [8, 8],
        };
        let fd = q.first_descendant(5);
        let ld = q.last_descendant(5);
        assert!(fd <= ld);
        assert_eq!(fd.coords, q.coords);
    }

    #[test]
    fn morton_order_respects_ancestry() {
        let parent = Quadrant::<2> {
            level: 1,
            coords: [0, 0],
        };
        for child in parent.children_of() {
            assert_eq!(parent.morton_cmp(&child), Ordering::Less);
        }
    }

    #[test]
    fn linear_id_round_trips_through_set_morton() {
        let q = Quadrant::<3> {
            level: 4,
            coords: [ROOT_LEN / 2, ROOT_LEN / 4, 0],
        };
        let id = q.linear_id(q.level);
        assert_eq!(Q3::set_morton(q.level, id), q);
    }

    #[test]
    fn nearest_common_ancestor_is_actually_an_ancestor_or_equal() {
        let a = Quadrant::<3> {
            level: 5,
            coords: [0, 0, 0],
        };
        let b = a.children_of()[0].children_of()[3];
        let nca = Quadrant::nearest_common_ancestor(&a, &b);
        assert!(nca.level <= a.level && nca.level <= b.level);
        assert!(nca == a || nca.is_ancestor(&a));
        assert!(nca == b || nca.is_ancestor(&b));
    }

    #[test]
    fn insulation_neighbor_count_matches_3_pow_d_minus_1() {
        let q = Quadrant::<3> {
            level: 10,
            coords: [ROOT_LEN / 2, ROOT_LEN / 2, ROOT_LEN / 2],
        };
        assert_eq!(q.insulation_neighbors().len(), insulation(3));
    }

    #[test]
    fn face_neighbor_is_codim_one() {
        let q = Quadrant::<3> {
            level: 10,
            coords: [ROOT_LEN / 2, ROOT_LEN / 2, ROOT_LEN / 2],
        };
        let n = q.face_neighbor(1);
        assert_eq!(n.coords[0], q.coords[0] + Quadrant::<3>::side_len(q.level));
    }
}
