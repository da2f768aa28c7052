//! The static tree graph: vertices, trees, and face/edge/corner neighbor
//! relations with orientation codes (spec.md §3, §4.1, §6).
//!
//! Connectivity is read-only once built and may be shared across forests
//! (spec.md §5); callers wrap it in `Arc` rather than cloning it per forest.

use crate::types::quadrant::Quadrant;
use crate::constants::{children, faces, MAXLEVEL, ROOT_LEN};

/// How a quadrant's coordinates are carried from one tree's local frame into
/// a neighbor tree's local frame when it crosses a face, edge or corner.
///
/// `perm[i]` is the axis in the *source* tree that becomes local axis `i` in
/// the *target* tree; `flip[i]` reflects that axis about the root extent.
/// This is the bit-exact contract §4.1 calls out: user code that interprets
/// per-leaf directions across a tree boundary must agree with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Orientation<const D: usize> {
    pub perm: [u8; D],
    pub flip: [bool; D],
}

impl<const D: usize> Orientation<D> {
    pub fn identity() -> Self {
        let mut perm = [0u8; D];
        for (i, p) in perm.iter_mut().enumerate() {
            *p = i as u8;
        }
        Orientation {
            perm,
            flip: [false; D],
        }
    }
}

/// One neighbor-tree record: a `(codim, local_feature, neighbor_tree,
/// neighbor_feature, orientation)` tuple. `local_feature`/`neighbor_feature`
/// are face/edge/corner indices in `0..FACES`/`0..EDGES`/`0..CHILDREN`
/// respectively depending on `codim`. Stored as a flat list of records
/// rather than a pointer graph per the Design Notes (spec.md §9): a single
/// edge or corner can be shared by more than two trees, so this is
/// naturally a one-to-many relation.
#[derive(Clone, Copy, Debug)]
pub struct NeighborRecord<const D: usize> {
    pub codim: usize,
    pub local_feature: u8,
    pub neighbor_tree: u32,
    pub neighbor_feature: u8,
    pub orientation: Orientation<D>,
}

/// A static graph of trees (spec.md §3). Geometry (`vertices`,
/// `tree_to_vertex`) is carried for API fidelity with §6's persisted record
/// but is never consulted by balance, which works purely combinatorially.
#[derive(Clone, Debug)]
pub struct Connectivity<const D: usize> {
    pub num_trees: u32,
    pub num_vertices: u32,
    /// `3 * num_vertices` doubles, `[x, y, z]` per vertex (`z` unused in 2D).
    pub vertices: Vec<f64>,
    /// `CHILDREN * num_trees` vertex indices.
    pub tree_to_vertex: Vec<u32>,
    /// Neighbor records per tree, indexed by tree id.
    pub neighbors: Vec<Vec<NeighborRecord<D>>>,
}

impl<const D: usize> Connectivity<D> {
    /// A single tree with no neighbors: every boundary is a true domain
    /// boundary. Useful as the base case and in unit tests.
    pub fn single_tree() -> Self {
        Connectivity {
            num_trees: 1,
            num_vertices: children(D) as u32,
            vertices: vec![0.0; 3 * children(D)],
            tree_to_vertex: (0..children(D) as u32).collect(),
            neighbors: vec![Vec::new()],
        }
    }

    /// Build a connectivity from an explicit adjacency: `periodic_faces`
    /// wires face `i` of the only tree (`tree 0`) to itself across the
    /// opposite face with identity orientation, used for the Möbius /
    /// periodic-boundary style topologies mentioned in spec.md §8 scenario 2
    /// and similar small fixtures in tests.
    pub fn two_tree_strip(flip_axis: usize) -> Self {
        debug_assert!(flip_axis < D);
        let mut neighbors = vec![Vec::new(); 2];
        let mut orient = Orientation::<D>::identity();
        orient.flip[flip_axis] = true;
        // tree 0's face 1 (positive x) connects to tree 1's face 0.
        neighbors[0].push(NeighborRecord {
            codim: 1,
            local_feature: 1,
            neighbor_tree: 1,
            neighbor_feature: 0,
            orientation: orient,
        });
        neighbors[1].push(NeighborRecord {
            codim: 1,
            local_feature: 0,
            neighbor_tree: 0,
            neighbor_feature: 1,
            orientation: orient,
        });
        Connectivity {
            num_trees: 2,
            num_vertices: 2 * children(D) as u32,
            vertices: vec![0.0; 3 * 2 * children(D)],
            tree_to_vertex: (0..2 * children(D) as u32).collect(),
            neighbors,
        }
    }

    /// Two trees sharing a single corner, Möbius-style (spec.md §8 scenario
    /// 2): tree 0's "top-right" corner (the one with every coordinate
    /// bit set) glues to tree 1's "bottom-left" corner (index 0), flipped on
    /// every axis so a quadrant ratcheting across the corner lands
    /// upside-down in the neighbor's frame. Unlike `two_tree_strip`, which
    /// only wires a face, this is the codimension-`D` corner record a
    /// balance pass needs to see two trees meeting only at a point.
    pub fn two_tree_corner() -> Self {
        let mut neighbors = vec![Vec::new(); 2];
        let mut orient = Orientation::<D>::identity();
        for f in orient.flip.iter_mut() {
            *f = true;
        }
        let last_corner = (children(D) - 1) as u8;
        neighbors[0].push(NeighborRecord {
            codim: D,
            local_feature: last_corner,
            neighbor_tree: 1,
            neighbor_feature: 0,
            orientation: orient,
        });
        neighbors[1].push(NeighborRecord {
            codim: D,
            local_feature: 0,
            neighbor_tree: 0,
            neighbor_feature: last_corner,
            orientation: orient,
        });
        Connectivity {
            num_trees: 2,
            num_vertices: 2 * children(D) as u32,
            vertices: vec![0.0; 3 * 2 * children(D)],
            tree_to_vertex: (0..2 * children(D) as u32).collect(),
            neighbors,
        }
    }

    pub fn neighbors_of(&self, tree: u32) -> &[NeighborRecord<D>] {
        &self.neighbors[tree as usize]
    }

    /// Unified transform: carry an extended quadrant (one that has stepped
    /// outside `from_tree`'s root via a face/edge/corner neighbor lookup)
    /// into `record.neighbor_tree`'s local frame. Applies `record`'s
    /// orientation code. Returns `None` if the quadrant is not actually
    /// extended past the expected feature (a caller bug, but non-fatal here
    /// since dropped/no-op transforms are recoverable per spec.md §7).
    pub fn utransform(q: &Quadrant<D>, record: &NeighborRecord<D>) -> Quadrant<D> {
        let side = Quadrant::<D>::side_len(q.level);
        let mut coords = [0i64; D];
        for i in 0..D {
            let src_axis = record.orientation.perm[i] as usize;
            let val = q.coords[src_axis];
            coords[i] = if record.orientation.flip[i] {
                ROOT_LEN - val - side
            } else {
                val
            };
        }
        Quadrant {
            level: q.level,
            coords,
        }
    }

    /// Face-only specialization of [`Connectivity::utransform`], kept as a
    /// distinct name to mirror spec.md §4.1's `transform_face` /
    /// `transform_edge` / `transform_corner` trio; all three funnel through
    /// the same unified implementation.
    pub fn transform_face(q: &Quadrant<D>, record: &NeighborRecord<D>) -> Quadrant<D> {
        debug_assert_eq!(record.codim, 1);
        Self::utransform(q, record)
    }

    pub fn transform_edge(q: &Quadrant<D>, record: &NeighborRecord<D>) -> Quadrant<D> {
        debug_assert_eq!(record.codim, 2);
        Self::utransform(q, record)
    }

    pub fn transform_corner(q: &Quadrant<D>, record: &NeighborRecord<D>) -> Quadrant<D> {
        debug_assert_eq!(record.codim, D);
        Self::utransform(q, record)
    }

    /// All neighbor records whose codimension is at most `max_codim` and
    /// which pertain to the given local feature kind. Used by the ghost
    /// protocol when an insulation neighbor leaves the tree root (spec.md
    /// §4.5 Phase A): a corner can be shared by several trees, so this may
    /// return more than one record.
    pub fn records_for_feature(
        &self,
        tree: u32,
        codim: usize,
        feature: u8,
    ) -> impl Iterator<Item = &NeighborRecord<D>> {
        self.neighbors[tree as usize]
            .iter()
            .filter(move |r| r.codim == codim && r.local_feature == feature)
    }
}

/// Convenience: the set of face indices, `0..FACES`.
pub fn face_indices(d: usize) -> std::ops::Range<u8> {
    0..faces(d) as u8
}

pub const fn max_level() -> u8 {
    MAXLEVEL
}
