//! Callback contracts (spec.md §6).
//!
//! The original library passes these as C function pointers plus a `void*`
//! user context; the idiomatic replacement is a generic closure bound by a
//! small marker trait, so each call site can take `impl RefineFn<D, T>`
//! (etc.) without boxing unless the caller actually needs dynamic dispatch.

use crate::types::quadrant::Quadrant;

/// May `quadrant` in `tree` be refined?
pub trait RefineFn<const D: usize, T> {
    fn call(&mut self, tree: u32, quadrant: &Quadrant<D>, data: Option<&T>) -> bool;
}

impl<const D: usize, T, F> RefineFn<D, T> for F
where
    F: FnMut(u32, &Quadrant<D>, Option<&T>) -> bool,
{
    fn call(&mut self, tree: u32, quadrant: &Quadrant<D>, data: Option<&T>) -> bool {
        self(tree, quadrant, data)
    }
}

/// May this family of `CHILDREN` siblings be coarsened into their parent?
pub trait CoarsenFn<const D: usize, T> {
    fn call(&mut self, tree: u32, siblings: &[Quadrant<D>], data: &[Option<&T>]) -> bool;
}

impl<const D: usize, T, F> CoarsenFn<D, T> for F
where
    F: FnMut(u32, &[Quadrant<D>], &[Option<&T>]) -> bool,
{
    fn call(&mut self, tree: u32, siblings: &[Quadrant<D>], data: &[Option<&T>]) -> bool {
        self(tree, siblings, data)
    }
}

/// Populate user data for a newly created leaf.
pub trait InitFn<const D: usize, T> {
    fn call(&mut self, tree: u32, quadrant: &Quadrant<D>) -> T;
}

impl<const D: usize, T, F> InitFn<D, T> for F
where
    F: FnMut(u32, &Quadrant<D>) -> T,
{
    fn call(&mut self, tree: u32, quadrant: &Quadrant<D>) -> T {
        self(tree, quadrant)
    }
}

/// Transfer user data across a refinement/coarsening event: `outgoing` are
/// the leaves being removed, `incoming` the leaves replacing them (either
/// direction — one parent to `CHILDREN` children, or the reverse).
pub trait ReplaceFn<const D: usize, T> {
    fn call(
        &mut self,
        tree: u32,
        outgoing: &[(Quadrant<D>, T)],
        incoming: &[Quadrant<D>],
    ) -> Vec<T>;
}

impl<const D: usize, T, F> ReplaceFn<D, T> for F
where
    F: FnMut(u32, &[(Quadrant<D>, T)], &[Quadrant<D>]) -> Vec<T>,
{
    fn call(
        &mut self,
        tree: u32,
        outgoing: &[(Quadrant<D>, T)],
        incoming: &[Quadrant<D>],
    ) -> Vec<T> {
        self(tree, outgoing, incoming)
    }
}

/// Optional non-negative load weight for partitioning.
pub trait WeightFn<const D: usize, T> {
    fn call(&mut self, tree: u32, quadrant: &Quadrant<D>, data: Option<&T>) -> u64;
}

impl<const D: usize, T, F> WeightFn<D, T> for F
where
    F: FnMut(u32, &Quadrant<D>, Option<&T>) -> u64,
{
    fn call(&mut self, tree: u32, quadrant: &Quadrant<D>, data: Option<&T>) -> u64 {
        self(tree, quadrant, data)
    }
}
