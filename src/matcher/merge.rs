//! Transitive merging of `(folders, ids)` pairs into equivalence classes.

use std::collections::BTreeSet;

pub type Group<F, I> = (BTreeSet<F>, BTreeSet<I>);

/// Merges every pair whose id sets intersect, transitively.
///
/// If A shares an id with B and B one with C, all three end up in one class
/// even though A and C share nothing. The output is sorted, so it does not
/// depend on the input order.
pub fn merge_intersecting_sets<F, I>(items: impl IntoIterator<Item = Group<F, I>>) -> Vec<Group<F, I>>
where
    F: Ord,
    I: Ord,
{
    merge_where(items, |a, b| !a.1.is_disjoint(&b.1))
}

/// Like [`merge_intersecting_sets`] but also merges classes sharing a folder.
pub fn merge_overlapping_groups<F, I>(items: impl IntoIterator<Item = Group<F, I>>) -> Vec<Group<F, I>>
where
    F: Ord,
    I: Ord,
{
    merge_where(items, |a, b| !a.0.is_disjoint(&b.0) || !a.1.is_disjoint(&b.1))
}

fn merge_where<F, I, P>(items: impl IntoIterator<Item = Group<F, I>>, intersects: P) -> Vec<Group<F, I>>
where
    F: Ord,
    I: Ord,
    P: Fn(&Group<F, I>, &Group<F, I>) -> bool,
{
    let mut worklist: Vec<Group<F, I>> = items.into_iter().collect();
    let mut merged = Vec::new();

    while let Some(mut current) = worklist.pop() {
        // Absorbing one set can make others intersect, so repeat until stable
        loop {
            let (absorbed, rest): (Vec<_>, Vec<_>) = worklist
                .into_iter()
                .partition(|other| intersects(&current, other));
            worklist = rest;
            if absorbed.is_empty() {
                break;
            }
            for (folders, ids) in absorbed {
                current.0.extend(folders);
                current.1.extend(ids);
            }
        }
        merged.push(current);
    }

    merged.sort();
    merged
}
