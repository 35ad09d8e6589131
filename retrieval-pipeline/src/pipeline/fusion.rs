use std::{collections::HashSet, hash::Hash};

use common::error::AppError;

/// Interleaves ranked lists one item per source per round. An item already
/// taken from an earlier source (or an earlier round) is skipped, so the
/// first source to surface an item keeps it.
pub fn round_robin<T, K, F>(sources: Vec<Vec<T>>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let total = sources.iter().map(Vec::len).sum();
    let mut iters: Vec<std::vec::IntoIter<T>> = sources.into_iter().map(Vec::into_iter).collect();
    let mut seen = HashSet::with_capacity(total);
    let mut merged = Vec::with_capacity(total);

    loop {
        let mut progressed = false;
        for iter in &mut iters {
            if let Some(item) = iter.next() {
                progressed = true;
                if seen.insert(key(&item)) {
                    merged.push(item);
                }
            }
        }
        if !progressed {
            break;
        }
    }
    merged
}

/// Keeps the longest prefix whose cumulative cost fits `budget`. Items after
/// the first one that overflows are dropped even if they would fit.
pub fn truncate_by_tokens<T, F>(items: Vec<T>, budget: usize, cost: F) -> Result<Vec<T>, AppError>
where
    F: Fn(&T) -> Result<usize, AppError>,
{
    let mut used = 0usize;
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        used = used.saturating_add(cost(&item)?);
        if used > budget {
            break;
        }
        kept.push(item);
    }
    Ok(kept)
}
