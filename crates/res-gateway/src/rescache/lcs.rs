//! Longest common subsequence diff between two collections.
//!
//! Produces the add/remove edits that turn a cached collection into a
//! freshly fetched one. Removes come first, highest index first, so each
//! index is valid against the intermediate collection. Adds follow in
//! ascending target order.

use crate::codec::Value;

/// Single edit on a collection
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEdit {
    /// Remove the value at `idx`
    Remove { idx: usize },
    /// Insert `value` at `idx`
    Add { idx: usize, value: Value },
}

/// Compute the edits transforming `a` into `b`.
pub fn diff(a: &[Value], b: &[Value]) -> Vec<CollectionEdit> {
    let mut s = 0;
    let mut m = a.len();
    let mut n = b.len();

    // Common prefix
    while s < m && s < n && a[s] == b[s] {
        s += 1;
    }
    if s == m && s == n {
        return Vec::new();
    }

    // Common suffix
    while s < m && s < n && a[m - 1] == b[n - 1] {
        m -= 1;
        n -= 1;
    }

    let aa = &a[s..m];
    let bb = &b[s..n];
    let m = aa.len();
    let n = bb.len();

    // c[i + w * j] is the LCS length of aa[..i] and bb[..j]
    let w = m + 1;
    let mut c = vec![0usize; w * (n + 1)];
    for i in 0..m {
        for j in 0..n {
            c[(i + 1) + w * (j + 1)] = if aa[i] == bb[j] {
                c[i + w * j] + 1
            } else {
                c[(i + 1) + w * j].max(c[i + w * (j + 1)])
            };
        }
    }

    let common = c[w * (n + 1) - 1];
    let mut edits = Vec::with_capacity(m + n - 2 * common);
    // (index in bb, position in a at the time, removes before it)
    let mut adds: Vec<(usize, usize, usize)> = Vec::with_capacity(n - common);

    let mut idx = m + s;
    let mut i = m;
    let mut j = n;
    let mut removed = 0;

    loop {
        if i > 0 && j > 0 && aa[i - 1] == bb[j - 1] {
            idx -= 1;
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || c[i + w * (j - 1)] >= c[(i - 1) + w * j]) {
            adds.push((j - 1, idx, removed));
            j -= 1;
        } else if i > 0 {
            idx -= 1;
            edits.push(CollectionEdit::Remove { idx });
            removed += 1;
            i -= 1;
        } else {
            break;
        }
    }

    let last = adds.len().saturating_sub(1);
    for (k, &(b_idx, pos, removed_before)) in adds.iter().enumerate().rev() {
        // pos - removed + removed_before + (last - k), never negative
        let idx = pos + removed_before + (last - k) - removed;
        edits.push(CollectionEdit::Add {
            idx,
            value: bb[b_idx].clone(),
        });
    }

    edits
}

/// Apply edits to a collection.
///
/// Returns `None` if an edit is out of bounds.
pub fn apply(collection: &[Value], edits: &[CollectionEdit]) -> Option<Vec<Value>> {
    let mut out = collection.to_vec();
    for edit in edits {
        match edit {
            CollectionEdit::Remove { idx } => {
                if *idx >= out.len() {
                    return None;
                }
                out.remove(*idx);
            }
            CollectionEdit::Add { idx, value } => {
                if *idx > out.len() {
                    return None;
                }
                out.insert(*idx, value.clone());
            }
        }
    }
    Some(out)
}
