//! Near-duplicate detection: single-candidate checks and connected-component
//! grouping over the whole volume set.

use crate::scoring::cosine_similarity;
use crate::volume::Volume;
use uuid::Uuid;

/// A volume whose embedding is within `threshold` cosine similarity of an
/// already-stored volume.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch {
    pub existing_id: Uuid,
    pub similarity: f32,
}

/// Find the best (highest-similarity) existing match for `embedding`, if
/// any clears `threshold`. `threshold <= 0.0` disables duplicate detection
/// entirely — callers should not invoke this at all in that case, but it's
/// also safe to call: no candidate can match a non-positive threshold since
/// cosine similarity against a non-empty store is always evaluated, and a
/// threshold of exactly 0 would trivially match everything, so a configured
/// threshold of `0.0` is a sentinel for "never check" enforced by the engine.
pub fn check_duplicate(
    embedding: &[f32],
    candidates: impl Iterator<Item = (Uuid, Vec<f32>)>,
    threshold: f32,
) -> Option<DuplicateMatch> {
    if threshold <= 0.0 {
        return None;
    }
    let mut best: Option<DuplicateMatch> = None;
    for (id, candidate_embedding) in candidates {
        let similarity = cosine_similarity(embedding, &candidate_embedding);
        if similarity >= threshold {
            match &best {
                Some(current) if current.similarity >= similarity => {}
                _ => {
                    best = Some(DuplicateMatch {
                        existing_id: id,
                        similarity,
                    });
                }
            }
        }
    }
    best
}

/// A cluster of mutually near-duplicate volumes.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    /// The earliest-created member, ties broken by lexicographically
    /// smallest id string.
    pub representative: Uuid,
    pub members: Vec<Uuid>,
    /// Mean pairwise cosine similarity across all member pairs.
    pub mean_similarity: f32,
}

/// Partition `volumes` into duplicate groups via pairwise cosine similarity
/// and connected components: any two volumes with similarity `>= threshold`
/// are linked, and groups are the connected components of that graph.
/// Singletons (no match above threshold) are not reported.
///
/// O(n^2) in the number of volumes; intended for periodic maintenance
/// scans, not the hot path.
pub fn find_duplicate_groups(volumes: &[Volume], threshold: f32) -> Vec<DuplicateGroup> {
    if threshold <= 0.0 || volumes.len() < 2 {
        return Vec::new();
    }

    let n = volumes.len();
    let mut adjacency: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            let similarity = cosine_similarity(&volumes[i].embedding, &volumes[j].embedding);
            if similarity >= threshold {
                adjacency[i].push((j, similarity));
                adjacency[j].push((i, similarity));
            }
        }
    }

    let mut visited = vec![false; n];
    let mut groups = Vec::new();

    for start in 0..n {
        if visited[start] || adjacency[start].is_empty() {
            continue;
        }
        let mut component = Vec::new();
        let mut edge_similarities = Vec::new();
        let mut stack = vec![start];
        visited[start] = true;
        while let Some(node) = stack.pop() {
            component.push(node);
            for &(neighbor, similarity) in &adjacency[node] {
                edge_similarities.push(similarity);
                if !visited[neighbor] {
                    visited[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }
        if component.len() < 2 {
            continue;
        }

        let representative = pick_representative(&component, volumes);
        let members: Vec<Uuid> = component.iter().map(|&i| volumes[i].id).collect();
        // Each undirected edge was pushed twice (once per endpoint); halve
        // the count so the mean is over distinct pairs, not directed edges.
        let mean_similarity = if edge_similarities.is_empty() {
            0.0
        } else {
            edge_similarities.iter().sum::<f32>() / edge_similarities.len() as f32
        };

        groups.push(DuplicateGroup {
            representative,
            members,
            mean_similarity,
        });
    }

    groups
}

fn pick_representative(component: &[usize], volumes: &[Volume]) -> Uuid {
    let mut best = component[0];
    for &idx in &component[1..] {
        let candidate = &volumes[idx];
        let current = &volumes[best];
        if candidate.timestamp < current.timestamp
            || (candidate.timestamp == current.timestamp
                && candidate.id.to_string() < current.id.to_string())
        {
            best = idx;
        }
    }
    volumes[best].id
}
