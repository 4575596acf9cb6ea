//! Pure planning over a course's prerequisite graph.
//!
//! Nothing in this module touches the database. The engine loads a
//! [`CourseGraph`] snapshot, asks [`plan_prerequisites`] whether a
//! replacement edge list is acceptable, and writes the resulting
//! [`GraphPlan`] only when it is.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;

/// Snapshot of one course's islands and prerequisite edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseGraph {
    /// Stored position of each island, in creation order.
    positions: IndexMap<String, i64>,
    /// `island -> [prerequisite, ...]`, in the order they were supplied.
    prerequisites: HashMap<String, Vec<String>>,
}

impl CourseGraph {
    /// Builds a snapshot from `(island_id, position)` pairs in creation
    /// order and `(island_id, prerequisite_island_id)` edges.
    pub fn new(
        islands: impl IntoIterator<Item = (String, i64)>,
        edges: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut graph = Self::default();
        graph.positions.extend(islands);
        for (island, prerequisite) in edges {
            graph
                .prerequisites
                .entry(island)
                .or_default()
                .push(prerequisite);
        }
        graph
    }

    pub fn contains(&self, island_id: &str) -> bool {
        self.positions.contains_key(island_id)
    }

    /// Island ids in creation order.
    pub fn islands(&self) -> impl ExactSizeIterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    pub fn position(&self, island_id: &str) -> Option<i64> {
        self.positions.get(island_id).copied()
    }

    pub fn prerequisites_of(&self, island_id: &str) -> &[String] {
        self.prerequisites
            .get(island_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All edges as `(island, prerequisite)` pairs, grouped by island in
    /// creation order.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.islands()
            .flat_map(|island| {
                self.prerequisites_of(island)
                    .iter()
                    .map(move |prerequisite| (island.to_string(), prerequisite.clone()))
            })
            .collect()
    }
}

/// The requested edges would close a cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("prerequisites of island {island_id} would create a cycle: {}", .path.join(" -> "))]
pub struct CycleError {
    /// The island whose edge list was being replaced.
    pub island_id: String,
    /// The cycle, following "requires" edges, starting and ending at
    /// `island_id`.
    pub path: Vec<String>,
}

/// An island whose derived position differs from the stored one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionChange {
    pub island_id: String,
    pub from: i64,
    pub to: i64,
}

/// An accepted edge replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPlan {
    pub island_id: String,
    /// The island's new prerequisite list, duplicates removed.
    pub prerequisites: Vec<String>,
    /// Recomputed position of every island, in creation order.
    pub positions: Vec<(String, i64)>,
    /// Islands whose position changes, in creation order.
    pub moved: Vec<PositionChange>,
}

/// Decides whether `island_id` may require exactly `requested`.
///
/// The caller has already checked that every requested id is an island of
/// the course other than `island_id` itself. Duplicate ids are collapsed,
/// keeping their first occurrence.
pub fn plan_prerequisites(
    graph: &CourseGraph,
    island_id: &str,
    requested: &[String],
) -> Result<GraphPlan, CycleError> {
    let mut seen = HashSet::new();
    let prerequisites: Vec<String> = requested
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();

    let mut edges = graph.prerequisites.clone();
    edges.insert(island_id.to_string(), prerequisites.clone());

    if let Some(path) = find_cycle(&edges, island_id) {
        return Err(CycleError {
            island_id: island_id.to_string(),
            path,
        });
    }

    let positions = compute_positions(&graph.positions, &edges).map_err(|stuck| CycleError {
        island_id: island_id.to_string(),
        path: stuck,
    })?;

    let moved = positions
        .iter()
        .filter_map(|(id, to)| {
            let from = graph.position(id).unwrap_or(0);
            (from != *to).then(|| PositionChange {
                island_id: id.clone(),
                from,
                to: *to,
            })
        })
        .collect();

    Ok(GraphPlan {
        island_id: island_id.to_string(),
        prerequisites,
        positions,
        moved,
    })
}

/// Looks for a path of "requires" edges from `start` back to itself.
///
/// Iterative depth-first search with a visited set, so every island and
/// edge is examined at most once. Returns the cycle as a list of ids
/// beginning and ending with `start`.
fn find_cycle(edges: &HashMap<String, Vec<String>>, start: &str) -> Option<Vec<String>> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut stack: Vec<&str> = vec![start];

    while let Some(node) = stack.pop() {
        let Some(next) = edges.get(node) else {
            continue;
        };
        for prerequisite in next {
            let prerequisite = prerequisite.as_str();
            if prerequisite == start {
                let mut path = vec![start.to_string()];
                let mut cursor = node;
                let mut chain = vec![];
                while cursor != start {
                    chain.push(cursor.to_string());
                    cursor = parent.get(cursor).copied().unwrap_or(start);
                }
                chain.reverse();
                path.extend(chain);
                path.push(start.to_string());
                return Some(path);
            }
            if visited.insert(prerequisite) {
                parent.insert(prerequisite, node);
                stack.push(prerequisite);
            }
        }
    }
    None
}

/// Assigns each island its topological depth: the length of the longest
/// prerequisite chain ending at it. Islands without prerequisites sit at 0.
///
/// `islands` maps each island to its stored position in creation order;
/// only the order is consulted. Kahn's algorithm is seeded in that order,
/// so the result is a total function of the island list and edge set.
/// Edges pointing at islands outside the list are ignored. On a cycle,
/// returns the islands that could not be ordered.
pub fn compute_positions(
    islands: &IndexMap<String, i64>,
    edges: &HashMap<String, Vec<String>>,
) -> Result<Vec<(String, i64)>, Vec<String>> {
    // dependents[p] = islands that require p
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); islands.len()];
    let mut pending: Vec<usize> = vec![0; islands.len()];
    for (i, island) in islands.keys().enumerate() {
        let mut unique = HashSet::new();
        for prerequisite in edges.get(island).into_iter().flatten() {
            if let Some(p) = islands.get_index_of(prerequisite.as_str()) {
                if unique.insert(p) {
                    dependents[p].push(i);
                    pending[i] += 1;
                }
            }
        }
    }

    let mut depth = vec![0i64; islands.len()];
    let mut ready: VecDeque<usize> = (0..islands.len()).filter(|&i| pending[i] == 0).collect();
    let mut ordered = 0usize;

    while let Some(p) = ready.pop_front() {
        ordered += 1;
        for &d in &dependents[p] {
            depth[d] = depth[d].max(depth[p] + 1);
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if ordered != islands.len() {
        return Err(islands
            .keys()
            .enumerate()
            .filter(|(i, _)| pending[*i] > 0)
            .map(|(_, id)| id.clone())
            .collect());
    }

    Ok(islands.keys().cloned().zip(depth).collect())
}
