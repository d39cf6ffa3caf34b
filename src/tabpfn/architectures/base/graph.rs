//! Data DAGs and their spectral positional encodings.
//!
//! A DAG describes causal structure between the columns of one batch element.
//! Nodes may stand for features, the target, or latent variables. After the
//! transitive closure only feature and target nodes are kept, and every kept
//! node is given the leading non-trivial eigenvectors of the directed
//! Laplacian as its positional encoding.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use petgraph::algo::kosaraju_scc;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::{Directed, Graph};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{HashMap, VecDeque};

use super::eigen::{EigenMode, EigenSolver};
use super::error::{Result, TransformerError};

/// Graph node metadata for DAG operations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMetadata {
    pub is_feature: bool,
    pub is_target: bool,
    pub feature_idxs: Vec<usize>,
    pub target_idxs: Vec<usize>,
    pub positional_encoding: Option<Vec<f32>>,
}

impl NodeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feature_indices(mut self, indices: Vec<usize>) -> Self {
        self.is_feature = !indices.is_empty();
        self.feature_idxs = indices;
        self
    }

    pub fn with_target_indices(mut self, indices: Vec<usize>) -> Self {
        self.is_target = !indices.is_empty();
        self.target_idxs = indices;
        self
    }
}

pub type DataDAG = Graph<NodeMetadata, (), Directed>;

/// For every path `a -> b -> c`, add `a -> c` if missing.
///
/// Returns whether any edge was added. Newly added edges are visible to later
/// nodes in the same pass.
pub fn add_direct_connections(graph: &mut DataDAG) -> bool {
    let mut added_connection = false;
    let nodes: Vec<NodeIndex> = graph.node_indices().collect();

    for node in nodes {
        let neighbors: Vec<NodeIndex> = graph.neighbors(node).collect();
        for neighbor in neighbors {
            let second_neighbors: Vec<NodeIndex> = graph.neighbors(neighbor).collect();
            for second_neighbor in second_neighbors {
                if graph.find_edge(node, second_neighbor).is_none() {
                    graph.add_edge(node, second_neighbor, ());
                    added_connection = true;
                }
            }
        }
    }

    added_connection
}

/// Repeat [`add_direct_connections`] until nothing changes.
pub fn transitive_closure(graph: &mut DataDAG) {
    let mut passes = 0;
    while add_direct_connections(graph) {
        passes += 1;
    }
    debug!("transitive closure converged after {passes} extra passes");
}

/// Induced subgraph on feature and target nodes, node order preserved.
pub fn feature_target_subgraph(graph: &DataDAG) -> DataDAG {
    let mut subgraph = DataDAG::new();
    let mut mapping = HashMap::new();
    for node in graph.node_indices() {
        let meta = &graph[node];
        if meta.is_feature || meta.is_target {
            mapping.insert(node, subgraph.add_node(meta.clone()));
        }
    }
    for edge in graph.edge_references() {
        if let (Some(&s), Some(&t)) = (mapping.get(&edge.source()), mapping.get(&edge.target())) {
            subgraph.add_edge(s, t, ());
        }
    }
    subgraph
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    Random,
    Lazy,
    PageRank,
}

const PAGERANK_ALPHA: f64 = 0.95;
const STATIONARY_TOLERANCE: f64 = 1e-12;
const STATIONARY_MAX_ITERATIONS: usize = 100_000;

/// Whether the graph is aperiodic, via the gcd of BFS level differences
/// along non-tree edges. Isolated single nodes are periodic.
pub fn is_aperiodic(graph: &DataDAG) -> bool {
    let Some(start) = graph.node_indices().next() else {
        return false;
    };

    let mut levels: HashMap<NodeIndex, i64> = HashMap::new();
    levels.insert(start, 0);
    let mut frontier = VecDeque::from([start]);
    let mut g: i64 = 0;

    while let Some(node) = frontier.pop_front() {
        let level = levels[&node];
        for next in graph.neighbors(node) {
            match levels.get(&next) {
                Some(&next_level) => g = gcd(g, level - next_level + 1),
                None => {
                    levels.insert(next, level + 1);
                    frontier.push_back(next);
                }
            }
        }
    }

    if levels.len() == graph.node_count() {
        g == 1
    } else {
        // Nodes unreachable from the start node form their own components.
        let rest: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|n| !levels.contains_key(n))
            .collect();
        g == 1 && is_aperiodic(&graph.filter_map(
            |n, w| rest.contains(&n).then(|| w.clone()),
            |_, e| Some(*e),
        ))
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn adjacency(graph: &DataDAG) -> DMatrix<f64> {
    let n = graph.node_count();
    let mut a = DMatrix::zeros(n, n);
    for edge in graph.edge_references() {
        a[(edge.source().index(), edge.target().index())] = 1.0;
    }
    a
}

/// Row-normalize; rows summing to zero stay zero.
fn row_normalized(a: &DMatrix<f64>) -> DMatrix<f64> {
    let mut p = a.clone();
    for mut row in p.row_iter_mut() {
        let sum: f64 = row.sum();
        if sum != 0.0 {
            row /= sum;
        }
    }
    p
}

fn transition_matrix(graph: &DataDAG, walk: Walk) -> DMatrix<f64> {
    let n = graph.node_count();
    let a = adjacency(graph);
    match walk {
        Walk::Random => row_normalized(&a),
        Walk::Lazy => (DMatrix::identity(n, n) + row_normalized(&a)) * 0.5,
        Walk::PageRank => {
            let mut a = a;
            let uniform = 1.0 / n as f64;
            for mut row in a.row_iter_mut() {
                if row.sum() == 0.0 {
                    row.fill(uniform);
                }
            }
            let p = row_normalized(&a);
            p * PAGERANK_ALPHA + DMatrix::from_element(n, n, (1.0 - PAGERANK_ALPHA) / n as f64)
        }
    }
}

/// Stationary distribution of `p` by power iteration on `Pᵀ`.
fn stationary_distribution(p: &DMatrix<f64>) -> Result<DVector<f64>> {
    let n = p.nrows();
    let pt = p.transpose();
    let mut v = DVector::from_element(n, 1.0 / n as f64);

    for _ in 0..STATIONARY_MAX_ITERATIONS {
        let mut next = &pt * &v;
        let total = next.sum();
        if total != 0.0 {
            next /= total;
        }
        if !next.iter().all(|x| x.is_finite()) {
            return Ok(next);
        }
        let delta = (&next - &v).amax();
        v = next;
        if delta < STATIONARY_TOLERANCE {
            return Ok(v);
        }
    }

    Err(TransformerError::numerical(format!(
        "stationary distribution did not converge in {STATIONARY_MAX_ITERATIONS} iterations"
    )))
}

/// Normalized directed Laplacian `L = I - (Q + Qᵀ) / 2` with
/// `Q = Φ^{1/2} P Φ^{-1/2}`.
///
/// The walk is a plain random walk for strongly connected aperiodic graphs,
/// a lazy walk for strongly connected periodic graphs, and PageRank with
/// teleportation otherwise. NaN entries are replaced with 0.
pub fn directed_laplacian(graph: &DataDAG) -> Result<DMatrix<f64>> {
    let n = graph.node_count();
    if n == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }

    let strongly_connected = kosaraju_scc(graph).len() == 1;
    let walk = match (strongly_connected, strongly_connected && is_aperiodic(graph)) {
        (true, true) => Walk::Random,
        (true, false) => Walk::Lazy,
        _ => Walk::PageRank,
    };
    debug!("directed laplacian over {n} nodes uses {walk:?} walk");

    let p = transition_matrix(graph, walk);
    let phi = stationary_distribution(&p)?;
    let total = phi.sum();
    let sqrt_phi = phi.map(|x| (x / total).abs().sqrt());

    let mut q = p.clone();
    for i in 0..n {
        for j in 0..n {
            q[(i, j)] = sqrt_phi[i] * p[(i, j)] / sqrt_phi[j];
        }
    }

    let mut laplacian = DMatrix::identity(n, n) - (&q + q.transpose()) * 0.5;
    laplacian.apply(|x| {
        if x.is_nan() {
            *x = 0.0;
        }
    });
    Ok(laplacian)
}

/// Assign `k`-dimensional spectral positional encodings to every node.
///
/// Eigenvectors `1..=k` (ascending eigenvalue, the trivial first one dropped)
/// are used; each column is multiplied by a random sign drawn from `rng`.
/// Columns beyond what the solver returns are zero.
pub fn add_pos_emb<S: EigenSolver + ?Sized>(
    graph: &mut DataDAG,
    is_undirected: bool,
    k: usize,
    solver: &S,
    rng: &mut StdRng,
) -> Result<()> {
    let n = graph.node_count();
    if n == 0 {
        return Ok(());
    }

    let laplacian = directed_laplacian(graph)?;
    let mode = if is_undirected {
        EigenMode::SmallestAlgebraic
    } else {
        EigenMode::SmallestReal
    };
    let pairs = solver.smallest_k_eigenpairs(&laplacian, k + 1, mode)?;
    let usable = pairs.len().saturating_sub(1).min(k);
    if usable < k {
        warn!("graph with {n} nodes only yields {usable} of {k} positional encoding columns, zero-padding");
    }

    let signs: Vec<f32> = (0..k)
        .map(|_| -1.0 + 2.0 * rng.random_range(0..2) as f32)
        .collect();

    for (row, node) in graph.node_indices().collect::<Vec<_>>().into_iter().enumerate() {
        let encoding = (0..k)
            .map(|col| {
                if col < usable {
                    pairs.vectors[(row, col + 1)] as f32 * signs[col]
                } else {
                    0.0
                }
            })
            .collect();
        graph[node].positional_encoding = Some(encoding);
    }

    Ok(())
}

/// Closure, feature/target restriction and positional encodings in one go.
pub fn graph_positional_encodings<S: EigenSolver + ?Sized>(
    dag: &DataDAG,
    k: usize,
    solver: &S,
    rng: &mut StdRng,
) -> Result<DataDAG> {
    let mut closed = dag.clone();
    transitive_closure(&mut closed);
    let mut subgraph = feature_target_subgraph(&closed);
    add_pos_emb(&mut subgraph, false, k, solver, rng)?;
    Ok(subgraph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabpfn::architectures::base::eigen::{EigenPairs, NalgebraEigenSolver};
    use rand::SeedableRng;

    fn chain(n: usize) -> (DataDAG, Vec<NodeIndex>) {
        let mut g = DataDAG::new();
        let nodes: Vec<_> = (0..n)
            .map(|i| g.add_node(NodeMetadata::new().with_feature_indices(vec![i])))
            .collect();
        for w in nodes.windows(2) {
            g.add_edge(w[0], w[1], ());
        }
        (g, nodes)
    }

    #[test]
    fn test_transitive_closure_of_chain() {
        let (mut g, n) = chain(3);
        transitive_closure(&mut g);
        assert!(g.find_edge(n[0], n[1]).is_some());
        assert!(g.find_edge(n[1], n[2]).is_some());
        assert!(g.find_edge(n[0], n[2]).is_some());
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn test_closed_graph_is_fixed_point() {
        let (mut g, _) = chain(4);
        transitive_closure(&mut g);
        let edges = g.edge_count();
        assert!(!add_direct_connections(&mut g));
        assert_eq!(g.edge_count(), edges);
    }

    #[test]
    fn test_subgraph_drops_latent_nodes() {
        let mut g = DataDAG::new();
        let f = g.add_node(NodeMetadata::new().with_feature_indices(vec![0]));
        let latent = g.add_node(NodeMetadata::new());
        let t = g.add_node(NodeMetadata::new().with_target_indices(vec![0]));
        g.add_edge(f, latent, ());
        g.add_edge(latent, t, ());
        transitive_closure(&mut g);

        let sub = feature_target_subgraph(&g);
        assert_eq!(sub.node_count(), 2);
        assert_eq!(sub.edge_count(), 1);
        assert!(sub[NodeIndex::new(1)].is_target);
    }

    #[test]
    fn test_aperiodicity() {
        let mut cycle = DataDAG::new();
        let a = cycle.add_node(NodeMetadata::new());
        let b = cycle.add_node(NodeMetadata::new());
        cycle.add_edge(a, b, ());
        cycle.add_edge(b, a, ());
        assert!(!is_aperiodic(&cycle));

        cycle.add_edge(a, a, ());
        assert!(is_aperiodic(&cycle));
    }

    #[test]
    fn test_laplacian_is_symmetric_and_finite() {
        let (g, _) = chain(4);
        let l = directed_laplacian(&g).unwrap();
        assert_eq!(l.shape(), (4, 4));
        assert!(l.iter().all(|x| x.is_finite()));
        assert!((&l - l.transpose()).amax() < 1e-12);
    }

    #[test]
    fn test_laplacian_of_undirected_cycle_has_zero_eigenvalue() {
        // 2-cycle is strongly connected and periodic: lazy walk.
        let mut g = DataDAG::new();
        let a = g.add_node(NodeMetadata::new());
        let b = g.add_node(NodeMetadata::new());
        g.add_edge(a, b, ());
        g.add_edge(b, a, ());
        let l = directed_laplacian(&g).unwrap();
        let pairs = NalgebraEigenSolver::default()
            .smallest_k_eigenpairs(&l, 1, EigenMode::SmallestReal)
            .unwrap();
        assert!(pairs.values[0].abs() < 1e-9);
    }

    #[test]
    fn test_pos_emb_shapes_and_padding() {
        let (mut g, _) = chain(2);
        let mut rng = StdRng::seed_from_u64(0);
        add_pos_emb(&mut g, false, 3, &NalgebraEigenSolver::default(), &mut rng).unwrap();
        for node in g.node_indices() {
            let pe = g[node].positional_encoding.as_ref().unwrap();
            assert_eq!(pe.len(), 3);
            // Only one non-trivial eigenvector exists for 2 nodes.
            assert_eq!(pe[1], 0.0);
            assert_eq!(pe[2], 0.0);
        }
    }

    struct FixedSolver;

    impl EigenSolver for FixedSolver {
        fn smallest_k_eigenpairs(
            &self,
            matrix: &DMatrix<f64>,
            k: usize,
            _mode: EigenMode,
        ) -> Result<EigenPairs> {
            let n = matrix.nrows();
            let vectors = DMatrix::from_fn(n, k, |r, c| (r * 10 + c) as f64);
            Ok(EigenPairs {
                values: (0..k).map(|v| v as f64).collect(),
                vectors,
            })
        }
    }

    #[test]
    fn test_pos_emb_skips_first_eigenvector_and_flips_signs() {
        let (mut g, _) = chain(3);
        let mut rng = StdRng::seed_from_u64(1);
        add_pos_emb(&mut g, false, 2, &FixedSolver, &mut rng).unwrap();

        let pe = g[NodeIndex::new(2)].positional_encoding.clone().unwrap();
        assert_eq!(pe[0].abs(), 21.0);
        assert_eq!(pe[1].abs(), 22.0);
    }

    #[test]
    fn test_graph_encodings_are_reproducible() {
        let (g, _) = chain(4);
        let solver = NalgebraEigenSolver::default();
        let a = graph_positional_encodings(&g, 2, &solver, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = graph_positional_encodings(&g, 2, &solver, &mut StdRng::seed_from_u64(9)).unwrap();
        for node in a.node_indices() {
            assert_eq!(a[node].positional_encoding, b[node].positional_encoding);
        }
    }
}
