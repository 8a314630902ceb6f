//! Unsupervised starting clustering: PCA, a kNN graph on the leading
//! components, then Louvain community detection at a given resolution.

use std::collections::{BTreeMap, HashMap};

use indicatif::{ProgressBar, ProgressStyle};
use kiddo::float::distance::SquaredEuclidean;
use kiddo::float::kdtree::KdTree;
use log::{info, warn};
use ndarray::{Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};

use crate::dataset::{ClusterId, Labels};
use crate::error::{Result, SccafError};

pub const DEFAULT_RESOLUTION: f64 = 1.5;
pub const DEFAULT_N_PCS: usize = 10;
pub const DEFAULT_N_NEIGHBORS: usize = 15;

/// Passes over all nodes per Louvain level before giving up on convergence.
const MAX_LOCAL_PASSES: usize = 100;

#[derive(Debug, Clone)]
pub struct ClusteringConfig {
    pub resolution: f64,
    pub n_pcs: usize,
    pub n_neighbors: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            n_pcs: DEFAULT_N_PCS,
            n_neighbors: DEFAULT_N_NEIGHBORS,
        }
    }
}

/// Weighted undirected graph as symmetric adjacency lists. A self loop is
/// stored once and carries twice the weight of the edges it stands for.
pub type Graph = Vec<Vec<(usize, f64)>>;

/// Project cells onto the leading principal components.
///
/// The eigendecomposition runs on whichever of the gene covariance or the
/// cell Gram matrix is smaller.
pub fn pca(x: ArrayView2<f64>, n_components: usize) -> Result<Array2<f64>> {
    let (n_cells, n_genes) = x.dim();
    if n_cells < 2 || n_genes == 0 {
        return Err(SccafError::EmptyInput(format!(
            "PCA needs at least 2 cells and 1 gene, got {}x{}",
            n_cells, n_genes
        )));
    }
    let mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| SccafError::EmptyInput("no cells for PCA".to_string()))?;
    let centered = &x - &mean;
    let k = n_components.min(n_genes).min(n_cells - 1).max(1);

    let scores = if n_genes <= n_cells {
        let cov = centered.t().dot(&centered) / (n_cells as f64 - 1.0);
        let (eigenvalues, eigenvectors) = cov.eigh(UPLO::Lower).map_err(|e| SccafError::Linalg(e.to_string()))?;
        let top = descending_order(eigenvalues.as_slice().unwrap_or(&[]), k);
        centered.dot(&eigenvectors.select(Axis(1), &top))
    } else {
        // X = U S V^T, so the scores X V equal U S and come straight from X X^T
        let gram = centered.dot(&centered.t());
        let (eigenvalues, eigenvectors) = gram.eigh(UPLO::Lower).map_err(|e| SccafError::Linalg(e.to_string()))?;
        let top = descending_order(eigenvalues.as_slice().unwrap_or(&[]), k);
        let mut scores = eigenvectors.select(Axis(1), &top);
        for (mut column, &idx) in scores.columns_mut().into_iter().zip(&top) {
            column *= eigenvalues[idx].max(0.0).sqrt();
        }
        scores
    };

    info!("PCA complete: {} cells, {} components", n_cells, scores.ncols());
    Ok(scores)
}

fn descending_order(values: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(std::cmp::Ordering::Equal));
    order.truncate(k);
    order
}

/// Symmetric unit-weight kNN graph over the rows of `points`.
pub fn knn_graph(points: &Array2<f64>, n_neighbors: usize) -> Graph {
    let neighbors = match points.ncols() {
        0 => return vec![Vec::new(); points.nrows()],
        1 => knn_for_dim::<1>(points, n_neighbors),
        2 => knn_for_dim::<2>(points, n_neighbors),
        3 => knn_for_dim::<3>(points, n_neighbors),
        4 => knn_for_dim::<4>(points, n_neighbors),
        5 => knn_for_dim::<5>(points, n_neighbors),
        6 => knn_for_dim::<6>(points, n_neighbors),
        7 => knn_for_dim::<7>(points, n_neighbors),
        8 => knn_for_dim::<8>(points, n_neighbors),
        9 => knn_for_dim::<9>(points, n_neighbors),
        10 => knn_for_dim::<10>(points, n_neighbors),
        20 => knn_for_dim::<20>(points, n_neighbors),
        d => {
            warn!("kNN search not implemented for {} dimensions. Using first 10 components.", d);
            let truncated = points.slice(ndarray::s![.., ..10.min(d)]).to_owned();
            return knn_graph(&truncated, n_neighbors);
        }
    };

    let mut edges: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); points.nrows()];
    for (i, list) in neighbors.iter().enumerate() {
        for &j in list {
            if i != j {
                edges[i].insert(j, 1.0);
                edges[j].insert(i, 1.0);
            }
        }
    }
    edges.into_iter().map(|m| m.into_iter().collect()).collect()
}

/// Coordinates as a hashable key; `-0.0` and `0.0` map to the same key.
fn point_key<const D: usize>(point: &[f64; D]) -> [u64; D] {
    let mut key = [0u64; D];
    for (k, &v) in key.iter_mut().zip(point) {
        *k = if v == 0.0 { 0 } else { v.to_bits() };
    }
    key
}

fn knn_for_dim<const D: usize>(points: &Array2<f64>, n_neighbors: usize) -> Vec<Vec<usize>> {
    const B: usize = 256;
    let n_points = points.nrows();

    let to_point = |i: usize| {
        let mut point_arr = [0.0; D];
        for (j, value) in points.row(i).iter().enumerate().take(D) {
            point_arr[j] = *value;
        }
        point_arr
    };

    // a leaf holds at most B items at one location, so identical cells share
    // a single tree entry and are expanded again after the search
    let mut slot_of: HashMap<[u64; D], usize> = HashMap::new();
    let mut members: Vec<Vec<usize>> = Vec::new();
    let mut slots = Vec::with_capacity(n_points);
    for i in 0..n_points {
        let next = members.len();
        let slot = *slot_of.entry(point_key(&to_point(i))).or_insert(next);
        if slot == next {
            members.push(Vec::new());
        }
        members[slot].push(i);
        slots.push(slot);
    }
    if members.len() < n_points {
        info!(
            "kNN: {} cells share {} distinct positions",
            n_points,
            members.len()
        );
    }

    let mut tree = KdTree::<f64, u64, D, B, u32>::new();
    for group in &members {
        tree.add(&to_point(group[0]), slots[group[0]] as u64);
    }

    let pb = ProgressBar::new(n_points as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} cells processed (kNN)")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );

    let mut nearest_slots: Vec<Option<Vec<usize>>> = vec![None; members.len()];
    let mut neighbors = Vec::with_capacity(n_points);
    for i in 0..n_points {
        let slot = slots[i];
        // every position holds at least one cell, so k+1 positions cover k
        // neighbours plus the query cell itself
        let nearest = nearest_slots[slot].get_or_insert_with(|| {
            tree.nearest_n::<SquaredEuclidean>(&to_point(i), n_neighbors + 1)
                .into_iter()
                .map(|nn| nn.item as usize)
                .collect()
        });
        neighbors.push(
            nearest
                .iter()
                .flat_map(|&s| members[s].iter().copied())
                .filter(|&j| j != i)
                .take(n_neighbors)
                .collect(),
        );
        if i % 1000 == 0 {
            pb.set_position(i as u64);
        }
    }
    pb.finish_and_clear();
    neighbors
}

fn node_degrees(graph: &Graph) -> Vec<f64> {
    graph.iter().map(|adj| adj.iter().map(|&(_, w)| w).sum()).collect()
}

/// Move nodes between communities until no single move raises modularity.
/// Nodes are visited in index order; a node only moves for a strictly
/// better gain and candidate communities are compared in id order.
fn local_moving(graph: &Graph, resolution: f64) -> (Vec<usize>, bool) {
    let n = graph.len();
    let degrees = node_degrees(graph);
    let two_m: f64 = degrees.iter().sum();
    let mut community: Vec<usize> = (0..n).collect();
    if two_m <= 0.0 {
        return (community, false);
    }
    let mut totals = degrees.clone();
    let mut moved_any = false;

    for _ in 0..MAX_LOCAL_PASSES {
        let mut moved = false;
        for node in 0..n {
            let current = community[node];
            let k_i = degrees[node];

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for &(neighbor, weight) in &graph[node] {
                if neighbor != node {
                    *links.entry(community[neighbor]).or_insert(0.0) += weight;
                }
            }

            totals[current] -= k_i;
            let gain = |c: usize, k_in: f64| k_in - resolution * totals[c] * k_i / two_m;
            let mut best = current;
            let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
            for (&c, &k_in) in &links {
                let g = gain(c, k_in);
                if g > best_gain + 1e-12 {
                    best = c;
                    best_gain = g;
                }
            }
            totals[best] += k_i;

            if best != current {
                community[node] = best;
                moved = true;
                moved_any = true;
            }
        }
        if !moved {
            break;
        }
    }

    (community, moved_any)
}

/// Relabel community ids to `0..n_communities`, in order of first appearance.
fn renumber(community: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let renumbered = community
        .iter()
        .map(|c| {
            let next = mapping.len();
            *mapping.entry(*c).or_insert(next)
        })
        .collect();
    (renumbered, mapping.len())
}

fn aggregate(graph: &Graph, community: &[usize], n_communities: usize) -> Graph {
    let mut edges: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n_communities];
    for (node, adj) in graph.iter().enumerate() {
        let a = community[node];
        for &(neighbor, weight) in adj {
            *edges[a].entry(community[neighbor]).or_insert(0.0) += weight;
        }
    }
    edges.into_iter().map(|m| m.into_iter().collect()).collect()
}

/// Louvain community detection. Returns one community index per node,
/// numbered by decreasing community size (ties by lowest member).
pub fn louvain(graph: &Graph, resolution: f64) -> Vec<usize> {
    let mut membership: Vec<usize> = (0..graph.len()).collect();
    let mut level_graph = graph.clone();
    let mut level = 0;

    loop {
        let (community, moved) = local_moving(&level_graph, resolution);
        if !moved {
            break;
        }
        let (community, n_communities) = renumber(&community);
        for m in membership.iter_mut() {
            *m = community[*m];
        }
        level += 1;
        info!("Louvain level {}: {} communities", level, n_communities);
        if n_communities == level_graph.len() {
            break;
        }
        level_graph = aggregate(&level_graph, &community, n_communities);
    }

    let mut sizes: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (node, &c) in membership.iter().enumerate() {
        let entry = sizes.entry(c).or_insert((0, node));
        entry.0 += 1;
    }
    let mut ranked: Vec<(usize, usize, usize)> = sizes.into_iter().map(|(c, (size, first))| (c, size, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    let rank: HashMap<usize, usize> = ranked.iter().enumerate().map(|(r, &(c, _, _))| (c, r)).collect();

    membership.iter().map(|c| rank[c]).collect()
}

/// Round-0 clustering for cells without a supplied assignment.
pub fn initial_clustering(x: ArrayView2<f64>, config: &ClusteringConfig) -> Result<Labels> {
    info!(
        "Computing initial clustering (PCs: {}, neighbors: {}, resolution: {:.2})...",
        config.n_pcs, config.n_neighbors, config.resolution
    );
    let scores = pca(x, config.n_pcs)?;
    let graph = knn_graph(&scores, config.n_neighbors.min(x.nrows().saturating_sub(1)).max(1));
    let communities = louvain(&graph, config.resolution);

    let n_clusters = communities.iter().max().map_or(0, |m| m + 1);
    info!("Initial clustering found {} clusters", n_clusters);
    Ok(communities
        .into_iter()
        .map(|c| Some(ClusterId::from(c.to_string())))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn clique(graph: &mut Graph, nodes: &[usize]) {
        for &a in nodes {
            for &b in nodes {
                if a != b {
                    graph[a].push((b, 1.0));
                }
            }
        }
    }

    #[test]
    fn louvain_splits_two_cliques_joined_by_a_bridge() {
        let mut graph: Graph = vec![Vec::new(); 8];
        clique(&mut graph, &[0, 1, 2, 3]);
        clique(&mut graph, &[4, 5, 6, 7]);
        graph[3].push((4, 1.0));
        graph[4].push((3, 1.0));

        let communities = louvain(&graph, 1.0);
        assert!(communities[..4].iter().all(|&c| c == communities[0]));
        assert!(communities[4..].iter().all(|&c| c == communities[4]));
        assert_ne!(communities[0], communities[4]);
        assert_eq!(communities[0], 0, "ties in size go to the community holding node 0");
    }

    #[test]
    fn lower_resolution_merges_more() {
        let mut graph: Graph = vec![Vec::new(); 8];
        clique(&mut graph, &[0, 1, 2, 3]);
        clique(&mut graph, &[4, 5, 6, 7]);
        graph[3].push((4, 1.0));
        graph[4].push((3, 1.0));

        let coarse = louvain(&graph, 0.01);
        assert!(coarse.iter().all(|&c| c == 0));
    }

    #[test]
    fn edgeless_graph_keeps_singletons() {
        let graph: Graph = vec![Vec::new(); 3];
        assert_eq!(louvain(&graph, 1.0), vec![0, 1, 2]);
    }

    #[test]
    fn aggregation_preserves_total_weight() {
        let mut graph: Graph = vec![Vec::new(); 4];
        clique(&mut graph, &[0, 1, 2, 3]);
        let before: f64 = node_degrees(&graph).iter().sum();
        let aggregated = aggregate(&graph, &[0, 0, 1, 1], 2);
        let after: f64 = node_degrees(&aggregated).iter().sum();
        assert!((before - after).abs() < 1e-12);
    }

    #[test]
    fn knn_graph_is_symmetric() {
        let points = array![[0.0, 0.0], [0.1, 0.0], [5.0, 5.0], [5.1, 5.0]];
        let graph = knn_graph(&points, 1);
        assert_eq!(graph[0], vec![(1, 1.0)]);
        assert_eq!(graph[2], vec![(3, 1.0)]);
        for (i, adj) in graph.iter().enumerate() {
            for &(j, _) in adj {
                assert!(graph[j].iter().any(|&(k, _)| k == i));
            }
        }
    }

    #[test]
    fn knn_graph_handles_many_identical_cells() {
        let points = Array2::<f64>::zeros((600, 2));
        let graph = knn_graph(&points, 15);
        assert_eq!(graph.len(), 600);
        for (i, adj) in graph.iter().enumerate() {
            assert!(adj.len() >= 15);
            assert!(adj.iter().all(|&(j, _)| j != i));
        }
    }

    #[test]
    fn duplicate_positions_are_neighbours_first() {
        let mut rows = vec![0.0; 2 * 300];
        rows.extend_from_slice(&[10.0, 10.0, 10.1, 10.0, 10.0, 10.1]);
        let points = Array2::from_shape_vec((303, 2), rows).unwrap();
        let graph = knn_graph(&points, 2);
        // the three distant cells only point at each other
        assert_eq!(graph[300], vec![(301, 1.0), (302, 1.0)]);
        assert!(graph[0].iter().all(|&(j, _)| j < 300));
    }

    #[test]
    fn pca_recovers_single_direction() {
        let x = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0], [4.0, 8.0]];
        let scores = pca(x.view(), 1).unwrap();
        assert_eq!(scores.dim(), (4, 1));
        let spread = (scores[[3, 0]] - scores[[0, 0]]).abs();
        assert!((spread - (9.0f64 + 36.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn pca_wide_matrix_uses_gram_path() {
        let x = array![[1.0, 0.0, 0.0, 2.0], [0.0, 1.0, 0.0, 2.0], [0.0, 0.0, 1.0, 2.0]];
        let scores = pca(x.view(), 5).unwrap();
        assert_eq!(scores.ncols(), 2);
        // pairwise distances are preserved when all variance is kept
        let d01 = (scores.row(0).to_owned() - scores.row(1)).mapv(|v| v * v).sum().sqrt();
        assert!((d01 - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn initial_clustering_separates_distant_groups() {
        let mut rows = Vec::new();
        for i in 0..12 {
            let base = if i < 6 { 0.0 } else { 50.0 };
            rows.extend_from_slice(&[base + (i % 3) as f64 * 0.1, base + (i % 2) as f64 * 0.1, base]);
        }
        let x = Array2::from_shape_vec((12, 3), rows).unwrap();
        let config = ClusteringConfig {
            resolution: 1.0,
            n_pcs: 2,
            n_neighbors: 5,
        };
        let labels = initial_clustering(x.view(), &config).unwrap();
        assert!(labels[..6].iter().all(|l| l == &labels[0]));
        assert!(labels[6..].iter().all(|l| l == &labels[6]));
        assert_ne!(labels[0], labels[6]);
    }
}
