use crate::{Dataset, EntityId, RelationId, Result, Triple};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Read-only multigraph over every known triple (train + valid + test).
///
/// Nodes are entity ids, edges carry the relation id. Edge ids follow
/// insertion order, so a graph built from [`Dataset::all_triples`] numbers
/// train edges first.
///
/// # Example
///
/// ```rust
/// use dkge_core::{EvalGraph, Triple};
///
/// let g = EvalGraph::from_triples(3, [Triple::new(0, 0, 1), Triple::new(0, 1, 2)]);
/// assert_eq!(g.out_neighbors(0), vec![(0, 1), (1, 2)]);
/// assert_eq!(g.in_degree(2), 1);
/// assert!(g.contains(&Triple::new(0, 1, 2)));
/// ```
#[derive(Debug, Clone)]
pub struct EvalGraph {
    graph: DiGraph<(), RelationId, u32>,
}

/// On-disk form: the node count plus the edge list.
#[derive(Serialize, Deserialize)]
struct EdgeList {
    n_entities: usize,
    triples: Vec<Triple>,
}

impl EvalGraph {
    /// Build from an entity count and an edge list.
    pub fn from_triples(n_entities: usize, triples: impl IntoIterator<Item = Triple>) -> Self {
        let triples = triples.into_iter();
        let mut graph = DiGraph::with_capacity(n_entities, triples.size_hint().0);
        for _ in 0..n_entities {
            graph.add_node(());
        }
        for t in triples {
            graph.add_edge(NodeIndex::new(t.head as usize), NodeIndex::new(t.tail as usize), t.relation);
        }
        Self { graph }
    }

    /// Build the full graph of a dataset.
    pub fn from_dataset(dataset: &Dataset) -> Self {
        Self::from_triples(dataset.n_entities(), dataset.all_triples())
    }

    /// Number of entities.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of triples.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn node(&self, id: EntityId) -> Option<NodeIndex> {
        ((id as usize) < self.graph.node_count()).then(|| NodeIndex::new(id as usize))
    }

    fn neighbors(&self, id: EntityId, dir: Direction) -> Vec<(RelationId, EntityId)> {
        let Some(node) = self.node(id) else {
            return Vec::new();
        };
        let mut edges: Vec<(usize, RelationId, EntityId)> = self
            .graph
            .edges_directed(node, dir)
            .map(|e| {
                let other = match dir {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                (e.id().index(), *e.weight(), other.index() as EntityId)
            })
            .collect();
        // petgraph walks adjacency lists newest-first
        edges.sort_unstable_by_key(|(idx, _, _)| *idx);
        edges.into_iter().map(|(_, r, n)| (r, n)).collect()
    }

    /// `(relation, tail)` for every edge leaving `id`, in edge-id order.
    pub fn out_neighbors(&self, id: EntityId) -> Vec<(RelationId, EntityId)> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// `(relation, head)` for every edge entering `id`, in edge-id order.
    pub fn in_neighbors(&self, id: EntityId) -> Vec<(RelationId, EntityId)> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Number of edges leaving `id` (0 for unknown ids).
    pub fn out_degree(&self, id: EntityId) -> u32 {
        self.node(id)
            .map_or(0, |n| self.graph.edges_directed(n, Direction::Outgoing).count() as u32)
    }

    /// Number of edges entering `id` (0 for unknown ids).
    pub fn in_degree(&self, id: EntityId) -> u32 {
        self.node(id)
            .map_or(0, |n| self.graph.edges_directed(n, Direction::Incoming).count() as u32)
    }

    /// The triple stored under an edge id.
    pub fn edge(&self, edge_id: u64) -> Option<Triple> {
        let idx = EdgeIndex::new(usize::try_from(edge_id).ok()?);
        let (src, dst) = self.graph.edge_endpoints(idx)?;
        let relation = *self.graph.edge_weight(idx)?;
        Some(Triple::new(src.index() as EntityId, relation, dst.index() as EntityId))
    }

    /// Whether the triple is a known edge.
    pub fn contains(&self, triple: &Triple) -> bool {
        match (self.node(triple.head), self.node(triple.tail)) {
            (Some(h), Some(t)) => self
                .graph
                .edges_connecting(h, t)
                .any(|e| *e.weight() == triple.relation),
            _ => false,
        }
    }

    /// Write the graph as a binary edge list (bincode).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let list = EdgeList {
            n_entities: self.node_count(),
            triples: (0..self.edge_count() as u64).filter_map(|i| self.edge(i)).collect(),
        };
        bincode::serialize_into(BufWriter::new(File::create(path)?), &list)?;
        Ok(())
    }

    /// Read a graph written by [`EvalGraph::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let list: EdgeList = bincode::deserialize_from(BufReader::new(File::open(path)?))?;
        Ok(Self::from_triples(list.n_entities, list.triples))
    }
}

/// Write a plain triple list (validation or test edges) to a binary file.
pub fn save_triples(path: impl AsRef<Path>, triples: &[Triple]) -> Result<()> {
    bincode::serialize_into(BufWriter::new(File::create(path)?), triples)?;
    Ok(())
}

/// Read a triple list written by [`save_triples`].
pub fn load_triples(path: impl AsRef<Path>) -> Result<Vec<Triple>> {
    Ok(bincode::deserialize_from(BufReader::new(File::open(path)?))?)
}
