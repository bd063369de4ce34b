use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::types::{JunctionId, Location, Neighbor, Node, Segment, SegmentId};
use crate::{ReachError, Result};

/// An adjacency entry in the arena: `target` is a dense node index, not a junction id.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Edge {
    pub target: usize,
    pub length_meters: f64,
    pub segment: SegmentId,
}

/// Junctions that take part in at least one adjacency entry, indexed densely in input order.
/// Immutable once built, so it can be shared between reach workers.
#[derive(Clone, Debug)]
pub struct SpatialGraph {
    ids: Vec<JunctionId>,
    locations: Vec<Location>,
    index: HashMap<JunctionId, usize>,
    adjacency: Vec<Vec<Edge>>,
    weights: BTreeMap<String, Vec<f64>>,
}

fn index_nodes(nodes: &[Node]) -> Result<HashMap<JunctionId, usize>> {
    let mut index = HashMap::with_capacity(nodes.len());
    for (position, node) in nodes.iter().enumerate() {
        if index.insert(node.id, position).is_some() {
            return Err(ReachError::DuplicateNode { id: node.id });
        }
    }
    Ok(index)
}

fn check_length(segment: SegmentId, length: f64) -> Result<()> {
    if !length.is_finite() || length < 0.0 {
        return Err(ReachError::InvalidLength { segment, length });
    }
    Ok(())
}

// Every ordered pair of distinct endpoints, as (from position, entry).
fn segment_entries(index: &HashMap<JunctionId, usize>, segments: &[Segment]) -> Result<Vec<(usize, Neighbor)>> {
    let mut entries = Vec::new();
    for segment in segments {
        let endpoints = segment.distinct_endpoints();
        if endpoints.len() < 2 {
            log::debug!("Dropping segment {} with {} endpoint(s)", segment.id, endpoints.len());
            continue;
        }
        check_length(segment.id, segment.length_meters)?;
        if endpoints.len() > 2 {
            log::warn!(
                "Segment {} joins {} junctions, linking all of them to each other",
                segment.id,
                endpoints.len()
            );
        }

        let mut positions = Vec::with_capacity(endpoints.len());
        for node in &endpoints {
            match index.get(node) {
                Some(position) => positions.push(*position),
                None => return Err(ReachError::UnknownEndpoint { segment: segment.id, node: *node }),
            }
        }
        for (from, position) in positions.iter().enumerate() {
            for (to, neighbor) in endpoints.iter().enumerate() {
                if from != to {
                    entries.push((
                        *position,
                        Neighbor { node: *neighbor, length_meters: segment.length_meters, segment: segment.id },
                    ));
                }
            }
        }
    }
    Ok(entries)
}

/// Appends the segment-derived neighbour entries to each node's own `neighbors` list.
pub fn link_segments(nodes: &mut [Node], segments: &[Segment]) -> Result<()> {
    let index = index_nodes(nodes)?;
    for (position, entry) in segment_entries(&index, segments)? {
        nodes[position].neighbors.push(entry);
    }
    Ok(())
}

impl SpatialGraph {
    /// Builds the graph from the nodes' pre-linked neighbours plus every segment.
    ///
    /// Fails on duplicate junction ids, references to unknown junctions, negative or
    /// non-finite lengths and weights. Segments with fewer than two distinct endpoints are
    /// skipped. Junctions that end up with no adjacency entry in either direction are left out.
    /// A junction with no outgoing entries is kept when another junction points at it; its
    /// reach is then just its own `weight * decay(0)`, which can still set a field's maximum
    /// during normalization.
    pub fn build(nodes: &[Node], segments: &[Segment]) -> Result<Self> {
        let index = index_nodes(nodes)?;

        for node in nodes {
            for (property, value) in &node.weights {
                if !value.is_finite() || *value < 0.0 {
                    return Err(ReachError::InvalidWeight {
                        node: node.id,
                        property: property.clone(),
                        value: *value,
                    });
                }
            }
        }

        let mut adjacency: Vec<Vec<Neighbor>> = vec![Vec::new(); nodes.len()];
        for (position, node) in nodes.iter().enumerate() {
            for neighbor in &node.neighbors {
                if !index.contains_key(&neighbor.node) {
                    return Err(ReachError::UnknownNeighbor { node: node.id, neighbor: neighbor.node });
                }
                check_length(neighbor.segment, neighbor.length_meters)?;
                adjacency[position].push(*neighbor);
            }
        }
        for (position, entry) in segment_entries(&index, segments)? {
            adjacency[position].push(entry);
        }

        let mut linked = vec![false; nodes.len()];
        for (position, entries) in adjacency.iter().enumerate() {
            if !entries.is_empty() {
                linked[position] = true;
            }
            for entry in entries {
                linked[index[&entry.node]] = true;
            }
        }

        let kept: Vec<usize> = (0..nodes.len()).filter(|p| linked[*p]).collect();
        let mut dense = HashMap::with_capacity(kept.len());
        for (dense_index, position) in kept.iter().enumerate() {
            dense.insert(nodes[*position].id, dense_index);
        }

        let graph_adjacency: Vec<Vec<Edge>> = kept
            .iter()
            .map(|position| {
                adjacency[*position]
                    .iter()
                    .map(|n| Edge { target: dense[&n.node], length_meters: n.length_meters, segment: n.segment })
                    .collect()
            })
            .collect();

        let properties: BTreeSet<&String> = kept.iter().flat_map(|p| nodes[*p].weights.keys()).collect();
        let weights = properties
            .into_iter()
            .map(|property| {
                let column = kept.iter().map(|p| nodes[*p].weight(property)).collect();
                (property.clone(), column)
            })
            .collect();

        let graph = SpatialGraph {
            ids: kept.iter().map(|p| nodes[*p].id).collect(),
            locations: kept.iter().map(|p| nodes[*p].location).collect(),
            index: dense,
            adjacency: graph_adjacency,
            weights,
        };
        log::info!(
            "Built junction graph: {} of {} junctions linked, {} adjacency entries",
            graph.len(),
            nodes.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum()
    }

    pub fn ids(&self) -> &[JunctionId] {
        &self.ids
    }

    pub fn id(&self, index: usize) -> JunctionId {
        self.ids[index]
    }

    pub fn index_of(&self, id: JunctionId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn location(&self, index: usize) -> Location {
        self.locations[index]
    }

    pub fn neighbors(&self, index: usize) -> &[Edge] {
        &self.adjacency[index]
    }

    /// Per-node values of a weight property, in graph order. `None` if no junction carries it.
    pub fn weight_column(&self, property: &str) -> Option<&[f64]> {
        self.weights.get(property).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn junctions(ids: &[JunctionId]) -> Vec<Node> {
        ids.iter().map(|id| Node::new(*id, 49.0, -123.0)).collect()
    }

    fn targets(graph: &SpatialGraph, id: JunctionId) -> Vec<JunctionId> {
        let index = graph.index_of(id).unwrap();
        graph.neighbors(index).iter().map(|e| graph.id(e.target)).collect()
    }

    #[test]
    fn test_two_endpoint_segment_links_both_ways() {
        let graph = SpatialGraph::build(&junctions(&[1, 2]), &[Segment::new(10, 55.5, vec![1, 2])]).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(targets(&graph, 1), vec![2]);
        assert_eq!(targets(&graph, 2), vec![1]);
        let edge = graph.neighbors(0)[0];
        assert_eq!(edge.length_meters, 55.5);
        assert_eq!(edge.segment, 10);
    }

    #[test]
    fn test_many_endpoints_fan_out_to_a_clique() {
        let graph = SpatialGraph::build(&junctions(&[1, 2, 3]), &[Segment::new(10, 20.0, vec![1, 2, 3])]).unwrap();
        assert_eq!(graph.edge_count(), 6);
        assert_eq!(targets(&graph, 1), vec![2, 3]);
        assert_eq!(targets(&graph, 2), vec![1, 3]);
        assert_eq!(targets(&graph, 3), vec![1, 2]);
    }

    #[test]
    fn test_isolated_junctions_are_dropped() {
        let nodes = junctions(&[1, 2, 3]);
        let segments = vec![Segment::new(10, 20.0, vec![1, 3]), Segment::new(11, 5.0, vec![2])];
        let graph = SpatialGraph::build(&nodes, &segments).unwrap();
        assert_eq!(graph.ids().to_vec(), vec![1, 3]);
        assert_eq!(graph.index_of(2), None);
        assert_eq!(graph.neighbors(graph.index_of(3).unwrap())[0].target, 0);
    }

    #[test]
    fn test_empty_inputs_give_empty_graph() {
        assert!(SpatialGraph::build(&[], &[]).unwrap().is_empty());
        assert!(SpatialGraph::build(&junctions(&[1, 2]), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_endpoint_is_fatal() {
        let err = SpatialGraph::build(&junctions(&[1, 2]), &[Segment::new(10, 20.0, vec![1, 9])]).unwrap_err();
        assert!(matches!(err, ReachError::UnknownEndpoint { segment: 10, node: 9 }));
    }

    #[test]
    fn test_duplicate_junction_is_fatal() {
        let err = SpatialGraph::build(&junctions(&[1, 2, 1]), &[]).unwrap_err();
        assert!(matches!(err, ReachError::DuplicateNode { id: 1 }));
    }

    #[test]
    fn test_bad_length_and_weight_are_fatal() {
        let err = SpatialGraph::build(&junctions(&[1, 2]), &[Segment::new(4, -3.0, vec![1, 2])]).unwrap_err();
        assert!(matches!(err, ReachError::InvalidLength { segment: 4, .. }));

        let mut nodes = junctions(&[1, 2]);
        nodes[1].weights.insert("crime_count".into(), f64::INFINITY);
        let err = SpatialGraph::build(&nodes, &[]).unwrap_err();
        assert!(matches!(err, ReachError::InvalidWeight { node: 2, .. }));
    }

    #[test]
    fn test_prelinked_neighbors_merge_with_segments() {
        let mut nodes = junctions(&[1, 2, 3]);
        nodes[0].neighbors.push((2, 12.0, 77).into());
        let graph = SpatialGraph::build(&nodes, &[Segment::new(10, 20.0, vec![1, 3])]).unwrap();
        assert_eq!(targets(&graph, 1), vec![2, 3]);
        assert!(targets(&graph, 2).is_empty());
        assert_eq!(graph.len(), 3);

        nodes[2].neighbors.push((42, 1.0, 78).into());
        let err = SpatialGraph::build(&nodes, &[]).unwrap_err();
        assert!(matches!(err, ReachError::UnknownNeighbor { node: 3, neighbor: 42 }));
    }

    #[test]
    fn test_link_segments_writes_neighbor_lists() {
        let mut nodes = junctions(&[1, 2, 3]);
        link_segments(&mut nodes, &[Segment::new(10, 20.0, vec![1, 2]), Segment::new(11, 30.0, vec![2, 3])]).unwrap();
        assert_eq!(nodes[1].neighbors, vec![Neighbor::from((1, 20.0, 10)), Neighbor::from((3, 30.0, 11))]);
        // Building from the linked lists alone gives the same graph.
        let graph = SpatialGraph::build(&nodes, &[]).unwrap();
        assert_eq!(graph.edge_count(), 4);
    }

    #[test]
    fn test_weight_columns_follow_graph_order() {
        let nodes = vec![
            Node::new(5, 0.0, 0.0).with_weight("crime_count", 2.0),
            Node::new(6, 0.0, 0.0),
            Node::new(7, 0.0, 0.0).with_weight("crime_count", 1.0),
        ];
        let graph = SpatialGraph::build(&nodes, &[Segment::new(1, 1.0, vec![5, 7])]).unwrap();
        assert_eq!(graph.weight_column("crime_count"), Some(&[2.0, 1.0][..]));
        assert_eq!(graph.weight_column("stores_count"), None);
    }
}
