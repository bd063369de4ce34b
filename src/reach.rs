use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::decay::DecayKernel;
use crate::graph::SpatialGraph;
use crate::types::JunctionId;
use crate::{ReachError, Result};

// Path distances are sums of validated, finite edge lengths, so total_cmp orders them like `<`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct OrderedFloat(f64);

impl Eq for OrderedFloat {}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap priority: shortest distance first, then lowest junction id.
type Priority = Reverse<(OrderedFloat, JunctionId)>;

/// One weight property to propagate, and how its contributions fall off with distance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReachProperty {
    pub property: String,
    pub kernel: DecayKernel,
    /// Output field name; `<property>_reach` when absent.
    #[serde(default)]
    pub output: Option<String>,
}

impl ReachProperty {
    pub fn new(property: &str, kernel: DecayKernel) -> Self {
        ReachProperty { property: property.to_string(), kernel, output: None }
    }

    pub fn named(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }

    pub fn output_name(&self) -> String {
        self.output.clone().unwrap_or_else(|| format!("{}_reach", self.property))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReachConfig {
    pub properties: Vec<ReachProperty>,
    /// Nodes further than this are still counted but not expanded. `None` is unbounded.
    #[serde(default)]
    pub radius_limit_meters: Option<f64>,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

fn default_parallel() -> bool {
    true
}

impl ReachConfig {
    pub fn new(properties: Vec<ReachProperty>) -> Self {
        ReachConfig {
            properties,
            radius_limit_meters: None,
            parallel: default_parallel(),
            deadline: None,
        }
    }

    pub fn with_radius_limit(mut self, meters: f64) -> Self {
        self.radius_limit_meters = Some(meters);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for property in &self.properties {
            property.kernel.validate()?;
        }
        let mut outputs = Vec::with_capacity(self.properties.len());
        for property in &self.properties {
            let name = property.output_name();
            if outputs.contains(&name) {
                return Err(ReachError::InvalidConfig(format!("reach field {name} is configured twice")));
            }
            outputs.push(name);
        }
        if let Some(limit) = self.radius_limit_meters {
            if limit.is_nan() || limit < 0.0 {
                return Err(ReachError::InvalidConfig(format!(
                    "radius_limit_meters must be non-negative, got {limit}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-node scores, one column per reach field (`crime_count_reach`, ...), rows in graph order.
#[derive(Clone, Debug, PartialEq)]
pub struct ReachScores {
    node_ids: Vec<JunctionId>,
    rows: HashMap<JunctionId, usize>,
    fields: Vec<String>,
    values: Vec<Vec<f64>>,
}

impl ReachScores {
    pub(crate) fn new(node_ids: Vec<JunctionId>, fields: Vec<String>, values: Vec<Vec<f64>>) -> Self {
        let rows = node_ids.iter().enumerate().map(|(row, id)| (*id, row)).collect();
        ReachScores { node_ids, rows, fields, values }
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn node_ids(&self) -> &[JunctionId] {
        &self.node_ids
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn get(&self, node: JunctionId, field: &str) -> Option<f64> {
        let column = self.fields.iter().position(|f| f == field)?;
        self.node_row(node).map(|row| row[column])
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.values.get(index).map(Vec::as_slice)
    }

    /// Scores of one junction, in `fields()` order.
    pub fn node_row(&self, node: JunctionId) -> Option<&[f64]> {
        self.row(*self.rows.get(&node)?)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.values.iter().map(Vec::as_slice)
    }

    pub(crate) fn rows_mut(&mut self) -> impl Iterator<Item = &mut Vec<f64>> {
        self.values.iter_mut()
    }

    pub fn column(&self, field: &str) -> Option<Vec<f64>> {
        let column = self.fields.iter().position(|f| f == field)?;
        Some(self.values.iter().map(|row| row[column]).collect())
    }

    pub fn to_map(&self) -> BTreeMap<JunctionId, BTreeMap<String, f64>> {
        self.node_ids
            .iter()
            .zip(&self.values)
            .map(|(id, row)| (*id, self.fields.iter().cloned().zip(row.iter().copied()).collect()))
            .collect()
    }
}

impl Serialize for ReachScores {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

// Per-worker traversal state, reused across source nodes.
struct Scratch {
    visited: Vec<bool>,
    touched: Vec<usize>,
    queue: PriorityQueue<usize, Priority>,
}

impl Scratch {
    fn new(node_count: usize) -> Self {
        Scratch {
            visited: vec![false; node_count],
            touched: Vec::new(),
            queue: PriorityQueue::new(),
        }
    }

    fn reset(&mut self) {
        for index in self.touched.drain(..) {
            self.visited[index] = false;
        }
        self.queue.clear();
    }
}

pub struct ReachEngine<'g> {
    graph: &'g SpatialGraph,
}

impl<'g> ReachEngine<'g> {
    pub fn new(graph: &'g SpatialGraph) -> Self {
        ReachEngine { graph }
    }

    /// Raw decay-weighted sums for every node of the graph and every configured property.
    pub fn compute(&self, config: &ReachConfig) -> Result<ReachScores> {
        config.validate()?;
        let graph = self.graph;
        let node_count = graph.len();

        let columns: Vec<Vec<f64>> = config
            .properties
            .iter()
            .map(|p| match graph.weight_column(&p.property) {
                Some(column) => column.to_vec(),
                None => {
                    log::warn!("No junction carries weight property {}, its reach is zero", p.property);
                    vec![0.0; node_count]
                }
            })
            .collect();
        let kernels: Vec<DecayKernel> = config.properties.iter().map(|p| p.kernel).collect();
        let limit = config.radius_limit_meters.unwrap_or(f64::INFINITY);

        log::info!(
            "Computing reach of {} properties over {} junctions ({} adjacency entries)",
            kernels.len(),
            node_count,
            graph.edge_count()
        );

        let run = |scratch: &mut Scratch, source: usize| -> Result<Vec<f64>> {
            if let Some(deadline) = config.deadline {
                if Instant::now() > deadline {
                    return Err(ReachError::DeadlineExceeded { node: graph.id(source) });
                }
            }
            let sums = self.reach_from(scratch, source, &columns, &kernels, limit);
            if (source + 1) % 100 == 0 {
                log::debug!("Calculated {}/{}", source + 1, node_count);
            }
            Ok(sums)
        };

        #[cfg(feature = "parallel")]
        let values: Result<Vec<Vec<f64>>> = if config.parallel {
            (0..node_count)
                .into_par_iter()
                .map_init(|| Scratch::new(node_count), run)
                .collect()
        } else {
            let mut scratch = Scratch::new(node_count);
            (0..node_count).map(|source| run(&mut scratch, source)).collect()
        };
        #[cfg(not(feature = "parallel"))]
        let values: Result<Vec<Vec<f64>>> = {
            let mut scratch = Scratch::new(node_count);
            (0..node_count).map(|source| run(&mut scratch, source)).collect()
        };

        let fields = config.properties.iter().map(|p| p.output_name()).collect();
        Ok(ReachScores::new(graph.ids().to_vec(), fields, values?))
    }

    // Dijkstra from `source`, accumulating weight * decay(distance) at every settled node.
    fn reach_from(
        &self,
        scratch: &mut Scratch,
        source: usize,
        columns: &[Vec<f64>],
        kernels: &[DecayKernel],
        limit: f64,
    ) -> Vec<f64> {
        let graph = self.graph;
        let mut sums = vec![0.0; kernels.len()];
        scratch.reset();
        scratch.queue.push(source, Reverse((OrderedFloat(0.0), graph.id(source))));

        while let Some((node, Reverse((OrderedFloat(distance), _)))) = scratch.queue.pop() {
            if scratch.visited[node] {
                continue;
            }
            scratch.visited[node] = true;
            scratch.touched.push(node);

            for ((sum, column), kernel) in sums.iter_mut().zip(columns).zip(kernels) {
                let weight = column[node];
                if weight != 0.0 {
                    *sum += weight * kernel.decay(distance);
                }
            }

            // Past the radius the node counts but is not expanded.
            if distance > limit {
                continue;
            }
            for edge in graph.neighbors(node) {
                if scratch.visited[edge.target] {
                    continue;
                }
                let candidate = Reverse((OrderedFloat(distance + edge.length_meters), graph.id(edge.target)));
                // Only replaces a queued entry when the new path is shorter.
                scratch.queue.push_increase(edge.target, candidate);
            }
        }
        sums
    }
}
