use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

use crate::{ReachError, Result};

// ** Coordinates **

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Location { latitude, longitude }
    }

    /// Rejects coordinates a distance cannot be computed from, naming the record and field.
    pub fn validate(&self, dataset: &str, id: u64) -> Result<()> {
        let checks = [
            ("latitude", self.latitude, 90.0),
            ("longitude", self.longitude, 180.0),
        ];
        for (field, value, bound) in checks {
            if !value.is_finite() || value.abs() > bound {
                return Err(ReachError::InvalidCoordinate {
                    dataset: dataset.to_string(),
                    id,
                    field,
                    value,
                });
            }
        }
        Ok(())
    }
}

// ** Graph data types **

pub type JunctionId = u64;
pub type SegmentId = u64;

/// One outgoing adjacency entry: `(neighbor_id, length_meters, segment_id)` on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(JunctionId, f64, SegmentId)", into = "(JunctionId, f64, SegmentId)")]
pub struct Neighbor {
    pub node: JunctionId,
    pub length_meters: f64,
    pub segment: SegmentId,
}

impl From<(JunctionId, f64, SegmentId)> for Neighbor {
    fn from((node, length_meters, segment): (JunctionId, f64, SegmentId)) -> Self {
        Neighbor { node, length_meters, segment }
    }
}

impl From<Neighbor> for (JunctionId, f64, SegmentId) {
    fn from(n: Neighbor) -> Self {
        (n.node, n.length_meters, n.segment)
    }
}

// A street junction. Weight properties are the per-node numbers reach is computed over
// (crime_count, stores_count, ...); reach output fields are written back into the same map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: JunctionId,
    #[serde(flatten)]
    pub location: Location,
    #[serde(default)]
    pub neighbors: Vec<Neighbor>,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

impl Node {
    pub fn new(id: JunctionId, latitude: f64, longitude: f64) -> Self {
        Node {
            id,
            location: Location::new(latitude, longitude),
            neighbors: Vec::new(),
            weights: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, property: &str, value: f64) -> Self {
        self.weights.insert(property.to_string(), value);
        self
    }

    /// Missing properties read as zero.
    pub fn weight(&self, property: &str) -> f64 {
        self.weights.get(property).copied().unwrap_or(0.0)
    }
}

// A raw street segment. Every pair of distinct endpoints becomes mutually adjacent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub length_meters: f64,
    pub endpoints: Vec<JunctionId>,
}

impl Segment {
    pub fn new(id: SegmentId, length_meters: f64, endpoints: Vec<JunctionId>) -> Self {
        Segment { id, length_meters, endpoints }
    }

    /// Endpoints with repeats removed, first occurrence order kept.
    pub fn distinct_endpoints(&self) -> Vec<JunctionId> {
        let mut seen = Vec::with_capacity(self.endpoints.len());
        for id in &self.endpoints {
            if !seen.contains(id) {
                seen.push(*id);
            }
        }
        seen
    }
}

// ** Point features **

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: u64,
    #[serde(flatten)]
    pub location: Location,
    #[serde(default)]
    pub match_id: Option<JunctionId>,
    #[serde(default)]
    pub match_distance_meters: f64,
    // Dataset-specific columns, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Feature {
    pub fn new(id: u64, latitude: f64, longitude: f64) -> Self {
        Feature {
            id,
            location: Location::new(latitude, longitude),
            match_id: None,
            match_distance_meters: 0.0,
            extra: Map::new(),
        }
    }
}

/// A named external dataset (crime, stores, transit, ...) and the node counter it feeds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureDataset {
    pub name: String,
    #[serde(default)]
    pub count_field: Option<String>,
    pub features: Vec<Feature>,
}
