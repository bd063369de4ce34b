use wasm_bindgen::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use log::Level;

use geo::{BoundingRect, MultiPoint, Point};
use geojson::{feature::Id, Feature, FeatureCollection, GeoJson, Geometry, Value};

pub mod decay;
pub mod distance;
pub mod graph;
pub mod matcher;
pub mod normalize;
pub mod reach;
pub mod types;

use self::graph::SpatialGraph;
use self::matcher::{GeoMatcher, MatchConfig, MatchSummary};
use self::normalize::normalize;
use self::reach::{ReachConfig, ReachEngine, ReachScores};
use self::types::{FeatureDataset, JunctionId, Node, Segment, SegmentId};

#[derive(Debug, thiserror::Error)]
pub enum ReachError {
    #[error("Duplicate junction id {id}")]
    DuplicateNode { id: JunctionId },

    #[error("Segment {segment} references unknown junction {node}")]
    UnknownEndpoint { segment: SegmentId, node: JunctionId },

    #[error("Junction {node} lists unknown neighbor {neighbor}")]
    UnknownNeighbor { node: JunctionId, neighbor: JunctionId },

    #[error("Segment {segment} has invalid length {length}")]
    InvalidLength { segment: SegmentId, length: f64 },

    #[error("Invalid {field} {value} on {dataset} record {id}")]
    InvalidCoordinate { dataset: String, id: u64, field: &'static str, value: f64 },

    #[error("Junction {node} has invalid {property} value {value}")]
    InvalidWeight { node: JunctionId, property: String, value: f64 },

    #[error("Invalid decay kernel: {0}")]
    InvalidKernel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Deadline passed before reach of junction {node} was computed")]
    DeadlineExceeded { node: JunctionId },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReachError>;

/// Everything one batch run needs: junctions, street segments, the point datasets to attach
/// and how to score them.
#[derive(Deserialize)]
pub struct ReachParams {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub datasets: Vec<FeatureDataset>,
    #[serde(default)]
    pub matching: MatchConfig,
    pub reach: ReachConfig,
}

#[derive(Serialize)]
pub struct ReachReport {
    /// Input junctions with counters and normalized reach fields written in.
    pub nodes: Vec<Node>,
    /// Input datasets with `match_id` / `match_distance_meters` filled.
    pub datasets: Vec<FeatureDataset>,
    pub matches: Vec<MatchSummary>,
    pub scores: ReachScores,
}

#[wasm_bindgen]
pub fn rust_init() {
    if console_log::init_with_level(Level::Info).is_ok() {
        log::info!("Logger initialized from library");
    }
}

/// Writes every score field onto the junction with the same id. Junctions that are not
/// part of the scored graph are left as they are.
pub fn apply_scores(nodes: &mut [Node], scores: &ReachScores) {
    for node in nodes.iter_mut() {
        if let Some(row) = scores.node_row(node.id) {
            for (field, value) in scores.fields().iter().zip(row) {
                node.weights.insert(field.clone(), *value);
            }
        }
    }
}

/// Match every dataset to its nearest junctions, build the junction graph and compute
/// normalized reach.
pub fn run(params: ReachParams) -> Result<ReachReport> {
    let ReachParams { mut nodes, segments, mut datasets, matching, reach } = params;
    reach.validate()?;

    let matcher = GeoMatcher::new(matching)?;
    let mut matches = Vec::with_capacity(datasets.len());
    for dataset in datasets.iter_mut() {
        matches.push(matcher.match_features(dataset, &mut nodes)?);
    }

    let graph = SpatialGraph::build(&nodes, &segments)?;
    let raw = ReachEngine::new(&graph).compute(&reach)?;
    let scores = normalize(&raw);
    apply_scores(&mut nodes, &scores);

    Ok(ReachReport { nodes, datasets, matches, scores })
}

/// Junctions as GeoJSON points carrying their counters and reach fields.
pub fn to_geojson(nodes: &[Node]) -> GeoJson {
    let points: Vec<Point> = nodes
        .iter()
        .map(|n| Point::new(n.location.longitude, n.location.latitude))
        .collect();

    let features = nodes
        .iter()
        .zip(&points)
        .map(|(node, point)| {
            let properties: Map<String, JsonValue> = node
                .weights
                .iter()
                .map(|(key, value)| (key.clone(), JsonValue::from(*value)))
                .collect();
            Feature {
                geometry: Some(Geometry::new(Value::from(point))),
                id: Some(Id::Number(node.id.into())),
                properties: Some(properties),
                ..Default::default()
            }
        })
        .collect();

    let bbox = MultiPoint::from(points)
        .bounding_rect()
        .map(|rect| vec![rect.min().x, rect.min().y, rect.max().x, rect.max().y]);

    GeoJson::FeatureCollection(FeatureCollection {
        bbox,
        features,
        foreign_members: None,
    })
}

pub fn compute_reach_json(params_json: &str) -> Result<String> {
    let params: ReachParams = serde_json::from_str(params_json)?;
    let report = run(params)?;
    Ok(serde_json::to_string(&report)?)
}

pub fn compute_reach_geojson(params_json: &str) -> Result<String> {
    let params: ReachParams = serde_json::from_str(params_json)?;
    let report = run(params)?;
    let geojson_str = serde_json::to_string(&to_geojson(&report.nodes))?;
    log::info!("GeoJson created for {} junctions", report.nodes.len());
    Ok(geojson_str)
}

#[wasm_bindgen]
pub fn compute_reach(params: String) -> std::result::Result<String, JsValue> {
    compute_reach_geojson(&params).map_err(|e| JsValue::from_str(&e.to_string()))
}
