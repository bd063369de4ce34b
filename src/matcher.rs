use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::distance::{haversine_meters, Distance, DistanceMetric};
use crate::types::{FeatureDataset, Location, Node};
use crate::{ReachError, Result};

/// Answers "which target is closest to this point" under a distance budget.
pub trait NearestTarget: Sync {
    /// Index and distance of the nearest target, if it is strictly closer than `limit`.
    /// Among equally distant targets the lowest index wins.
    fn nearest(&self, origin: &Location, limit: f64) -> Option<(usize, f64)>;
}

// Full scan over every target. Fine for a few thousand junctions.
pub struct LinearScan<D> {
    targets: Vec<Location>,
    metric: D,
}

impl<D: Distance> LinearScan<D> {
    pub fn new(targets: Vec<Location>, metric: D) -> Self {
        LinearScan { targets, metric }
    }
}

impl<D: Distance> NearestTarget for LinearScan<D> {
    fn nearest(&self, origin: &Location, limit: f64) -> Option<(usize, f64)> {
        let mut closest_index = None;
        let mut closest_distance = limit;
        for (index, target) in self.targets.iter().enumerate() {
            let distance = self.metric.distance(origin, target);
            if distance < closest_distance {
                closest_distance = distance;
                closest_index = Some(index);
            }
        }
        closest_index.map(|index| (index, closest_distance))
    }
}

// Targets live in the tree as points on the unit sphere. Chord length grows with
// great-circle distance, so the Euclidean nearest neighbour is the haversine one.
struct IndexedTarget {
    position: [f64; 3],
    location: Location,
    index: usize,
}

impl RTreeObject for IndexedTarget {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for IndexedTarget {
    fn distance_2(&self, point: &[f64; 3]) -> f64 {
        self.position
            .iter()
            .zip(point)
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

fn unit_vector(location: &Location) -> [f64; 3] {
    let lat = location.latitude.to_radians();
    let lon = location.longitude.to_radians();
    [lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin()]
}

/// R-tree backed provider, same answers as a haversine [`LinearScan`].
pub struct RTreeScan {
    tree: RTree<IndexedTarget>,
}

impl RTreeScan {
    pub fn new(targets: &[Location]) -> Self {
        let indexed = targets
            .iter()
            .enumerate()
            .map(|(index, location)| IndexedTarget {
                position: unit_vector(location),
                location: *location,
                index,
            })
            .collect();
        RTreeScan { tree: RTree::bulk_load(indexed) }
    }
}

impl NearestTarget for RTreeScan {
    fn nearest(&self, origin: &Location, limit: f64) -> Option<(usize, f64)> {
        let point = unit_vector(origin);
        let mut candidates = self.tree.nearest_neighbor_iter(&point);
        let first = candidates.next()?;
        let best_chord = first.distance_2(&point);
        let mut best = first;
        for candidate in candidates {
            if candidate.distance_2(&point) > best_chord {
                break;
            }
            if candidate.index < best.index {
                best = candidate;
            }
        }
        let distance = haversine_meters(origin, &best.location);
        (distance < limit).then_some((best.index, distance))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    #[serde(default = "unlimited")]
    pub distance_limit_meters: f64,
    #[serde(default)]
    pub metric: DistanceMetric,
    /// Use the R-tree provider instead of a full scan. Haversine only.
    #[serde(default)]
    pub indexed: bool,
}

fn unlimited() -> f64 {
    f64::INFINITY
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            distance_limit_meters: unlimited(),
            metric: DistanceMetric::Haversine,
            indexed: false,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.distance_limit_meters.is_nan() {
            return Err(ReachError::InvalidConfig("distance_limit_meters is NaN".into()));
        }
        if let DistanceMetric::Minkowski { p } = self.metric {
            if !p.is_finite() || p <= 0.0 {
                return Err(ReachError::InvalidConfig(format!("p-norm exponent must be positive, got {p}")));
            }
        }
        if self.indexed && self.metric != DistanceMetric::Haversine {
            return Err(ReachError::InvalidConfig(
                "the indexed matcher only supports the haversine metric".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub dataset: String,
    pub matched: usize,
    pub unmatched: usize,
}

pub struct GeoMatcher {
    config: MatchConfig,
}

impl GeoMatcher {
    pub fn new(config: MatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(GeoMatcher { config })
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// The provider the configuration asks for, built over `targets`.
    pub fn finder(&self, targets: Vec<Location>) -> Box<dyn NearestTarget> {
        if self.config.indexed {
            Box::new(RTreeScan::new(&targets))
        } else {
            Box::new(LinearScan::new(targets, self.config.metric))
        }
    }

    /// Pairs every source with its nearest target and calls `on_match(source, target, distance)`
    /// in source order. Sources with nothing inside the limit are skipped.
    pub fn match_closest<F>(&self, sources: &[Location], finder: &dyn NearestTarget, mut on_match: F) -> usize
    where
        F: FnMut(usize, usize, f64),
    {
        let limit = self.config.distance_limit_meters;

        #[cfg(feature = "parallel")]
        let nearest: Vec<Option<(usize, f64)>> =
            sources.par_iter().map(|source| finder.nearest(source, limit)).collect();
        #[cfg(not(feature = "parallel"))]
        let nearest: Vec<Option<(usize, f64)>> =
            sources.iter().map(|source| finder.nearest(source, limit)).collect();

        let mut matched = 0;
        for (source, found) in nearest.into_iter().enumerate() {
            if let Some((target, distance)) = found {
                on_match(source, target, distance);
                matched += 1;
            }
            if (source + 1) % 100 == 0 {
                log::debug!("Matched {}/{} records", source + 1, sources.len());
            }
        }
        matched
    }

    /// Attaches every feature of `dataset` to its nearest node and, when the dataset names a
    /// count field, recounts it on every node. Running it twice gives the same result.
    pub fn match_features(&self, dataset: &mut FeatureDataset, nodes: &mut [Node]) -> Result<MatchSummary> {
        for feature in &dataset.features {
            feature.location.validate(&dataset.name, feature.id)?;
        }
        for node in nodes.iter() {
            node.location.validate("junctions", node.id)?;
        }

        log::info!(
            "Matching {} {} features against {} junctions",
            dataset.features.len(),
            dataset.name,
            nodes.len()
        );

        if let Some(field) = &dataset.count_field {
            for node in nodes.iter_mut() {
                node.weights.insert(field.clone(), 0.0);
            }
        }
        for feature in dataset.features.iter_mut() {
            feature.match_id = None;
            feature.match_distance_meters = 0.0;
        }

        let sources: Vec<Location> = dataset.features.iter().map(|f| f.location).collect();
        let finder = self.finder(nodes.iter().map(|n| n.location).collect());

        let count_field = dataset.count_field.as_deref();
        let features = &mut dataset.features;
        let matched = self.match_closest(&sources, finder.as_ref(), |source, target, distance| {
            let node = &mut nodes[target];
            features[source].match_id = Some(node.id);
            features[source].match_distance_meters = distance;
            if let Some(field) = count_field {
                *node.weights.entry(field.to_string()).or_insert(0.0) += 1.0;
            }
        });

        let summary = MatchSummary {
            dataset: dataset.name.clone(),
            matched,
            unmatched: dataset.features.len() - matched,
        };
        log::info!("{}: {} matched, {} left unmatched", summary.dataset, summary.matched, summary.unmatched);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Feature;

    fn matcher(limit: f64) -> GeoMatcher {
        GeoMatcher::new(MatchConfig { distance_limit_meters: limit, ..Default::default() }).unwrap()
    }

    fn equator_targets() -> Vec<Location> {
        vec![Location::new(1.0, 0.0), Location::new(2.0, 0.0)]
    }

    #[test]
    fn test_matches_first_target_within_limit() {
        let matcher = matcher(150_000.0);
        let finder = matcher.finder(equator_targets());
        let mut matches = Vec::new();
        let count = matcher.match_closest(&[Location::new(0.0, 0.0)], finder.as_ref(), |s, t, d| {
            matches.push((s, t, d))
        });
        assert_eq!(count, 1);
        assert_eq!(matches[0].0, 0);
        assert_eq!(matches[0].1, 0);
        assert!((matches[0].2 - 111_195.0).abs() < 50.0, "{}", matches[0].2);
    }

    #[test]
    fn test_nothing_inside_limit_leaves_source_unmatched() {
        let matcher = matcher(100_000.0);
        let finder = matcher.finder(equator_targets());
        let count = matcher.match_closest(&[Location::new(0.0, 0.0)], finder.as_ref(), |_, _, _| {
            panic!("should not match")
        });
        assert_eq!(count, 0);
    }

    #[test]
    fn test_empty_targets_never_match() {
        let matcher = matcher(f64::INFINITY);
        let finder = matcher.finder(Vec::new());
        let count = matcher.match_closest(&[Location::new(0.0, 0.0)], finder.as_ref(), |_, _, _| {
            panic!("should not match")
        });
        assert_eq!(count, 0);
    }

    #[test]
    fn test_ties_go_to_first_target() {
        let targets = vec![Location::new(0.0, 1.0), Location::new(0.0, -1.0), Location::new(1.0, 0.0)];
        let origin = Location::new(0.0, 0.0);
        let linear = LinearScan::new(targets.clone(), DistanceMetric::Haversine);
        let indexed = RTreeScan::new(&targets);
        assert_eq!(linear.nearest(&origin, f64::INFINITY).map(|m| m.0), Some(0));
        assert_eq!(indexed.nearest(&origin, f64::INFINITY).map(|m| m.0), Some(0));
    }

    #[test]
    fn test_antipodal_target_still_matches() {
        let origin = Location::new(-87.843, -179.0);
        let targets = vec![Location::new(87.843, 1.0)];
        let linear = LinearScan::new(targets.clone(), DistanceMetric::Haversine);
        let indexed = RTreeScan::new(&targets);
        assert_eq!(linear.nearest(&origin, f64::INFINITY).map(|m| m.0), Some(0));
        assert_eq!(indexed.nearest(&origin, f64::INFINITY).map(|m| m.0), Some(0));
    }

    #[test]
    fn test_rtree_agrees_with_full_scan() {
        let targets: Vec<Location> = (0..400)
            .map(|i| Location::new(49.20 + (i % 20) as f64 * 0.004, -123.20 + (i / 20) as f64 * 0.005))
            .collect();
        let linear = LinearScan::new(targets.clone(), DistanceMetric::Haversine);
        let indexed = RTreeScan::new(&targets);
        for k in 0..50 {
            let origin = Location::new(49.19 + k as f64 * 0.0019, -123.21 + k as f64 * 0.0021);
            let a = linear.nearest(&origin, 2_000.0);
            let b = indexed.nearest(&origin, 2_000.0);
            assert_eq!(a.is_some(), b.is_some(), "origin {origin:?}");
            if let (Some(a), Some(b)) = (a, b) {
                assert!((a.1 - b.1).abs() < 1e-6, "origin {origin:?}: {a:?} vs {b:?}");
            }
        }
    }

    fn crime_dataset() -> FeatureDataset {
        FeatureDataset {
            name: "crime".into(),
            count_field: Some("crime_count".into()),
            features: vec![
                Feature::new(1, 49.2800, -123.1200),
                Feature::new(2, 49.2801, -123.1201),
                Feature::new(3, 49.2900, -123.1000),
                Feature::new(4, 10.0, 10.0),
            ],
        }
    }

    fn junctions() -> Vec<Node> {
        vec![Node::new(11, 49.2800, -123.1200), Node::new(12, 49.2900, -123.1000)]
    }

    #[test]
    fn test_match_features_counts_and_annotates() {
        let matcher = matcher(1_000.0);
        let mut dataset = crime_dataset();
        let mut nodes = junctions();
        let summary = matcher.match_features(&mut dataset, &mut nodes).unwrap();

        assert_eq!(summary, MatchSummary { dataset: "crime".into(), matched: 3, unmatched: 1 });
        assert_eq!(dataset.features[0].match_id, Some(11));
        assert_eq!(dataset.features[0].match_distance_meters, 0.0);
        assert_eq!(dataset.features[1].match_id, Some(11));
        assert_eq!(dataset.features[2].match_id, Some(12));
        assert_eq!(dataset.features[3].match_id, None);
        assert_eq!(nodes[0].weight("crime_count"), 2.0);
        assert_eq!(nodes[1].weight("crime_count"), 1.0);
    }

    #[test]
    fn test_match_features_is_idempotent() {
        let matcher = matcher(1_000.0);
        let mut dataset = crime_dataset();
        let mut nodes = junctions();
        matcher.match_features(&mut dataset, &mut nodes).unwrap();
        let (first_features, first_nodes) = (dataset.clone(), nodes.clone());
        matcher.match_features(&mut dataset, &mut nodes).unwrap();
        assert_eq!(dataset, first_features);
        assert_eq!(nodes, first_nodes);
    }

    #[test]
    fn test_match_features_rejects_bad_coordinates() {
        let matcher = matcher(1_000.0);
        let mut dataset = crime_dataset();
        dataset.features[2].location.latitude = f64::NAN;
        let mut nodes = junctions();
        let err = matcher.match_features(&mut dataset, &mut nodes).unwrap_err();
        assert!(matches!(err, ReachError::InvalidCoordinate { id: 3, field: "latitude", .. }));
    }

    #[test]
    fn test_indexed_requires_haversine() {
        let config = MatchConfig {
            metric: DistanceMetric::ApproxHaversine,
            indexed: true,
            ..Default::default()
        };
        assert!(GeoMatcher::new(config).is_err());
    }
}
