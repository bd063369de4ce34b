use crate::reach::ReachScores;

/// Divides every field by its maximum over all nodes, so the top node ends at exactly 1.
/// Fields whose maximum is zero stay zero.
pub fn normalize(raw: &ReachScores) -> ReachScores {
    let mut scaled = raw.clone();
    let field_count = raw.fields().len();

    let mut maxima = vec![0.0f64; field_count];
    for row in raw.rows() {
        for (max, value) in maxima.iter_mut().zip(row) {
            *max = max.max(*value);
        }
    }

    for row in scaled.rows_mut() {
        for (value, max) in row.iter_mut().zip(&maxima) {
            if *max > 0.0 {
                *value /= *max;
            }
        }
    }
    scaled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(values: Vec<Vec<f64>>) -> ReachScores {
        let ids = (1..=values.len() as u64).collect();
        ReachScores::new(ids, vec!["crime_reach".into(), "store_reach".into()], values)
    }

    #[test]
    fn test_divides_by_maximum() {
        let raw = scores(vec![vec![2.0, 0.0], vec![8.0, 0.0], vec![4.0, 0.0]]);
        let scaled = normalize(&raw);
        assert_eq!(scaled.column("crime_reach").unwrap(), vec![0.25, 1.0, 0.5]);
    }

    #[test]
    fn test_all_zero_field_stays_zero() {
        let raw = scores(vec![vec![1.0, 0.0], vec![3.0, 0.0]]);
        let scaled = normalize(&raw);
        assert_eq!(scaled.column("store_reach").unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_no_minimum_subtraction() {
        let raw = scores(vec![vec![5.0, 1.0], vec![10.0, 1.0]]);
        let scaled = normalize(&raw);
        assert_eq!(scaled.get(1, "crime_reach"), Some(0.5));
        assert_eq!(scaled.get(2, "store_reach"), Some(1.0));
    }

    #[test]
    fn test_empty_scores() {
        let scaled = normalize(&scores(Vec::new()));
        assert!(scaled.is_empty());
    }
}
