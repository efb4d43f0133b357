use chrono::{DateTime, Utc};

/// Half-life for recall weighting in a sales context
const HALF_LIFE_DAYS: f64 = 7.0;

/// Forgetting-curve weight for a row: exp(-ln2 * days_since_use / half_life).
/// Rows that were never recalled keep full weight.
pub fn decay_weight(last_used_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(last_used_at) = last_used_at else {
        return 1.0;
    };
    let days_passed = (now - last_used_at).num_seconds() as f64 / 86_400.0;
    if days_passed <= 0.0 {
        return 1.0;
    }
    let lambda = std::f64::consts::LN_2 / HALF_LIFE_DAYS;
    (-lambda * days_passed).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn unused_rows_keep_full_weight() {
        assert_eq!(decay_weight(None, Utc::now()), 1.0);
    }

    #[test]
    fn seven_days_halves_the_weight() {
        let now = Utc::now();
        let weight = decay_weight(Some(now - Duration::days(7)), now);
        assert!((weight - 0.5).abs() < 1e-6);
    }

    #[test]
    fn fourteen_days_quarters_the_weight() {
        let now = Utc::now();
        let weight = decay_weight(Some(now - Duration::days(14)), now);
        assert!((weight - 0.25).abs() < 1e-6);
    }

    #[test]
    fn just_used_rows_keep_full_weight() {
        let now = Utc::now();
        assert_eq!(decay_weight(Some(now), now), 1.0);
    }

    #[test]
    fn weight_decreases_monotonically() {
        let now = Utc::now();
        let fresh = decay_weight(Some(now - Duration::days(1)), now);
        let stale = decay_weight(Some(now - Duration::days(10)), now);
        assert!(fresh > stale);
        assert!(stale > 0.0);
    }
}
