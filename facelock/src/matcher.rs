use crate::gallery::{Embedding, Gallery};

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    pub identity: Option<String>,
    pub display_name: Option<String>,
    /// `(1 - d/2) * 100`, clamped to [0, 100]. The mapping comes from the
    /// original system and is kept as-is so accept/reject behavior is
    /// unchanged.
    pub confidence_percent: f64,
    pub raw_distance: f64,
}

impl MatchResult {
    fn no_match() -> Self {
        Self {
            matched: false,
            identity: None,
            display_name: None,
            confidence_percent: 0.0,
            raw_distance: f64::INFINITY,
        }
    }
}

fn confidence(distance: f64) -> f64 {
    ((1.0 - distance / 2.0) * 100.0).clamp(0.0, 100.0)
}

/// Score a query against every gallery entry and pick the nearest.
/// Pure - no state is read or written besides the arguments. Ties on the
/// exact minimum distance go to the first entry in gallery order.
pub fn match_embedding(query: &Embedding, gallery: &Gallery, threshold: f64) -> MatchResult {
    let mut best: Option<(usize, f64)> = None;
    for (idx, entry) in gallery.entries().iter().enumerate() {
        let d = entry.embedding().distance(query);
        if best.map_or(true, |(_, d_min)| d < d_min) {
            best = Some((idx, d));
        }
    }
    let Some((idx, d_min)) = best else {
        return MatchResult::no_match();
    };
    let entry = &gallery.entries()[idx];
    let matched = d_min < threshold;
    log::debug!(
        target: "enc_match",
        "nearest {} at distance {d_min:.4} (threshold {threshold})",
        entry.identity()
    );
    MatchResult {
        matched,
        identity: matched.then(|| entry.identity().to_owned()),
        display_name: matched.then(|| entry.display_name().to_owned()),
        confidence_percent: confidence(d_min),
        raw_distance: d_min,
    }
}
