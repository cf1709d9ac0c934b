//! Rendition selection among the candidates offered for one source.
//!
//! Pure and deterministic: scoring plus tier filtering, no I/O. Ties are
//! broken by `format_id` so repeated runs pick the same candidate.

use mediabatch_core::models::{QualityLevel, QualityMode, QualityPolicy, RenditionCandidate};
use std::cmp::Ordering;

/// Outcome of selection. An empty or fully unsuitable candidate list is a
/// value, not an error; the caller decides how to classify it.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Selected(RenditionCandidate),
    NoCandidate,
}

/// Intrinsic quality score of a candidate, independent of the policy.
pub fn quality_score(c: &RenditionCandidate) -> f64 {
    let mut score: f64 = match c.height.unwrap_or(0) {
        h if h >= 2160 => 100.0,
        h if h >= 1440 => 85.0,
        h if h >= 1080 => 70.0,
        h if h >= 720 => 55.0,
        h if h >= 480 => 40.0,
        h if h >= 360 => 25.0,
        _ => 10.0,
    };

    let fps = c.fps.unwrap_or(0.0);
    if fps >= 60.0 {
        score += 10.0;
    } else if fps >= 30.0 {
        score += 5.0;
    }

    let codec = c.video_codec.as_deref().unwrap_or("");
    if codec.contains("av01") {
        score += 8.0;
    } else if codec.contains("vp9") {
        score += 5.0;
    } else if codec.contains("h264") || codec.contains("avc") {
        score += 3.0;
    }

    // Segmented delivery needs a merge step, so plain downloads win ties.
    if c.protocol.as_deref().unwrap_or("").contains("dash") {
        score -= 5.0;
    }

    score.max(0.0)
}

/// Balance quality against estimated size for `Auto` mode.
fn auto_score(c: &RenditionCandidate) -> f64 {
    let mut score = quality_score(c) - (c.estimated_size_mb() / 10.0).min(50.0);

    if matches!(c.container.as_str(), "mp4" | "webm") {
        score += 10.0;
    }

    let codec = c.video_codec.as_deref().unwrap_or("");
    if codec.contains("av01") || codec.contains("vp9") || codec.contains("h264") {
        score += 5.0;
    }

    score
}

/// Rank candidates that already match an explicitly requested level.
fn explicit_rank(c: &RenditionCandidate) -> f64 {
    let ext_rank = match c.container.as_str() {
        "mp4" => 3.0,
        "webm" => 2.0,
        "mkv" => 1.0,
        _ => 0.0,
    };

    let codec = c.video_codec.as_deref().unwrap_or("");
    let codec_rank = if codec.contains("av01") {
        3.0
    } else if codec.contains("vp9") {
        2.0
    } else if codec.contains("h264") || codec.contains("avc") {
        1.0
    } else {
        0.0
    };

    let mut rank = ext_rank * 10.0 + codec_rank * 5.0;

    match c.protocol.as_deref() {
        Some("https") => rank += 15.0,
        Some(p) if p.contains("http") => rank += 10.0,
        _ => {}
    }

    let size_mb = c.estimated_size_mb();
    if size_mb > 200.0 {
        rank -= (size_mb - 200.0) / 10.0;
    }

    rank
}

/// Highest-scoring candidate, ties broken by `format_id`.
fn best_by<'a, F>(candidates: &[&'a RenditionCandidate], score: F) -> Option<&'a RenditionCandidate>
where
    F: Fn(&RenditionCandidate) -> f64,
{
    let mut ranked: Vec<&'a RenditionCandidate> = candidates.to_vec();
    ranked.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.format_id.cmp(&b.format_id))
    });
    ranked.first().copied()
}

fn select_explicit<'a>(
    eligible: &[&'a RenditionCandidate],
    level: QualityLevel,
) -> Option<&'a RenditionCandidate> {
    let exact: Vec<&RenditionCandidate> = eligible
        .iter()
        .copied()
        .filter(|c| c.quality_level() == level)
        .collect();
    if !exact.is_empty() {
        return best_by(&exact, explicit_rank);
    }

    // No candidate carries the requested label. Take the five nearest by
    // frame height and keep the best of those.
    let target = level.height() as i64;
    let mut by_distance: Vec<&RenditionCandidate> = eligible.to_vec();
    by_distance.sort_by(|a, b| {
        let da = (a.height.unwrap_or(0) as i64 - target).abs();
        let db = (b.height.unwrap_or(0) as i64 - target).abs();
        da.cmp(&db).then_with(|| a.format_id.cmp(&b.format_id))
    });
    by_distance.truncate(5);
    best_by(&by_distance, quality_score)
}

/// Choose one rendition for a source under the given policy.
///
/// Candidates above the tier's allowed levels or size cap are filtered
/// out first. When nothing survives the filter, the single smallest
/// candidate from the full input is offered instead of failing the task.
pub fn select(candidates: &[RenditionCandidate], policy: &QualityPolicy) -> Selection {
    if candidates.is_empty() {
        return Selection::NoCandidate;
    }

    let allowed = policy.tier.allowed_levels();
    let cap_mb = policy.tier.max_size_mb() as f64;

    let eligible: Vec<&RenditionCandidate> = candidates
        .iter()
        .filter(|c| allowed.contains(&c.quality_level()) && c.estimated_size_mb() <= cap_mb)
        .collect();

    if eligible.is_empty() {
        let all: Vec<&RenditionCandidate> = candidates.iter().collect();
        return match best_by(&all, |c| -c.estimated_size_mb()) {
            Some(c) => Selection::Selected(c.clone()),
            None => Selection::NoCandidate,
        };
    }

    let chosen = match policy.mode {
        QualityMode::Best => best_by(&eligible, quality_score),
        QualityMode::Worst => best_by(&eligible, |c| -c.estimated_size_mb()),
        QualityMode::Auto => best_by(&eligible, auto_score),
        QualityMode::Explicit(level) => select_explicit(&eligible, level),
    };

    match chosen {
        Some(c) => Selection::Selected(c.clone()),
        None => Selection::NoCandidate,
    }
}
