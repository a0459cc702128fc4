// THEORY:
// Greedy, class-aware non-max suppression. Candidates are visited from the most
// to the least confident; a candidate is dropped when it overlaps an already kept
// candidate of the same class by more than the threshold. Boxes of different
// classes never suppress each other.
//
// The survivors are returned in their original order rather than sorted by
// confidence, so the caller still sees the model's native ordering.

use crate::core_modules::frame::RawDetection;

/// Returns the detections that survive suppression, in input order.
pub fn non_max_suppression(detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    if detections.len() < 2 {
        return detections;
    }

    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .total_cmp(&detections[a].confidence)
            .then(a.cmp(&b))
    });

    let mut keep = vec![false; detections.len()];
    let mut kept: Vec<usize> = Vec::with_capacity(detections.len());

    for &index in &order {
        let candidate = &detections[index];
        let suppressed = kept.iter().any(|&k| {
            let winner = &detections[k];
            winner.class_id == candidate.class_id && winner.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep[index] = true;
            kept.push(index);
        }
    }

    detections
        .into_iter()
        .zip(keep)
        .filter_map(|(detection, keep)| keep.then_some(detection))
        .collect()
}
