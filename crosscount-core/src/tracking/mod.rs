//! tracking — centroid identity assignment
//!
//! Keeps object identities stable across frames by matching each frame's box
//! centroids to the live tracks' last known centroids, greedily, closest
//! first. Tracks that go unmatched age; past the disappearance window they
//! are dropped. Ids are minted from a counter owned by the registry and are
//! never reused.

use std::collections::BTreeMap;

use tracing::debug;

use crate::detection::{Centroid, Detection};

pub type TrackId = u64;

/// Live state of one tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedObject {
    pub centroid: Centroid,
    pub class_id: u32,
    /// Consecutive frames without a matching detection.
    pub disappeared: u32,
}

/// Owns every live track and the next-id counter.
#[derive(Debug, Default)]
pub struct TrackRegistry {
    objects: BTreeMap<TrackId, TrackedObject>,
    next_id: TrackId,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, class_id: u32, centroid: Centroid) -> TrackId {
        let id = self.next_id;
        self.objects.insert(
            id,
            TrackedObject {
                centroid,
                class_id,
                disappeared: 0,
            },
        );
        self.next_id += 1;
        debug!(id, class_id, x = centroid.x, y = centroid.y, "track registered");
        id
    }

    fn deregister(&mut self, id: TrackId) {
        if self.objects.remove(&id).is_some() {
            debug!(id, "track deregistered");
        }
    }

    /// Count one more missed frame for `id`; drop it once past `max_disappeared`.
    fn mark_missing(&mut self, id: TrackId, max_disappeared: u32) {
        let Some(obj) = self.objects.get_mut(&id) else {
            return;
        };
        obj.disappeared += 1;
        if obj.disappeared > max_disappeared {
            self.deregister(id);
        }
    }

    fn matched(&mut self, id: TrackId, centroid: Centroid) {
        if let Some(obj) = self.objects.get_mut(&id) {
            obj.centroid = centroid;
            obj.disappeared = 0;
        }
    }

    pub fn get(&self, id: TrackId) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    /// Live tracks in id order.
    pub fn iter(&self) -> impl Iterator<Item = (TrackId, &TrackedObject)> {
        self.objects.iter().map(|(&id, obj)| (id, obj))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Id the next registration will receive.
    pub fn next_id(&self) -> TrackId {
        self.next_id
    }

    pub fn centroids(&self) -> BTreeMap<TrackId, Centroid> {
        self.iter().map(|(id, o)| (id, o.centroid)).collect()
    }

    pub fn classes(&self) -> BTreeMap<TrackId, u32> {
        self.iter().map(|(id, o)| (id, o.class_id)).collect()
    }
}

pub struct CentroidAssigner {
    registry: TrackRegistry,
    max_disappeared: u32,
}

impl CentroidAssigner {
    pub fn new(max_disappeared: u32) -> Self {
        Self {
            registry: TrackRegistry::new(),
            max_disappeared,
        }
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    /// Fold one frame's boxes into the registry. Input order only matters for
    /// the order new ids are minted in.
    pub fn update(&mut self, detections: &[Detection]) -> &TrackRegistry {
        if detections.is_empty() {
            let ids: Vec<TrackId> = self.registry.iter().map(|(id, _)| id).collect();
            for id in ids {
                self.registry.mark_missing(id, self.max_disappeared);
            }
            return &self.registry;
        }

        let inputs: Vec<(u32, Centroid)> = detections
            .iter()
            .map(|d| (d.class_id, d.bbox.centroid()))
            .collect();

        if self.registry.is_empty() {
            for &(class_id, centroid) in &inputs {
                self.registry.register(class_id, centroid);
            }
            return &self.registry;
        }

        let (track_ids, track_centroids): (Vec<TrackId>, Vec<Centroid>) =
            self.registry.iter().map(|(id, o)| (id, o.centroid)).unzip();

        let distances: Vec<Vec<f64>> = track_centroids
            .iter()
            .map(|t| inputs.iter().map(|(_, c)| t.distance(c)).collect())
            .collect();

        // Rows ordered by their closest input; each row proposes its argmin.
        let mut rows: Vec<(usize, f64, usize)> = distances
            .iter()
            .enumerate()
            .map(|(row, d)| {
                let (col, min) = argmin(d);
                (row, min, col)
            })
            .collect();
        rows.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut used_rows = vec![false; track_ids.len()];
        let mut used_cols = vec![false; inputs.len()];
        for (row, _, col) in rows {
            if used_rows[row] || used_cols[col] {
                continue;
            }
            self.registry.matched(track_ids[row], inputs[col].1);
            used_rows[row] = true;
            used_cols[col] = true;
        }

        // With at least as many tracks as inputs, leftovers on the input side
        // are dropped, even when the counts are equal.
        if track_ids.len() >= inputs.len() {
            for (row, id) in track_ids.iter().enumerate() {
                if !used_rows[row] {
                    self.registry.mark_missing(*id, self.max_disappeared);
                }
            }
        } else {
            for (col, &(class_id, centroid)) in inputs.iter().enumerate() {
                if !used_cols[col] {
                    self.registry.register(class_id, centroid);
                }
            }
        }

        &self.registry
    }
}

/// First index of the smallest value.
fn argmin(values: &[f64]) -> (usize, f64) {
    values
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, v)| {
            if v < best.1 { (i, v) } else { best }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use proptest::prelude::*;

    /// A box whose truncated centroid is exactly `(x, y)`.
    fn at(class_id: u32, x: i32, y: i32) -> Detection {
        Detection {
            class_id,
            bbox: BBox::new(x - 2, y - 2, x + 2, y + 2),
        }
    }

    fn centroid_of(assigner: &CentroidAssigner, id: TrackId) -> Centroid {
        assigner.registry().get(id).unwrap().centroid
    }

    #[test]
    fn empty_registry_registers_in_input_order() {
        let mut assigner = CentroidAssigner::new(15);
        let reg = assigner.update(&[at(2, 5, 5), at(7, 20, 20)]);

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(0).unwrap().class_id, 2);
        assert_eq!(reg.get(0).unwrap().centroid, Centroid::new(5, 5));
        assert_eq!(reg.get(1).unwrap().class_id, 7);
        assert_eq!(reg.get(1).unwrap().centroid, Centroid::new(20, 20));
    }

    #[test]
    fn nearby_centroid_updates_existing_track() {
        let mut assigner = CentroidAssigner::new(15);
        assigner.update(&[at(2, 0, 0)]);
        assigner.update(&[at(2, 10, 50)]);
        let id = assigner.registry().iter().next().unwrap().0;

        let reg = assigner.update(&[at(2, 12, 52)]);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(id).unwrap().centroid, Centroid::new(12, 52));
        assert_eq!(reg.get(id).unwrap().disappeared, 0);
        assert_eq!(reg.next_id(), 1);
    }

    #[test]
    fn deregistered_after_window_is_exceeded() {
        let mut assigner = CentroidAssigner::new(2);
        assigner.update(&[at(2, 10, 10)]);

        assigner.update(&[]);
        assigner.update(&[]);
        assert_eq!(assigner.registry().get(0).unwrap().disappeared, 2);

        assigner.update(&[]);
        assert!(assigner.registry().is_empty());
    }

    #[test]
    fn match_resets_disappearance() {
        let mut assigner = CentroidAssigner::new(5);
        assigner.update(&[at(2, 10, 10)]);
        assigner.update(&[]);
        assigner.update(&[]);
        assigner.update(&[at(2, 11, 10)]);
        assert_eq!(assigner.registry().get(0).unwrap().disappeared, 0);
    }

    #[test]
    fn closest_track_claims_contested_input_first() {
        let mut assigner = CentroidAssigner::new(5);
        assigner.update(&[at(2, 0, 0), at(2, 100, 0)]);
        // Both tracks are nearest to (90, 0); track 1 is closer and wins it.
        assigner.update(&[at(2, 90, 0), at(2, 300, 0), at(2, 500, 0)]);

        assert_eq!(centroid_of(&assigner, 1), Centroid::new(90, 0));
        // Track 0's argmin was consumed, so it stays put this frame.
        assert_eq!(centroid_of(&assigner, 0), Centroid::new(0, 0));
        assert_eq!(assigner.registry().get(0).unwrap().disappeared, 0);
        // Unmatched inputs 1 and 2 become tracks 2 and 3.
        assert_eq!(centroid_of(&assigner, 2), Centroid::new(300, 0));
        assert_eq!(centroid_of(&assigner, 3), Centroid::new(500, 0));
    }

    #[test]
    fn equal_counts_drop_unmatched_inputs() {
        let mut assigner = CentroidAssigner::new(5);
        assigner.update(&[at(2, 0, 0), at(2, 100, 0)]);
        // Both rows pick column 0; row 1 loses and ages, column 1 is dropped.
        assigner.update(&[at(2, 95, 0), at(2, 400, 0)]);

        let reg = assigner.registry();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.next_id(), 2);
        assert_eq!(reg.get(1).unwrap().centroid, Centroid::new(95, 0));
        assert_eq!(reg.get(0).unwrap().disappeared, 1);
    }

    #[test]
    fn extra_tracks_age_while_others_match() {
        let mut assigner = CentroidAssigner::new(0);
        assigner.update(&[at(2, 0, 0), at(2, 100, 100)]);
        assigner.update(&[at(2, 101, 100)]);

        let reg = assigner.registry();
        assert!(reg.get(0).is_none());
        assert_eq!(reg.get(1).unwrap().centroid, Centroid::new(101, 100));
        assert_eq!(reg.classes().len(), reg.centroids().len());
    }

    #[test]
    fn identical_input_gives_identical_assignment() {
        let frames = vec![
            vec![at(2, 10, 10), at(3, 50, 50)],
            vec![at(3, 30, 30), at(2, 30, 30), at(2, 80, 80)],
            vec![],
            vec![at(2, 31, 29)],
        ];
        let run = || {
            let mut a = CentroidAssigner::new(3);
            for f in &frames {
                a.update(f);
            }
            a.registry().centroids()
        };
        assert_eq!(run(), run());
    }

    fn frame_strategy() -> impl Strategy<Value = Vec<(i32, i32)>> {
        prop::collection::vec((0..400i32, 0..400i32), 0..6)
    }

    proptest! {
        #[test]
        fn ids_are_reused_or_strictly_newer(frames in prop::collection::vec(frame_strategy(), 1..12)) {
            let mut assigner = CentroidAssigner::new(2);
            for frame in frames {
                let before: Vec<TrackId> = assigner.registry().iter().map(|(id, _)| id).collect();
                let minted_before = assigner.registry().next_id();
                let dets: Vec<Detection> = frame.iter().map(|&(x, y)| at(0, x, y)).collect();
                let reg = assigner.update(&dets);
                for (id, _) in reg.iter() {
                    prop_assert!(before.contains(&id) || id >= minted_before);
                }
                prop_assert!(reg.next_id() >= minted_before);
            }
        }

        #[test]
        fn disappearance_moves_by_reset_or_one(frames in prop::collection::vec(frame_strategy(), 1..12)) {
            let mut assigner = CentroidAssigner::new(3);
            for frame in frames {
                let before: BTreeMap<TrackId, u32> = assigner
                    .registry()
                    .iter()
                    .map(|(id, o)| (id, o.disappeared))
                    .collect();
                let dets: Vec<Detection> = frame.iter().map(|&(x, y)| at(0, x, y)).collect();
                let reg = assigner.update(&dets);
                for (id, prev) in &before {
                    match reg.get(*id) {
                        Some(o) => prop_assert!(
                            o.disappeared == 0 || o.disappeared == prev + 1 || o.disappeared == *prev
                        ),
                        None => prop_assert_eq!(*prev + 1, 4),
                    }
                    if let Some(o) = reg.get(*id) {
                        prop_assert!(o.disappeared <= 3);
                    }
                }
            }
        }
    }
}
