use crate::{
    race::{Participant, DNF_POSITION},
    storage::{PersistentStorage, StorageError},
};
use std::collections::HashMap;
use tracing::warn;

pub const DEFAULT_RATING: i64 = 1200;
const K_FACTOR: f64 = 32.0;

#[derive(Debug, Clone, Copy)]
pub struct RatingChange {
    pub before: i64,
    pub after: i64,
}

impl RatingChange {
    #[must_use]
    pub const fn delta(&self) -> i64 {
        self.after - self.before
    }
}

#[must_use]
pub fn expected_score(rating: i64, opponent: i64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - rating) as f64 / 400.0))
}

/// Pairwise multiplayer ELO. Each pair is scored by finish position (a DNF
/// loses to any finisher, ties split) and the per-pair K is scaled by the
/// field size so a large race moves ratings about as much as a duel.
#[must_use]
pub fn apply_results(field: &[(String, i64, i64)]) -> HashMap<String, RatingChange> {
    let mut changes: HashMap<String, RatingChange> = field
        .iter()
        .map(|(user_id, rating, _)| {
            (user_id.clone(), RatingChange { before: *rating, after: *rating })
        })
        .collect();
    if field.len() < 2 {
        return changes;
    }
    let pair_k = K_FACTOR / (field.len() - 1) as f64;

    let mut deltas: HashMap<&str, f64> = HashMap::new();
    for (i, (user_a, rating_a, pos_a)) in field.iter().enumerate() {
        for (user_b, rating_b, pos_b) in field.iter().skip(i + 1) {
            let actual_a = score_between(*pos_a, *pos_b);
            let expected_a = expected_score(*rating_a, *rating_b);
            let shift = pair_k * (actual_a - expected_a);
            *deltas.entry(user_a.as_str()).or_default() += shift;
            *deltas.entry(user_b.as_str()).or_default() -= shift;
        }
    }

    for (user_id, delta) in deltas {
        if let Some(change) = changes.get_mut(user_id) {
            change.after = change.before + delta.round() as i64;
        }
    }
    changes
}

fn score_between(pos_a: i64, pos_b: i64) -> f64 {
    match (pos_a == DNF_POSITION, pos_b == DNF_POSITION) {
        (true, true) => 0.5,
        (true, false) => 0.0,
        (false, true) => 1.0,
        (false, false) => {
            if pos_a < pos_b {
                1.0
            } else if pos_a > pos_b {
                0.0
            } else {
                0.5
            }
        }
    }
}

/// Post-race rating orchestration: load-or-create each human's rating, apply
/// the pairwise update, persist. Persistence errors are logged per user and
/// never propagate into the completion pipeline.
pub async fn process_race_ratings(
    storage: &PersistentStorage,
    finishers: &[Participant],
) -> Result<HashMap<String, RatingChange>, StorageError> {
    let mut field: Vec<(String, i64, i64)> = Vec::new();
    for participant in finishers {
        let Some(user_id) = participant.user_id.as_deref() else { continue };
        if participant.is_bot {
            continue;
        }
        let rating = storage.get_or_create_user_rating(user_id).await?;
        field.push((
            user_id.to_owned(),
            rating.rating,
            participant.finish_position.unwrap_or(DNF_POSITION),
        ));
    }

    let changes = apply_results(&field);
    for (user_id, _, _) in &field {
        let Some(change) = changes.get(user_id) else { continue };
        let existing = storage.get_or_create_user_rating(user_id).await?;
        if let Err(error) = storage
            .update_user_rating(user_id, change.after, existing.races_completed + 1)
            .await
        {
            warn!(%error, user_id, "rating update failed");
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_score_is_symmetric() {
        let a = expected_score(1200, 1400);
        let b = expected_score(1400, 1200);
        assert!((a + b - 1.0).abs() < 1e-9);
        assert!(a < 0.5);
    }

    #[test]
    fn winner_gains_loser_drops() {
        let changes = apply_results(&[
            ("alice".into(), 1200, 1),
            ("bob".into(), 1200, 2),
        ]);
        assert_eq!(changes["alice"].delta(), 16);
        assert_eq!(changes["bob"].delta(), -16);
    }

    #[test]
    fn upset_moves_more_than_expected_win() {
        let upset = apply_results(&[
            ("underdog".into(), 1000, 1),
            ("favorite".into(), 1400, 2),
        ]);
        let expected_win = apply_results(&[
            ("favorite".into(), 1400, 1),
            ("underdog".into(), 1000, 2),
        ]);
        assert!(upset["underdog"].delta() > expected_win["favorite"].delta());
    }

    #[test]
    fn dnf_counts_as_loss_to_every_finisher() {
        let changes = apply_results(&[
            ("alice".into(), 1200, 1),
            ("bob".into(), 1200, DNF_POSITION),
        ]);
        assert!(changes["bob"].delta() < 0);
        assert!(changes["alice"].delta() > 0);
    }

    #[test]
    fn three_way_deltas_roughly_conserve() {
        let changes = apply_results(&[
            ("a".into(), 1300, 1),
            ("b".into(), 1200, 2),
            ("c".into(), 1100, 3),
        ]);
        let total: i64 = changes.values().map(RatingChange::delta).sum();
        assert!(total.abs() <= 2, "rounding drift only, got {total}");
    }

    #[test]
    fn solo_field_is_untouched() {
        let changes = apply_results(&[("alice".into(), 1200, 1)]);
        assert_eq!(changes["alice"].delta(), 0);
    }
}
