use crate::util::Secret;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, Row};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Finish position recorded for participants who did not finish.
pub const DNF_POSITION: i64 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
    Waiting,
    Countdown,
    Racing,
    Finished,
    Abandoned,
}

impl RaceStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Countdown => "countdown",
            Self::Racing => "racing",
            Self::Finished => "finished",
            Self::Abandoned => "abandoned",
        }
    }

    /// Terminal states absorb; no transition ever leaves them.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Abandoned)
    }
}

impl Display for RaceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown race status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for RaceStatus {
    type Err = ParseStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "waiting" => Ok(Self::Waiting),
            "countdown" => Ok(Self::Countdown),
            "racing" => Ok(Self::Racing),
            "finished" => Ok(Self::Finished),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceType {
    Standard,
    Timed,
}

impl RaceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Timed => "timed",
        }
    }
}

impl FromStr for RaceType {
    type Err = ParseStatusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "standard" => Ok(Self::Standard),
            "timed" => Ok(Self::Timed),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Race {
    pub id: i64,
    pub room_code: String,
    pub status: RaceStatus,
    pub paragraph_content: String,
    pub paragraph_id: Option<i64>,
    pub max_players: i64,
    pub is_private: bool,
    pub race_type: RaceType,
    pub time_limit_seconds: Option<i64>,
    pub creator_participant_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Race {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let race_type: String = row.try_get("race_type")?;
        Ok(Self {
            id: row.try_get("id")?,
            room_code: row.try_get("room_code")?,
            status: status
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            paragraph_content: row.try_get("paragraph_content")?,
            paragraph_id: row.try_get("paragraph_id")?,
            max_players: row.try_get("max_players")?,
            is_private: row.try_get::<i64, _>("is_private")? != 0,
            race_type: race_type
                .parse()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            time_limit_seconds: row.try_get("time_limit_seconds")?,
            creator_participant_id: row.try_get("creator_participant_id")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    #[must_use]
    pub fn paragraph_len(&self) -> i64 {
        self.paragraph_content.chars().count() as i64
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: i64,
    pub race_id: i64,
    pub username: String,
    pub user_id: Option<String>,
    pub guest_name: Option<String>,
    pub avatar_color: Option<String>,
    pub is_bot: bool,
    pub progress: i64,
    pub wpm: i64,
    pub accuracy: f64,
    pub errors: i64,
    pub is_finished: bool,
    pub finish_position: Option<i64>,
    pub join_token: Secret,
    /// Soft-deleted (left or kicked). Only token validation ever sees these.
    pub deleted: bool,
}

impl Participant {
    pub fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        let join_token: String = row.try_get("join_token")?;
        let deleted_at: Option<chrono::DateTime<Utc>> = row.try_get("deleted_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            race_id: row.try_get("race_id")?,
            username: row.try_get("username")?,
            user_id: row.try_get("user_id")?,
            guest_name: row.try_get("guest_name")?,
            avatar_color: row.try_get("avatar_color")?,
            is_bot: row.try_get::<i64, _>("is_bot")? != 0,
            progress: row.try_get("progress")?,
            wpm: row.try_get("wpm")?,
            accuracy: row.try_get("accuracy")?,
            errors: row.try_get("errors")?,
            is_finished: row.try_get::<i64, _>("is_finished")? != 0,
            finish_position: row.try_get("finish_position")?,
            join_token: Secret::from(join_token),
            deleted: deleted_at.is_some(),
        })
    }

    #[must_use]
    pub fn identity_key(&self) -> crate::identity::IdentityKey {
        crate::identity::IdentityKey::for_participant(
            self.user_id.as_deref(),
            self.guest_name.as_deref(),
            self.id,
        )
    }

    #[must_use]
    pub const fn is_dnf(&self) -> bool {
        matches!(self.finish_position, Some(DNF_POSITION))
    }
}

/// Broadcast-safe projection of a participant. The join token never leaves
/// the server, so this is the only participant shape that serializes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: i64,
    pub race_id: i64,
    pub username: String,
    pub user_id: Option<String>,
    pub avatar_color: Option<String>,
    pub is_bot: bool,
    pub progress: i64,
    pub wpm: i64,
    pub accuracy: f64,
    pub errors: i64,
    pub is_finished: bool,
    pub finish_position: Option<i64>,
}

impl From<&Participant> for ParticipantView {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id,
            race_id: p.race_id,
            username: p.username.clone(),
            user_id: p.user_id.clone(),
            avatar_color: p.avatar_color.clone(),
            is_bot: p.is_bot,
            progress: p.progress,
            wpm: p.wpm,
            accuracy: p.accuracy,
            errors: p.errors,
            is_finished: p.is_finished,
            finish_position: p.finish_position,
        }
    }
}

/// Broadcast-safe projection of a race row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceView {
    pub id: i64,
    pub room_code: String,
    pub status: RaceStatus,
    pub paragraph_content: String,
    pub max_players: i64,
    pub is_private: bool,
    pub race_type: RaceType,
    pub time_limit_seconds: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Race> for RaceView {
    fn from(race: &Race) -> Self {
        Self {
            id: race.id,
            room_code: race.room_code.clone(),
            status: race.status,
            paragraph_content: race.paragraph_content.clone(),
            max_players: race.max_players,
            is_private: race.is_private,
            race_type: race.race_type,
            time_limit_seconds: race.time_limit_seconds,
            started_at: race.started_at,
            finished_at: race.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            RaceStatus::Waiting,
            RaceStatus::Countdown,
            RaceStatus::Racing,
            RaceStatus::Finished,
            RaceStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<RaceStatus>().unwrap(), status);
        }
        assert!("sprinting".parse::<RaceStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(RaceStatus::Finished.is_terminal());
        assert!(RaceStatus::Abandoned.is_terminal());
        assert!(!RaceStatus::Racing.is_terminal());
    }

    #[test]
    fn participant_view_has_no_token_field() {
        let participant = Participant {
            id: 1,
            race_id: 2,
            username: "alice".into(),
            user_id: Some("u1".into()),
            guest_name: None,
            avatar_color: None,
            is_bot: false,
            progress: 3,
            wpm: 40,
            accuracy: 98.5,
            errors: 1,
            is_finished: false,
            finish_position: None,
            join_token: crate::util::Secret::from("topsecret".to_owned()),
            deleted: false,
        };
        let view = ParticipantView::from(&participant);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("topsecret"));
        assert!(!json.to_lowercase().contains("jointoken"));
    }
}
