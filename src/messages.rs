use crate::race::{ParticipantView, RaceView};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoStaticStr;
use thiserror::Error;

/// Hard cap on any inbound frame.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;
/// Cap applied at the engine to everything except `submit_keystrokes`.
pub const MAX_STANDARD_FRAME_BYTES: usize = 16 * 1024;
/// Keystroke evidence frames carry at most this many events.
pub const MAX_KEYSTROKE_EVENTS: usize = 3000;
/// Chat content is truncated to this many characters after sanitization.
pub const MAX_CHAT_CHARS: usize = 500;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY: u16 = 1008;
pub const CLOSE_OVERLOAD: u16 = 1013;
pub const CLOSE_SUPERSEDED: u16 = 4000;
pub const CLOSE_IDLE: u16 = 4001;

pub const SUPERSEDED_REASON: &str = "Connection superseded by new session";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokeEvent {
    pub position: i64,
    pub key: String,
    pub timestamp: i64,
    /// Client-reported correctness is ignored; the server re-derives it.
    #[serde(default)]
    pub correct: Option<bool>,
}

/// Inbound frames. The `type` tag dispatches; unknown tags fail parsing.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        race_id: i64,
        participant_id: i64,
        username: String,
        join_token: String,
    },
    #[serde(rename_all = "camelCase")]
    Ready { race_id: i64, participant_id: i64 },
    #[serde(rename_all = "camelCase")]
    ReadyToggle {
        race_id: i64,
        participant_id: i64,
        #[serde(default)]
        is_ready: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        participant_id: i64,
        progress: serde_json::Value,
        errors: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Finish { race_id: i64, participant_id: i64 },
    #[serde(rename_all = "camelCase")]
    TimedFinish {
        race_id: i64,
        participant_id: i64,
        progress: serde_json::Value,
        errors: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Leave {
        race_id: i64,
        participant_id: i64,
        #[serde(default)]
        is_racing: Option<bool>,
        #[serde(default)]
        progress: Option<serde_json::Value>,
        #[serde(default)]
        errors: Option<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    SubmitKeystrokes {
        race_id: i64,
        participant_id: i64,
        keystrokes: Vec<KeystrokeEvent>,
        #[serde(default)]
        client_wpm: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        race_id: i64,
        participant_id: i64,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    KickPlayer {
        race_id: i64,
        participant_id: i64,
        target_participant_id: i64,
    },
    #[serde(rename_all = "camelCase")]
    LockRoom {
        race_id: i64,
        participant_id: i64,
        locked: bool,
    },
    #[serde(rename_all = "camelCase")]
    RejoinDecision {
        race_id: i64,
        participant_id: i64,
        target_participant_id: i64,
        approved: bool,
    },
    #[serde(rename_all = "camelCase")]
    ExtendParagraph { race_id: i64, participant_id: i64 },
    #[serde(rename_all = "camelCase")]
    Rematch { race_id: i64, participant_id: i64 },
    #[serde(rename_all = "camelCase")]
    Spectate { race_id: i64 },
    #[serde(rename_all = "camelCase")]
    StopSpectate { race_id: i64 },
    #[serde(rename_all = "camelCase")]
    GetReplay { race_id: i64 },
    #[serde(rename_all = "camelCase")]
    GetRating { user_id: String },
}

impl ClientMessage {
    /// Wire tag, used as the rate-limit bucket key.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Ready { .. } => "ready",
            Self::ReadyToggle { .. } => "ready_toggle",
            Self::Progress { .. } => "progress",
            Self::Finish { .. } => "finish",
            Self::TimedFinish { .. } => "timed_finish",
            Self::Leave { .. } => "leave",
            Self::SubmitKeystrokes { .. } => "submit_keystrokes",
            Self::ChatMessage { .. } => "chat_message",
            Self::KickPlayer { .. } => "kick_player",
            Self::LockRoom { .. } => "lock_room",
            Self::RejoinDecision { .. } => "rejoin_decision",
            Self::ExtendParagraph { .. } => "extend_paragraph",
            Self::Rematch { .. } => "rematch",
            Self::Spectate { .. } => "spectate",
            Self::StopSpectate { .. } => "stop_spectate",
            Self::GetReplay { .. } => "get_replay",
            Self::GetRating { .. } => "get_rating",
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    TooLarge,
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame is missing a string `type`")]
    MissingType,
    #[error("invalid payload: {0}")]
    Invalid(serde_json::Error),
}

/// Applies the payload gate and parses an inbound text frame.
pub fn parse_client_frame(text: &str) -> Result<ClientMessage, FrameError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge);
    }
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| FrameError::NotAnObject)?;
    let object = value.as_object().ok_or(FrameError::NotAnObject)?;
    if !object.get("type").map_or(false, serde_json::Value::is_string) {
        return Err(FrameError::MissingType);
    }
    serde_json::from_value(value).map_err(FrameError::Invalid)
}

/// Reads a client-reported numeric field. Non-numeric and negative values
/// are indistinguishable to callers: both mean "drop the frame".
#[must_use]
pub fn numeric_field(value: &serde_json::Value) -> Option<i64> {
    let number = value.as_f64()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some(number.floor() as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, IntoStaticStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPayload,
    RateLimited,
    IpLimitExceeded,
    TokenRequired,
    InvalidToken,
    NotAuthorized,
    NotHost,
    RoomLocked,
    Kicked,
    RaceInProgress,
    RaceFinished,
    RaceStarting,
    NotEnoughPlayers,
    InsufficientPlayers,
    PlayerNotFound,
    CannotKickSelf,
    RoomNotFound,
    RaceUnavailable,
    InvalidRaceStatus,
    NoHost,
    RequestTimeout,
    RematchFailed,
    DuplicateConnection,
    SpectatorLimitReached,
    GlobalSpectatorLimit,
    ChatRateLimited,
    RaceStartConflict,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub participant_id: i64,
    pub username: String,
    pub content: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    pub participant_id: i64,
    pub username: String,
    pub is_bot: bool,
    pub position: i64,
    pub wpm: i64,
    pub accuracy: f64,
    pub progress: i64,
    pub errors: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<RatingSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSummary {
    pub rating: i64,
    pub change: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSummary {
    pub verification_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEntry {
    pub participant_id: i64,
    pub data: String,
}

/// Outbound events. Serialized once per broadcast and fanned out as shared
/// text to every socket in the room.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Joined {
        race: RaceView,
        participants: Vec<ParticipantView>,
        participant_id: i64,
        host_participant_id: Option<i64>,
        is_reconnect: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_timestamp: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant: ParticipantView },
    #[serde(rename_all = "camelCase")]
    ParticipantsSync { participants: Vec<ParticipantView> },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { participant_id: i64, username: String },
    #[serde(rename_all = "camelCase")]
    ParticipantDisconnected { participant_id: i64 },
    #[serde(rename_all = "camelCase")]
    ParticipantReconnected { participant_id: i64, username: String },
    #[serde(rename_all = "camelCase")]
    ParticipantDnf { participant_id: i64 },
    #[serde(rename_all = "camelCase")]
    PlayerKicked {
        participant_id: i64,
        participants: Vec<ParticipantView>,
    },
    #[serde(rename_all = "camelCase")]
    HostChanged {
        host_participant_id: i64,
        host_version: u64,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    CountdownStart {
        countdown: u64,
        participants: Vec<ParticipantView>,
    },
    #[serde(rename_all = "camelCase")]
    Countdown { countdown: u64 },
    #[serde(rename_all = "camelCase")]
    CountdownCancelled { reason: String },
    #[serde(rename_all = "camelCase")]
    RaceStart { server_timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    ParagraphExtended {
        additional_content: String,
        previous_length: i64,
        new_total_length: i64,
    },
    #[serde(rename_all = "camelCase")]
    ProgressUpdate {
        participant_id: i64,
        progress: i64,
        wpm: i64,
        accuracy: f64,
        errors: i64,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantFinished { participant_id: i64, position: i64 },
    #[serde(rename_all = "camelCase")]
    RaceFinished {
        results: Vec<FinalResult>,
        certificates: HashMap<i64, CertificateSummary>,
    },
    #[serde(rename_all = "camelCase")]
    RaceCertificates {
        certificates: HashMap<i64, CertificateSummary>,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        participant_id: i64,
        username: String,
        content: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ChatHistory { messages: Vec<ChatBroadcast> },
    #[serde(rename_all = "camelCase")]
    ReadyStateUpdate { participant_id: i64, is_ready: bool },
    #[serde(rename_all = "camelCase")]
    RejoinRequest { participant_id: i64, username: String },
    #[serde(rename_all = "camelCase")]
    RejoinRequestPending,
    #[serde(rename_all = "camelCase")]
    RejoinApproved {
        race: RaceView,
        participants: Vec<ParticipantView>,
        chat_history: Vec<ChatBroadcast>,
    },
    #[serde(rename_all = "camelCase")]
    RejoinRejected { reason: String },
    #[serde(rename_all = "camelCase")]
    RoomLockChanged { locked: bool },
    #[serde(rename_all = "camelCase")]
    RematchAvailable { race_id: i64, room_code: String },
    #[serde(rename_all = "camelCase")]
    ConnectionSuperseded { reason: String },
    #[serde(rename_all = "camelCase")]
    ServerShutdown,
    #[serde(rename_all = "camelCase")]
    ReplayData {
        race_id: i64,
        replays: Vec<ReplayEntry>,
    },
    #[serde(rename_all = "camelCase")]
    RatingData {
        user_id: String,
        rating: i64,
        races_completed: i64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
}

impl ServerEvent {
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn error_with_retry(code: ErrorCode, message: impl Into<String>, retry_after: u64) -> Self {
        Self::Error {
            code,
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }
}

/// Strips HTML tags and control characters, then truncates.
#[must_use]
pub fn sanitize_chat(content: &str) -> String {
    let mut out = String::with_capacity(content.len().min(MAX_CHAT_CHARS));
    let mut in_tag = false;
    for c in content.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if in_tag => {
                let _ = c;
            }
            c if c.is_control() && c != '\n' => {}
            c => out.push(c),
        }
    }
    let trimmed = out.trim();
    trimmed.chars().take(MAX_CHAT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_frame() {
        let frame = r#"{"type":"join","raceId":1,"participantId":2,"username":"alice","joinToken":"tok"}"#;
        let message = parse_client_frame(frame).unwrap();
        assert!(matches!(
            message,
            ClientMessage::Join { race_id: 1, participant_id: 2, .. }
        ));
        assert_eq!(message.message_type(), "join");
    }

    #[test]
    fn rejects_non_object_and_missing_type() {
        assert!(matches!(
            parse_client_frame("[1,2,3]"),
            Err(FrameError::NotAnObject)
        ));
        assert!(matches!(
            parse_client_frame(r#"{"raceId":1}"#),
            Err(FrameError::MissingType)
        ));
        assert!(matches!(
            parse_client_frame(r#"{"type":5}"#),
            Err(FrameError::MissingType)
        ));
    }

    #[test]
    fn rejects_oversized_frame() {
        let padding = "x".repeat(MAX_FRAME_BYTES + 1);
        let frame = format!(r#"{{"type":"ready","raceId":1,"participantId":2,"pad":"{padding}"}}"#);
        assert!(matches!(parse_client_frame(&frame), Err(FrameError::TooLarge)));
    }

    #[test]
    fn numeric_field_drops_garbage() {
        assert_eq!(numeric_field(&serde_json::json!(40)), Some(40));
        assert_eq!(numeric_field(&serde_json::json!(40.9)), Some(40));
        assert_eq!(numeric_field(&serde_json::json!(-1)), None);
        assert_eq!(numeric_field(&serde_json::json!("40")), None);
        assert_eq!(numeric_field(&serde_json::json!(null)), None);
    }

    #[test]
    fn error_codes_serialize_screaming() {
        let json = serde_json::to_string(&ErrorCode::IpLimitExceeded).unwrap();
        assert_eq!(json, "\"IP_LIMIT_EXCEEDED\"");
        let s: &'static str = ErrorCode::ChatRateLimited.into();
        assert_eq!(s, "CHAT_RATE_LIMITED");
    }

    #[test]
    fn sanitize_strips_tags_and_truncates() {
        assert_eq!(sanitize_chat("<script>alert(1)</script>hello"), "alert(1)hello");
        assert_eq!(sanitize_chat("  hi there \u{0007} "), "hi there");
        let long = "a".repeat(600);
        assert_eq!(sanitize_chat(&long).chars().count(), MAX_CHAT_CHARS);
    }

    #[test]
    fn progress_event_uses_camel_case_fields() {
        let event = ServerEvent::ProgressUpdate {
            participant_id: 7,
            progress: 11,
            wpm: 80,
            accuracy: 99.0,
            errors: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"progress_update""#));
        assert!(json.contains(r#""participantId":7"#));
    }
}
