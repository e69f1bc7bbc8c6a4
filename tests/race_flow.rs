mod common;

use common::harness::{run_test_harness, WsClient};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn standard_race_runs_to_a_single_race_finished() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("abc def ghi").await;
    let alice = harness.add_participant(race.id, "alice", Some("u-alice")).await;
    let bob = harness.add_participant(race.id, "bob", Some("u-bob")).await;

    let mut alice_ws = WsClient::connect(&harness).await;
    alice_ws.join(&alice).await;
    let joined = alice_ws.recv_type("joined").await;
    assert_eq!(joined["participantId"], alice.id);
    assert_eq!(joined["hostParticipantId"], alice.id);

    let mut bob_ws = WsClient::connect(&harness).await;
    bob_ws.join(&bob).await;
    bob_ws.recv_type("joined").await;
    alice_ws.recv_type("participant_joined").await;

    // Host starts; both see the countdown and the start signal.
    alice_ws.send(json!({
        "type": "ready",
        "raceId": race.id,
        "participantId": alice.id,
    }))
    .await;
    let countdown = alice_ws.recv_type("countdown_start").await;
    assert_eq!(countdown["countdown"], 1);
    bob_ws.recv_type("countdown_start").await;
    let start = alice_ws.recv_type("race_start").await;
    assert!(start["serverTimestamp"].as_i64().unwrap() > 0);
    bob_ws.recv_type("race_start").await;

    // Alice completes first.
    alice_ws.send(json!({
        "type": "progress",
        "participantId": alice.id,
        "progress": 11,
        "errors": 0,
    }))
    .await;
    alice_ws.send(json!({
        "type": "finish",
        "raceId": race.id,
        "participantId": alice.id,
    }))
    .await;
    let finished = bob_ws.recv_type("participant_finished").await;
    assert_eq!(finished["participantId"], alice.id);
    assert_eq!(finished["position"], 1);

    bob_ws.send(json!({
        "type": "progress",
        "participantId": bob.id,
        "progress": 11,
        "errors": 0,
    }))
    .await;
    bob_ws.send(json!({
        "type": "finish",
        "raceId": race.id,
        "participantId": bob.id,
    }))
    .await;

    let results = alice_ws.recv_type("race_finished").await;
    let positions: Vec<(i64, i64)> = results["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| {
            (
                r["participantId"].as_i64().unwrap(),
                r["position"].as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(positions, vec![(alice.id, 1), (bob.id, 2)]);
    bob_ws.recv_type("race_finished").await;

    // Exactly one race_finished per client.
    assert!(alice_ws
        .try_recv_type("race_finished", Duration::from_secs(1))
        .await
        .is_none());

    harness.stop().await;
}

#[tokio::test]
async fn duplicate_identity_supersedes_older_socket() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("abc def ghi").await;
    let alice = harness.add_participant(race.id, "alice", Some("u7")).await;
    let bob = harness.add_participant(race.id, "bob", Some("u8")).await;

    let mut first = WsClient::connect(&harness).await;
    first.join(&alice).await;
    first.recv_type("joined").await;
    let mut second_participant = WsClient::connect(&harness).await;
    second_participant.join(&bob).await;
    second_participant.recv_type("joined").await;

    let mut second = WsClient::connect(&harness).await;
    second.join(&alice).await;
    second.recv_type("joined").await;

    let (frames, close_code) = first.drain_until_close(Duration::from_secs(5)).await;
    assert!(frames
        .iter()
        .any(|frame| frame["type"] == "connection_superseded"));
    assert_eq!(close_code, Some(4000));

    harness.stop().await;
}

#[tokio::test]
async fn progress_regression_is_dropped() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("a long paragraph for regression testing here").await;
    let alice = harness.add_participant(race.id, "alice", None).await;
    let bob = harness.add_participant(race.id, "bob", None).await;

    let mut alice_ws = WsClient::connect(&harness).await;
    alice_ws.join(&alice).await;
    alice_ws.recv_type("joined").await;
    let mut bob_ws = WsClient::connect(&harness).await;
    bob_ws.join(&bob).await;
    bob_ws.recv_type("joined").await;

    alice_ws.send(json!({
        "type": "ready",
        "raceId": race.id,
        "participantId": alice.id,
    }))
    .await;
    alice_ws.recv_type("race_start").await;
    bob_ws.recv_type("race_start").await;

    bob_ws.send(json!({
        "type": "progress",
        "participantId": bob.id,
        "progress": 40,
        "errors": 0,
    }))
    .await;
    let update = alice_ws.recv_type("progress_update").await;
    assert_eq!(update["participantId"], bob.id);
    assert_eq!(update["progress"], 40);

    // The regression must produce no broadcast at all.
    bob_ws.send(json!({
        "type": "progress",
        "participantId": bob.id,
        "progress": 35,
        "errors": 0,
    }))
    .await;
    assert!(alice_ws
        .try_recv_type("progress_update", Duration::from_secs(1))
        .await
        .is_none());

    // Progress resumes from the maximum the server observed.
    bob_ws.send(json!({
        "type": "progress",
        "participantId": bob.id,
        "progress": 41,
        "errors": 0,
    }))
    .await;
    let update = alice_ws.recv_type("progress_update").await;
    assert_eq!(update["progress"], 41);

    harness.stop().await;
}

#[tokio::test]
async fn kick_then_rejoin_approval_flow() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("abc def ghi").await;
    let alice = harness.add_participant(race.id, "alice", Some("u-alice")).await;
    let bob = harness.add_participant(race.id, "bob", Some("u-bob")).await;

    let mut alice_ws = WsClient::connect(&harness).await;
    alice_ws.join(&alice).await;
    alice_ws.recv_type("joined").await;
    let mut bob_ws = WsClient::connect(&harness).await;
    bob_ws.join(&bob).await;
    bob_ws.recv_type("joined").await;
    alice_ws.recv_type("participant_joined").await;

    alice_ws.send(json!({
        "type": "kick_player",
        "raceId": race.id,
        "participantId": alice.id,
        "targetParticipantId": bob.id,
    }))
    .await;
    let kicked = bob_ws.recv_type("error").await;
    assert_eq!(kicked["code"], "KICKED");
    let kick_event = alice_ws.recv_type("player_kicked").await;
    assert_eq!(kick_event["participantId"], bob.id);

    // Bob reconnects and lands in the approval queue.
    let mut bob_retry = WsClient::connect(&harness).await;
    bob_retry.join(&bob).await;
    bob_retry.recv_type("rejoin_request_pending").await;
    let request = alice_ws.recv_type("rejoin_request").await;
    assert_eq!(request["participantId"], bob.id);

    alice_ws.send(json!({
        "type": "rejoin_decision",
        "raceId": race.id,
        "participantId": alice.id,
        "targetParticipantId": bob.id,
        "approved": true,
    }))
    .await;
    let approved = bob_retry.recv_type("rejoin_approved").await;
    let names: Vec<&str> = approved["participants"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["username"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"bob"));

    // Bob is a full participant again: chat goes through.
    bob_retry.send(json!({
        "type": "chat_message",
        "raceId": race.id,
        "participantId": bob.id,
        "content": "back!",
    }))
    .await;
    let chat = alice_ws.recv_type("chat_message").await;
    assert_eq!(chat["content"], "back!");

    harness.stop().await;
}

#[tokio::test]
async fn chat_is_rate_limited_per_participant() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("abc def ghi").await;
    let alice = harness.add_participant(race.id, "alice", None).await;

    let mut alice_ws = WsClient::connect(&harness).await;
    alice_ws.join(&alice).await;
    alice_ws.recv_type("joined").await;

    alice_ws.send(json!({
        "type": "chat_message",
        "raceId": race.id,
        "participantId": alice.id,
        "content": "one",
    }))
    .await;
    alice_ws.recv_type("chat_message").await;

    for _ in 0..2 {
        alice_ws.send(json!({
            "type": "chat_message",
            "raceId": race.id,
            "participantId": alice.id,
            "content": "too fast",
        }))
        .await;
        let error = alice_ws.recv_type("error").await;
        assert_eq!(error["code"], "CHAT_RATE_LIMITED");
        assert!(error["retryAfter"].as_u64().unwrap() > 0);
    }

    tokio::time::sleep(Duration::from_millis(2100)).await;
    alice_ws.send(json!({
        "type": "chat_message",
        "raceId": race.id,
        "participantId": alice.id,
        "content": "two",
    }))
    .await;
    let chat = alice_ws.recv_type("chat_message").await;
    assert_eq!(chat["content"], "two");

    harness.stop().await;
}

#[tokio::test]
async fn timed_race_force_finishes_and_ranks_by_wpm() {
    let mut harness = run_test_harness().await;
    let paragraph =
        "a rather long paragraph that nobody will realistically complete in two seconds of typing";
    let race = harness.create_timed_race(paragraph, 2).await;
    let alice = harness.add_participant(race.id, "alice", Some("u-alice")).await;
    let bob = harness.add_participant(race.id, "bob", Some("u-bob")).await;

    let mut alice_ws = WsClient::connect(&harness).await;
    alice_ws.join(&alice).await;
    alice_ws.recv_type("joined").await;
    let mut bob_ws = WsClient::connect(&harness).await;
    bob_ws.join(&bob).await;
    bob_ws.recv_type("joined").await;

    alice_ws.send(json!({
        "type": "ready",
        "raceId": race.id,
        "participantId": alice.id,
    }))
    .await;
    alice_ws.recv_type("race_start").await;
    bob_ws.recv_type("race_start").await;

    alice_ws.send(json!({
        "type": "progress",
        "participantId": alice.id,
        "progress": 20,
        "errors": 2,
    }))
    .await;
    bob_ws.send(json!({
        "type": "progress",
        "participantId": bob.id,
        "progress": 30,
        "errors": 0,
    }))
    .await;

    // Nobody claims a finish; the server timer resolves the race.
    let results = alice_ws.recv_type("race_finished").await;
    let positions: Vec<(i64, i64)> = results["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| {
            (
                r["participantId"].as_i64().unwrap(),
                r["position"].as_i64().unwrap(),
            )
        })
        .collect();
    assert_eq!(positions, vec![(bob.id, 1), (alice.id, 2)]);

    harness.stop().await;
}

#[tokio::test]
async fn invalid_join_tokens_are_rejected() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("abc def ghi").await;
    let alice = harness.add_participant(race.id, "alice", None).await;

    let mut ws = WsClient::connect(&harness).await;
    ws.send(json!({
        "type": "join",
        "raceId": race.id,
        "participantId": alice.id,
        "username": "alice",
        "joinToken": "wrong-token",
    }))
    .await;
    let error = ws.recv_type("error").await;
    assert_eq!(error["code"], "INVALID_TOKEN");

    ws.send(json!({
        "type": "join",
        "raceId": race.id,
        "participantId": alice.id,
        "username": "mallory",
        "joinToken": alice.join_token.get_secret(),
    }))
    .await;
    let error = ws.recv_type("error").await;
    assert_eq!(error["code"], "NOT_AUTHORIZED");

    harness.stop().await;
}

#[tokio::test]
async fn host_leaving_transfers_host_with_new_version() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("abc def ghi").await;
    let alice = harness.add_participant(race.id, "alice", None).await;
    let bob = harness.add_participant(race.id, "bob", None).await;

    let mut alice_ws = WsClient::connect(&harness).await;
    alice_ws.join(&alice).await;
    alice_ws.recv_type("joined").await;
    let mut bob_ws = WsClient::connect(&harness).await;
    bob_ws.join(&bob).await;
    bob_ws.recv_type("joined").await;

    alice_ws.send(json!({
        "type": "leave",
        "raceId": race.id,
        "participantId": alice.id,
    }))
    .await;

    let host_changed = bob_ws.recv_type("host_changed").await;
    assert_eq!(host_changed["hostParticipantId"], bob.id);
    assert!(host_changed["hostVersion"].as_u64().unwrap() >= 2);

    harness.stop().await;
}

#[tokio::test]
async fn no_frame_ever_carries_a_join_token() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("abc def ghi").await;
    let alice = harness.add_participant(race.id, "alice", Some("u-alice")).await;
    let bob = harness.add_participant(race.id, "bob", Some("u-bob")).await;
    let alice_token = alice.join_token.get_secret().to_owned();
    let bob_token = bob.join_token.get_secret().to_owned();

    let mut alice_ws = WsClient::connect(&harness).await;
    alice_ws.join(&alice).await;
    let joined = alice_ws.recv_type("joined").await;
    assert!(!joined.to_string().contains(&alice_token));
    let mut bob_ws = WsClient::connect(&harness).await;
    bob_ws.join(&bob).await;
    bob_ws.recv_type("joined").await;

    alice_ws.send(json!({
        "type": "ready",
        "raceId": race.id,
        "participantId": alice.id,
    }))
    .await;
    bob_ws.recv_type("race_start").await;
    for (ws, participant) in [(&mut alice_ws, &alice), (&mut bob_ws, &bob)] {
        ws.send(json!({
            "type": "progress",
            "participantId": participant.id,
            "progress": 11,
            "errors": 0,
        }))
        .await;
        ws.send(json!({
            "type": "finish",
            "raceId": race.id,
            "participantId": participant.id,
        }))
        .await;
    }
    bob_ws.recv_type("race_finished").await;

    let (frames, _) = alice_ws.drain_until_close(Duration::from_secs(2)).await;
    for frame in &frames {
        let serialized = frame.to_string();
        assert!(!serialized.contains(&alice_token), "token leaked: {serialized}");
        assert!(!serialized.contains(&bob_token), "token leaked: {serialized}");
        assert!(!serialized.contains("joinToken"), "token field leaked: {serialized}");
    }

    harness.stop().await;
}

#[tokio::test]
async fn locked_room_rejects_unknown_participants() {
    let mut harness = run_test_harness().await;
    let race = harness.create_race("abc def ghi").await;
    let alice = harness.add_participant(race.id, "alice", None).await;

    let mut alice_ws = WsClient::connect(&harness).await;
    alice_ws.join(&alice).await;
    alice_ws.recv_type("joined").await;

    alice_ws.send(json!({
        "type": "lock_room",
        "raceId": race.id,
        "participantId": alice.id,
        "locked": true,
    }))
    .await;
    let locked = alice_ws.recv_type("room_lock_changed").await;
    assert_eq!(locked["locked"], true);

    // A participant created after the room was loaded is unknown to it.
    let cara = harness.add_participant(race.id, "cara", None).await;
    let mut cara_ws = WsClient::connect(&harness).await;
    cara_ws.join(&cara).await;
    let error = cara_ws.recv_type("error").await;
    assert_eq!(error["code"], "ROOM_LOCKED");

    harness.stop().await;
}
