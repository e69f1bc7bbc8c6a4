use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::{
    net::TcpStream,
    sync::{oneshot, Mutex, MutexGuard, OnceCell},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use typerace_server::{
    engine::RaceEngine,
    race::{Participant, Race, RaceType},
    storage::{CreateParticipant, CreateRace, PersistentStorage},
    start_server, Options,
};

pub const SERVER_PORT: u16 = 3999;
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn test_options(database_url: &str) -> Options {
    let args: Vec<&str> = vec![
        "typerace-server",
        "--server",
        "http://127.0.0.1:3999",
        "--database-url",
        database_url,
        "--countdown-seconds",
        "1",
    ];
    Options::parse_from(args)
}

pub struct Harness {
    pub options: Options,
    pub storage: PersistentStorage,
    pub engine: std::sync::Arc<RaceEngine>,
    shutdown_sender: Option<oneshot::Sender<()>>,
    /// Needed to keep the lock on the server port for the duration of a test.
    #[allow(dead_code)]
    lock: MutexGuard<'static, ()>,
    /// Needed to keep the database file alive throughout the test.
    #[allow(dead_code)]
    temp_dir: TempDir,
    app_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Harness {
    pub async fn run() -> Self {
        let lock = server_lock().await.lock().await;
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("typerace-test.db");
        let database_url = format!("sqlite://{}", db_path.display());
        let options = test_options(&database_url);

        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
        let (start_sender, start_receiver) = oneshot::channel::<std::sync::Arc<RaceEngine>>();
        let server_options = options.clone();
        let app_handle = tokio::spawn(async move {
            let (server, engine) = start_server(server_options).await.unwrap();
            start_sender.send(std::sync::Arc::clone(&engine)).ok();
            server
                .with_graceful_shutdown(async move {
                    shutdown_receiver.await.ok();
                })
                .await
                .unwrap();
        });
        let engine = start_receiver.await.unwrap();
        let storage = engine.storage().clone();

        Self {
            options,
            storage,
            engine,
            shutdown_sender: Some(shutdown_sender),
            lock,
            temp_dir,
            app_handle: Some(app_handle),
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{SERVER_PORT}/ws/race")
    }

    pub async fn create_race(&self, paragraph: &str) -> Race {
        self.storage
            .create_race(CreateRace {
                paragraph_content: paragraph.to_owned(),
                paragraph_id: None,
                max_players: 5,
                is_private: false,
                race_type: RaceType::Standard,
                time_limit_seconds: None,
            })
            .await
            .unwrap()
    }

    pub async fn create_timed_race(&self, paragraph: &str, time_limit_seconds: i64) -> Race {
        self.storage
            .create_race(CreateRace {
                paragraph_content: paragraph.to_owned(),
                paragraph_id: None,
                max_players: 5,
                is_private: false,
                race_type: RaceType::Timed,
                time_limit_seconds: Some(time_limit_seconds),
            })
            .await
            .unwrap()
    }

    pub async fn add_participant(
        &self,
        race_id: i64,
        username: &str,
        user_id: Option<&str>,
    ) -> Participant {
        self.storage
            .create_participant(CreateParticipant {
                race_id,
                username: username.to_owned(),
                user_id: user_id.map(str::to_owned),
                guest_name: user_id
                    .is_none()
                    .then(|| format!("g-{username}-{race_id}")),
                avatar_color: None,
                is_bot: false,
            })
            .await
            .unwrap()
    }

    pub async fn stop(&mut self) {
        if let Some(sender) = self.shutdown_sender.take() {
            sender.send(()).ok();
        }
        if let Some(handle) = self.app_handle.take() {
            // Graceful shutdown waits for upgraded sockets, which test
            // clients keep open; abort instead of draining them.
            handle.abort();
            handle.await.ok();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(sender) = self.shutdown_sender.take() {
            sender.send(()).ok();
        }
    }
}

static SERVER_LOCK: OnceCell<Mutex<()>> = OnceCell::const_new();

async fn server_lock() -> &'static Mutex<()> {
    SERVER_LOCK.get_or_init(|| async { Mutex::new(()) }).await
}

pub async fn run_test_harness() -> Harness {
    Harness::run().await
}

/// One connected WebSocket client with frame helpers.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(harness: &Harness) -> Self {
        let (stream, _) = connect_async(harness.ws_url()).await.unwrap();
        Self { stream }
    }

    pub async fn send(&mut self, value: Value) {
        self.stream
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    pub async fn join(&mut self, participant: &Participant) {
        self.send(serde_json::json!({
            "type": "join",
            "raceId": participant.race_id,
            "participantId": participant.id,
            "username": participant.username,
            "joinToken": participant.join_token.get_secret(),
        }))
        .await;
    }

    /// Next text frame, panicking after the timeout.
    pub async fn recv(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .expect("socket error");
            match message {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Close(frame) => panic!("unexpected close: {frame:?}"),
                _ => continue,
            }
        }
    }

    /// Skips frames until one with the requested type arrives.
    pub async fn recv_type(&mut self, wanted: &str) -> Value {
        for _ in 0..100 {
            let value = self.recv().await;
            if value["type"] == wanted {
                return value;
            }
        }
        panic!("no {wanted} frame within 100 messages");
    }

    /// Next frame of the requested type, if it arrives within `window`.
    pub async fn try_recv_type(&mut self, wanted: &str, window: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let Ok(next) = tokio::time::timeout(remaining, self.stream.next()).await else {
                return None;
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == wanted {
                        return Some(value);
                    }
                }
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    /// Collects text frames until the socket closes; returns frames and the
    /// close code if one was received.
    pub async fn drain_until_close(&mut self, window: Duration) -> (Vec<Value>, Option<u16>) {
        let deadline = tokio::time::Instant::now() + window;
        let mut frames = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return (frames, None);
            }
            match tokio::time::timeout(remaining, self.stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    frames.push(serde_json::from_str(&text).unwrap());
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return (frames, frame.map(|f| u16::from(f.code)));
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_)) | None) => return (frames, None),
                Err(_) => return (frames, None),
            }
        }
    }
}
