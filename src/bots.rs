use crate::engine::RaceEngine;
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

/// Synthetic participants push progress at this cadence.
const BOT_TICK: Duration = Duration::from_millis(400);

/// Outcome of one bot progress push, decided by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotTick {
    /// Keep typing.
    Continue,
    /// Paragraph complete for a standard race; claim the finish.
    Finish,
    /// Race over or room gone; the bot task exits.
    Stop,
}

/// Drives synthetic participants through the same engine entry points as
/// human sockets. One task per bot, all cancelled when the race ends.
#[derive(Default)]
pub struct BotDriver {
    tasks: Mutex<HashMap<i64, Vec<JoinHandle<()>>>>,
}

impl BotDriver {
    pub fn start_race_bots(
        &self,
        engine: &Arc<RaceEngine>,
        race_id: i64,
        bot_participants: Vec<i64>,
    ) {
        if bot_participants.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap();
        let handles = tasks.entry(race_id).or_default();
        for participant_id in bot_participants {
            let engine = Arc::clone(engine);
            handles.push(tokio::spawn(run_bot(engine, race_id, participant_id)));
        }
    }

    pub fn stop_race(&self, race_id: i64) {
        let handles = self.tasks.lock().unwrap().remove(&race_id);
        if let Some(handles) = handles {
            debug!(race_id, bots = handles.len(), "stopping race bots");
            for handle in handles {
                handle.abort();
            }
        }
    }

    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handles) in tasks.drain() {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

async fn run_bot(engine: Arc<RaceEngine>, race_id: i64, participant_id: i64) {
    let target_wpm: f64 = rand::thread_rng().gen_range(35.0..75.0);
    let chars_per_sec = target_wpm * 5.0 / 60.0;
    let started = Instant::now();

    let mut interval = tokio::time::interval(BOT_TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let progress = (started.elapsed().as_secs_f64() * chars_per_sec) as i64;
        match engine.bot_progress(race_id, participant_id, progress).await {
            BotTick::Continue => {}
            BotTick::Finish => {
                engine.bot_finish(race_id, participant_id).await;
                return;
            }
            BotTick::Stop => return,
        }
    }
}
