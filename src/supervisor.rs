/*
 *  supervisor.rs
 *
 *  PostBox - posts on glass
 *  (c) 2024-26 PostBox contributors
 *
 *  Top-level lifecycle: initialize, listen, heartbeat, detect failure,
 *  back off and reinitialize, or give up permanently.
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use chrono::Utc;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use linux_embedded_hal::{Delay, I2cdev};
use log::{debug, error, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::config::{Config, DisplayConfig, RecoveryConfig};
use crate::error::Fault;
use crate::feed::{self, FeedClient, Post};
use crate::lcd::Lcd;
use crate::text;

/// Everything that can wake the supervisor. Feed changes, heartbeat
/// ticks, and retry expiries are the only suspension points; they are
/// dispatched one at a time, so supervisor state needs no locking.
#[derive(Debug)]
pub enum Event {
    FeedChange(Result<Option<Value>, Fault>),
    HeartbeatTick,
    RetryElapsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Starting,
    Running,
    ErrorPending,
    Terminated,
}

/// Consecutive-error bookkeeping.
///
/// A fault arriving within twice the retry delay of the previous one
/// belongs to the same outage and increments the count; a larger gap
/// resets it to 1. The count is never zeroed by a successful
/// reinitialization, only superseded by the gap rule on the next
/// fault.
#[derive(Debug)]
pub struct ErrorState {
    consecutive: u32,
    last_error_ms: i64,
    handling: bool,
}

impl ErrorState {
    pub fn new() -> Self {
        ErrorState {
            consecutive: 0,
            last_error_ms: 0,
            handling: false,
        }
    }

    /// Begin handling a fault observed at `now_ms`. Returns the
    /// updated consecutive count, or None when a recovery is already
    /// pending — the caller must not schedule a second retry timer.
    pub fn begin_handling(&mut self, now_ms: i64, window_ms: i64) -> Option<u32> {
        if self.handling {
            return None;
        }
        self.handling = true;
        if now_ms - self.last_error_ms < window_ms {
            self.consecutive += 1;
        } else {
            self.consecutive = 1;
        }
        self.last_error_ms = now_ms;
        Some(self.consecutive)
    }

    /// The retry delay has elapsed; the next fault may be handled.
    pub fn retry_elapsed(&mut self) {
        self.handling = false;
    }

    #[allow(dead_code)]
    pub fn is_handling(&self) -> bool {
        self.handling
    }
}

/// Recovery orchestrator. Exclusive owner of the display handle, the
/// error state, and the heartbeat timer.
pub struct Supervisor {
    display_cfg: DisplayConfig,
    recovery_cfg: RecoveryConfig,
    lcd: Option<Lcd<I2cdev, Delay>>,
    feed: FeedClient,
    errors: ErrorState,
    heartbeat: Option<JoinHandle<()>>,
    state: RunState,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
}

impl Supervisor {
    pub fn new(cfg: Config) -> Result<Self, Fault> {
        let (tx, rx) = mpsc::channel(16);
        let feed = FeedClient::new(cfg.feed.clone().unwrap_or_default())?;
        Ok(Supervisor {
            display_cfg: cfg.display.unwrap_or_default(),
            recovery_cfg: cfg.recovery.unwrap_or_default(),
            lcd: None,
            feed,
            errors: ErrorState::new(),
            heartbeat: None,
            state: RunState::Starting,
            tx,
            rx,
        })
    }

    /// Run until the consecutive-error threshold (or a fatal auth
    /// rejection) terminates the device. Returns the exit code.
    pub async fn run(mut self) -> i32 {
        self.start().await;
        while self.state != RunState::Terminated {
            match self.rx.recv().await {
                Some(event) => self.dispatch(event).await,
                None => break,
            }
        }
        1
    }

    async fn start(&mut self) {
        if let Err(fault) = self.try_start().await {
            self.handle_fault(fault).await;
        }
    }

    /// The Starting sequence. Any failure routes to the error handler
    /// rather than retrying in place.
    async fn try_start(&mut self) -> Result<(), Fault> {
        self.state = RunState::Starting;
        debug!("initializing");
        let settle = self.recovery_cfg.startup_delay_secs();
        if settle > 0 {
            // boot settle: the bus and the network may not be up yet
            time::sleep(Duration::from_secs(settle)).await;
        }
        self.lcd = Some(Lcd::open(
            self.display_cfg.bus(),
            self.display_cfg.address(),
            self.display_cfg.cols(),
            self.display_cfg.rows(),
        )?);
        self.feed.sign_in().await?;
        self.feed.subscribe_latest(self.tx.clone())?;
        self.start_heartbeats();
        self.state = RunState::Running;
        debug!("initialized");
        Ok(())
    }

    async fn dispatch(&mut self, event: Event) {
        let result = match event {
            Event::FeedChange(Ok(snapshot)) => self.on_feed_change(snapshot).await,
            Event::FeedChange(Err(fault)) => Err(fault),
            Event::HeartbeatTick => self.send_heartbeat().await,
            Event::RetryElapsed => {
                self.on_retry_elapsed().await;
                Ok(())
            }
        };
        if let Err(fault) = result {
            if fault.is_data() {
                // malformed records never enter the recovery cycle
                warn!("dropping malformed post: {}", fault);
            } else {
                self.handle_fault(fault).await;
            }
        }
    }

    /// The newest record changed. Probe liveness, blank the panel,
    /// and render the post if there is one.
    async fn on_feed_change(&mut self, snapshot: Option<Value>) -> Result<(), Fault> {
        self.send_heartbeat().await?;
        let lcd = self.lcd.as_mut().ok_or_else(|| no_display("feed update"))?;
        lcd.clear()?;
        let Some(raw) = snapshot else {
            debug!("fetched 0 posts");
            return Ok(());
        };
        let post = feed::validate_post(&raw)?;
        debug!("fetched post {} (posted at {})", post.uuid, post.time_posted);
        render_post(lcd, &post)
    }

    /// Cursor-home probe on the display plus a liveness report to the
    /// feed. Either failing routes to the error handler.
    async fn send_heartbeat(&mut self) -> Result<(), Fault> {
        let lcd = self.lcd.as_mut().ok_or_else(|| no_display("heartbeat probe"))?;
        lcd.home()?;
        self.feed.report_liveness(Utc::now().timestamp_millis()).await?;
        debug!("heartbeat sent");
        Ok(())
    }

    /// The single error handler: the only place that decides retry
    /// vs. terminate.
    async fn handle_fault(&mut self, fault: Fault) {
        if self.state == RunState::Terminated {
            return;
        }
        if fault.is_fatal_auth() {
            error!("authentication rejected, terminating: {}", fault);
            self.terminate();
            return;
        }

        let retry_secs = self.recovery_cfg.retry_secs();
        let window_ms = (retry_secs * 2 * 1000) as i64;
        let Some(count) = self.errors.begin_handling(Utc::now().timestamp_millis(), window_ms)
        else {
            error!("error while recovery is already queued: {}", fault);
            return;
        };

        self.state = RunState::ErrorPending;
        self.stop_heartbeats();
        // never reuse a handle that saw a fault
        self.lcd = None;

        let max = self.recovery_cfg.max_consecutive_errors();
        if count >= max {
            error!("consecutive error threshold of {} reached, terminating: {}", max, fault);
            self.terminate();
            return;
        }

        error!("reinitializing in {}s (consecutive errors: {}): {}", retry_secs, count, fault);
        let tx = self.tx.clone();
        let delay = Duration::from_secs(retry_secs);
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(Event::RetryElapsed).await;
        });
    }

    async fn on_retry_elapsed(&mut self) {
        self.errors.retry_elapsed();
        self.reinitialize().await;
        // restarted after the retry delay regardless of the outcome of
        // the reinitialization attempt
        self.start_heartbeats();
    }

    async fn reinitialize(&mut self) {
        self.lcd = None;
        self.feed.sign_out();
        self.start().await;
    }

    fn start_heartbeats(&mut self) {
        if self.heartbeat.is_some() {
            // never two live timers
            return;
        }
        let tx = self.tx.clone();
        let period = Duration::from_secs(self.recovery_cfg.heartbeat_secs());
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the zeroth tick completes immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(Event::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_heartbeats(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }

    fn terminate(&mut self) {
        self.state = RunState::Terminated;
        self.stop_heartbeats();
        self.feed.sign_out();
        log::logger().flush();
    }
}

fn no_display(what: &str) -> Fault {
    Fault::Bus(format!("{} with no display handle", what))
}

/// Blank the panel and render a post through the layout engine, one
/// row at a time.
pub fn render_post<I2C, D>(lcd: &mut Lcd<I2C, D>, post: &Post) -> Result<(), Fault>
where
    I2C: I2c,
    D: DelayNs,
{
    lcd.clear()?;
    let lines = text::wrap_lines(&post.text, lcd.rows() as usize, lcd.cols() as usize);
    for (row, line) in lines.iter().enumerate() {
        lcd.write_line(line, row as u8)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lcd::testutil::{transactions, NoDelay, RecordingBus};

    const RETRY_MS: i64 = 60_000;
    const WINDOW_MS: i64 = RETRY_MS * 2;

    #[test]
    fn test_error_burst_increments_counter() {
        let mut errors = ErrorState::new();
        assert_eq!(errors.begin_handling(1_000, WINDOW_MS), Some(1));
        errors.retry_elapsed();
        assert_eq!(errors.begin_handling(1_000 + WINDOW_MS - 1, WINDOW_MS), Some(2));
        errors.retry_elapsed();
        assert_eq!(errors.begin_handling(1_000 + WINDOW_MS + 500, WINDOW_MS), Some(3));
    }

    #[test]
    fn test_stale_error_resets_counter_to_one() {
        let mut errors = ErrorState::new();
        assert_eq!(errors.begin_handling(1_000, WINDOW_MS), Some(1));
        errors.retry_elapsed();
        assert_eq!(errors.begin_handling(1_000 + WINDOW_MS, WINDOW_MS), Some(1));
    }

    #[test]
    fn test_fault_while_handling_does_not_schedule_again() {
        let mut errors = ErrorState::new();
        assert_eq!(errors.begin_handling(1_000, WINDOW_MS), Some(1));
        // second fault before the retry fires: recorded nowhere, no
        // second timer, count untouched
        assert_eq!(errors.begin_handling(2_000, WINDOW_MS), None);
        assert!(errors.is_handling());
        errors.retry_elapsed();
        assert_eq!(errors.begin_handling(3_000, WINDOW_MS), Some(2));
    }

    #[test]
    fn test_successful_reinit_does_not_zero_counter() {
        let mut errors = ErrorState::new();
        assert_eq!(errors.begin_handling(1_000, WINDOW_MS), Some(1));
        // retry fires and reinitialization succeeds; nothing resets
        // the count, so a prompt second fault still escalates
        errors.retry_elapsed();
        assert_eq!(errors.begin_handling(5_000, WINDOW_MS), Some(2));
    }

    #[test]
    fn test_counter_reaches_configured_maximum() {
        let max = 5;
        let mut errors = ErrorState::new();
        let mut count = 0;
        for attempt in 0..max {
            count = errors
                .begin_handling(1_000 + attempt as i64 * 100, WINDOW_MS)
                .unwrap();
            errors.retry_elapsed();
        }
        assert_eq!(count, max);
    }

    #[test]
    fn test_long_post_renders_within_grid() {
        let bus = RecordingBus::new();
        let log = bus.log();
        let mut lcd = Lcd::new(bus, NoDelay, 0x27, 20, 4).unwrap();
        let post = Post {
            text: "Hello world this is a long test message".to_string(),
            time_posted: 100,
            uuid: "a".to_string(),
        };

        render_post(&mut lcd, &post).unwrap();

        let txs = transactions(&log.lock().unwrap(), 0);
        // leading clear, then one address command per row
        assert_eq!(txs[0], (0x01, false));
        let addresses: Vec<u8> = txs
            .iter()
            .skip(1)
            .filter(|(byte, is_data)| !is_data && byte & 0x80 != 0)
            .map(|(byte, _)| *byte)
            .collect();
        assert_eq!(addresses, vec![0x80, 0xC0, 0x94, 0xD4]);

        // reassemble the rendered rows and hold them to the grid
        let mut rows: Vec<String> = Vec::new();
        for (byte, is_data) in txs.iter().skip(1) {
            if *is_data {
                rows.last_mut().unwrap().push(*byte as char);
            } else {
                rows.push(String::new());
            }
        }
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|row| row.len() <= 20));
        assert_eq!(rows[0], "Hello world this is");
        assert_eq!(rows[1], "a long test message");
        assert_eq!(rows[2], "");
        assert_eq!(rows[3], "");
    }
}
