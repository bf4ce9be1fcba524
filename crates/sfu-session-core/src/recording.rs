use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::SessionError;
use crate::events::{Alert, EventEmitter, SessionEvent, StateSlice};
use crate::room::RecordingParams;
use crate::timer::{format_hms, Clock, TickTask};
use crate::transport::SocketTransport;

pub const PAUSE_WINDOW_MESSAGE: &str =
    "Can only pause or resume after 15 seconds of starting or pausing or resuming recording";
pub const STOP_WINDOW_MESSAGE: &str =
    "Can only stop after 15 seconds of starting or pausing or resuming recording";
pub const PAUSE_LIMIT_MESSAGE: &str =
    "You have reached the limit of pauses - you can choose to stop recording.";

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingPhase {
    #[default]
    Stopped,
    Running,
    Paused,
}

/// Pause limits and the pause/resume window.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingLimits {
    pub video_pauses_limit: u32,
    pub audio_pauses_limit: u32,
    /// `video` or `audio`; selects which pause limit applies.
    pub media_option: String,
    pub record_change: Duration,
}

impl Default for RecordingLimits {
    fn default() -> Self {
        Self {
            video_pauses_limit: 0,
            audio_pauses_limit: 0,
            media_option: "video".to_string(),
            record_change: Duration::from_secs(15),
        }
    }
}

impl RecordingLimits {
    pub fn pause_limit(&self) -> u32 {
        if self.media_option == "video" {
            self.video_pauses_limit
        } else {
            self.audio_pauses_limit
        }
    }

    pub fn apply_params(&mut self, params: &RecordingParams) {
        self.video_pauses_limit = params.recording_video_pauses_limit;
        self.audio_pauses_limit = params.recording_audio_pauses_limit;
    }
}

/// Observable snapshot of the machine.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingTimerState {
    pub phase: RecordingPhase,
    pub is_running: bool,
    pub start_timestamp_ms: Option<i64>,
    pub elapsed_seconds: u64,
    pub pause_count: u32,
    pub can_pause_resume: bool,
}

/// `Stopped -> Running <-> Paused -> Stopped`, anchored to wall-clock time.
///
/// Elapsed time is always recomputed from the anchor, never accumulated
/// per tick, so missed ticks cannot under-count.
pub struct RecordingTimerMachine {
    clock: Arc<dyn Clock>,
    limits: RecordingLimits,
    phase: RecordingPhase,
    anchor_ms: Option<i64>,
    frozen_ms: i64,
    pause_count: u32,
    /// Pause/resume allowed from this instant on.
    changeable_at_ms: Option<i64>,
    /// Highest elapsed value reported, to stay monotonic under clock skew.
    high_water: u64,
}

impl RecordingTimerMachine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            limits: RecordingLimits::default(),
            phase: RecordingPhase::Stopped,
            anchor_ms: None,
            frozen_ms: 0,
            pause_count: 0,
            changeable_at_ms: None,
            high_water: 0,
        }
    }

    pub fn phase(&self) -> RecordingPhase {
        self.phase
    }

    pub fn limits(&self) -> &RecordingLimits {
        &self.limits
    }

    pub fn limits_mut(&mut self) -> &mut RecordingLimits {
        &mut self.limits
    }

    pub fn pause_count(&self) -> u32 {
        self.pause_count
    }

    pub fn can_pause_resume(&self) -> bool {
        self.changeable_at_ms
            .is_some_and(|at| self.clock.now_ms() >= at)
    }

    pub fn elapsed_seconds(&mut self) -> u64 {
        let running_ms = match self.anchor_ms {
            Some(anchor) => (self.clock.now_ms() - anchor).max(0),
            None => 0,
        };
        let elapsed = ((self.frozen_ms + running_ms).max(0) / 1000) as u64;
        if self.phase != RecordingPhase::Stopped {
            self.high_water = self.high_water.max(elapsed);
            self.high_water
        } else {
            elapsed
        }
    }

    pub fn state(&mut self) -> RecordingTimerState {
        RecordingTimerState {
            phase: self.phase,
            is_running: self.phase == RecordingPhase::Running,
            start_timestamp_ms: self.anchor_ms,
            elapsed_seconds: self.elapsed_seconds(),
            pause_count: self.pause_count,
            can_pause_resume: self.can_pause_resume(),
        }
    }

    /// Start from `Stopped`, optionally continuing from a baseline.
    pub fn start(&mut self, baseline_seconds: Option<u64>) -> Result<(), SessionError> {
        if self.phase != RecordingPhase::Stopped {
            return Err(SessionError::Recording("Recording is already in progress".to_string()));
        }
        let now = self.clock.now_ms();
        self.frozen_ms = baseline_seconds.unwrap_or(0) as i64 * 1000;
        self.high_water = baseline_seconds.unwrap_or(0);
        self.anchor_ms = Some(now);
        self.pause_count = 0;
        self.phase = RecordingPhase::Running;
        self.open_window(now);
        Ok(())
    }

    /// Pause from `Running`. State is untouched on refusal.
    pub fn pause(&mut self) -> Result<u64, SessionError> {
        if self.phase != RecordingPhase::Running {
            return Err(SessionError::Recording("Recording is not running".to_string()));
        }
        if self.pause_count >= self.limits.pause_limit() {
            return Err(SessionError::Recording(PAUSE_LIMIT_MESSAGE.to_string()));
        }
        if !self.can_pause_resume() {
            return Err(SessionError::Recording(PAUSE_WINDOW_MESSAGE.to_string()));
        }
        let now = self.clock.now_ms();
        self.freeze(now);
        self.pause_count += 1;
        self.phase = RecordingPhase::Paused;
        self.open_window(now);
        Ok(self.elapsed_seconds())
    }

    /// Resume from `Paused` with a fresh anchor.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        if self.phase != RecordingPhase::Paused {
            return Err(SessionError::Recording("Recording is not paused".to_string()));
        }
        if !self.can_pause_resume() {
            return Err(SessionError::Recording(PAUSE_WINDOW_MESSAGE.to_string()));
        }
        let now = self.clock.now_ms();
        self.anchor_ms = Some(now);
        self.phase = RecordingPhase::Running;
        self.open_window(now);
        Ok(())
    }

    /// Stop from any state. Returns the final elapsed seconds.
    pub fn stop(&mut self, zero: bool) -> u64 {
        let now = self.clock.now_ms();
        self.freeze(now);
        let final_elapsed = self.elapsed_seconds();
        self.phase = RecordingPhase::Stopped;
        self.changeable_at_ms = None;
        if zero {
            self.frozen_ms = 0;
            self.pause_count = 0;
            self.high_water = 0;
            0
        } else {
            final_elapsed
        }
    }

    /// Adopt the server's authoritative view.
    pub fn apply_notice(&mut self, notice: &RecordingNotice, is_host: bool) {
        let now = self.clock.now_ms();
        let target = match notice.state.as_str() {
            "pause" => RecordingPhase::Paused,
            "stop" => RecordingPhase::Stopped,
            _ => RecordingPhase::Running,
        };

        if is_host && notice.time_done != 0 {
            self.frozen_ms = 0;
            self.high_water = 0;
            self.anchor_ms = Some(now - notice.time_done);
        } else if self.phase == RecordingPhase::Stopped && target != RecordingPhase::Stopped {
            self.frozen_ms = 0;
            self.high_water = 0;
            self.anchor_ms = Some(now);
        }

        match target {
            RecordingPhase::Running => {
                if self.anchor_ms.is_none() {
                    self.anchor_ms = Some(now);
                }
            }
            RecordingPhase::Paused | RecordingPhase::Stopped => self.freeze(now),
        }
        if self.phase != target && target != RecordingPhase::Stopped {
            self.open_window(now);
        }
        if target == RecordingPhase::Stopped {
            self.changeable_at_ms = None;
        }
        self.phase = target;
        self.pause_count = notice.pause_count;
    }

    /// Current elapsed as `HH:MM:SS` while running; `None` otherwise.
    pub fn tick(&mut self) -> Option<String> {
        (self.phase == RecordingPhase::Running).then(|| format_hms(self.elapsed_seconds()))
    }

    fn freeze(&mut self, now: i64) {
        if let Some(anchor) = self.anchor_ms.take() {
            self.frozen_ms += (now - anchor).max(0);
        }
    }

    fn open_window(&mut self, now: i64) {
        self.changeable_at_ms = Some(now + self.limits.record_change.as_millis() as i64);
    }
}

/// `RecordingNotice` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecordingNotice {
    pub state: String,
    pub pause_count: u32,
    pub time_done: i64,
    #[serde(alias = "userRecordingParams")]
    pub user_recording_param: Option<Value>,
}

/// Machine plus its 1 Hz tick publisher.
pub struct RecordingTimer {
    machine: Arc<Mutex<RecordingTimerMachine>>,
    ticks: TickTask,
    emitter: EventEmitter,
}

impl RecordingTimer {
    pub fn new(clock: Arc<dyn Clock>, emitter: EventEmitter) -> Self {
        Self {
            machine: Arc::new(Mutex::new(RecordingTimerMachine::new(clock))),
            ticks: TickTask::new(),
            emitter,
        }
    }

    pub fn state(&self) -> RecordingTimerState {
        self.lock().state()
    }

    pub fn phase(&self) -> RecordingPhase {
        self.lock().phase()
    }

    pub fn set_limits(&self, limits: RecordingLimits) {
        *self.lock().limits_mut() = limits;
    }

    pub fn apply_params(&self, params: &RecordingParams) {
        self.lock().limits_mut().apply_params(params);
    }

    pub fn set_media_option(&self, option: &str) {
        self.lock().limits_mut().media_option = option.to_string();
    }

    pub fn start(&self, baseline_seconds: Option<u64>) -> Result<(), SessionError> {
        self.lock().start(baseline_seconds)?;
        self.spawn_ticks();
        self.publish();
        Ok(())
    }

    pub fn pause(&self) -> Result<u64, SessionError> {
        let elapsed = self.lock().pause()?;
        self.ticks.cancel();
        self.publish();
        Ok(elapsed)
    }

    pub fn resume(&self) -> Result<(), SessionError> {
        self.lock().resume()?;
        self.spawn_ticks();
        self.publish();
        Ok(())
    }

    pub fn stop(&self, zero: bool) -> u64 {
        self.ticks.cancel();
        let elapsed = self.lock().stop(zero);
        self.emitter.emit(SessionEvent::RecordingTick(format_hms(elapsed)));
        elapsed
    }

    pub fn apply_notice(&self, notice: &RecordingNotice, is_host: bool) {
        let phase = {
            let mut machine = self.lock();
            machine.apply_notice(notice, is_host);
            machine.phase()
        };
        match phase {
            RecordingPhase::Running => self.spawn_ticks(),
            _ => self.ticks.cancel(),
        }
        self.publish();
    }

    pub fn is_ticking(&self) -> bool {
        self.ticks.is_active()
    }

    fn publish(&self) {
        let elapsed = self.lock().elapsed_seconds();
        self.emitter.emit(SessionEvent::RecordingTick(format_hms(elapsed)));
    }

    fn spawn_ticks(&self) {
        let machine = self.machine.clone();
        let emitter = self.emitter.clone();
        self.ticks.replace(TICK, move || {
            let text = machine.lock().unwrap_or_else(|e| e.into_inner()).tick();
            let emitter = emitter.clone();
            async move {
                match text {
                    Some(text) => {
                        emitter.emit(SessionEvent::RecordingTick(text));
                        true
                    }
                    None => false,
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingTimerMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ack shape for `startRecord` / `pauseRecord` / `resumeRecord` /
/// `stopRecord`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RecordAck {
    success: bool,
    reason: String,
    record_state: String,
    pause_count: Option<u32>,
}

/// Socket-facing recording commands driving a [`RecordingTimer`].
pub struct RecordingCommands<'a> {
    pub timer: &'a RecordingTimer,
    pub socket: &'a dyn SocketTransport,
    pub emitter: &'a EventEmitter,
    pub room_name: &'a str,
    pub user_recording_params: Value,
    pub ack_timeout: Duration,
}

impl RecordingCommands<'_> {
    pub async fn start(&self) -> Result<(), SessionError> {
        if self.timer.phase() != RecordingPhase::Stopped {
            return self.refuse("Recording is already in progress");
        }
        let ack = self
            .ack(
                "startRecord",
                json!({"roomName": self.room_name, "userRecordingParams": self.user_recording_params}),
            )
            .await?;
        if !ack.success {
            return self.refuse(&format!("Recording could not start - {}", ack.reason));
        }
        self.timer.start(None)?;
        self.emitter.alert(Alert::success("Recording started"));
        self.emitter.state_changed(vec![StateSlice::Recording]);
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        // Check locally first so a refusal never reaches the server.
        {
            let machine = self.timer.lock();
            if machine.phase() != RecordingPhase::Running {
                drop(machine);
                return self.refuse("Recording is not running");
            }
            if machine.pause_count() >= machine.limits().pause_limit() {
                drop(machine);
                return self.refuse(PAUSE_LIMIT_MESSAGE);
            }
            if !machine.can_pause_resume() {
                drop(machine);
                return self.refuse(PAUSE_WINDOW_MESSAGE);
            }
        }
        let ack = self.ack("pauseRecord", json!({"roomName": self.room_name})).await?;
        if !ack.success {
            return self.refuse(&format!(
                "Recording Pause Failed: {}; the current state is: {}",
                ack.reason, ack.record_state
            ));
        }
        self.timer.pause()?;
        if let Some(count) = ack.pause_count {
            self.timer.lock().pause_count = count;
        }
        self.emitter.alert(Alert::success("Recording paused successfully"));
        self.emitter.state_changed(vec![StateSlice::Recording]);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        {
            let machine = self.timer.lock();
            if machine.phase() != RecordingPhase::Paused {
                drop(machine);
                return self.refuse("Recording is not paused");
            }
            if !machine.can_pause_resume() {
                drop(machine);
                return self.refuse(PAUSE_WINDOW_MESSAGE);
            }
        }
        let ack = self
            .ack(
                "resumeRecord",
                json!({"roomName": self.room_name, "userRecordingParams": self.user_recording_params}),
            )
            .await?;
        if !ack.success {
            return self.refuse(
                "Cannot start recording. Ensure media is on and you are cleared to record",
            );
        }
        self.timer.resume()?;
        self.emitter.state_changed(vec![StateSlice::Recording]);
        Ok(())
    }

    pub async fn stop(&self) -> Result<u64, SessionError> {
        {
            let machine = self.timer.lock();
            if machine.phase() == RecordingPhase::Stopped {
                drop(machine);
                return self
                    .refuse("Recording is not started yet or already stopped")
                    .map(|_| 0);
            }
            if !machine.can_pause_resume() {
                drop(machine);
                return self.refuse(STOP_WINDOW_MESSAGE).map(|_| 0);
            }
        }
        let ack = self.ack("stopRecord", json!({"roomName": self.room_name})).await?;
        if !ack.success {
            return self
                .refuse(&format!(
                    "Recording Stop Failed: {}; the recording is currently {}",
                    ack.reason, ack.record_state
                ))
                .map(|_| 0);
        }
        let elapsed = self.timer.stop(false);
        self.emitter.alert(Alert::success("Recording Stopped"));
        self.emitter.state_changed(vec![StateSlice::Recording]);
        Ok(elapsed)
    }

    async fn ack(&self, event: &str, payload: Value) -> Result<RecordAck, SessionError> {
        let value = self
            .socket
            .emit_with_ack(event, payload, self.ack_timeout)
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    fn refuse(&self, message: &str) -> Result<(), SessionError> {
        self.emitter.alert(Alert::danger(message));
        Err(SessionError::Recording(message.to_string()))
    }
}
