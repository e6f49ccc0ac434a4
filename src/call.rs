//! Per-call orchestration.
//!
//! Each call owns two WebSockets, a handful of timers and its own state; the
//! reader tasks in `tasks.rs` feed everything through one `CallEvent` channel
//! so all mutable state lives on a single task and needs no locks.

use crate::audio::{b64_decode_to_buf, b64_decoded_len, b64_encode, PlaybackTracker};
use crate::bargein::{BargeDecision, BargeInController};
use crate::config::Settings;
use crate::db::{self, NewCallLog};
use crate::eventlog::EventLog;
use crate::finalize::{self, FinalizeContext, FinalizeOutcome};
use crate::realtime::{ErrorClass, RealtimeClient, ServerEvent, SessionPhaseParams};
use crate::summary;
use crate::tenant::TenantConfig;
use crate::twilio::TwilioOutbound;

use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Conversation phase.  Strictly `Greeting -> Normal`, never back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Greeting,
    Normal,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Greeting => "greeting",
            Phase::Normal => "normal",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TranscriptTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: String,
}

/// Everything the reader tasks and timers report to the orchestrator.
#[derive(Debug)]
pub enum CallEvent {
    CarrierMedia(String),
    CarrierMark(String),
    CarrierStop,
    CarrierClosed,
    Model(ServerEvent),
    ModelClosed { errored: bool },
    SessionReadyTimeout,
    BargeTimerFired(u64),
    GreetingFailsafe,
    SummaryTick,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// The per-call timers, cancelled together at shutdown.
#[derive(Default)]
struct TimerWheel {
    session_ready: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    failsafe: Option<JoinHandle<()>>,
    summary: Option<JoinHandle<()>>,
}

impl TimerWheel {
    fn cancel_all(&mut self) {
        for handle in [
            self.session_ready.take(),
            self.debounce.take(),
            self.failsafe.take(),
            self.summary.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Timings {
    session_ready_ms: Option<u64>,
    first_audio_ms: Option<u64>,
    first_text_ms: Option<u64>,
    reservation_called_ms: Option<u64>,
    reservation_committed_ms: Option<u64>,
}

pub struct Call {
    settings: Settings,
    pool: Option<PgPool>,
    http: reqwest::Client,
    tenant: TenantConfig,
    stream_sid: String,
    call_sid: String,
    caller_number: Option<String>,
    callee_number: Option<String>,
    realtime: RealtimeClient,
    twilio_tx: mpsc::Sender<TwilioOutbound>,
    events_tx: mpsc::Sender<CallEvent>,
    events_rx: mpsc::Receiver<CallEvent>,
    log: EventLog,
    tracker: PlaybackTracker,
    barge: BargeInController,
    timers: TimerWheel,
    phase: Phase,
    greeting_response_sent: bool,
    greeting_sent_ms: Option<u64>,
    normal_update_sent: bool,
    transcript: Vec<TranscriptTurn>,
    reservation_committed: bool,
    started: Instant,
    timings: Timings,
    media_frames: u64,
    media_bytes: u64,
    stop_reason: &'static str,
    closed: bool,
}

pub struct CallParams {
    pub settings: Settings,
    pub pool: Option<PgPool>,
    pub http: reqwest::Client,
    pub tenant: TenantConfig,
    pub stream_sid: String,
    pub call_sid: String,
    pub caller_number: Option<String>,
    pub callee_number: Option<String>,
    pub realtime: RealtimeClient,
    pub twilio_tx: mpsc::Sender<TwilioOutbound>,
    pub events_tx: mpsc::Sender<CallEvent>,
    pub events_rx: mpsc::Receiver<CallEvent>,
}

impl Call {
    pub fn new(params: CallParams) -> Self {
        let log = EventLog::new(
            params.settings.log_dir.clone(),
            &params.stream_sid,
            &params.call_sid,
        );
        let barge = BargeInController::new(
            params.settings.barge_in_debounce_ms,
            params.settings.barge_in_min_remain_ms,
            params.settings.smart_cancel,
        );
        Self {
            log,
            barge,
            settings: params.settings,
            pool: params.pool,
            http: params.http,
            tenant: params.tenant,
            stream_sid: params.stream_sid,
            call_sid: params.call_sid,
            caller_number: params.caller_number,
            callee_number: params.callee_number,
            realtime: params.realtime,
            twilio_tx: params.twilio_tx,
            events_tx: params.events_tx,
            events_rx: params.events_rx,
            tracker: PlaybackTracker::new(),
            timers: TimerWheel::default(),
            phase: Phase::Greeting,
            greeting_response_sent: false,
            greeting_sent_ms: None,
            normal_update_sent: false,
            transcript: vec![],
            reservation_committed: false,
            started: Instant::now(),
            timings: Timings::default(),
            media_frames: 0,
            media_bytes: 0,
            stop_reason: "unknown",
            closed: false,
        }
    }

    pub async fn run(mut self) {
        self.log
            .write(
                "start",
                json!({
                    "tenantId": self.tenant.tenant_id,
                    "caller": self.caller_number,
                    "callee": self.callee_number,
                }),
            )
            .await;
        self.log.write("openai_ws_open", json!({})).await;

        if self.send_session_update(Phase::Greeting).await.is_err() {
            self.stop_reason = "model_send_failed";
            self.close().await;
            return;
        }
        self.timers.session_ready = Some(arm(
            &self.events_tx,
            Duration::from_millis(self.settings.session_ready_timeout_ms),
            CallEvent::SessionReadyTimeout,
        ));
        self.timers.summary = Some(arm_interval(
            &self.events_tx,
            Duration::from_millis(self.settings.timing_summary_interval_ms),
        ));

        while let Some(event) = self.events_rx.recv().await {
            if self.handle_event(event).await == Flow::Stop {
                break;
            }
        }
        self.close().await;
    }

    async fn handle_event(&mut self, event: CallEvent) -> Flow {
        match event {
            CallEvent::CarrierMedia(payload) => self.on_carrier_media(payload).await,
            CallEvent::CarrierMark(name) => {
                self.on_carrier_mark(&name).await;
                Flow::Continue
            }
            CallEvent::CarrierStop => {
                self.stop_reason = "carrier_stop";
                Flow::Stop
            }
            CallEvent::CarrierClosed => {
                self.stop_reason = "carrier_closed";
                Flow::Stop
            }
            CallEvent::Model(server_event) => self.on_model_event(server_event).await,
            CallEvent::ModelClosed { errored } => {
                let event = if errored {
                    "openai_ws_error"
                } else {
                    "openai_ws_close"
                };
                self.log.write(event, json!({})).await;
                self.stop_reason = "model_closed";
                Flow::Stop
            }
            CallEvent::SessionReadyTimeout => {
                if self.timings.session_ready_ms.is_none() {
                    self.log
                        .write(
                            "session_update_timeout",
                            json!({"timeoutMs": self.settings.session_ready_timeout_ms}),
                        )
                        .await;
                    self.stop_reason = "session_update_timeout";
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            CallEvent::BargeTimerFired(generation) => {
                if self.barge.on_timer_fired(generation) {
                    self.confirm_barge_in().await;
                }
                Flow::Continue
            }
            CallEvent::GreetingFailsafe => {
                if self.phase == Phase::Greeting && !self.normal_update_sent {
                    self.log
                        .write(
                            "speaking_failsafe",
                            json!({
                                "sentMs": self.tracker.sent_ms(),
                                "playedMs": self.tracker.played_ms(),
                            }),
                        )
                        .await;
                    self.enter_normal_phase().await;
                }
                Flow::Continue
            }
            CallEvent::SummaryTick => {
                self.write_timing_summary().await;
                Flow::Continue
            }
        }
    }

    async fn on_carrier_media(&mut self, payload: String) -> Flow {
        let payload = if self.settings.base64_passthrough {
            payload
        } else {
            // validate-and-reencode path for debugging carrier payloads
            let mut raw = Vec::new();
            if let Err(e) = b64_decode_to_buf(&payload, &mut raw) {
                warn!(error=%e, "discarding undecodable media payload");
                return Flow::Continue;
            }
            b64_encode(&raw)
        };
        self.media_frames += 1;
        self.media_bytes += b64_decoded_len(&payload);
        if self.media_frames % 250 == 0 {
            self.log
                .write(
                    "twilio_media",
                    json!({"frames": self.media_frames, "bytes": self.media_bytes}),
                )
                .await;
        }
        if self.realtime.append_audio(payload).await.is_err() {
            self.stop_reason = "model_send_failed";
            return Flow::Stop;
        }
        Flow::Continue
    }

    async fn on_carrier_mark(&mut self, name: &str) {
        let accepted = self.tracker.on_mark_ack(name);
        if !accepted {
            debug!(mark=%name, "mark ack discarded");
        }
        self.maybe_enter_normal_phase().await;
    }

    /// The greeting is considered delivered once 90% of its audio is
    /// acknowledged played; only then is barge-in worth enabling.
    async fn maybe_enter_normal_phase(&mut self) {
        if self.phase != Phase::Greeting || self.normal_update_sent {
            return;
        }
        let Some(greeting_sent_ms) = self.greeting_sent_ms else {
            return;
        };
        if self.tracker.played_ms() * 10 >= greeting_sent_ms * 9 {
            self.enter_normal_phase().await;
        }
    }

    async fn enter_normal_phase(&mut self) {
        if self.normal_update_sent {
            return;
        }
        if self.send_session_update(Phase::Normal).await.is_ok() {
            self.normal_update_sent = true;
            self.phase = Phase::Normal;
            if let Some(h) = self.timers.failsafe.take() {
                h.abort();
            }
        }
    }

    async fn send_session_update(&mut self, phase: Phase) -> Result<(), crate::error::AppError> {
        let enable = phase == Phase::Normal;
        let result = self
            .realtime
            .send_session_update(SessionPhaseParams {
                instructions: &self.tenant.instructions,
                tool_parameters: &self.tenant.tool_parameters,
                create_response: enable,
                interrupt_response: enable,
            })
            .await;
        if result.is_ok() {
            self.log
                .write("session_update_sent", json!({"phase": phase.as_str()}))
                .await;
        }
        result
    }

    async fn on_model_event(&mut self, event: ServerEvent) -> Flow {
        match event {
            ServerEvent::SessionUpdated => {
                self.log.write("session_updated_received", json!({})).await;
                if self.timings.session_ready_ms.is_none() {
                    self.timings.session_ready_ms = Some(self.elapsed_ms());
                    if let Some(h) = self.timers.session_ready.take() {
                        h.abort();
                    }
                }
                if !self.greeting_response_sent {
                    self.greeting_response_sent = true;
                    let instruction = self.tenant.greeting_instruction();
                    if self
                        .realtime
                        .send_response_create(Some(&instruction))
                        .await
                        .is_err()
                    {
                        self.stop_reason = "model_send_failed";
                        return Flow::Stop;
                    }
                    self.log
                        .write("response_create_sent", json!({"reason": "greeting"}))
                        .await;
                }
                Flow::Continue
            }
            ServerEvent::OutputItemAdded { item } => {
                if item.is_assistant_message() {
                    if let Some(id) = &item.id {
                        self.tracker.begin_item(id);
                    }
                }
                Flow::Continue
            }
            ServerEvent::AudioDelta { delta, item_id } => self.on_audio_delta(delta, item_id).await,
            ServerEvent::ResponseDone { response } => self.on_response_done(response).await,
            ServerEvent::TranscriptionCompleted { transcript } => {
                let text = transcript.trim();
                if !text.is_empty() {
                    self.push_transcript(Role::User, text);
                    self.log
                        .write("user_utterance", json!({"text": text}))
                        .await;
                }
                Flow::Continue
            }
            ServerEvent::SpeechStarted => {
                self.log
                    .write("vad_event", json!({"kind": "speech_started"}))
                    .await;
                self.on_speech_started().await
            }
            ServerEvent::SpeechStopped => {
                self.log
                    .write("vad_event", json!({"kind": "speech_stopped"}))
                    .await;
                if self.barge.on_speech_stopped() {
                    if let Some(h) = self.timers.debounce.take() {
                        h.abort();
                    }
                    self.log
                        .write(
                            "barge_in_cancelled",
                            json!({"reason": "speech_stopped_before_debounce"}),
                        )
                        .await;
                }
                Flow::Continue
            }
            ServerEvent::ErrorEvent { error } => {
                match error.classify() {
                    ErrorClass::Benign => {
                        debug!(code=?error.code, "benign realtime error");
                        Flow::Continue
                    }
                    ErrorClass::Budget => {
                        error!(code=?error.code, message=?error.message, "realtime budget error");
                        self.log
                            .write(
                                "realtime_error",
                                json!({"code": error.code, "message": error.message, "fatal": true}),
                            )
                            .await;
                        self.stop_reason = "budget_error";
                        Flow::Stop
                    }
                    ErrorClass::Other => {
                        error!(code=?error.code, message=?error.message, "realtime error");
                        self.log
                            .write(
                                "realtime_error",
                                json!({"code": error.code, "message": error.message}),
                            )
                            .await;
                        Flow::Continue
                    }
                }
            }
            ServerEvent::Unknown => Flow::Continue,
        }
    }

    async fn on_audio_delta(&mut self, delta: String, item_id: Option<String>) -> Flow {
        if self.timings.first_audio_ms.is_none() {
            self.timings.first_audio_ms = Some(self.elapsed_ms());
        }
        // normally set by output_item.added; the delta's item id is a backstop
        if self.tracker.item_id().is_none() {
            if let Some(id) = &item_id {
                self.tracker.begin_item(id);
            }
        }
        let bytes = b64_decoded_len(&delta);
        if self.settings.debug_audio_events {
            self.log
                .write("audio_delta", json!({"bytes": bytes, "sentMs": self.tracker.sent_ms()}))
                .await;
        }
        let accounting = self.tracker.on_delta_bytes(bytes);
        if self
            .twilio_tx
            .send(TwilioOutbound::media(&self.stream_sid, delta))
            .await
            .is_err()
        {
            self.stop_reason = "carrier_send_failed";
            return Flow::Stop;
        }
        if let Some(mark) = accounting.mark {
            if self
                .twilio_tx
                .send(TwilioOutbound::mark(&self.stream_sid, mark))
                .await
                .is_err()
            {
                self.stop_reason = "carrier_send_failed";
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn on_response_done(&mut self, response: crate::realtime::ResponsePayload) -> Flow {
        for item in &response.output {
            if item.is_assistant_message() {
                let text = item.assistant_text();
                if !text.trim().is_empty() {
                    if self.timings.first_text_ms.is_none() {
                        self.timings.first_text_ms = Some(self.elapsed_ms());
                    }
                    self.push_transcript(Role::Assistant, text.trim());
                    self.log
                        .write(
                            "assistant_response",
                            json!({"text": text.trim(), "itemId": item.id}),
                        )
                        .await;
                }
            }
        }

        // The greeting is the only response that can complete in this phase;
        // its total length anchors the 90% delivery threshold.
        if self.phase == Phase::Greeting && self.greeting_sent_ms.is_none() {
            let sent = self.tracker.sent_ms();
            self.greeting_sent_ms = Some(sent);
            let failsafe = Duration::from_millis(sent + 5_000);
            self.timers.failsafe = Some(arm(&self.events_tx, failsafe, CallEvent::GreetingFailsafe));
            self.maybe_enter_normal_phase().await;
        }

        for item in &response.output {
            if item.is_function_call() {
                if self.on_function_call(item).await == Flow::Stop {
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    async fn on_function_call(&mut self, item: &crate::realtime::OutputItem) -> Flow {
        let name = item.name.as_deref().unwrap_or("");
        let (Some(call_id), Some(arguments)) = (&item.call_id, &item.arguments) else {
            warn!(name, "function call item without call id or arguments");
            return Flow::Continue;
        };
        if name != "finalize_reservation" {
            warn!(name, "ignoring unknown tool call");
            return Flow::Continue;
        }

        if self.timings.reservation_called_ms.is_none() {
            self.timings.reservation_called_ms = Some(self.elapsed_ms());
        }
        let outcome = finalize::handle(
            FinalizeContext {
                pool: self.pool.as_ref(),
                http: &self.http,
                tenant: &self.tenant,
                call_sid: &self.call_sid,
                caller_number: self.caller_number.as_deref(),
            },
            arguments,
        )
        .await;
        if let FinalizeOutcome::Ok { .. } = outcome {
            self.reservation_committed = true;
            if self.timings.reservation_committed_ms.is_none() {
                self.timings.reservation_committed_ms = Some(self.elapsed_ms());
            }
        }

        let wire = outcome.to_wire();
        self.log
            .write(
                "tool_call",
                json!({
                    "toolCallId": call_id,
                    "arguments": arguments,
                    "result": wire,
                }),
            )
            .await;
        if self
            .realtime
            .send_function_output(call_id, wire.to_string())
            .await
            .is_err()
        {
            self.stop_reason = "model_send_failed";
            return Flow::Stop;
        }
        self.log
            .write("response_create_sent", json!({"reason": "tool_result"}))
            .await;
        Flow::Continue
    }

    async fn on_speech_started(&mut self) -> Flow {
        let decision = self
            .barge
            .on_speech_started(self.phase, self.tracker.remaining_ms());
        match decision {
            BargeDecision::Ignore(reason) => {
                self.log
                    .write("barge_in_ignored", json!({"reason": reason}))
                    .await;
            }
            BargeDecision::Debounce {
                generation,
                delay_ms,
            } => {
                if let Some(h) = self.timers.debounce.take() {
                    h.abort();
                }
                self.timers.debounce = Some(arm(
                    &self.events_tx,
                    Duration::from_millis(delay_ms),
                    CallEvent::BargeTimerFired(generation),
                ));
            }
            BargeDecision::ConfirmNow => {
                self.confirm_barge_in().await;
            }
        }
        Flow::Continue
    }

    async fn confirm_barge_in(&mut self) {
        let Some(item_id) = self.tracker.item_id().map(str::to_string) else {
            debug!("barge-in confirmed with no assistant item; nothing to truncate");
            return;
        };
        let played_ms = self.tracker.played_ms();
        self.tracker.begin_clearing();
        if self
            .twilio_tx
            .send(TwilioOutbound::clear(&self.stream_sid))
            .await
            .is_err()
        {
            return;
        }
        if self.realtime.truncate_item(&item_id, played_ms).await.is_err() {
            return;
        }
        // best effort; a finished response yields the benign cancel error
        let _ = self.realtime.cancel_response().await;
        self.log
            .write(
                "barge_in_confirmed",
                json!({"itemId": item_id, "audioEndMs": played_ms}),
            )
            .await;
    }

    fn push_transcript(&mut self, role: Role, text: &str) {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        self.transcript.push(TranscriptTurn {
            role,
            text: text.to_string(),
            timestamp,
        });
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn write_timing_summary(&mut self) {
        self.log
            .write(
                "timing_summary",
                json!({
                    "phase": self.phase.as_str(),
                    "elapsedMs": self.elapsed_ms(),
                    "sentMs": self.tracker.sent_ms(),
                    "playedMs": self.tracker.played_ms(),
                    "mediaFrames": self.media_frames,
                    "mediaBytes": self.media_bytes,
                    "transcriptTurns": self.transcript.len(),
                    "sessionReadyMs": self.timings.session_ready_ms,
                    "firstAudioMs": self.timings.first_audio_ms,
                    "firstTextMs": self.timings.first_text_ms,
                    "reservationCalledMs": self.timings.reservation_called_ms,
                    "reservationCommittedMs": self.timings.reservation_committed_ms,
                }),
            )
            .await;
    }

    /// Exactly-once shutdown: timers, model socket, summary and persistence
    /// under a best-effort deadline, then the event log last.
    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.timers.cancel_all();
        self.realtime.close().await;

        let summary_text = if self.transcript.is_empty() {
            None
        } else {
            match tokio::time::timeout(
                Duration::from_secs(8),
                summary::summarize_transcript(&self.http, &self.settings, &self.transcript),
            )
            .await
            {
                Ok(Ok(s)) => Some(s),
                Ok(Err(_)) => None,
                Err(_) => {
                    warn!("summary generation timed out");
                    None
                }
            }
        };

        if let Some(pool) = self.pool.clone() {
            let transcript_json =
                serde_json::to_value(&self.transcript).unwrap_or_else(|_| json!([]));
            match db::insert_call_log(
                &pool,
                NewCallLog {
                    call_sid: &self.call_sid,
                    stream_sid: &self.stream_sid,
                    tenant_id: &self.tenant.tenant_id,
                    caller_number: self.caller_number.as_deref(),
                    callee_number: self.callee_number.as_deref(),
                    transcript: &transcript_json,
                    summary: summary_text.as_deref(),
                },
            )
            .await
            {
                Ok(log_id) => {
                    if let Err(e) =
                        db::link_reservation_call_log(&pool, &self.call_sid, log_id).await
                    {
                        error!(error=%e, "failed to link reservation to call log");
                    }
                }
                Err(e) => error!(error=%e, "failed to persist call log"),
            }
        }

        if !self.reservation_committed {
            self.log.write("reservation_not_created", json!({})).await;
        }
        self.write_timing_summary().await;
        self.log
            .write(
                "stop",
                json!({"reason": self.stop_reason, "summary": summary_text}),
            )
            .await;
        self.log.close().await;
        info!(call_sid=%self.call_sid, reason=%self.stop_reason, "call finished");
    }
}

fn arm(tx: &mpsc::Sender<CallEvent>, delay: Duration, event: CallEvent) -> JoinHandle<()> {
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(event).await;
    })
}

fn arm_interval(tx: &mpsc::Sender<CallEvent>, period: Duration) -> JoinHandle<()> {
    let tx = tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            if tx.send(CallEvent::SummaryTick).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn speech_stopped_within_debounce_leaves_no_timer_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut barge = BargeInController::new(1_000, 2_000, true);
        // assistant mid-sentence: sent 4000, played 2000 -> 2000 remaining
        let BargeDecision::Debounce {
            generation,
            delay_ms,
        } = barge.on_speech_started(Phase::Normal, 2_000)
        else {
            panic!("expected a debounce");
        };
        let handle = arm(
            &tx,
            Duration::from_millis(delay_ms),
            CallEvent::BargeTimerFired(generation),
        );

        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(barge.on_speech_stopped());
        handle.abort();

        tokio::time::advance(Duration::from_millis(1_000)).await;
        tokio::task::yield_now().await;
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn uninterrupted_speech_delivers_the_timer_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut barge = BargeInController::new(1_000, 2_000, true);
        let BargeDecision::Debounce {
            generation,
            delay_ms,
        } = barge.on_speech_started(Phase::Normal, 5_000)
        else {
            panic!("expected a debounce");
        };
        let _handle = arm(
            &tx,
            Duration::from_millis(delay_ms),
            CallEvent::BargeTimerFired(generation),
        );

        tokio::time::advance(Duration::from_millis(1_001)).await;
        match rx.recv().await {
            Some(CallEvent::BargeTimerFired(g)) => assert!(barge.on_timer_fired(g)),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
