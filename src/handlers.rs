use crate::call::{Call, CallEvent, CallParams};
use crate::error::{handle_error, AppError};
use crate::realtime::RealtimeClient;
use crate::tasks::{read_carrier, read_model, write_carrier};
use crate::tenant;
use crate::twilio::{
    wrap_twiml, ConnectAction, Connection, ParameterAction, Response, ResponseAction, StartMeta,
    StreamAction, TwilioMessage, TwilioOutbound, VoiceWebhookPayload,
};
use crate::types::{ActiveCall, AppState};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Host, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::stream::{SplitStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Capture the Twilio Start message from the beginning of a media stream.
async fn get_twilio_start_meta(
    twilio_stream: &mut SplitStream<WebSocket>,
) -> Result<StartMeta, AppError> {
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        TwilioMessage::Connected { protocol, version } => {
                            trace!("got connected message with {protocol} and {version}");
                        }
                        TwilioMessage::Start {
                            start: start_meta, ..
                        } => {
                            break Ok(start_meta);
                        }
                        _ => {
                            break Err(AppError(
                                "expected only a Connected or Start message at stream open",
                            ));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to deserialize Twilio text message");
                        break Err(AppError("error deserializing twilio text message"));
                    }
                },
                _ => {
                    break Err(AppError("got unexpected websocket message type from Twilio"));
                }
            },
            None => break Err(AppError("end of stream")),
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket_handler(socket, app_state))
}

async fn socket_handler(socket: WebSocket, app_state: Arc<AppState>) {
    let (twilio_sink, mut twilio_stream) = socket.split();
    let start_meta = match get_twilio_start_meta(&mut twilio_stream).await {
        Ok(meta) => meta,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    debug!(meta = ?start_meta, "got start meta from twilio stream");

    // The tenant id is placed into the stream parameters by the call-control
    // plane after it has validated the subscription; a stream without one
    // should never reach us.
    let Some(tenant_id) = start_meta.tenant_id().map(str::to_string) else {
        error!(call_sid=%start_meta.call_sid, "start message carried no tenant id");
        return;
    };

    let settings = app_state.settings.clone();
    // Model socket open and tenant config load run concurrently; both must
    // land inside the session-ready deadline or the call fails closed.
    let deadline = Duration::from_millis(settings.session_ready_timeout_ms);
    let setup = tokio::time::timeout(deadline, async {
        tokio::join!(
            RealtimeClient::connect(&settings),
            tenant::load(app_state.db.as_ref(), &settings, &tenant_id),
        )
    })
    .await;
    let (realtime, model_stream, tenant_config) = match setup {
        Ok((Ok((client, stream)), config)) => (client, stream, config),
        Ok((Err(e), _)) => {
            handle_error(e).await;
            return;
        }
        Err(_) => {
            error!(call_sid=%start_meta.call_sid, "session setup exceeded deadline");
            return;
        }
    };
    info!(call_sid=%start_meta.call_sid, tenant_id=%tenant_id, "opened realtime connection");

    {
        let mut calls = app_state.calls.lock().unwrap();
        calls.insert(
            start_meta.stream_sid.clone(),
            ActiveCall {
                call_sid: start_meta.call_sid.clone(),
                tenant_id: tenant_id.clone(),
                started: OffsetDateTime::now_utc(),
            },
        );
        debug!(active = calls.len(), "registered call");
    }

    let (twilio_tx, twilio_rx) = mpsc::channel::<TwilioOutbound>(OUTBOUND_CHANNEL_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel::<CallEvent>(EVENT_CHANNEL_CAPACITY);
    let writer = tokio::spawn(write_carrier(twilio_rx, twilio_sink));
    let carrier_reader = tokio::spawn(read_carrier(twilio_stream, events_tx.clone()));
    let model_reader = tokio::spawn(read_model(model_stream, events_tx.clone()));

    let call = Call::new(CallParams {
        settings,
        pool: app_state.db.clone(),
        http: app_state.http_client.clone(),
        tenant: tenant_config,
        stream_sid: start_meta.stream_sid.clone(),
        call_sid: start_meta.call_sid.clone(),
        caller_number: start_meta.caller_number().map(str::to_string),
        callee_number: start_meta.callee_number().map(str::to_string),
        realtime,
        twilio_tx,
        events_tx,
        events_rx,
    });
    call.run().await;

    for handle in [writer, carrier_reader, model_reader] {
        handle.abort();
    }
    {
        let mut calls = app_state.calls.lock().unwrap();
        if let Some(active) = calls.remove(&start_meta.stream_sid) {
            debug!(
                call_sid=%active.call_sid,
                tenant_id=%active.tenant_id,
                started=?active.started,
                remaining = calls.len(),
                "released call"
            );
        }
    }
}

/// Answer webhook: returns TwiML connecting the call to our media stream,
/// carrying the validated tenant id and both numbers as stream parameters.
pub async fn twiml_voice_handler(
    Host(host): Host,
    Query(query): Query<HashMap<String, String>>,
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "voice webhook body");
    let payload = match serde_urlencoded::from_str::<VoiceWebhookPayload>(&body) {
        Ok(p) => p,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio voice webhook payload");
            return (
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                "Bad request".to_string(),
            );
        }
    };
    let Some(tenant_id) = query.get("tenant") else {
        error!(call_sid=%payload.call_sid, "voice webhook without tenant parameter");
        return (
            StatusCode::BAD_REQUEST,
            HeaderMap::new(),
            "Missing tenant".to_string(),
        );
    };

    let base = app_state
        .settings
        .public_base_url
        .clone()
        .unwrap_or_else(|| format!("https://{host}"));
    let ws_base = base
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    let stream_action = StreamAction {
        url: format!("{ws_base}/call/stream"),
        parameters: vec![
            ParameterAction {
                name: "tenantId".to_string(),
                value: tenant_id.clone(),
            },
            ParameterAction {
                name: "callerNumber".to_string(),
                value: payload.from.clone(),
            },
            ParameterAction {
                name: "calleeNumber".to_string(),
                value: payload.to.clone(),
            },
        ],
    };
    let response = Response {
        actions: vec![ResponseAction::Connect(ConnectAction {
            connection: Connection::Stream(stream_action),
        })],
    };

    let twiml = wrap_twiml(xmlserde::xml_serialize(response));
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/xml".parse().unwrap());
    (StatusCode::OK, headers, twiml)
}
