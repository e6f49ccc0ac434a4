//! The per-call socket tasks.  Each reader parses its wire format and feeds
//! typed `CallEvent`s to the orchestrator; the writer funnels all outbound
//! Twilio messages through one sink.  Malformed frames are discarded with a
//! log entry and the call continues; transport failures end the call.

use crate::call::CallEvent;
use crate::realtime::{ModelStream, ServerEvent};
use crate::twilio::{TwilioMessage, TwilioOutbound};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::{debug, error, info, warn};

/// Stream all Twilio frames into the orchestrator until the carrier stops.
pub async fn read_carrier(mut twilio_stream: SplitStream<WebSocket>, tx: mpsc::Sender<CallEvent>) {
    loop {
        let event = match twilio_stream.next().await {
            Some(Ok(Message::Text(json))) => match serde_json::from_str::<TwilioMessage>(&json) {
                Ok(TwilioMessage::Media { media, .. }) => CallEvent::CarrierMedia(media.payload),
                Ok(TwilioMessage::Mark { mark, .. }) => CallEvent::CarrierMark(mark.name),
                Ok(TwilioMessage::Stop { sequence_number, .. }) => {
                    debug!(%sequence_number, "got twilio stop message");
                    let _ = tx.send(CallEvent::CarrierStop).await;
                    break;
                }
                Ok(_) => {
                    warn!("unexpected connected/start message mid-stream");
                    continue;
                }
                Err(e) => {
                    error!(error=%e, "failed to parse twilio text message; frame discarded");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Close(_))) => {
                let _ = tx.send(CallEvent::CarrierClosed).await;
                break;
            }
            Some(Ok(m)) => {
                warn!(message=?m, "unsupported message type from twilio");
                continue;
            }
            Some(Err(e)) => {
                error!(error=%e, "failed to receive message from twilio");
                let _ = tx.send(CallEvent::CarrierClosed).await;
                break;
            }
            None => {
                info!("end of twilio stream");
                let _ = tx.send(CallEvent::CarrierClosed).await;
                break;
            }
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Stream realtime server events into the orchestrator until the model
/// socket closes.
pub async fn read_model(mut model_stream: ModelStream, tx: mpsc::Sender<CallEvent>) {
    loop {
        let event = match model_stream.next().await {
            Some(Ok(tungstenite::Message::Text(json))) => {
                match serde_json::from_str::<ServerEvent>(&json) {
                    Ok(ServerEvent::Unknown) => {
                        debug!("unhandled realtime event type");
                        continue;
                    }
                    Ok(event) => CallEvent::Model(event),
                    Err(e) => {
                        error!(error=%e, "failed to parse realtime event; frame discarded");
                        continue;
                    }
                }
            }
            Some(Ok(tungstenite::Message::Ping(_))) => continue,
            Some(Ok(tungstenite::Message::Close(frame))) => {
                debug!(frame=?frame, "realtime socket closed");
                let _ = tx.send(CallEvent::ModelClosed { errored: false }).await;
                break;
            }
            Some(Ok(m)) => {
                warn!(message=?m, "unsupported message type from realtime socket");
                continue;
            }
            Some(Err(e)) => {
                error!(error=%e, "failed to receive realtime message");
                let _ = tx.send(CallEvent::ModelClosed { errored: true }).await;
                break;
            }
            None => {
                debug!("end of realtime stream");
                let _ = tx.send(CallEvent::ModelClosed { errored: false }).await;
                break;
            }
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

/// Funnel of all `TwilioOutbound` messages going to the carrier socket.
pub async fn write_carrier(
    mut outbound_rx: mpsc::Receiver<TwilioOutbound>,
    mut twilio_sink: SplitSink<WebSocket, Message>,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        let json = match serde_json::to_string(&outbound) {
            Ok(j) => j,
            Err(e) => {
                error!(error=%e, "failed to serialize twilio outbound");
                continue;
            }
        };
        if let Err(e) = twilio_sink.send(Message::Text(json)).await {
            error!(error=%e, "failed to send message to twilio");
            break;
        }
    }
}
