//! HTTP surface: operator commands, status JSON, health, and the live SSE
//! event stream. Commands serialise through the supervisor's bus; reads are
//! served from the broadcaster's latest snapshot.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use crate::event::{BusSender, CommandRequest, Event, OperatorCommand};
use crate::snapshot::{connected_record, wire_records, Broadcaster, Subscription, WireRecord};

/// How long an HTTP caller waits for the supervisor to pick up and answer a
/// command before giving up.
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Composite app state shared across all handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub bus: BusSender,
    pub broadcaster: Arc<Broadcaster>,
    pub mqtt_connected: Arc<AtomicBool>,
    pub started_at: Instant,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/mcb", get(get_mcb))
        .route("/api/mcb/on", post(mcb_on))
        .route("/api/mcb/off", post(mcb_off))
        .route("/api/mcb/toggle", post(mcb_toggle))
        .route("/api/mcb/force-on", post(mcb_force_on))
        .route("/api/mcb/force-off", post(mcb_force_off))
        .route("/api/notify/test", post(notify_test))
        .route("/api/events", get(events))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "mqtt_connected": state.mqtt_connected.load(Ordering::Relaxed),
        "dropped_events": state.bus.dropped(),
        "subscribers": state.broadcaster.subscriber_count(),
    }))
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.broadcaster.latest())
}

async fn get_mcb(State(state): State<AppState>) -> impl IntoResponse {
    match state.broadcaster.latest() {
        Some(snap) => (
            StatusCode::OK,
            Json(json!({ "status": snap.mcb, "source": snap.mcb_source })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "kind": "not_ready", "message": "no snapshot yet" })),
        ),
    }
}

async fn mcb_on(State(state): State<AppState>) -> impl IntoResponse {
    dispatch_command(&state, OperatorCommand::TurnOn).await
}

async fn mcb_off(State(state): State<AppState>) -> impl IntoResponse {
    dispatch_command(&state, OperatorCommand::TurnOff).await
}

async fn mcb_toggle(State(state): State<AppState>) -> impl IntoResponse {
    dispatch_command(&state, OperatorCommand::Toggle).await
}

async fn mcb_force_on(State(state): State<AppState>) -> impl IntoResponse {
    dispatch_command(&state, OperatorCommand::ForceOn).await
}

async fn mcb_force_off(State(state): State<AppState>) -> impl IntoResponse {
    dispatch_command(&state, OperatorCommand::ForceOff).await
}

async fn notify_test(State(state): State<AppState>) -> impl IntoResponse {
    dispatch_command(&state, OperatorCommand::TestNotify).await
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

async fn dispatch_command(state: &AppState, command: OperatorCommand) -> axum::response::Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .bus
        .send(Event::Command(CommandRequest {
            command,
            reply: Some(reply_tx),
        }))
        .await;

    match timeout(COMMAND_REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(Ok(outcome))) => {
            (StatusCode::OK, Json(json!({ "ok": true, "mcb": outcome.mcb }))).into_response()
        }
        Ok(Ok(Err(e))) => {
            let status = match e.kind() {
                "timeout" => StatusCode::GATEWAY_TIMEOUT,
                "state_unknown" => StatusCode::CONFLICT,
                "notifier_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(json!({ "ok": false, "kind": e.kind(), "message": e.to_string() })),
            )
                .into_response()
        }
        Ok(Err(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "kind": "unavailable", "message": "supervisor not running" })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({ "ok": false, "kind": "timeout", "message": "command reply timed out" })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Live event stream
// ---------------------------------------------------------------------------

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.broadcaster.subscribe();
    let (tx, rx) = mpsc::channel::<WireRecord>(32);
    tokio::spawn(forward_snapshots(subscription, tx));

    let stream = ReceiverStream::new(rx).map(|record| {
        Ok(SseEvent::default()
            .event(record.name)
            .data(record.data.to_string()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Pump snapshots from a broadcaster subscription into one client's channel.
/// Ends when the client goes away (send failure) or the broadcaster closes.
async fn forward_snapshots(mut subscription: Subscription, tx: mpsc::Sender<WireRecord>) {
    if tx.send(connected_record(subscription.id)).await.is_err() {
        return;
    }
    if let Some(current) = subscription.current.take() {
        for record in wire_records(&current) {
            if tx.send(record).await.is_err() {
                return;
            }
        }
    }
    loop {
        match subscription.rx.recv().await {
            Ok(snapshot) => {
                for record in wire_records(&snapshot) {
                    if tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(subscriber = subscription.id, skipped, "slow live stream subscriber");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{self, CommandError, CommandOutcome, McbSource, McbState};
    use crate::snapshot::Snapshot;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use time::OffsetDateTime;
    use tower::ServiceExt; // for `oneshot`

    fn snapshot(mcb: McbState) -> Snapshot {
        Snapshot {
            mcb,
            mcb_source: McbSource::Local,
            phases: None,
            temperature: None,
            door: None,
            ventilator: None,
            floor_heating: None,
            last_safety_error: None,
            at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    /// Build an AppState plus a stub supervisor that answers every command
    /// with the given reply.
    fn test_state(
        reply: impl Fn() -> Result<CommandOutcome, CommandError> + Send + 'static,
    ) -> AppState {
        let (tx, mut rx) = event::channel(16);
        tokio::spawn(async move {
            loop {
                if let Event::Command(req) = rx.recv().await {
                    if let Some(ch) = req.reply {
                        let _ = ch.send(reply());
                    }
                }
            }
        });
        AppState {
            bus: tx,
            broadcaster: Arc::new(Broadcaster::new()),
            mqtt_connected: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(test_state(|| {
            Ok(CommandOutcome {
                mcb: McbState::Unknown,
            })
        }));
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].is_u64());
        assert_eq!(json["mqtt_connected"], false);
        assert_eq!(json["dropped_events"], 0);
        assert_eq!(json["subscribers"], 0);
    }

    #[tokio::test]
    async fn status_is_null_before_first_snapshot() {
        let app = router(test_state(|| {
            Ok(CommandOutcome {
                mcb: McbState::Unknown,
            })
        }));
        let req = Request::builder()
            .uri("/api/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_json(resp).await.is_null());
    }

    #[tokio::test]
    async fn status_returns_latest_snapshot() {
        let state = test_state(|| {
            Ok(CommandOutcome {
                mcb: McbState::Unknown,
            })
        });
        state.broadcaster.publish(snapshot(McbState::On));

        let app = router(state);
        let req = Request::builder()
            .uri("/api/status")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["mcb"], "on");
        assert_eq!(json["mcb_source"], "local");
    }

    #[tokio::test]
    async fn get_mcb_unavailable_before_first_snapshot() {
        let app = router(test_state(|| {
            Ok(CommandOutcome {
                mcb: McbState::Unknown,
            })
        }));
        let req = Request::builder()
            .uri("/api/mcb")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn get_mcb_reports_status_and_source() {
        let state = test_state(|| {
            Ok(CommandOutcome {
                mcb: McbState::Unknown,
            })
        });
        state.broadcaster.publish(snapshot(McbState::Off));

        let app = router(state);
        let req = Request::builder()
            .uri("/api/mcb")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "off");
        assert_eq!(json["source"], "local");
    }

    #[tokio::test]
    async fn command_success_returns_ok_and_state() {
        let app = router(test_state(|| Ok(CommandOutcome { mcb: McbState::On })));
        let req = Request::builder()
            .method("POST")
            .uri("/api/mcb/on")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["mcb"], "on");
    }

    #[tokio::test]
    async fn toggle_on_unknown_state_maps_to_conflict() {
        let app = router(test_state(|| Err(CommandError::StateUnknown)));
        let req = Request::builder()
            .method("POST")
            .uri("/api/mcb/toggle")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], false);
        assert_eq!(json["kind"], "state_unknown");
    }

    #[tokio::test]
    async fn device_timeout_maps_to_gateway_timeout() {
        let app = router(test_state(|| Err(CommandError::Timeout)));
        let req = Request::builder()
            .method("POST")
            .uri("/api/mcb/off")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn device_error_maps_to_bad_gateway() {
        let app = router(test_state(|| Err(CommandError::Device("boom".to_string()))));
        let req = Request::builder()
            .method("POST")
            .uri("/api/mcb/force-off")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(resp).await;
        assert_eq!(json["kind"], "device");
        assert_eq!(json["message"], "device error: boom");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = router(test_state(|| {
            Ok(CommandOutcome {
                mcb: McbState::Unknown,
            })
        }));
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    // -- live stream forwarding ---------------------------------------------

    #[tokio::test]
    async fn stream_starts_with_connected_then_current_snapshot() {
        let broadcaster = Broadcaster::new();
        broadcaster.publish(snapshot(McbState::On));

        let subscription = broadcaster.subscribe();
        let id = subscription.id;
        let (tx, mut rx) = mpsc::channel(32);
        tokio::spawn(forward_snapshots(subscription, tx));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "connected");
        assert_eq!(first.data["subscriberId"], id);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.name, "mcb_status");
        assert_eq!(second.data["status"], "on");
    }

    #[tokio::test]
    async fn stream_forwards_published_snapshots_in_order() {
        let broadcaster = Arc::new(Broadcaster::new());
        let subscription = broadcaster.subscribe();
        let (tx, mut rx) = mpsc::channel(32);
        tokio::spawn(forward_snapshots(subscription, tx));

        // connected record (no current snapshot yet)
        assert_eq!(rx.recv().await.unwrap().name, "connected");

        broadcaster.publish(snapshot(McbState::On));
        broadcaster.publish(snapshot(McbState::Off));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data["status"], "on");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.data["status"], "off");
    }
}
