//! WebSocket gateway binding: fronts a [`LogStore`]/[`StreamService`]/
//! [`SessionRegistry`] trio with a per-collection WebSocket connection that
//! carries pushed deltas, recovery requests, and heartbeats. The engine
//! itself has no wire protocol of its own; this is one binding for it, not
//! the only one.
//!
//! An axum upgrade handler resolves the route, then hands the socket to a
//! connection function that splits it, races a receive task against a push
//! task with `tokio::select!`, and writes back through an `Arc<Mutex<..>>`-
//! guarded sink. Each frame is a tagged JSON object serialized to bytes and
//! sent as a single binary WebSocket message, since a frame can carry several
//! independently-sized blobs at once (a document id, a delta, a vector).

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::any;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::Mutex as AsyncMutex;

use braid_log::LogStore;
use braid_session::SessionRegistry;
use braid_stream::{ChangeKind, StreamChange, StreamService};
use braid_types::prelude::*;

/// Tunables for the gateway's server-push loop: how often it polls `stream`
/// for new changes, and the batch size and compaction threshold it passes
/// through.
#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
	pub poll_interval_ms: u64,
	pub limit: usize,
	pub delta_threshold: u64,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self { poll_interval_ms: 200, limit: 200, delta_threshold: 500 }
	}
}

/// Shared handle passed to every gateway connection via axum's `State`.
pub struct GatewayState {
	pub log: Arc<LogStore>,
	pub stream: Arc<StreamService>,
	pub sessions: Option<Arc<SessionRegistry>>,
	pub config: GatewayConfig,
}

impl GatewayState {
	#[must_use]
	pub fn new(
		log: Arc<LogStore>,
		stream: Arc<StreamService>,
		sessions: Option<Arc<SessionRegistry>>,
		config: GatewayConfig,
	) -> Arc<Self> {
		Arc::new(Self { log, stream, sessions, config })
	}
}

/// Mount the gateway's `/ws/{collection}` route. Callers merge this into
/// their own axum app (the gateway owns no HTTP concerns beyond the upgrade).
#[must_use]
pub fn router(state: Arc<GatewayState>) -> Router {
	Router::new().route("/ws/{collection}", any(get_ws_collection)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
	client: String,
	cursor: Option<u64>,
}

async fn get_ws_collection(
	ws: WebSocketUpgrade,
	Path(collection): Path<String>,
	Query(query): Query<ConnectQuery>,
	State(state): State<Arc<GatewayState>>,
) -> Response {
	let cursor = Seq(query.cursor.unwrap_or(0));
	info!(collection, client = %query.client, "gateway upgrade request");
	ws.on_upgrade(move |socket| handle_connection(socket, collection, query.client, cursor, state))
}

/// Client-to-server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
	/// A locally produced delta, pushed through `LogStore::append_delta`.
	Push { document: String, delta_type: DeltaType, bytes: String },
	/// Recovery handshake against a known client state vector.
	Recovery { document: String, vector: String },
	/// Presence re-mark.
	Heartbeat {
		document: String,
		vector: Option<String>,
		seq: Option<u64>,
		profile: Option<Json>,
		cursor: Option<Json>,
		interval_secs: u64,
	},
}

/// Server-to-client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
	/// One `stream` batch, pushed as new changes land past the connection's
	/// cursor.
	StreamBatch { seq: u64, more: bool, compact: Option<bool>, changes: Vec<WireChange> },
	RecoveryResult { document: String, diff: Option<String>, server_vector: String },
	Error { message: String },
}

#[derive(Debug, Serialize)]
struct WireChange {
	document: String,
	bytes: String,
	seq: u64,
	kind: &'static str,
	exists: Option<bool>,
}

impl From<&StreamChange> for WireChange {
	fn from(change: &StreamChange) -> Self {
		Self {
			document: change.document.to_string(),
			bytes: STANDARD.encode(&change.bytes),
			seq: change.seq.0,
			kind: match change.kind {
				ChangeKind::Delta => "delta",
				ChangeKind::Snapshot => "snapshot",
			},
			exists: change.exists,
		}
	}
}

type Sink = Arc<AsyncMutex<SplitSink<WebSocket, Message>>>;

fn decode(s: &str) -> BraidResult<Vec<u8>> {
	STANDARD.decode(s).map_err(|e| Error::NonRetriable(format!("invalid base64: {e}")))
}

async fn send_frame(sink: &Sink, frame: &ServerFrame) {
	let Ok(bytes) = serde_json::to_vec(frame) else { return };
	let mut guard = sink.lock().await;
	let _ = guard.send(Message::Binary(bytes.into())).await;
}

/// One gateway connection: races a receive task (client frames) against a
/// push task (server-driven `stream` polling) with `tokio::select!`, ending
/// the connection as soon as either side exits.
async fn handle_connection(
	socket: WebSocket,
	collection: String,
	client: String,
	initial_cursor: Seq,
	state: Arc<GatewayState>,
) {
	info!(collection, client, "gateway connection opened");

	let (ws_tx, ws_rx) = socket.split();
	let ws_tx: Sink = Arc::new(AsyncMutex::new(ws_tx));

	let recv_task =
		tokio::spawn(recv_loop(ws_rx, Arc::clone(&ws_tx), collection.clone(), client.clone(), Arc::clone(&state)));
	let push_task = tokio::spawn(push_loop(Arc::clone(&ws_tx), collection.clone(), initial_cursor, Arc::clone(&state)));

	tokio::select! {
		_ = recv_task => debug!(collection, "gateway receive task ended"),
		_ = push_task => debug!(collection, "gateway push task ended"),
	}

	info!(collection, client, "gateway connection closed");
}

async fn recv_loop(
	mut ws_rx: SplitStream<WebSocket>,
	ws_tx: Sink,
	collection: String,
	client: String,
	state: Arc<GatewayState>,
) {
	while let Some(msg) = ws_rx.next().await {
		let msg = match msg {
			Ok(m) => m,
			Err(e) => {
				warn!(collection, "gateway socket error: {e}");
				break;
			}
		};
		let Message::Binary(data) = msg else { continue };
		let frame: ClientFrame = match serde_json::from_slice(&data) {
			Ok(f) => f,
			Err(e) => {
				send_frame(&ws_tx, &ServerFrame::Error { message: format!("bad frame: {e}") }).await;
				continue;
			}
		};
		if let Err(e) = handle_client_frame(frame, &collection, &client, &state, &ws_tx).await {
			warn!(collection, client, "gateway frame handling failed: {e}");
			send_frame(&ws_tx, &ServerFrame::Error { message: e.to_string() }).await;
		}
	}
}

async fn handle_client_frame(
	frame: ClientFrame,
	collection: &str,
	client: &str,
	state: &Arc<GatewayState>,
	ws_tx: &Sink,
) -> BraidResult<()> {
	match frame {
		ClientFrame::Push { document, delta_type, bytes } => {
			let bytes = decode(&bytes)?;
			state.log.append_delta(collection, &document, &bytes, delta_type).await?;
		}
		ClientFrame::Recovery { document, vector } => {
			let vector = decode(&vector)?;
			let result = state.stream.recovery(collection, &document, &vector).await?;
			send_frame(
				ws_tx,
				&ServerFrame::RecoveryResult {
					document,
					diff: result.diff.map(|d| STANDARD.encode(d)),
					server_vector: STANDARD.encode(result.server_vector),
				},
			)
			.await;
		}
		ClientFrame::Heartbeat { document, vector, seq, profile, cursor, interval_secs } => {
			if let Some(sessions) = &state.sessions {
				let vector = vector.as_deref().map(decode).transpose()?;
				sessions.heartbeat(collection, &document, client, vector, seq.map(Seq), profile, cursor, interval_secs).await?;
			}
		}
	}
	Ok(())
}

/// Polls `stream` at `config.poll_interval_ms` and pushes new batches down
/// the socket. A dedicated `LogStore`-change notification channel would
/// avoid the poll, but `LogStore` exposes no such hook; polling at a short
/// interval is the straightforward way to bridge it to a push-style
/// transport without adding one.
async fn push_loop(ws_tx: Sink, collection: String, initial_cursor: Seq, state: Arc<GatewayState>) {
	let mut cursor = initial_cursor;
	let interval = Duration::from_millis(state.config.poll_interval_ms);
	loop {
		tokio::time::sleep(interval).await;

		let result = match state.stream.stream(&collection, cursor, state.config.limit, state.config.delta_threshold).await {
			Ok(r) => r,
			Err(e) => {
				warn!(collection, "gateway stream poll failed: {e}");
				continue;
			}
		};
		if result.changes.is_empty() {
			continue;
		}

		cursor = result.seq;
		let changes = result.changes.iter().map(WireChange::from).collect();
		send_frame(
			&ws_tx,
			&ServerFrame::StreamBatch { seq: result.seq.0, more: result.more, compact: result.compact, changes },
		)
		.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wire_change_round_trips_delta_kind() {
		let change =
			StreamChange { document: "a".into(), bytes: vec![1, 2, 3], seq: Seq(5), kind: ChangeKind::Delta, exists: Some(true) };
		let wire = WireChange::from(&change);
		assert_eq!(wire.document, "a");
		assert_eq!(wire.kind, "delta");
		assert_eq!(wire.seq, 5);
		assert_eq!(STANDARD.decode(&wire.bytes).unwrap(), vec![1, 2, 3]);
	}

	#[test]
	fn client_frame_parses_push_from_json() {
		let json = r#"{"type":"push","document":"a","delta_type":"update","bytes":"AQID"}"#;
		let frame: ClientFrame = serde_json::from_str(json).unwrap();
		match frame {
			ClientFrame::Push { document, delta_type, bytes } => {
				assert_eq!(document, "a");
				assert_eq!(delta_type, DeltaType::Update);
				assert_eq!(decode(&bytes).unwrap(), vec![1, 2, 3]);
			}
			_ => panic!("expected push frame"),
		}
	}

	#[test]
	fn server_frame_serializes_with_tagged_type() {
		let frame = ServerFrame::Error { message: "bad frame".into() };
		let json = serde_json::to_string(&frame).unwrap();
		assert!(json.contains(r#""type":"error""#));
		assert!(json.contains("bad frame"));
	}
}

// vim: ts=4
