//! Runnable demo binary: wires the redb adapters into the core engine
//! crates and fronts the result with the WebSocket gateway.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use braid_core::app::{Adapters, Config};
use braid_gateway::{GatewayConfig, GatewayState, router as gateway_router};
use braid_local_adapter_redb::RedbLocalStore;
use braid_log::LogStore;
use braid_session::SessionRegistry;
use braid_store_adapter_redb::RedbStore;
use braid_stream::StreamService;
use braid_types::adapters::session_store::InMemorySessionStore;
use braid_types::prelude::*;

struct DemoConfig {
	data_dir: PathBuf,
	listen: String,
}

impl DemoConfig {
	fn from_env() -> Self {
		Self {
			data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string())),
			listen: env::var("LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
		}
	}
}

#[tokio::main]
async fn main() -> BraidResult<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_target(false)
		.init();

	let demo_config = DemoConfig::from_env();

	let store = Arc::new(RedbStore::open(demo_config.data_dir.join("log.redb"))?);
	let sessions_adapter = Arc::new(InMemorySessionStore::new());
	let _local = Arc::new(RedbLocalStore::open(demo_config.data_dir.join("local.redb"))?);

	let config = Config::default();
	let log = Arc::new(LogStore::new(store.clone(), store.clone(), config.delta_threshold));
	let stream = Arc::new(StreamService::new(log.clone(), None));
	let sessions = SessionRegistry::new(sessions_adapter.clone());

	let _compactor = braid_compaction::Compactor::new(log.clone(), store.clone(), sessions_adapter.clone());

	let _app = braid_core::app::build(
		Adapters {
			log_store: store.clone(),
			session_store: sessions_adapter.clone(),
			compaction_store: store.clone(),
			main_table: None,
		},
		config,
	);

	let gateway_state = GatewayState::new(log, stream, Some(sessions), GatewayConfig::default());
	let app = gateway_router(gateway_state);

	let listener = tokio::net::TcpListener::bind(&demo_config.listen)
		.await
		.map_err(|e| Error::Io(e.to_string()))?;
	info!(addr = %demo_config.listen, "gateway listening");
	axum::serve(listener, app).await.map_err(|e| Error::Io(e.to_string()))?;

	Ok(())
}

// vim: ts=4
