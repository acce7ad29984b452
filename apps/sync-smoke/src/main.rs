use sync_core::SyncCommand;
use sync_platform::{JsonFileStateStore, StateStore, WsTransportFactory};
use sync_socket::{HttpOrderApi, SyncConfig, spawn_runtime};
use tracing::info;

mod logging;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let state_store = match JsonFileStateStore::new(&config.data_dir) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("Failed to open state store at {}: {err}", config.data_dir.display());
            std::process::exit(1);
        }
    };
    let hydrated = state_store.hydrate().unwrap_or_default();
    info!(
        rooms = hydrated.rooms.len(),
        active_room = ?hydrated.active_room_id,
        "hydrated persisted store"
    );

    let factory = WsTransportFactory::new(config.server_url.clone());
    let order_api = HttpOrderApi::new(
        config.api_base_url.clone(),
        config.local_user_id.clone(),
        config.auth_token.clone(),
    );

    let handle = spawn_runtime(config.clone(), factory, order_api, state_store);
    match config.auth_token {
        Some(auth_token) => {
            handle
                .send(SyncCommand::Connect { auth_token })
                .await
                .expect("runtime accepts commands");
            println!("Sync runtime started; connecting to {}", config.server_url);
        }
        None => {
            println!("Sync runtime started without credentials.");
            println!("Set LIVECART_AUTH_TOKEN (and LIVECART_SERVER_URL) to connect.");
        }
    }
}
