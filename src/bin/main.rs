use std::sync::Arc;

use cas::authenticator::{Authenticator, StaticAuthenticator};
use cas::config::{Settings, StoreBackend};
use cas::server;
use cas::ticket::{HttpProxyCallback, MemoryTicketStore, RedisTicketStore, TicketBroker, TicketStore};
use log::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = Arc::new(Settings::from_env()?);

    let store: Arc<dyn TicketStore> = match settings.store {
        StoreBackend::Memory => {
            info!("Using in-memory ticket store");
            Arc::new(MemoryTicketStore::new())
        }
        StoreBackend::Redis => Arc::new(RedisTicketStore::open(
            &settings.redis_url,
            settings.expiration,
        )?),
    };

    let authenticator: Arc<dyn Authenticator> = match &settings.users_path {
        Some(path) => Arc::new(StaticAuthenticator::from_file(
            path,
            settings.extra_attributes.clone(),
        )?),
        None => {
            warn!("CAS_USERS_PATH not set; no user will be able to log in");
            Arc::new(StaticAuthenticator::new(
                Vec::new(),
                settings.extra_attributes.clone(),
            ))
        }
    };

    let callback = Arc::new(HttpProxyCallback::new(settings.proxy_callback_timeout)?);
    let broker = TicketBroker::new(store, settings.clone(), callback);

    let bind = format!("0.0.0.0:{}", settings.port);
    let handle = server::serve(broker, authenticator, &bind).await?;
    println!("Listening on: {}", bind);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown().await?;

    Ok(())
}
