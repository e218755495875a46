//! Ticket lifecycle and validation engine.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  ┌───────────┐  ┌───────────────────┐  ┌──────────────────────┐
//! │ TicketFactory │  │ Validator │  │ ProxyChainManager │  │ RevocationCoordinator│
//! └───────┬───────┘  └─────┬─────┘  └─────────┬─────────┘  └──────────┬───────────┘
//!         │                │                  │                       │
//!         └────────────────┴────────┬─────────┴───────────────────────┘
//!                                   ▼
//!                         ┌───────────────────┐
//!                         │ TicketStore       │
//!                         │ (memory | redis)  │
//!                         └───────────────────┘
//! ```
//!
//! Ticket graph: `TGT → ST → PGT → PT → PGT → …`. Every record names its
//! parent, and revoking a TGT removes its whole subtree at once.
//!
//! # Usage
//!
//! ```ignore
//! let broker = TicketBroker::new(store, settings, callback);
//! let tgt = broker.factory.issue_ticket_granting_ticket("alice", attrs, None).await?;
//! let st = broker.factory.issue_service_ticket(service, "alice", &tgt, true).await?;
//! let validated = broker.validator.validate_service_ticket(Some(service), Some(&st.id), false).await?;
//! ```

pub mod error;
pub mod factory;
pub mod proxy;
pub mod redis_store;
pub mod revocation;
pub mod service_url;
pub mod store;
pub mod types;
pub mod validator;

pub use error::{StoreError, ValidationError};
pub use factory::TicketFactory;
pub use proxy::{HttpProxyCallback, ProxyCallback, ProxyChainManager};
pub use redis_store::RedisTicketStore;
pub use revocation::{Revocation, RevocationCoordinator};
pub use store::{MemoryTicketStore, TicketStore};
pub use types::{
    ExpirationPolicy, ExtraAttributes, LoginTicket, ProxyGrantingTicket, ServiceTicket, Ticket,
    TicketGrantingTicket, TicketKind,
};
pub use validator::{ValidatedTicket, Validator};

use crate::config::Settings;
use std::sync::Arc;

/// All ticket components wired to one store.
#[derive(Clone)]
pub struct TicketBroker {
    pub store: Arc<dyn TicketStore>,
    pub settings: Arc<Settings>,
    pub factory: Arc<TicketFactory>,
    pub validator: Arc<Validator>,
    pub proxy: Arc<ProxyChainManager>,
    pub revocation: Arc<RevocationCoordinator>,
}

impl TicketBroker {
    pub fn new(
        store: Arc<dyn TicketStore>,
        settings: Arc<Settings>,
        callback: Arc<dyn ProxyCallback>,
    ) -> Self {
        let proxy = Arc::new(ProxyChainManager::new(
            store.clone(),
            settings.clone(),
            callback,
        ));
        Self {
            factory: Arc::new(TicketFactory::new(
                store.clone(),
                settings.clone(),
                proxy.clone(),
            )),
            validator: Arc::new(Validator::new(
                store.clone(),
                settings.clone(),
                proxy.clone(),
            )),
            revocation: Arc::new(RevocationCoordinator::new(store.clone())),
            proxy,
            store,
            settings,
        }
    }
}
