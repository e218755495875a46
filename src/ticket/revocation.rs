//! Session revocation.

use crate::ticket::error::ValidationError;
use crate::ticket::store::TicketStore;
use crate::ticket::types::{short_id, Ticket, TicketKind};
use log::{info, warn};
use std::sync::Arc;

/// What a revocation removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revocation {
    pub username: String,
    pub proxy_granting_tickets: usize,
    pub service_tickets: usize,
    pub proxy_tickets: usize,
}

pub struct RevocationCoordinator {
    store: Arc<dyn TicketStore>,
}

impl RevocationCoordinator {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    /// Destroy a ticket-granting ticket and every ticket rooted under it.
    ///
    /// Unknown ids are a no-op, so logging out twice is harmless. The subtree
    /// is removed in a single store transaction.
    pub async fn revoke(&self, tgt_id: &str) -> Result<Option<Revocation>, ValidationError> {
        let username = match self.store.get(tgt_id).await? {
            Some(Ticket::TicketGranting(tgt)) => tgt.username,
            Some(other) => {
                warn!(
                    "Refusing to revoke {} {} as a session",
                    other.kind(),
                    short_id(tgt_id)
                );
                return Ok(None);
            }
            None => {
                info!(
                    "Logout without a valid ticket-granting ticket ({})",
                    short_id(tgt_id)
                );
                return Ok(None);
            }
        };

        let Some(removed) = self.store.revoke_tree(tgt_id).await? else {
            // Revoked concurrently between the lookup and the transaction.
            return Ok(None);
        };

        let mut revocation = Revocation {
            username,
            ..Revocation::default()
        };
        for id in &removed {
            match TicketKind::of(id) {
                Some(TicketKind::ProxyGranting) => revocation.proxy_granting_tickets += 1,
                Some(TicketKind::Service) => revocation.service_tickets += 1,
                Some(TicketKind::Proxy) => revocation.proxy_tickets += 1,
                _ => {}
            }
        }

        info!(
            "User '{}' logged out; revoked session {} with {} proxy-granting tickets",
            revocation.username,
            short_id(tgt_id),
            revocation.proxy_granting_tickets
        );
        Ok(Some(revocation))
    }
}
