//! Ticket issuance.

use crate::config::Settings;
use crate::ticket::error::ValidationError;
use crate::ticket::proxy::ProxyChainManager;
use crate::ticket::service_url;
use crate::ticket::store::{InsertOutcome, TicketStore};
use crate::ticket::types::{
    short_id, ExtraAttributes, LoginTicket, ProxyGrantingTicket, ServiceTicket, Ticket,
    TicketGrantingTicket, TicketKind,
};
use chrono::Utc;
use log::{debug, info, warn};
use rand_core::{OsRng, RngCore};
use std::sync::Arc;

/// Fresh ids tried before an insert is reported as an internal error.
const MAX_ID_ATTEMPTS: usize = 4;

/// Build `<prefix>-<hex>` from `entropy_bytes` of OS randomness.
pub fn generate_ticket_id(prefix: &str, entropy_bytes: usize) -> String {
    let mut bytes = vec![0u8; entropy_bytes];
    OsRng.fill_bytes(&mut bytes);
    format!("{}-{}", prefix, hex::encode(bytes))
}

pub struct TicketFactory {
    store: Arc<dyn TicketStore>,
    settings: Arc<Settings>,
    proxy: Arc<ProxyChainManager>,
}

impl TicketFactory {
    pub fn new(
        store: Arc<dyn TicketStore>,
        settings: Arc<Settings>,
        proxy: Arc<ProxyChainManager>,
    ) -> Self {
        Self {
            store,
            settings,
            proxy,
        }
    }

    /// Generate ids until one is free, then insert the record built from it.
    async fn persist<T, F>(&self, kind: TicketKind, build: F) -> Result<T, ValidationError>
    where
        T: Clone + Into<Ticket>,
        F: Fn(String) -> T,
    {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_ticket_id(kind.prefix(), self.settings.ticket_entropy_bytes);
            let record = build(id);
            let ticket: Ticket = record.clone().into();
            match self.store.create(ticket.clone()).await? {
                InsertOutcome::Inserted => return Ok(record),
                InsertOutcome::Collision => {
                    warn!("Generated {} id collided, retrying", kind);
                }
                InsertOutcome::ParentMissing => {
                    let parent = ticket.granted_by().unwrap_or_default();
                    return Err(ValidationError::InvalidTicket(format!(
                        "Ticket '{}' is no longer valid.",
                        short_id(parent)
                    )));
                }
            }
        }
        Err(ValidationError::InternalError(format!(
            "Could not generate a unique {} id",
            kind
        )))
    }

    pub async fn issue_login_ticket(&self) -> Result<LoginTicket, ValidationError> {
        let lt = self
            .persist(TicketKind::Login, |id| LoginTicket {
                id,
                issued_at: Utc::now(),
                consumed: false,
            })
            .await?;
        debug!("Issued login ticket {}", short_id(&lt.id));
        Ok(lt)
    }

    /// Start a session. Only call after the credentials were verified.
    pub async fn issue_ticket_granting_ticket(
        &self,
        username: &str,
        extra_attributes: ExtraAttributes,
        client_hostname: Option<String>,
    ) -> Result<TicketGrantingTicket, ValidationError> {
        let tgt = self
            .persist(TicketKind::TicketGranting, |id| TicketGrantingTicket {
                id,
                username: username.to_string(),
                extra_attributes: extra_attributes.clone(),
                issued_at: Utc::now(),
                client_hostname: client_hostname.clone(),
            })
            .await?;
        info!(
            "Issued ticket-granting ticket {} for user {}",
            short_id(&tgt.id),
            username
        );
        Ok(tgt)
    }

    /// Issue a service ticket for `service` under a session.
    ///
    /// `renew` marks tickets issued straight from a credential check.
    pub async fn issue_service_ticket(
        &self,
        service: &str,
        username: &str,
        granting_tgt: &TicketGrantingTicket,
        renew: bool,
    ) -> Result<ServiceTicket, ValidationError> {
        let service = service_url::normalize(service).map_err(|_| {
            ValidationError::InvalidService(format!(
                "The target service '{}' appears to be invalid.",
                service
            ))
        })?;

        let st = self
            .persist(TicketKind::Service, |id| ServiceTicket {
                id,
                kind: TicketKind::Service,
                service: service.to_string(),
                username: username.to_string(),
                extra_attributes: granting_tgt.extra_attributes.clone(),
                issued_at: Utc::now(),
                consumed: false,
                granted_by: granting_tgt.id.clone(),
                renew,
            })
            .await?;
        info!(
            "Issued service ticket {} for user {} on {}",
            short_id(&st.id),
            username,
            st.service
        );
        Ok(st)
    }

    /// Best effort: `None` when the handshake is declined or fails.
    pub async fn issue_proxy_granting_ticket(
        &self,
        callback_url: &str,
        granting_ticket: &ServiceTicket,
    ) -> Option<ProxyGrantingTicket> {
        self.proxy.establish(Some(callback_url), granting_ticket).await
    }

    pub async fn issue_proxy_ticket(
        &self,
        service: &str,
        granting_pgt: &ProxyGrantingTicket,
    ) -> Result<ServiceTicket, ValidationError> {
        let service = service_url::normalize(service).map_err(|_| {
            ValidationError::InvalidService(format!(
                "The target service '{}' appears to be invalid.",
                service
            ))
        })?;

        let pt = self
            .persist(TicketKind::Proxy, |id| ServiceTicket {
                id,
                kind: TicketKind::Proxy,
                service: service.to_string(),
                username: granting_pgt.username.clone(),
                extra_attributes: granting_pgt.extra_attributes.clone(),
                issued_at: Utc::now(),
                consumed: false,
                granted_by: granting_pgt.id.clone(),
                renew: false,
            })
            .await?;
        info!(
            "Issued proxy ticket {} for user {} on {}",
            short_id(&pt.id),
            pt.username,
            pt.service
        );
        Ok(pt)
    }
}
