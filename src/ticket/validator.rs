//! Ticket validation state machine.
//!
//! Single-use tickets move `issued → consumed` exactly once. Consumption is
//! delegated to the store's compare-and-swap, so of any number of concurrent
//! validations of one id exactly one succeeds. Checks that only read
//! immutable fields (kind, service, renew, age) run before the swap; a
//! ticket presented to the wrong service is rejected without being spent.

use crate::config::Settings;
use crate::ticket::error::ValidationError;
use crate::ticket::proxy::ProxyChainManager;
use crate::ticket::service_url;
use crate::ticket::store::{ConsumeOutcome, TicketStore};
use crate::ticket::types::{
    short_id, LoginTicket, ProxyGrantingTicket, ServiceTicket, Ticket, TicketGrantingTicket,
    TicketKind,
};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;

/// A service or proxy ticket that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedTicket {
    pub ticket: ServiceTicket,
    /// Proxies the ticket's authority passed through, most recent first.
    pub proxies: Vec<String>,
}

pub struct Validator {
    store: Arc<dyn TicketStore>,
    settings: Arc<Settings>,
    proxy: Arc<ProxyChainManager>,
}

impl Validator {
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

    /// Check and spend the login ticket of a form submission.
    pub async fn validate_login_ticket(
        &self,
        id: Option<&str>,
    ) -> Result<LoginTicket, ValidationError> {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return Err(ValidationError::InvalidRequest(
                "Your login request did not include a login ticket. There may be a problem with the authentication system.".to_string(),
            ));
        };

        let lt = match self.store.get(id).await? {
            Some(Ticket::Login(lt)) => lt,
            _ => {
                warn!("Invalid login ticket {}", short_id(id));
                return Err(ValidationError::InvalidTicket(
                    "The login ticket you provided is invalid. There may be a problem with the authentication system.".to_string(),
                ));
            }
        };

        if lt.consumed {
            warn!("Login ticket {} was already used", short_id(id));
            return Err(login_ticket_used());
        }

        if self
            .settings
            .expiration
            .is_expired(TicketKind::Login, lt.issued_at, Utc::now())
        {
            warn!("Login ticket {} expired", short_id(id));
            return Err(ValidationError::InvalidTicket(
                "You took too long to enter your credentials. Please try again.".to_string(),
            ));
        }

        match self.store.consume(id).await? {
            ConsumeOutcome::Consumed => {
                debug!("Login ticket {} consumed", short_id(id));
                Ok(LoginTicket {
                    consumed: true,
                    ..lt
                })
            }
            ConsumeOutcome::AlreadyConsumed | ConsumeOutcome::Missing => Err(login_ticket_used()),
        }
    }

    /// Look up a session. Never consumes.
    pub async fn validate_ticket_granting_ticket(
        &self,
        id: Option<&str>,
    ) -> Result<TicketGrantingTicket, ValidationError> {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return Err(ValidationError::InvalidRequest(
                "No ticket-granting ticket was given.".to_string(),
            ));
        };

        let tgt = match self.store.get(id).await? {
            Some(Ticket::TicketGranting(tgt)) => tgt,
            _ => {
                warn!("Invalid ticket-granting ticket {}", short_id(id));
                return Err(ValidationError::InvalidTicket(format!(
                    "Invalid ticket granting ticket '{}'.",
                    short_id(id)
                )));
            }
        };

        if self
            .settings
            .expiration
            .is_expired(TicketKind::TicketGranting, tgt.issued_at, Utc::now())
        {
            info!(
                "Ticket-granting ticket {} for user {} has expired",
                short_id(id),
                tgt.username
            );
            return Err(ValidationError::InvalidTicket(
                "Your session has expired. Please log in again.".to_string(),
            ));
        }

        Ok(tgt)
    }

    /// Validate a service ticket; proxy tickets are rejected.
    pub async fn validate_service_ticket(
        &self,
        service: Option<&str>,
        id: Option<&str>,
        renew: bool,
    ) -> Result<ServiceTicket, ValidationError> {
        self.check_and_consume(service, id, renew, false).await
    }

    /// Validate a service or proxy ticket, reconstructing the proxy chain of
    /// a proxy ticket.
    pub async fn validate_proxy_ticket(
        &self,
        service: Option<&str>,
        id: Option<&str>,
        renew: bool,
    ) -> Result<ValidatedTicket, ValidationError> {
        let ticket = self.check_and_consume(service, id, renew, true).await?;
        let proxies = self.proxy.build_proxy_chain(&ticket).await?;
        Ok(ValidatedTicket { ticket, proxies })
    }

    /// Look up a PGT presented to request a proxy ticket.
    pub async fn validate_proxy_granting_ticket(
        &self,
        id: Option<&str>,
    ) -> Result<ProxyGrantingTicket, ValidationError> {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return Err(ValidationError::InvalidRequest(
                "pgt parameter was missing in the request.".to_string(),
            ));
        };

        match self.store.get(id).await? {
            Some(Ticket::ProxyGranting(pgt)) => Ok(pgt),
            _ => {
                warn!("Unknown proxy-granting ticket {}", short_id(id));
                Err(ValidationError::BadPgt(format!(
                    "Proxy granting ticket '{}' not recognized.",
                    short_id(id)
                )))
            }
        }
    }

    async fn check_and_consume(
        &self,
        service: Option<&str>,
        id: Option<&str>,
        renew: bool,
        allow_proxy: bool,
    ) -> Result<ServiceTicket, ValidationError> {
        let (Some(service), Some(id)) = (
            service.filter(|s| !s.is_empty()),
            id.filter(|t| !t.is_empty()),
        ) else {
            return Err(ValidationError::InvalidRequest(
                "Ticket or service parameter was missing in the request.".to_string(),
            ));
        };

        match TicketKind::of(id) {
            Some(TicketKind::Service) => {}
            Some(TicketKind::Proxy) if allow_proxy => {}
            Some(TicketKind::Proxy) => {
                warn!("Proxy ticket {} presented to serviceValidate", short_id(id));
                return Err(ValidationError::InvalidTicketSpec(format!(
                    "Ticket '{}' is a proxy ticket, but only service tickets are allowed here.",
                    id
                )));
            }
            _ => {
                return Err(ValidationError::InvalidTicket(format!(
                    "Ticket '{}' not recognized.",
                    id
                )))
            }
        }

        let ticket = match self.store.get(id).await? {
            Some(Ticket::Service(ticket)) => ticket,
            _ => {
                warn!("Unknown ticket {}", short_id(id));
                return Err(ValidationError::InvalidTicket(format!(
                    "Ticket '{}' not recognized.",
                    id
                )));
            }
        };

        if ticket.consumed {
            warn!("Ticket {} was already used", short_id(id));
            return Err(ticket_used(id));
        }

        if self
            .settings
            .expiration
            .is_expired(ticket.kind, ticket.issued_at, Utc::now())
        {
            warn!("Ticket {} expired", short_id(id));
            return Err(ValidationError::InvalidTicket(format!(
                "Ticket '{}' has expired.",
                id
            )));
        }

        if !service_url::services_match(&ticket.service, service) {
            warn!(
                "Ticket {} was issued for {} but presented by {}",
                short_id(id),
                ticket.service,
                service
            );
            return Err(ValidationError::InvalidService(format!(
                "The ticket '{}' belonging to user '{}' is valid, but the requested service '{}' does not match the service '{}' associated with this ticket.",
                id, ticket.username, service, ticket.service
            )));
        }

        if renew && !ticket.renew {
            warn!(
                "Ticket {} did not come from a credential check but renew was requested",
                short_id(id)
            );
            return Err(ValidationError::InvalidTicket(format!(
                "Ticket '{}' was not issued from primary credentials.",
                id
            )));
        }

        match self.store.consume(id).await? {
            ConsumeOutcome::Consumed => {
                info!(
                    "Ticket {} for user {} validated for {}",
                    short_id(id),
                    ticket.username,
                    ticket.service
                );
                Ok(ServiceTicket {
                    consumed: true,
                    ..ticket
                })
            }
            ConsumeOutcome::AlreadyConsumed => Err(ticket_used(id)),
            ConsumeOutcome::Missing => Err(ValidationError::InvalidTicket(format!(
                "Ticket '{}' not recognized.",
                id
            ))),
        }
    }
}

fn login_ticket_used() -> ValidationError {
    ValidationError::InvalidTicket(
        "The login ticket you provided has already been used up. Please try logging in again."
            .to_string(),
    )
}

fn ticket_used(id: &str) -> ValidationError {
    ValidationError::InvalidTicket(format!("Ticket '{}' has already been used up.", id))
}
