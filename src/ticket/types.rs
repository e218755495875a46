//! Ticket records and identifiers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque attributes captured from the credential checker at login.
pub type ExtraAttributes = BTreeMap<String, serde_json::Value>;

/// Prefix of the public handle echoed for a proxy-granting ticket.
pub const PGT_IOU_PREFIX: &str = "PGTIOU";

/// The five ticket kinds, each with its own identifier prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketKind {
    Login,
    TicketGranting,
    Service,
    ProxyGranting,
    Proxy,
}

impl TicketKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            TicketKind::Login => "LT",
            TicketKind::TicketGranting => "TGC",
            TicketKind::Service => "ST",
            TicketKind::ProxyGranting => "PGT",
            TicketKind::Proxy => "PT",
        }
    }

    /// Determine the kind of a ticket from its identifier alone.
    pub fn of(id: &str) -> Option<TicketKind> {
        let (prefix, rest) = id.split_once('-')?;
        if rest.is_empty() {
            return None;
        }
        match prefix {
            "LT" => Some(TicketKind::Login),
            "TGC" => Some(TicketKind::TicketGranting),
            "ST" => Some(TicketKind::Service),
            "PGT" => Some(TicketKind::ProxyGranting),
            "PT" => Some(TicketKind::Proxy),
            _ => None,
        }
    }

    /// Single-use kinds carry a consumed flag.
    pub fn is_single_use(&self) -> bool {
        matches!(
            self,
            TicketKind::Login | TicketKind::Service | TicketKind::Proxy
        )
    }
}

impl std::fmt::Display for TicketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TicketKind::Login => "login ticket",
            TicketKind::TicketGranting => "ticket-granting ticket",
            TicketKind::Service => "service ticket",
            TicketKind::ProxyGranting => "proxy-granting ticket",
            TicketKind::Proxy => "proxy ticket",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginTicket {
    pub id: String,
    pub issued_at: DateTime<Utc>,
    pub consumed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketGrantingTicket {
    pub id: String,
    pub username: String,
    pub extra_attributes: ExtraAttributes,
    pub issued_at: DateTime<Utc>,
    pub client_hostname: Option<String>,
}

/// Shared record for service tickets and proxy tickets.
///
/// A service ticket is granted by a TGT, a proxy ticket by a PGT; `kind`
/// and `granted_by` always agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTicket {
    pub id: String,
    pub kind: TicketKind,
    pub service: String,
    pub username: String,
    pub extra_attributes: ExtraAttributes,
    pub issued_at: DateTime<Utc>,
    pub consumed: bool,
    pub granted_by: String,
    /// Issued straight from a credential check rather than an existing session.
    pub renew: bool,
}

impl ServiceTicket {
    pub fn is_proxy(&self) -> bool {
        self.kind == TicketKind::Proxy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyGrantingTicket {
    pub id: String,
    pub iou: String,
    pub callback_url: String,
    pub issued_at: DateTime<Utc>,
    /// The ST or PT whose validation earned this PGT.
    pub granted_by: String,
    pub username: String,
    pub extra_attributes: ExtraAttributes,
}

/// Any stored ticket record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Ticket {
    Login(LoginTicket),
    TicketGranting(TicketGrantingTicket),
    Service(ServiceTicket),
    ProxyGranting(ProxyGrantingTicket),
}

impl Ticket {
    pub fn id(&self) -> &str {
        match self {
            Ticket::Login(t) => &t.id,
            Ticket::TicketGranting(t) => &t.id,
            Ticket::Service(t) => &t.id,
            Ticket::ProxyGranting(t) => &t.id,
        }
    }

    pub fn kind(&self) -> TicketKind {
        match self {
            Ticket::Login(_) => TicketKind::Login,
            Ticket::TicketGranting(_) => TicketKind::TicketGranting,
            Ticket::Service(t) => t.kind,
            Ticket::ProxyGranting(_) => TicketKind::ProxyGranting,
        }
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        match self {
            Ticket::Login(t) => t.issued_at,
            Ticket::TicketGranting(t) => t.issued_at,
            Ticket::Service(t) => t.issued_at,
            Ticket::ProxyGranting(t) => t.issued_at,
        }
    }

    /// Parent record in the ticket graph, if any.
    pub fn granted_by(&self) -> Option<&str> {
        match self {
            Ticket::Service(t) => Some(&t.granted_by),
            Ticket::ProxyGranting(t) => Some(&t.granted_by),
            Ticket::Login(_) | Ticket::TicketGranting(_) => None,
        }
    }

    pub fn is_consumed(&self) -> bool {
        match self {
            Ticket::Login(t) => t.consumed,
            Ticket::Service(t) => t.consumed,
            Ticket::TicketGranting(_) | Ticket::ProxyGranting(_) => false,
        }
    }

    pub(crate) fn mark_consumed(&mut self) {
        match self {
            Ticket::Login(t) => t.consumed = true,
            Ticket::Service(t) => t.consumed = true,
            Ticket::TicketGranting(_) | Ticket::ProxyGranting(_) => {}
        }
    }
}

impl From<LoginTicket> for Ticket {
    fn from(t: LoginTicket) -> Self {
        Ticket::Login(t)
    }
}

impl From<TicketGrantingTicket> for Ticket {
    fn from(t: TicketGrantingTicket) -> Self {
        Ticket::TicketGranting(t)
    }
}

impl From<ServiceTicket> for Ticket {
    fn from(t: ServiceTicket) -> Self {
        Ticket::Service(t)
    }
}

impl From<ProxyGrantingTicket> for Ticket {
    fn from(t: ProxyGrantingTicket) -> Self {
        Ticket::ProxyGranting(t)
    }
}

/// Loggable prefix of a ticket id; full ids are bearer secrets.
pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(12)
        .map_or(id.len(), |(idx, _)| idx);
    &id[..end]
}

/// Lifetimes applied lazily at validation time and by the purge task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpirationPolicy {
    pub login_ticket_lifetime: Duration,
    pub service_ticket_lifetime: Duration,
    pub tgt_max_lifetime: Option<Duration>,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            login_ticket_lifetime: Duration::seconds(300),
            service_ticket_lifetime: Duration::seconds(300),
            tgt_max_lifetime: None,
        }
    }
}

impl ExpirationPolicy {
    /// Lifetime of a ticket kind; `None` means it lives until revoked.
    pub fn lifetime(&self, kind: TicketKind) -> Option<Duration> {
        match kind {
            TicketKind::Login => Some(self.login_ticket_lifetime),
            TicketKind::Service | TicketKind::Proxy => Some(self.service_ticket_lifetime),
            TicketKind::TicketGranting => self.tgt_max_lifetime,
            TicketKind::ProxyGranting => None,
        }
    }

    pub fn is_expired(&self, kind: TicketKind, issued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.lifetime(kind) {
            Some(lifetime) => now - issued_at > lifetime,
            None => false,
        }
    }
}
