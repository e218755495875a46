//! Proxy-granting ticket handshake and proxy chain reconstruction.
//!
//! A PGT only exists once the requesting service has proven it controls its
//! callback URL: the PGT id and its iou are delivered to the callback over
//! the back channel, and only the iou is returned in the validation
//! response. The handshake is best effort; any failure yields no PGT and
//! never affects the validation that requested it.

use crate::config::Settings;
use crate::ticket::error::ValidationError;
use crate::ticket::factory::generate_ticket_id;
use crate::ticket::store::{InsertOutcome, TicketStore};
use crate::ticket::types::{
    short_id, ProxyGrantingTicket, ServiceTicket, Ticket, TicketKind, PGT_IOU_PREFIX,
};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Longest delegation chain walked before giving up.
const MAX_PROXY_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Callback request failed: {0}")]
    Transport(String),

    #[error("Callback answered with status {0}")]
    Status(u16),

    #[error("Callback did not answer within {0:?}")]
    Timeout(Duration),
}

/// Back-channel delivery of a PGT to a service's callback endpoint.
#[async_trait]
pub trait ProxyCallback: Send + Sync {
    /// Returns `Ok` only when the endpoint confirmed receipt.
    async fn deliver(&self, callback: &Url, pgt_id: &str, pgt_iou: &str)
        -> Result<(), CallbackError>;
}

/// Delivers PGTs with an HTTP GET carrying `pgtId` and `pgtIou`.
///
/// Certificates are always verified and redirects are not followed.
pub struct HttpProxyCallback {
    client: reqwest::Client,
}

impl HttpProxyCallback {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProxyCallback for HttpProxyCallback {
    async fn deliver(
        &self,
        callback: &Url,
        pgt_id: &str,
        pgt_iou: &str,
    ) -> Result<(), CallbackError> {
        let mut url = callback.clone();
        url.query_pairs_mut()
            .append_pair("pgtId", pgt_id)
            .append_pair("pgtIou", pgt_iou);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CallbackError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallbackError::Status(status.as_u16()));
        }
        Ok(())
    }
}

pub struct ProxyChainManager {
    store: Arc<dyn TicketStore>,
    settings: Arc<Settings>,
    callback: Arc<dyn ProxyCallback>,
}

impl ProxyChainManager {
    pub fn new(
        store: Arc<dyn TicketStore>,
        settings: Arc<Settings>,
        callback: Arc<dyn ProxyCallback>,
    ) -> Self {
        Self {
            store,
            settings,
            callback,
        }
    }

    /// Check the callback URL a service asked PGTs to be delivered to.
    fn callback_url(&self, pgt_url: &str) -> Option<Url> {
        let url = Url::parse(pgt_url.trim()).ok()?;
        if url.cannot_be_a_base() || !url.has_host() {
            return None;
        }
        match url.scheme() {
            "https" => Some(url),
            "http" if !self.settings.require_https_callback => Some(url),
            _ => None,
        }
    }

    /// Run the callback handshake and persist the PGT under `granting`.
    ///
    /// Returns `None` when no usable callback URL was given or when any step
    /// of the handshake fails.
    pub async fn establish(
        &self,
        pgt_url: Option<&str>,
        granting: &ServiceTicket,
    ) -> Option<ProxyGrantingTicket> {
        let raw = pgt_url?;
        let Some(callback) = self.callback_url(raw) else {
            debug!("Ignoring unusable proxy callback URL '{}'", raw);
            return None;
        };

        let entropy = self.settings.ticket_entropy_bytes;
        let pgt = ProxyGrantingTicket {
            id: generate_ticket_id(TicketKind::ProxyGranting.prefix(), entropy),
            iou: generate_ticket_id(PGT_IOU_PREFIX, entropy),
            callback_url: callback.to_string(),
            issued_at: Utc::now(),
            granted_by: granting.id.clone(),
            username: granting.username.clone(),
            extra_attributes: granting.extra_attributes.clone(),
        };

        let timeout = self.settings.proxy_callback_timeout;
        let delivered = tokio::time::timeout(
            timeout,
            self.callback.deliver(&callback, &pgt.id, &pgt.iou),
        )
        .await
        .unwrap_or(Err(CallbackError::Timeout(timeout)));

        if let Err(e) = delivered {
            warn!(
                "Proxy callback to {} failed, no PGT issued: {}",
                callback, e
            );
            return None;
        }

        match self.store.create(Ticket::from(pgt.clone())).await {
            Ok(InsertOutcome::Inserted) => {
                info!(
                    "Issued proxy-granting ticket {} for user {} via {}",
                    short_id(&pgt.id),
                    pgt.username,
                    callback
                );
                Some(pgt)
            }
            Ok(outcome) => {
                warn!(
                    "Could not persist proxy-granting ticket under {}: {:?}",
                    short_id(&granting.id),
                    outcome
                );
                None
            }
            Err(e) => {
                error!("Failed to persist proxy-granting ticket: {}", e);
                None
            }
        }
    }

    /// Services a proxy ticket's authority passed through, most recent first.
    ///
    /// For a service ticket the chain is empty.
    pub async fn build_proxy_chain(
        &self,
        ticket: &ServiceTicket,
    ) -> Result<Vec<String>, ValidationError> {
        let mut chain = Vec::new();
        let mut current = ticket.clone();

        while current.is_proxy() {
            if chain.len() >= MAX_PROXY_DEPTH {
                return Err(ValidationError::InternalError(format!(
                    "Proxy chain of ticket '{}' exceeds {} hops",
                    ticket.id, MAX_PROXY_DEPTH
                )));
            }

            let pgt = match self.store.get(&current.granted_by).await? {
                Some(Ticket::ProxyGranting(pgt)) => pgt,
                _ => {
                    return Err(ValidationError::BadPgt(format!(
                        "Proxy ticket '{}' belonging to user '{}' is not associated with a proxy granting ticket.",
                        current.id, current.username
                    )))
                }
            };

            current = match self.store.get(&pgt.granted_by).await? {
                Some(Ticket::Service(granting)) => granting,
                _ => {
                    return Err(ValidationError::BadPgt(format!(
                        "Proxy granting ticket '{}' is not associated with a service or proxy ticket.",
                        short_id(&pgt.id)
                    )))
                }
            };
            chain.push(current.service.clone());
        }

        Ok(chain)
    }
}
