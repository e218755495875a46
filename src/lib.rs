//! Central authentication service: a ticket broker for single sign-on.
//!
//! Users log in once and receive a ticket-granting ticket (the session).
//! Services obtain single-use service tickets through browser redirects and
//! redeem them over the back channel; proxying services chain proxy-granting
//! and proxy tickets on behalf of the user.

pub mod authenticator;
pub mod config;
pub mod modules;
pub mod server;
pub mod ticket;

pub use config::Settings;
pub use ticket::TicketBroker;
