//! Application layer orchestrating the billing service.
//!
//! [`client::BillingClient`] is the primary entry point. It shares one remote
//! connection through the [`broker`], keeps owned purchases in the [`cache`]
//! and runs purchases through the single-slot [`purchase_flow`].

pub mod broker;
pub mod cache;
pub mod client;
pub mod purchase_flow;
pub mod settings;
