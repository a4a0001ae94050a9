//! The recoup service: webhook ingress, durable worker, janitor, watchdog,
//! and the merchant-facing HTTP API, all sharing one store pool.

use std::sync::Arc;

use recoup_common::{hmac::LinkSigner, rng::SysRng};
use recoup_provider::{ProviderClient, webhook::WebhookVerifier};
use recoup_store::Store;

use crate::email::EmailApi;

pub mod cli;
pub mod config;
pub mod email;
pub mod logger;
pub mod run;

mod janitor;
mod jobs;
mod quota;
mod server;
mod watchdog;
mod webhook;
mod worker;

/// Process-wide shared state. Initialized once at startup in a defined
/// order (store pool -> encryption key -> platform provider client ->
/// watchdog -> worker -> janitor -> HTTP listener) and shared by every
/// component behind an [`Arc`].
pub struct App {
    pub config: config::Config,
    pub store: Store,
    /// Platform-scoped provider client; tenant scoping via `for_account`.
    pub provider: ProviderClient,
    pub email: Arc<dyn EmailApi>,
    pub link_signer: LinkSigner,
    pub webhook_verifier: WebhookVerifier,
    pub rng: SysRng,
    pub(crate) webhook_rate_limiter: webhook::RateLimiter,
}
