//! Engine initialization and the process lifecycle.
//!
//! Startup order matters and is fixed: encryption key -> store pool (+
//! migrations) -> platform provider client -> email gateway -> watchdog
//! bootstrap -> worker -> janitor -> HTTP listener. The watchdog must run
//! before the worker so the self-scheduling chains exist before polling
//! begins.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use recoup_common::{
    aes::TokenCipher,
    hmac::LinkSigner,
    rng::SysRng,
    shutdown::Shutdown,
    task::{self, NamedTask},
};
use recoup_provider::{ProviderClient, ProviderConfig, webhook::WebhookVerifier};
use recoup_store::Store;
use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::{
    App,
    config::Config,
    email::{EmailApi, HttpEmailGateway},
    janitor::Janitor,
    server,
    watchdog,
    webhook::RateLimiter,
    worker::Worker,
};

/// Max time we wait for tasks to finish after a shutdown signal.
const SHUTDOWN_TIME_LIMIT: Duration = Duration::from_secs(10);

pub struct Engine {
    static_tasks: Vec<NamedTask<()>>,
    shutdown: Shutdown,
    engine_url: String,
}

impl Engine {
    /// Initialize the engine: connect + migrate the store, build clients,
    /// bootstrap the task chains, and spawn the long-lived tasks.
    pub async fn init(config: Config) -> anyhow::Result<Self> {
        server::error::set_deploy_env(config.deploy_env);
        info!(deploy_env = %config.deploy_env, "Starting recoup");

        let rng = SysRng::new();

        let cipher = match &config.encryption_key {
            Some(key_hex) => TokenCipher::from_hex(key_hex)
                .context("ENCRYPTION_KEY is invalid")?,
            // Config::load already enforced prod; this is a dev run.
            None => {
                warn!(
                    "ENCRYPTION_KEY not set; tokens encrypted under an \
                     ephemeral key will not survive a restart"
                );
                TokenCipher::ephemeral(&rng)
            }
        };

        let store = Store::connect(&config.database_url, Arc::new(cipher))
            .await
            .context("Failed to connect to the store")?;

        let provider = ProviderClient::new(&ProviderConfig {
            base_url: config.pp_base_url.clone(),
            client_id: config.pp_client_id.clone(),
            secret_key: config.pp_secret_key.clone(),
        })
        .context("Failed to build provider client")?;

        let email: Arc<dyn EmailApi> = Arc::new(
            HttpEmailGateway::new(
                &config.email_base_url,
                config.email_api_key.clone(),
            )
            .context("Failed to build email gateway client")?,
        );

        let link_signer =
            LinkSigner::new(config.session_secret.expose_secret().as_bytes());
        let webhook_verifier = WebhookVerifier::new(
            config.pp_webhook_secret.expose_secret().as_bytes(),
        );

        let app = Arc::new(App {
            config,
            store,
            provider,
            email,
            link_signer,
            webhook_verifier,
            rng,
            webhook_rate_limiter: RateLimiter::for_webhooks(),
        });

        // Resurrect any severed self-scheduling chain before the worker
        // starts polling.
        watchdog::bootstrap(&app.store)
            .await
            .context("Watchdog bootstrap failed")?;

        let shutdown = Shutdown::new();
        let mut static_tasks = Vec::with_capacity(3);

        static_tasks.push(Worker::spawn(app.clone(), shutdown.clone()));
        static_tasks
            .push(Janitor::spawn(app.store.clone(), shutdown.clone()));

        let (server_task, engine_url) =
            server::spawn_server(app.clone(), shutdown.clone())
                .context("Failed to spawn HTTP server")?;
        static_tasks.push(server_task);

        info!("recoup listening at {engine_url}");

        Ok(Self {
            static_tasks,
            shutdown,
            engine_url,
        })
    }

    /// The url of the HTTP server, e.g. "http://127.0.0.1:8420".
    pub fn url(&self) -> String {
        self.engine_url.clone()
    }

    /// A handle that shuts the engine down when sent on.
    pub fn shutdown_channel(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until a shutdown signal is received, then drain gracefully.
    pub async fn run(self, spawn_ctrlc_handler: bool) -> anyhow::Result<()> {
        if spawn_ctrlc_handler {
            NamedTask::spawn("(ctrlc-handler)", {
                let shutdown = self.shutdown.clone();
                async move {
                    use tokio::signal::ctrl_c;

                    ctrl_c().await.expect("Error receiving first CTRL+C");
                    info!(
                        "CTRL+C received, starting graceful shutdown. \
                         Hit CTRL+C again to quit immediately."
                    );
                    shutdown.send();
                    ctrl_c().await.expect("Error receiving second CTRL+C");
                    std::process::exit(1);
                }
            })
            .detach();
        }

        task::try_join_and_shutdown(
            self.static_tasks,
            self.shutdown,
            SHUTDOWN_TIME_LIMIT,
        )
        .await
        .context("Error awaiting tasks")?;

        Ok(())
    }
}
