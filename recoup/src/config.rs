//! Environment-driven configuration, loaded once at startup.
//!
//! Secrets are mandatory in staging/prod; dev runs fall back to ephemeral
//! random values with a warning so a bare `cargo run` works against a local
//! Postgres. Secret values are wrapped in [`SecretString`] so they never
//! appear in `Debug` output or logs.

use std::{
    env,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use anyhow::{Context, ensure};
use recoup_common::{env::DeployEnv, rng::SysRng};
use secrecy::SecretString;

use crate::cli::EngineArgs;

/// `127.0.0.1:8420`
const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8420));

const DEFAULT_PP_BASE_URL: &str = "https://api.payprovider.com";
const DEFAULT_EMAIL_BASE_URL: &str = "https://api.mailgateway.dev";

pub struct Config {
    pub deploy_env: DeployEnv,
    pub listen_addr: SocketAddr,
    pub database_url: String,
    /// Public base URL of this deployment; tracking links embed it.
    pub public_url: String,

    // --- Payment provider --- //
    pub pp_base_url: String,
    pub pp_client_id: String,
    pub pp_secret_key: SecretString,
    pub pp_webhook_secret: SecretString,

    // --- Inbound auth secrets --- //
    pub worker_secret: SecretString,
    pub admin_key: SecretString,
    /// HMAC key for tracking-link signatures.
    pub session_secret: SecretString,
    /// 64 hex chars = 32 bytes; `None` only in dev (ephemeral key).
    pub encryption_key: Option<String>,

    // --- Email gateway --- //
    pub email_base_url: String,
    pub email_api_key: SecretString,
    pub email_from: String,
}

impl Config {
    pub fn load(args: EngineArgs, rng: &SysRng) -> anyhow::Result<Self> {
        let deploy_env = match args.deploy_env {
            Some(deploy_env) => deploy_env,
            None => DeployEnv::from_env().unwrap_or(DeployEnv::Dev),
        };

        let listen_addr = match args.listen_addr {
            Some(addr) => addr,
            None => match env::var("LISTEN_ADDR") {
                Ok(addr) =>
                    addr.parse().context("LISTEN_ADDR didn't parse")?,
                Err(_) => DEFAULT_LISTEN_ADDR,
            },
        };

        let database_url = args
            .database_url
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("DATABASE_URL is required")?;

        let public_url = env::var("PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://{listen_addr}"));

        let pp_base_url = env::var("PP_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_PP_BASE_URL.to_owned());
        let pp_client_id =
            env::var("PP_CLIENT_ID").context("PP_CLIENT_ID is required")?;
        let pp_secret_key = required_secret(deploy_env, rng, "PP_SECRET_KEY")?;
        let pp_webhook_secret =
            required_secret(deploy_env, rng, "PP_WEBHOOK_SECRET")?;

        let worker_secret = required_secret(deploy_env, rng, "WORKER_SECRET")?;
        let admin_key = required_secret(deploy_env, rng, "ADMIN_KEY")?;
        let session_secret =
            required_secret(deploy_env, rng, "SESSION_SECRET")?;

        let encryption_key = match env::var("ENCRYPTION_KEY") {
            Ok(key_hex) => {
                ensure!(
                    key_hex.len() == 64,
                    "ENCRYPTION_KEY must be 64 hex chars (32 bytes)"
                );
                Some(key_hex)
            }
            Err(_) => {
                ensure!(
                    deploy_env.is_dev(),
                    "ENCRYPTION_KEY is required in {deploy_env}"
                );
                None
            }
        };

        let email_base_url = env::var("EMAIL_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_EMAIL_BASE_URL.to_owned());
        let email_api_key = required_secret(deploy_env, rng, "EMAIL_API_KEY")?;
        let email_from = env::var("EMAIL_FROM")
            .unwrap_or_else(|_| "billing@recoup.dev".to_owned());

        Ok(Self {
            deploy_env,
            listen_addr,
            database_url,
            public_url,
            pp_base_url,
            pp_client_id,
            pp_secret_key,
            pp_webhook_secret,
            worker_secret,
            admin_key,
            session_secret,
            encryption_key,
            email_base_url,
            email_api_key,
            email_from,
        })
    }
}

/// Read a secret env var. Missing values are process-fatal in staging/prod
/// and fall back to an ephemeral random value (with a warning) in dev.
fn required_secret(
    deploy_env: DeployEnv,
    rng: &SysRng,
    name: &str,
) -> anyhow::Result<SecretString> {
    match env::var(name) {
        Ok(value) => Ok(SecretString::new(value)),
        Err(_) => {
            ensure!(
                deploy_env.is_dev(),
                "{name} is required in {deploy_env}"
            );
            tracing::warn!(
                "{name} not set; using an ephemeral random value (dev only)"
            );
            Ok(SecretString::new(rng.gen_hex::<32>()))
        }
    }
}
