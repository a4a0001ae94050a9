//! recoup CLI

use std::net::SocketAddr;

use recoup_common::env::DeployEnv;

/// recoup payment-recovery engine
#[derive(argh::FromArgs)]
pub struct EngineArgs {
    /// the <ip-address:port> to listen on.
    ///
    /// Default: `127.0.0.1:8420`.
    /// Env: `LISTEN_ADDR`.
    #[argh(option)]
    pub listen_addr: Option<SocketAddr>,

    /// the current deployment environment.
    /// one of: ["dev", "staging", "prod"].
    ///
    /// Default: "dev".
    /// Env: `DEPLOY_ENVIRONMENT`.
    #[argh(option)]
    pub deploy_env: Option<DeployEnv>,

    /// postgres connection string.
    ///
    /// Required: true.
    /// Env: `DATABASE_URL`.
    #[argh(option)]
    pub database_url: Option<String>,
}

impl EngineArgs {
    pub fn from_cli() -> Self {
        argh::from_env()
    }
}
