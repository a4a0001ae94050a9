use anyhow::Context;
use recoup::{cli::EngineArgs, config::Config, logger, run::Engine};
use recoup_common::{env::DeployEnv, rng::SysRng};

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = EngineArgs::from_cli();

    // The logger needs the deploy env before full config validation runs.
    let deploy_env = args
        .deploy_env
        .unwrap_or_else(|| DeployEnv::from_env().unwrap_or(DeployEnv::Dev));
    logger::init(deploy_env);

    let rng = SysRng::new();
    let config = Config::load(args, &rng)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    rt.block_on(async {
        let engine = Engine::init(config).await?;
        let spawn_ctrlc_handler = true;
        engine.run(spawn_ctrlc_handler).await
    })
}
