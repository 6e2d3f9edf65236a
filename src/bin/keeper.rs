use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio_util::sync::CancellationToken;

use ynops::chain::{ChainGateway, EthersGateway};
use ynops::config::{env_secret, NetworkConfig};
use ynops::constants::{PRIVATE_KEY_ENV, PROVISIONING_API_KEY_ENV};
use ynops::keeper::{Keeper, KeeperSettings};
use ynops::provisioning::{HttpProvisioningClient, Provisioner};
use ynops::registration::RegistrationPipeline;
use ynops::registry::{AddressRegistry, JsonFileRegistry};
use ynops::shutdown::shutdown_signal;

/// Registers a validator each time the pool holds enough ETH for one
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The network to operate on, selects ./conf/<network>.json
    #[arg(short, long, default_value = "goerli")]
    network: String,

    /// The path to the JSON network config file, overrides --network
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args
        .config
        .unwrap_or_else(|| NetworkConfig::path_for_network(&args.network));
    let config = NetworkConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    ynops::logging::init(&config.log_level);
    info!("Starting keeper on {}", config.network_name);

    let private_key = env_secret(PRIVATE_KEY_ENV)?;
    let provisioning = config.provisioning()?;
    let api_key = env_secret(PROVISIONING_API_KEY_ENV)?;

    // addresses are read once at startup; the keeper never writes the registry
    let registry = JsonFileRegistry::new(&config.registry_path);
    let pool = registry.resolve(&config.keeper.pool_key)?;
    let manager = registry.resolve(&config.keeper.manager_key)?;
    let deposit_contract = config
        .keeper
        .deposit_contract_key
        .as_deref()
        .map(|key| registry.resolve(key))
        .transpose()?;

    let gateway: Arc<dyn ChainGateway> = Arc::new(
        EthersGateway::connect(
            &config.rpc_url,
            &private_key,
            config.chain_id,
            config.confirmations,
        )
        .await?,
    );
    let service = Arc::new(HttpProvisioningClient::new(
        &provisioning.base_url,
        &provisioning.network,
        &api_key,
        provisioning.page_size,
    ));
    let provisioner = Arc::new(Provisioner::new(
        service,
        provisioning.poll_interval(),
        provisioning.per_poll_retries,
    ));
    let pipeline = RegistrationPipeline::new(gateway.clone(), provisioner, manager, deposit_contract);
    let settings = KeeperSettings::from_config(&config.keeper, pool)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    Keeper::new(gateway, pipeline, settings).run(&shutdown).await;
    Ok(())
}
