use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ethers::types::Address;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use ynops::chain::{ChainGateway, EthersGateway};
use ynops::config::{env_secret, NetworkConfig};
use ynops::constants::{EXPLORER_API_KEY_ENV, PRIVATE_KEY_ENV};
use ynops::explorer::{EtherscanClient, VerificationTask};
use ynops::proxy::artifacts::ArtifactDir;
use ynops::proxy::workflow::{DeploymentPlan, VerifierSettings, Workflow};
use ynops::proxy::ProxyManager;
use ynops::registry::JsonFileRegistry;
use ynops::shutdown::shutdown_signal;

/// Deploys, upgrades and verifies proxied protocol contracts
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The network to operate on, selects ./conf/<network>.json
    #[arg(short, long, default_value = "goerli")]
    network: String,

    /// The path to the JSON network config file, overrides --network
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exit as soon as the chain work is done instead of waiting for explorer verification
    #[arg(long)]
    no_wait_verify: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploys every unit of a deployment plan, skipping proxies already registered
    Deploy {
        /// The path to the deployment plan JSON
        #[arg(short, long)]
        plan: PathBuf,
    },
    /// Upgrades the registered proxy of a contract
    Upgrade {
        /// The contract name, e.g. ynETH
        #[arg(long)]
        contract: String,

        /// An already deployed implementation; a fresh one is deployed when omitted
        #[arg(long)]
        implementation: Option<String>,

        /// Human readable initializer to call during the upgrade
        #[arg(long)]
        initializer: Option<String>,

        /// Initializer arguments; `@key` resolves to a registered address
        #[arg(long, num_args = 0.., requires = "initializer")]
        init_args: Vec<String>,
    },
    /// Verifies a registered contract (the implementation, for a proxy)
    Verify {
        #[arg(long)]
        contract: String,

        /// Verify this address instead of the registered one
        #[arg(long)]
        address: Option<String>,
    },
    /// Prints the proxy and the implementation read from its storage slot
    Resolve {
        #[arg(long)]
        contract: String,
    },
}

fn parse_address(raw: &str) -> Result<Address> {
    raw.parse::<Address>()
        .with_context(|| format!("Bad address {raw}"))
}

/// Waits for every verification task, or stops them all when `wait` is false.
/// Returns whether every contract ended up verified.
async fn finish_verification(tasks: Vec<VerificationTask>, wait: bool) -> bool {
    if tasks.is_empty() {
        return false;
    }
    if !wait {
        info!("Leaving {} verifications unfinished", tasks.len());
        tasks.iter().for_each(VerificationTask::stop);
    }
    let mut all_verified = true;
    for task in tasks {
        let name = task.name.clone();
        let address = task.address;
        match task.join().await {
            Ok(attempts) => info!("{name} at {address:?} verified after {attempts} attempts"),
            Err(e) => {
                all_verified = false;
                warn!("Verification of {name} at {address:?} stopped: {e}");
            }
        }
    }
    all_verified
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| NetworkConfig::path_for_network(&args.network));
    let config = NetworkConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    ynops::logging::init(&config.log_level);

    let private_key = env_secret(PRIVATE_KEY_ENV)?;
    let gateway: Arc<dyn ChainGateway> = Arc::new(
        EthersGateway::connect(
            &config.rpc_url,
            &private_key,
            config.chain_id,
            config.confirmations,
        )
        .await?,
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let verifier = match (&config.explorer, env_secret(EXPLORER_API_KEY_ENV)) {
        (Some(explorer), Ok(api_key)) => Some(VerifierSettings {
            api: Arc::new(EtherscanClient::new(&explorer.api_url, &api_key)),
            retry_delay: explorer.retry_delay(),
            status_poll: explorer.status_poll(),
        }),
        (Some(_), Err(e)) => {
            warn!("{e}, explorer verification disabled");
            None
        }
        (None, _) => None,
    };
    let workflow = Workflow::new(
        ProxyManager::new(gateway, Arc::new(ArtifactDir::new(&config.artifacts_dir))),
        Arc::new(JsonFileRegistry::new(&config.registry_path)),
        verifier,
        cancel.clone(),
    );
    let wait = !args.no_wait_verify;

    match args.command {
        Command::Deploy { plan } => {
            let raw = std::fs::read_to_string(&plan)
                .with_context(|| format!("Failed to read {}", plan.display()))?;
            let plan: DeploymentPlan = serde_json::from_str(&raw).context("Bad deployment plan")?;
            let (units, tasks) = workflow.deploy_plan(&plan).await?;
            println!("{}", serde_json::to_string_pretty(&units)?);
            finish_verification(tasks, wait).await;
        }
        Command::Upgrade {
            contract,
            implementation,
            initializer,
            init_args,
        } => {
            let implementation = implementation.as_deref().map(parse_address).transpose()?;
            let initializer = initializer
                .as_deref()
                .map(|signature| (signature, init_args.as_slice()));
            let (record, tasks) = workflow
                .upgrade_by_name(&contract, implementation, initializer)
                .await?;
            let record = if finish_verification(tasks, wait).await {
                record.into_verified()
            } else {
                record
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Verify { contract, address } => {
            let address = address.as_deref().map(parse_address).transpose()?;
            let tasks = workflow.verify_registered(&contract, address).await?;
            finish_verification(tasks, true).await;
        }
        Command::Resolve { contract } => {
            let (proxy, implementation) = workflow.resolve(&contract).await?;
            println!("{contract}: proxy {proxy:?}, implementation {implementation:?}");
        }
    }
    cancel.cancel();
    Ok(())
}
