pub mod artifacts;
pub mod workflow;

use std::sync::Arc;

use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::Token;
use ethers::types::{Address, Bytes};
use log::{info, warn};
use serde::Serialize;

use crate::chain::{contracts, slot_to_address, ChainGateway, MethodCall};
use crate::constants::{
    EIP1967_ADMIN_SLOT, EIP1967_IMPLEMENTATION_SLOT, INITIALIZABLE_SLOT, PROXY_ADMIN_CONTRACT,
    PROXY_CONTRACT,
};
use crate::errors::{DeployError, GatewayError, ProxyError, ProxyInitError};
use artifacts::ArtifactSource;

/// A deployed transparent proxy and the `ProxyAdmin` allowed to upgrade it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProxyHandle {
    pub name: String,
    pub proxy: Address,
    pub admin: Address,
}

/// A contract known to the address registry.
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentUnit {
    pub logical_name: String,
    pub current_address: Address,
    pub implementation_address: Option<Address>,
    pub is_proxied: bool,
    pub init_args: Vec<String>,
}

/// Audit trail of one `upgrade` call. The implementation slot stays the source of truth.
#[derive(Clone, Debug, Serialize)]
pub struct ProxyUpgradeRecord {
    pub target_name: String,
    pub previous_implementation: Address,
    pub new_implementation: Address,
    pub initializer_args_used: Option<Vec<String>>,
    pub verified: bool,
}

impl ProxyUpgradeRecord {
    pub fn into_verified(self) -> Self {
        ProxyUpgradeRecord {
            verified: true,
            ..self
        }
    }
}

/// An initializer invocation: the human readable function plus its arguments.
#[derive(Clone, Debug)]
pub struct Initializer {
    call: MethodCall,
}

impl Initializer {
    pub fn new(signature: &str, args: Vec<Token>) -> Result<Self, GatewayError> {
        Ok(Initializer {
            call: MethodCall::new(signature, args)?,
        })
    }

    /// Tokenizes each string against the matching input of `signature`; tuples are
    /// written as `(a,b,c)`.
    pub fn from_strings(signature: &str, raw_args: &[String]) -> Result<Self, GatewayError> {
        let mut call = MethodCall::new(signature, vec![])?;
        if call.function.inputs.len() != raw_args.len() {
            return Err(GatewayError::Encode {
                method: call.function.signature(),
                reason: format!(
                    "expects {} arguments, got {}",
                    call.function.inputs.len(),
                    raw_args.len()
                ),
            });
        }
        call.args = call
            .function
            .inputs
            .iter()
            .zip(raw_args)
            .map(|(param, raw)| {
                LenientTokenizer::tokenize(&param.kind, raw).map_err(|e| GatewayError::Encode {
                    method: signature.to_string(),
                    reason: format!("argument {}: {e}", param.name),
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Initializer { call })
    }

    pub fn call(&self) -> &MethodCall {
        &self.call
    }

    pub fn calldata(&self) -> Result<Bytes, GatewayError> {
        self.call.encode()
    }

    pub fn describe_args(&self) -> Vec<String> {
        self.call.args.iter().map(|t| t.to_string()).collect()
    }
}

/// Deploys logic contracts and transparent proxies, initializes and upgrades them.
///
/// Deployment and initialization are two separate transactions. A proxy whose
/// initializer reverted still exists; `initialize` can be called again on it and is
/// a no-op once the initializer has run.
pub struct ProxyManager {
    gateway: Arc<dyn ChainGateway>,
    artifacts: Arc<dyn ArtifactSource>,
}

impl ProxyManager {
    pub fn new(gateway: Arc<dyn ChainGateway>, artifacts: Arc<dyn ArtifactSource>) -> Self {
        ProxyManager { gateway, artifacts }
    }

    pub fn gateway(&self) -> &Arc<dyn ChainGateway> {
        &self.gateway
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactSource> {
        &self.artifacts
    }

    async fn deploy_artifact(
        &self,
        name: &str,
        constructor_args: &[Token],
    ) -> Result<Address, DeployError> {
        let artifact = self.artifacts.artifact(name)?;
        let mut code = artifact.bytecode.to_vec();
        code.extend(ethers::abi::encode(constructor_args));

        let receipt = self
            .gateway
            .deploy_contract(code.into())
            .await
            .map_err(|source| DeployError::Send {
                name: name.to_string(),
                source,
            })?;
        let address = receipt.contract_address.ok_or(DeployError::MissingAddress {
            name: name.to_string(),
        })?;
        info!("{name} deployed to {address:?} in tx {:?}", receipt.tx_hash);
        Ok(address)
    }

    /// Deploys a fresh, uninitialized logic contract. Never retried: a blind retry
    /// can leave two deployments behind.
    pub async fn deploy_logic(&self, name: &str) -> Result<Address, DeployError> {
        self.deploy_artifact(name, &[]).await
    }

    pub async fn deploy_proxy_admin(&self) -> Result<Address, DeployError> {
        self.deploy_artifact(PROXY_ADMIN_CONTRACT, &[]).await
    }

    /// Deploys a proxy pointing at `logic` with empty init data, then runs the
    /// initializer through it when one is given.
    pub async fn deploy_proxy(
        &self,
        name: &str,
        logic: Address,
        admin: Address,
        initializer: Option<&Initializer>,
    ) -> Result<ProxyHandle, ProxyError> {
        info!("Deploy proxy for {name}");
        let proxy = self
            .deploy_artifact(
                PROXY_CONTRACT,
                &[
                    Token::Address(logic),
                    Token::Address(admin),
                    Token::Bytes(vec![]),
                ],
            )
            .await?;
        let handle = ProxyHandle {
            name: name.to_string(),
            proxy,
            admin,
        };
        if let Some(initializer) = initializer {
            self.initialize(&handle, initializer).await?;
        }
        Ok(handle)
    }

    pub async fn is_initialized(&self, proxy: Address) -> Result<bool, GatewayError> {
        let word = self
            .gateway
            .read_storage_slot(proxy, INITIALIZABLE_SLOT)
            .await?;
        Ok(word.as_bytes()[31] != 0)
    }

    /// Calls the initializer through the proxy unless it already ran.
    pub async fn initialize(
        &self,
        handle: &ProxyHandle,
        initializer: &Initializer,
    ) -> Result<(), ProxyInitError> {
        self.initialize_at(&handle.name, handle.proxy, initializer).await
    }

    /// Calls `initializer` on `target` unless its `Initializable` version is set.
    pub async fn initialize_at(
        &self,
        name: &str,
        target: Address,
        initializer: &Initializer,
    ) -> Result<(), ProxyInitError> {
        let init_err = |source| ProxyInitError {
            name: name.to_string(),
            proxy: target,
            source,
        };
        if self.is_initialized(target).await.map_err(init_err)? {
            info!("{name} at {target:?} is already initialized");
            return Ok(());
        }

        info!("Initializing {name} with {:?}", initializer.describe_args());
        match self
            .gateway
            .send_transaction(target, initializer.call())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                // somebody else may have initialized it between the read and our send
                if e.is_revert() && self.is_initialized(target).await.unwrap_or(false) {
                    warn!("{name} initializer reverted but it is initialized: {e}");
                    return Ok(());
                }
                Err(init_err(e))
            }
        }
    }

    /// Reads the implementation pointer straight from the EIP-1967 slot.
    pub async fn resolve_implementation(&self, proxy: Address) -> Result<Address, GatewayError> {
        let word = self
            .gateway
            .read_storage_slot(proxy, EIP1967_IMPLEMENTATION_SLOT)
            .await?;
        Ok(slot_to_address(word))
    }

    pub async fn resolve_admin(&self, proxy: Address) -> Result<Address, GatewayError> {
        let word = self.gateway.read_storage_slot(proxy, EIP1967_ADMIN_SLOT).await?;
        Ok(slot_to_address(word))
    }

    /// Builds a handle for an already deployed proxy.
    pub async fn handle_for(&self, name: &str, proxy: Address) -> Result<ProxyHandle, ProxyError> {
        if self.resolve_implementation(proxy).await?.is_zero() {
            return Err(ProxyError::NotAProxy(proxy));
        }
        Ok(ProxyHandle {
            name: name.to_string(),
            proxy,
            admin: self.resolve_admin(proxy).await?,
        })
    }

    /// Points the proxy at `new_logic`, optionally re-running an initializer in the
    /// same transaction. Upgrading to the implementation already in place is a no-op.
    pub async fn upgrade(
        &self,
        handle: &ProxyHandle,
        new_logic: Address,
        reinitializer: Option<&Initializer>,
    ) -> Result<ProxyUpgradeRecord, ProxyError> {
        let previous = self.resolve_implementation(handle.proxy).await?;
        if previous.is_zero() {
            return Err(ProxyError::NotAProxy(handle.proxy));
        }
        if previous == new_logic {
            info!(
                "{} already points at {new_logic:?}, nothing to upgrade",
                handle.name
            );
            return Ok(ProxyUpgradeRecord {
                target_name: handle.name.clone(),
                previous_implementation: previous,
                new_implementation: new_logic,
                initializer_args_used: None,
                verified: false,
            });
        }

        info!("Upgrade proxy for {} from {previous:?} to {new_logic:?}", handle.name);
        let call = match reinitializer {
            Some(init) => contracts::upgrade_and_call(handle.proxy, new_logic, init.calldata()?)?,
            None => contracts::upgrade(handle.proxy, new_logic)?,
        };
        self.gateway
            .send_transaction(handle.admin, &call)
            .await
            .map_err(|source| match reinitializer {
                Some(_) if source.is_revert() => ProxyError::Init(ProxyInitError {
                    name: handle.name.clone(),
                    proxy: handle.proxy,
                    source,
                }),
                _ => ProxyError::Gateway(source),
            })?;

        let actual = self.resolve_implementation(handle.proxy).await?;
        if actual != new_logic {
            return Err(ProxyError::NotApplied {
                proxy: handle.proxy,
                expected: new_logic,
                actual,
            });
        }
        info!("Upgraded {}", handle.name);
        Ok(ProxyUpgradeRecord {
            target_name: handle.name.clone(),
            previous_implementation: previous,
            new_implementation: new_logic,
            initializer_args_used: reinitializer.map(Initializer::describe_args),
            verified: false,
        })
    }
}
