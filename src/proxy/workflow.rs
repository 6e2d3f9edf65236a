//! Operator-driven deploy and upgrade workflows. The registry is written after every
//! step that changed the chain, and never for a step that failed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ethers::abi::Token;
use ethers::types::{Address, Bytes};
use log::{info, warn};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{DeploymentUnit, Initializer, ProxyHandle, ProxyManager, ProxyUpgradeRecord};
use crate::constants::{DEFAULT_INITIALIZER, PROXY_ADMIN_CONTRACT, PROXY_ADMIN_KEY, PROXY_CONTRACT};
use crate::errors::RegistryError;
use crate::explorer::{ExplorerApi, VerificationRequest, VerificationTask};
use crate::registry::{registry_key, AddressBook, AddressRegistry};

/// Ordered list of contracts to deploy, e.g. `deploy-plan.json`.
#[derive(Debug, Deserialize, Clone)]
pub struct DeploymentPlan {
    pub units: Vec<PlannedUnit>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PlannedUnit {
    pub name: String,
    #[serde(default = "default_proxied")]
    pub proxied: bool,
    /// Human readable initializer; defaults to `initialize()` when args are given.
    #[serde(default)]
    pub initializer: Option<String>,
    /// May reference registry entries as `@key` and the operator as `@deployer`.
    #[serde(default)]
    pub init_args: Vec<String>,
}

fn default_proxied() -> bool {
    true
}

impl PlannedUnit {
    fn initializer_signature(&self) -> Option<&str> {
        match (&self.initializer, self.init_args.is_empty()) {
            (Some(sig), _) => Some(sig.as_str()),
            (None, false) => Some(DEFAULT_INITIALIZER),
            (None, true) => None,
        }
    }
}

/// Replaces every `@key` in `raw` with the registered address.
pub fn resolve_references(raw: &str, book: &AddressBook) -> Result<String, RegistryError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('@') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let end = after
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(after.len());
        let key = &after[..end];
        let address = book
            .get(key)
            .ok_or_else(|| RegistryError::Missing(key.to_string()))?;
        out.push_str(&format!("{address:?}"));
        rest = &after[end..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Clone)]
pub struct VerifierSettings {
    pub api: Arc<dyn ExplorerApi>,
    pub retry_delay: Duration,
    pub status_poll: Duration,
}

pub struct Workflow {
    manager: ProxyManager,
    registry: Arc<dyn AddressRegistry>,
    verifier: Option<VerifierSettings>,
    cancel: CancellationToken,
}

impl Workflow {
    pub fn new(
        manager: ProxyManager,
        registry: Arc<dyn AddressRegistry>,
        verifier: Option<VerifierSettings>,
        cancel: CancellationToken,
    ) -> Self {
        Workflow {
            manager,
            registry,
            verifier,
            cancel,
        }
    }

    pub fn manager(&self) -> &ProxyManager {
        &self.manager
    }

    fn record(&self, key: &str, address: Address) -> Result<()> {
        self.registry
            .update(&|book| {
                book.insert(key.to_string(), address);
            })
            .with_context(|| format!("Failed to record {key} in the address registry"))?;
        Ok(())
    }

    fn initializer(&self, unit: &PlannedUnit, book: &AddressBook) -> Result<Option<Initializer>> {
        let Some(signature) = unit.initializer_signature() else {
            return Ok(None);
        };
        let mut book = book.clone();
        book.insert("deployer".to_string(), self.manager.gateway().sender());
        let args = unit
            .init_args
            .iter()
            .map(|raw| resolve_references(raw, &book))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Unresolved reference in init args of {}", unit.name))?;
        let init = Initializer::from_strings(signature, &args)
            .with_context(|| format!("Bad initializer for {}", unit.name))?;
        Ok(Some(init))
    }

    /// Starts background verification of `address` when an explorer is configured and
    /// the artifact carries verification metadata. Never fails the caller.
    pub fn verify(
        &self,
        name: &str,
        address: Address,
        constructor_args: Bytes,
    ) -> Option<VerificationTask> {
        let settings = self.verifier.as_ref()?;
        let request = self
            .manager
            .artifacts()
            .artifact(name)
            .map_err(|e| e.to_string())
            .and_then(|artifact| {
                VerificationRequest::from_artifact(&artifact, address, constructor_args)
                    .map_err(|e| e.to_string())
            });
        match request {
            Ok(request) => Some(VerificationTask::spawn(
                settings.api.clone(),
                request,
                settings.retry_delay,
                settings.status_poll,
                &self.cancel,
            )),
            Err(e) => {
                warn!("Skipping verification of {name} at {address:?}: {e}");
                None
            }
        }
    }

    /// The registered `ProxyAdmin`, deploying one on first use.
    pub async fn ensure_proxy_admin(&self, tasks: &mut Vec<VerificationTask>) -> Result<Address> {
        if let Some(admin) = self.registry.load()?.get(PROXY_ADMIN_KEY) {
            return Ok(*admin);
        }
        let admin = self.manager.deploy_proxy_admin().await?;
        self.record(PROXY_ADMIN_KEY, admin)?;
        tasks.extend(self.verify(PROXY_ADMIN_CONTRACT, admin, Bytes::default()));
        Ok(admin)
    }

    /// Deploys one unit. A unit already in the registry is not redeployed; if its
    /// initializer never ran, initialization is resumed.
    pub async fn deploy_unit(
        &self,
        unit: &PlannedUnit,
        tasks: &mut Vec<VerificationTask>,
    ) -> Result<DeploymentUnit> {
        let key = registry_key(&unit.name);
        let book = self.registry.load()?;
        let initializer = self.initializer(unit, &book)?;
        let init_args = initializer
            .as_ref()
            .map(Initializer::describe_args)
            .unwrap_or_default();

        if !unit.proxied {
            let address = match book.get(&key) {
                Some(&address) => {
                    info!("{} is already deployed at {address:?}", unit.name);
                    address
                }
                None => {
                    let address = self.manager.deploy_logic(&unit.name).await?;
                    // recorded before initializing so a failed initializer resumes
                    self.record(&key, address)?;
                    tasks.extend(self.verify(&unit.name, address, Bytes::default()));
                    address
                }
            };
            if let Some(init) = &initializer {
                self.manager.initialize_at(&unit.name, address, init).await?;
            }
            return Ok(DeploymentUnit {
                logical_name: unit.name.clone(),
                current_address: address,
                implementation_address: None,
                is_proxied: false,
                init_args,
            });
        }

        let handle = match book.get(&key) {
            Some(&proxy) => {
                info!("{} is already deployed at {proxy:?}", unit.name);
                self.manager.handle_for(&unit.name, proxy).await?
            }
            None => {
                let admin = self.ensure_proxy_admin(tasks).await?;
                let logic = self.manager.deploy_logic(&unit.name).await?;
                tasks.extend(self.verify(&unit.name, logic, Bytes::default()));

                let handle = self
                    .manager
                    .deploy_proxy(&unit.name, logic, admin, None)
                    .await?;
                // the proxy exists from here on, record it so a failed initializer resumes
                self.record(&key, handle.proxy)?;
                let ctor = ethers::abi::encode(&[
                    Token::Address(logic),
                    Token::Address(admin),
                    Token::Bytes(vec![]),
                ]);
                tasks.extend(self.verify(PROXY_CONTRACT, handle.proxy, ctor.into()));
                handle
            }
        };

        if let Some(init) = &initializer {
            self.manager.initialize(&handle, init).await?;
        }
        Ok(DeploymentUnit {
            logical_name: unit.name.clone(),
            current_address: handle.proxy,
            implementation_address: Some(self.manager.resolve_implementation(handle.proxy).await?),
            is_proxied: true,
            init_args,
        })
    }

    pub async fn deploy_plan(
        &self,
        plan: &DeploymentPlan,
    ) -> Result<(Vec<DeploymentUnit>, Vec<VerificationTask>)> {
        let mut tasks = Vec::new();
        let mut units = Vec::with_capacity(plan.units.len());
        for unit in &plan.units {
            let deployed = self
                .deploy_unit(unit, &mut tasks)
                .await
                .with_context(|| format!("Failed to deploy {}", unit.name))?;
            units.push(deployed);
        }
        Ok((units, tasks))
    }

    async fn registered_proxy(&self, name: &str) -> Result<ProxyHandle> {
        let key = registry_key(name);
        let proxy = self
            .registry
            .resolve(&key)
            .with_context(|| format!("No contract found with name {name}"))?;
        Ok(self.manager.handle_for(name, proxy).await?)
    }

    /// Upgrades the registered proxy of `name`. Without `implementation` a fresh logic
    /// contract is deployed from the artifact of the same name.
    pub async fn upgrade_by_name(
        &self,
        name: &str,
        implementation: Option<Address>,
        initializer: Option<(&str, &[String])>,
    ) -> Result<(ProxyUpgradeRecord, Vec<VerificationTask>)> {
        let handle = self.registered_proxy(name).await?;
        let mut tasks = Vec::new();

        let reinit = match initializer {
            Some((signature, raw_args)) => {
                let mut book = self.registry.load()?;
                book.insert("deployer".to_string(), self.manager.gateway().sender());
                let args = raw_args
                    .iter()
                    .map(|raw| resolve_references(raw, &book))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(Initializer::from_strings(signature, &args)?)
            }
            None => None,
        };

        let logic = match implementation {
            Some(logic) => logic,
            None => {
                let logic = self.manager.deploy_logic(name).await?;
                tasks.extend(self.verify(name, logic, Bytes::default()));
                logic
            }
        };

        let record = self
            .manager
            .upgrade(&handle, logic, reinit.as_ref())
            .await
            .with_context(|| format!("Failed to upgrade {name}"))?;

        // the proxy address never changes; rewrite the book from a fresh read
        let book = self.registry.load()?;
        if book.get(&registry_key(name)) != Some(&handle.proxy) {
            bail!("Registry entry of {name} changed during the upgrade");
        }
        self.registry.replace(&book)?;
        Ok((record, tasks))
    }

    /// Verification of a registered contract, or of `address` when given. For a proxy
    /// the live implementation is verified under `name`.
    pub async fn verify_registered(
        &self,
        name: &str,
        address: Option<Address>,
    ) -> Result<Vec<VerificationTask>> {
        if self.verifier.is_none() {
            bail!("No explorer configured for this network");
        }
        let address = match address {
            Some(address) => address,
            None => self
                .registry
                .resolve(&registry_key(name))
                .with_context(|| format!("No contract found with name {name}"))?,
        };
        let implementation = self.manager.resolve_implementation(address).await?;
        let target = if implementation.is_zero() {
            address
        } else {
            info!("{name} at {address:?} is a proxy, verifying implementation {implementation:?}");
            implementation
        };
        Ok(self
            .verify(name, target, Bytes::default())
            .into_iter()
            .collect())
    }

    /// `(proxy, implementation)` of a registered proxy.
    pub async fn resolve(&self, name: &str) -> Result<(Address, Address)> {
        let handle = self.registered_proxy(name).await?;
        let implementation = self.manager.resolve_implementation(handle.proxy).await?;
        Ok((handle.proxy, implementation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{MockChain, MOCK_ADMIN_CODE, MOCK_PROXY_CODE};
    use crate::errors::{ProxyInitError, VerifyError};
    use crate::explorer::Submission;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExplorer {
        submitted: Mutex<Vec<(String, Address)>>,
    }

    #[async_trait]
    impl ExplorerApi for RecordingExplorer {
        async fn submit(&self, request: &VerificationRequest) -> Result<Submission, VerifyError> {
            self.submitted
                .lock()
                .unwrap()
                .push((request.name.clone(), request.address));
            Ok(Submission::AlreadyVerified)
        }

        async fn status(&self, _guid: &str) -> Result<crate::explorer::VerificationStatus, VerifyError> {
            Ok(crate::explorer::VerificationStatus::Verified)
        }
    }
    use crate::proxy::artifacts::MemoryArtifacts;
    use crate::registry::MemoryRegistry;

    fn workflow() -> (Arc<MockChain>, Arc<MemoryRegistry>, Workflow) {
        let chain = Arc::new(MockChain::new());
        let registry = Arc::new(MemoryRegistry::default());
        let mut artifacts = MemoryArtifacts::default();
        artifacts.insert(PROXY_CONTRACT, MOCK_PROXY_CODE.to_vec().into());
        artifacts.insert(PROXY_ADMIN_CONTRACT, MOCK_ADMIN_CODE.to_vec().into());
        artifacts.insert("ynETH", vec![0x60, 0x01].into());
        artifacts.insert("Oracle", vec![0x60, 0x02].into());
        let manager = ProxyManager::new(chain.clone(), Arc::new(artifacts));
        let wf = Workflow::new(manager, registry.clone(), None, CancellationToken::new());
        (chain, registry, wf)
    }

    fn plan() -> DeploymentPlan {
        serde_json::from_str(
            r#"{ "units": [
                { "name": "Oracle", "proxied": false },
                { "name": "ynETH",
                  "initializer": "function initialize((address,address))",
                  "initArgs": ["(@deployer,@oracle)"] }
            ] }"#,
        )
        .unwrap()
    }

    #[test]
    fn references_resolve_against_the_book() {
        let mut book = AddressBook::new();
        book.insert("oracle".into(), Address::repeat_byte(0x0a));
        let resolved = resolve_references("(@oracle,0x00)", &book).unwrap();
        assert_eq!(resolved, format!("({:?},0x00)", Address::repeat_byte(0x0a)));
        assert!(resolve_references("@missing", &book).is_err());
        assert_eq!(resolve_references("plain", &book).unwrap(), "plain");
    }

    #[tokio::test]
    async fn plan_deploys_and_records_every_unit() {
        let (chain, registry, wf) = workflow();
        let (units, tasks) = wf.deploy_plan(&plan()).await.unwrap();
        assert!(tasks.is_empty());

        let book = registry.load().unwrap();
        assert_eq!(book.len(), 3);
        assert_eq!(book["oracle"], units[0].current_address);
        assert_eq!(book["ynETH"], units[1].current_address);
        assert!(book.contains_key(PROXY_ADMIN_KEY));
        assert_eq!(chain.initialized_version(units[1].current_address), 1);

        // running the plan again deploys nothing new for the proxy
        let (again, _) = wf.deploy_plan(&plan()).await.unwrap();
        assert_eq!(again[1].current_address, units[1].current_address);
    }

    #[tokio::test]
    async fn failed_initializer_resumes_on_rerun() {
        let (chain, registry, wf) = workflow();
        let unit = PlannedUnit {
            name: "ynETH".into(),
            proxied: true,
            initializer: Some("function initialize(address admin)".into()),
            init_args: vec!["@deployer".into()],
        };
        let mut tasks = Vec::new();

        chain.fail_next("initialize");
        let err = wf.deploy_unit(&unit, &mut tasks).await.unwrap_err();
        assert!(err.downcast_ref::<ProxyInitError>().is_some());
        let proxy = registry.resolve("ynETH").unwrap();
        assert_eq!(chain.initialized_version(proxy), 0);

        let deploys = chain.sent().iter().filter(|m| *m == "deploy").count();
        let resumed = wf.deploy_unit(&unit, &mut tasks).await.unwrap();
        assert_eq!(resumed.current_address, proxy);
        assert_eq!(chain.initialized_version(proxy), 1);
        assert_eq!(
            chain.sent().iter().filter(|m| *m == "deploy").count(),
            deploys
        );
    }

    #[tokio::test]
    async fn registered_plain_unit_is_not_redeployed() {
        let (chain, registry, wf) = workflow();
        let plan: DeploymentPlan =
            serde_json::from_str(r#"{ "units": [{ "name": "Oracle", "proxied": false }] }"#).unwrap();

        let (first, _) = wf.deploy_plan(&plan).await.unwrap();
        let (second, _) = wf.deploy_plan(&plan).await.unwrap();
        assert_eq!(first[0].current_address, second[0].current_address);
        assert_eq!(registry.resolve("oracle").unwrap(), first[0].current_address);
        assert_eq!(chain.sent().iter().filter(|m| *m == "deploy").count(), 1);
    }

    #[tokio::test]
    async fn plain_unit_initializer_resumes_without_redeploy() {
        let (chain, registry, wf) = workflow();
        let unit = PlannedUnit {
            name: "Oracle".into(),
            proxied: false,
            initializer: Some("function initialize(address admin)".into()),
            init_args: vec!["@deployer".into()],
        };

        chain.fail_next("initialize");
        let err = wf.deploy_unit(&unit, &mut Vec::new()).await.unwrap_err();
        assert!(err.downcast_ref::<ProxyInitError>().is_some());
        let oracle = registry.resolve("oracle").unwrap();
        assert_eq!(chain.initialized_version(oracle), 0);

        let resumed = wf.deploy_unit(&unit, &mut Vec::new()).await.unwrap();
        assert_eq!(resumed.current_address, oracle);
        assert_eq!(chain.initialized_version(oracle), 1);
        assert_eq!(chain.sent().iter().filter(|m| *m == "deploy").count(), 1);
    }

    #[tokio::test]
    async fn failed_deploy_leaves_registry_untouched() {
        let (chain, registry, wf) = workflow();
        let unit = PlannedUnit {
            name: "Oracle".into(),
            proxied: false,
            initializer: None,
            init_args: vec![],
        };
        chain.fail_next("deploy");
        assert!(wf.deploy_unit(&unit, &mut Vec::new()).await.is_err());
        assert!(registry.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upgrade_by_name_keeps_the_proxy() {
        let (_chain, registry, wf) = workflow();
        wf.deploy_plan(&plan()).await.unwrap();
        let (proxy, v1) = wf.resolve("ynETH").await.unwrap();

        let (record, _) = wf.upgrade_by_name("ynETH", None, None).await.unwrap();
        assert_eq!(record.previous_implementation, v1);
        let (proxy_after, v2) = wf.resolve("ynETH").await.unwrap();
        assert_eq!(proxy_after, proxy);
        assert_eq!(v2, record.new_implementation);
        assert_eq!(registry.resolve("ynETH").unwrap(), proxy);

        let (same, _) = wf.upgrade_by_name("ynETH", Some(v2), None).await.unwrap();
        assert_eq!(same.previous_implementation, v2);
        assert_eq!(wf.resolve("ynETH").await.unwrap().1, v2);
    }

    #[tokio::test]
    async fn verification_targets_the_live_implementation() {
        let (chain, registry, _) = workflow();
        let explorer = Arc::new(RecordingExplorer::default());
        let mut artifacts = MemoryArtifacts::default();
        artifacts.insert(PROXY_CONTRACT, MOCK_PROXY_CODE.to_vec().into());
        artifacts.insert(PROXY_ADMIN_CONTRACT, MOCK_ADMIN_CODE.to_vec().into());
        artifacts.insert("ynETH", vec![0x60, 0x01].into());
        let wf = Workflow::new(
            ProxyManager::new(chain.clone(), Arc::new(artifacts)),
            registry,
            Some(VerifierSettings {
                api: explorer.clone(),
                retry_delay: Duration::from_secs(10),
                status_poll: Duration::from_secs(1),
            }),
            CancellationToken::new(),
        );
        let unit = PlannedUnit {
            name: "ynETH".into(),
            proxied: true,
            initializer: None,
            init_args: vec![],
        };
        let mut deploy_tasks = Vec::new();
        wf.deploy_unit(&unit, &mut deploy_tasks).await.unwrap();
        assert_eq!(deploy_tasks.len(), 3);
        for task in deploy_tasks {
            task.join().await.unwrap();
        }
        let (_, implementation) = wf.resolve("ynETH").await.unwrap();
        explorer.submitted.lock().unwrap().clear();

        let tasks = wf.verify_registered("ynETH", None).await.unwrap();
        assert_eq!(tasks.len(), 1);
        for task in tasks {
            assert_eq!(task.join().await.unwrap(), 1);
        }
        assert_eq!(
            *explorer.submitted.lock().unwrap(),
            vec![("ynETH".to_string(), implementation)]
        );
    }

    #[tokio::test]
    async fn verify_needs_an_explorer() {
        let (_chain, _registry, wf) = workflow();
        assert!(wf.verify_registered("ynETH", Some(Address::zero())).await.is_err());
    }

    #[tokio::test]
    async fn unknown_name_cannot_be_upgraded() {
        let (_chain, _registry, wf) = workflow();
        assert!(wf.upgrade_by_name("Nope", None, None).await.is_err());
    }
}
