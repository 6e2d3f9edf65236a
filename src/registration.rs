//! Turns provisioned validator keys into one on-chain registration batch.
//!
//! Every deposit-data root handed over by the provisioning service is recomputed
//! through the manager's `generateDepositRoot` view before submission. A record whose
//! root disagrees is marked `RootMismatch`, left out of the batch and never offered
//! again; the remaining records are still registered.

use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::chain::contracts::{self, ValidatorData};
use crate::chain::{first_bytes, first_uint, first_word, view, ChainGateway, TxReceipt};
use crate::constants::{ETH1_ADDRESS_WITHDRAWAL_PREFIX, WITHDRAWAL_CREDENTIALS_BYTES};
use crate::errors::{GatewayError, RegistrationError};
use crate::provisioning::{Provisioner, ValidatorRecord, ValidatorStatus};

/// The execution address encoded in 0x01 withdrawal credentials.
pub fn withdrawal_address(credentials: &[u8]) -> Result<Address, RegistrationError> {
    if credentials.len() != WITHDRAWAL_CREDENTIALS_BYTES
        || credentials[0] != ETH1_ADDRESS_WITHDRAWAL_PREFIX
    {
        return Err(RegistrationError::Credentials(format!(
            "0x{}",
            hex::encode(credentials)
        )));
    }
    Ok(Address::from_slice(&credentials[12..]))
}

#[derive(Clone, Debug)]
pub struct RegistrationResult {
    pub node_id: U256,
    pub withdrawal_address: Address,
    /// Every record considered, `Registered` or `RootMismatch`.
    pub records: Vec<ValidatorRecord>,
    pub receipt: TxReceipt,
}

impl RegistrationResult {
    pub fn registered(&self) -> usize {
        self.count(ValidatorStatus::Registered)
    }

    pub fn rejected(&self) -> usize {
        self.count(ValidatorStatus::RootMismatch)
    }

    fn count(&self, status: ValidatorStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

pub struct RegistrationPipeline {
    gateway: Arc<dyn ChainGateway>,
    provisioner: Arc<Provisioner>,
    manager: Address,
    deposit_contract: Option<Address>,
}

impl RegistrationPipeline {
    /// `manager` is the staking-nodes manager. Without a `deposit_contract` the batch is
    /// anchored to the zero root.
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        provisioner: Arc<Provisioner>,
        manager: Address,
        deposit_contract: Option<Address>,
    ) -> Self {
        RegistrationPipeline {
            gateway,
            provisioner,
            manager,
            deposit_contract,
        }
    }

    pub async fn next_node_id(&self) -> Result<U256, GatewayError> {
        let call = contracts::next_node_id()?;
        let tokens = view(self.gateway.as_ref(), self.manager, &call).await?;
        first_uint(&call, tokens)
    }

    pub async fn withdrawal_credentials(&self, node_id: U256) -> Result<Vec<u8>, GatewayError> {
        let call = contracts::withdrawal_credentials(node_id)?;
        let tokens = view(self.gateway.as_ref(), self.manager, &call).await?;
        first_bytes(&call, tokens)
    }

    /// The root the chain computes for `record` under `credentials`.
    pub async fn recompute_root(
        &self,
        record: &ValidatorRecord,
        credentials: &[u8],
        amount: U256,
    ) -> Result<H256, GatewayError> {
        let call = contracts::generate_deposit_root(
            &record.public_key,
            &record.signature,
            credentials,
            amount,
        )?;
        let tokens = view(self.gateway.as_ref(), self.manager, &call).await?;
        first_word(&call, tokens)
    }

    /// Marks each record `RootComputed` or `RootMismatch`.
    pub async fn validate_roots(
        &self,
        records: Vec<ValidatorRecord>,
        credentials: &[u8],
        amount: U256,
    ) -> Result<Vec<ValidatorRecord>, GatewayError> {
        let mut checked = Vec::with_capacity(records.len());
        for mut record in records {
            let root = self.recompute_root(&record, credentials, amount).await?;
            if root == record.deposit_data_root {
                record.status = ValidatorStatus::RootComputed;
            } else {
                error!(
                    "Deposit root mismatch for validator 0x{}: provider {:?}, chain {:?}",
                    hex::encode(&record.public_key),
                    record.deposit_data_root,
                    root
                );
                record.status = ValidatorStatus::RootMismatch;
            }
            checked.push(record);
        }
        Ok(checked)
    }

    async fn deposit_root_anchor(&self) -> Result<H256, GatewayError> {
        match self.deposit_contract {
            Some(deposit_contract) => {
                let call = contracts::get_deposit_root()?;
                let tokens = view(self.gateway.as_ref(), deposit_contract, &call).await?;
                first_word(&call, tokens)
            }
            None => Ok(H256::zero()),
        }
    }

    /// Registers `count` validators for `node_id`, each staking `stake`.
    ///
    /// `cancel` only interrupts the wait for provisioned keys. Once the batch is
    /// submitted it is awaited to the end, and a failed submission is not retried.
    pub async fn register(
        &self,
        node_id: U256,
        stake: U256,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<RegistrationResult, RegistrationError> {
        let credentials = self.withdrawal_credentials(node_id).await?;
        let withdrawal_address = withdrawal_address(&credentials)?;
        info!("Node {node_id} withdraws to {withdrawal_address:?}");

        let mut records = self
            .provisioner
            .await_provisioned(withdrawal_address, count, cancel)
            .await?;
        records.truncate(count);

        let records = self.validate_roots(records, &credentials, stake).await?;
        let mut rejected = 0;
        for record in records
            .iter()
            .filter(|r| r.status == ValidatorStatus::RootMismatch)
        {
            self.provisioner.reject(&record.public_key);
            rejected += 1;
        }
        let batch: Vec<ValidatorData<'_>> = records
            .iter()
            .filter(|r| r.status == ValidatorStatus::RootComputed)
            .map(|r| ValidatorData {
                public_key: &r.public_key,
                signature: &r.signature,
                deposit_data_root: r.deposit_data_root,
            })
            .collect();
        if batch.is_empty() {
            return Err(RegistrationError::NoValidRecords { rejected });
        }
        if rejected > 0 {
            warn!("Registering {} validators, {rejected} dropped", batch.len());
        }

        let anchor = self.deposit_root_anchor().await?;
        let call = contracts::register_validators(anchor, &batch)?;
        info!(
            "Submitting registerValidators for {} validators on node {node_id}",
            batch.len()
        );
        let receipt = self
            .gateway
            .send_transaction(self.manager, &call)
            .await
            .map_err(RegistrationError::Submission)?;
        info!("Registration mined in {:?}", receipt.tx_hash);

        let records = records
            .into_iter()
            .map(|mut r| {
                if r.status == ValidatorStatus::RootComputed {
                    r.status = ValidatorStatus::Registered;
                }
                r
            })
            .collect();
        Ok(RegistrationResult {
            node_id,
            withdrawal_address,
            records,
            receipt,
        })
    }
}
