pub mod http;
pub mod mock;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::constants::PER_POLL_RETRY_DELAY_MS;
use crate::errors::ProvisioningError;

pub use http::HttpProvisioningClient;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorStatus {
    Provisioned,
    RootComputed,
    RootMismatch,
    Registered,
}

/// A validator key provisioned by the external service. The deposit-data root it
/// carries is advisory until recomputed on chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidatorRecord {
    pub public_key: Bytes,
    pub signature: Bytes,
    pub deposit_data_root: H256,
    pub withdrawal_credentials: Bytes,
    pub status: ValidatorStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProvisioningRequest {
    pub network: String,
    pub withdrawal_address: Address,
    #[serde(rename = "validators_count")]
    pub requested_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestAccepted {
    pub request_id: Option<String>,
    pub requested_count: usize,
}

/// The external validator-key provisioning service.
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    /// Acceptance only means the provider queued the work.
    async fn request_provisioning(
        &self,
        withdrawal_address: Address,
        count: usize,
    ) -> Result<RequestAccepted, ProvisioningError>;

    /// Every validator in the provider's ready state for `withdrawal_address`, all
    /// pages drained.
    async fn list_provisioned(
        &self,
        withdrawal_address: Address,
    ) -> Result<Vec<ValidatorRecord>, ProvisioningError>;
}

/// Drives a `ProvisioningService` until enough validators are ready.
///
/// At most one provisioning request is outstanding per withdrawal address. A request
/// stays outstanding, across cancelled waits too, until a listing shows the target it
/// was sized for. Rejected keys are left out of every later listing, so they never
/// count toward a target.
pub struct Provisioner {
    service: Arc<dyn ProvisioningService>,
    poll_interval: Duration,
    per_poll_retries: u32,
    outstanding: Mutex<HashMap<Address, usize>>,
    rejected: Mutex<HashSet<Vec<u8>>>,
}

impl Provisioner {
    pub fn new(
        service: Arc<dyn ProvisioningService>,
        poll_interval: Duration,
        per_poll_retries: u32,
    ) -> Self {
        Provisioner {
            service,
            poll_interval,
            per_poll_retries,
            outstanding: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    fn rejected(&self) -> std::sync::MutexGuard<'_, HashSet<Vec<u8>>> {
        self.rejected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drops `public_key` from every later listing.
    pub fn reject(&self, public_key: &[u8]) {
        if self.rejected().insert(public_key.to_vec()) {
            warn!("Validator 0x{} will not be used again", hex::encode(public_key));
        }
    }

    pub fn is_rejected(&self, public_key: &[u8]) -> bool {
        self.rejected().contains(public_key)
    }

    fn outstanding(&self) -> std::sync::MutexGuard<'_, HashMap<Address, usize>> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn outstanding_for(&self, withdrawal_address: Address) -> Option<usize> {
        self.outstanding().get(&withdrawal_address).copied()
    }

    /// One listing without rejected keys, retried a bounded number of times on
    /// transient errors.
    pub async fn list_with_retry(
        &self,
        withdrawal_address: Address,
    ) -> Result<Vec<ValidatorRecord>, ProvisioningError> {
        let mut attempt = 0;
        loop {
            match self.service.list_provisioned(withdrawal_address).await {
                Ok(mut records) => {
                    let rejected = self.rejected();
                    records.retain(|r| !rejected.contains(&r.public_key[..]));
                    return Ok(records);
                }
                Err(e) if e.is_transient() && attempt < self.per_poll_retries => {
                    attempt += 1;
                    debug!("Listing provisioned validators failed ({e}), retry {attempt}");
                    tokio::time::sleep(Duration::from_millis(PER_POLL_RETRY_DELAY_MS)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Polls until at least `target` validators are ready, requesting the shortfall
    /// once. Waits as long as the provider needs; only `cancel` ends the wait early.
    pub async fn await_provisioned(
        &self,
        withdrawal_address: Address,
        target: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ValidatorRecord>, ProvisioningError> {
        let available = self.list_with_retry(withdrawal_address).await?;
        if available.len() >= target {
            self.outstanding().remove(&withdrawal_address);
            return Ok(available);
        }

        match self.outstanding_for(withdrawal_address) {
            Some(pending) => info!(
                "A request for {pending} validators to {withdrawal_address:?} is still outstanding"
            ),
            None => {
                let needed = target.saturating_sub(available.len());
                info!("Requesting {needed} validators for {withdrawal_address:?}");
                let accepted = self
                    .service
                    .request_provisioning(withdrawal_address, needed)
                    .await?;
                debug!("Provisioning request accepted: {accepted:?}");
                self.outstanding().insert(withdrawal_address, target);
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisioningError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            match self.list_with_retry(withdrawal_address).await {
                Ok(records) if records.len() >= target => {
                    self.outstanding().remove(&withdrawal_address);
                    info!(
                        "{} validators ready for {withdrawal_address:?}",
                        records.len()
                    );
                    return Ok(records);
                }
                Ok(records) => debug!(
                    "{}/{target} validators ready for {withdrawal_address:?}",
                    records.len()
                ),
                Err(e) if e.is_transient() => {
                    warn!("Provisioning service unavailable, polling again: {e}")
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockProvisioningService;
    use super::*;
    use ethers::types::U256;

    fn provisioner(service: Arc<MockProvisioningService>) -> Provisioner {
        Provisioner::new(service, Duration::from_secs(10), 2)
    }

    fn service() -> Arc<MockProvisioningService> {
        Arc::new(MockProvisioningService::new(
            vec![0x01; 32],
            U256::exp10(18) * 32,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_target_with_a_single_request() {
        let service = service();
        service.set_release_per_list(1);
        let p = provisioner(service.clone());
        let addr = Address::repeat_byte(0xa1);

        let records = p
            .await_provisioned(addr, 3, &CancellationToken::new())
            .await
            .unwrap();
        assert!(records.len() >= 3);
        assert_eq!(service.requests(), vec![(addr, 3)]);
        assert_eq!(p.outstanding_for(addr), None);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_shortfall_is_requested() {
        let service = service();
        service.preload(2);
        let p = provisioner(service.clone());
        let addr = Address::repeat_byte(0xa1);

        let records = p
            .await_provisioned(addr, 5, &CancellationToken::new())
            .await
            .unwrap();
        assert!(records.len() >= 5);
        assert_eq!(service.requests(), vec![(addr, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn enough_ready_means_no_request() {
        let service = service();
        service.preload(1);
        let p = provisioner(service.clone());
        let records = p
            .await_provisioned(Address::zero(), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(service.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_does_not_re_request() {
        let service = service();
        service.set_release_per_list(0);
        let p = provisioner(service.clone());
        let addr = Address::repeat_byte(0xa1);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });
        assert!(matches!(
            p.await_provisioned(addr, 1, &cancel).await,
            Err(ProvisioningError::Cancelled)
        ));
        assert_eq!(p.outstanding_for(addr), Some(1));

        // the first request is still outstanding: poll without asking again
        service.set_release_per_list(1);
        let records = p
            .await_provisioned(addr, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(service.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_keys_do_not_count_toward_the_target() {
        let service = service();
        service.preload(1);
        let p = provisioner(service.clone());
        let addr = Address::repeat_byte(0xa1);
        p.reject(&[1u8; 48]);
        assert!(p.is_rejected(&[1u8; 48]));

        let records = p
            .await_provisioned(addr, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].public_key.as_ref(), &[2u8; 48][..]);
        assert_eq!(service.requests(), vec![(addr, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_listing_errors_are_absorbed() {
        let service = service();
        service.preload(1);
        service.fail_lists(2);
        let p = provisioner(service.clone());
        let records = p
            .await_provisioned(Address::zero(), 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
