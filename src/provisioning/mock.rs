use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};

use super::{ProvisioningService, RequestAccepted, ValidatorRecord, ValidatorStatus};
use crate::chain::mock::MockChain;
use crate::errors::ProvisioningError;

struct MockProvisioningState {
    ready: Vec<ValidatorRecord>,
    pending: VecDeque<ValidatorRecord>,
    requests: Vec<(Address, usize)>,
    release_per_list: usize,
    failing_lists: u32,
    corrupt_next: usize,
    minted: u8,
}

/// A provider that provisions asynchronously: requested validators become ready a few
/// at a time on subsequent listings. Records carry roots computed the way
/// [`MockChain`] computes them.
pub struct MockProvisioningService {
    withdrawal_credentials: Vec<u8>,
    stake: U256,
    state: Mutex<MockProvisioningState>,
}

impl MockProvisioningService {
    pub fn new(withdrawal_credentials: Vec<u8>, stake: U256) -> Self {
        MockProvisioningService {
            withdrawal_credentials,
            stake,
            state: Mutex::new(MockProvisioningState {
                ready: Vec::new(),
                pending: VecDeque::new(),
                requests: Vec::new(),
                release_per_list: usize::MAX,
                failing_lists: 0,
                corrupt_next: 0,
                minted: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockProvisioningState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mint(&self, state: &mut MockProvisioningState) -> ValidatorRecord {
        state.minted += 1;
        let public_key = vec![state.minted; 48];
        let signature = vec![state.minted; 96];
        let mut root = MockChain::deposit_root(
            &public_key,
            &signature,
            &self.withdrawal_credentials,
            self.stake,
        );
        if state.corrupt_next > 0 {
            state.corrupt_next -= 1;
            root = H256::repeat_byte(0xee);
        }
        ValidatorRecord {
            public_key: public_key.into(),
            signature: signature.into(),
            deposit_data_root: root,
            withdrawal_credentials: self.withdrawal_credentials.clone().into(),
            status: ValidatorStatus::Provisioned,
        }
    }

    /// Makes `count` validators ready without a request.
    pub fn preload(&self, count: usize) {
        let mut state = self.lock();
        for _ in 0..count {
            let record = self.mint(&mut state);
            state.ready.push(record);
        }
    }

    /// How many pending validators each listing releases.
    pub fn set_release_per_list(&self, count: usize) {
        self.lock().release_per_list = count;
    }

    /// The next `count` listings answer 503.
    pub fn fail_lists(&self, count: u32) {
        self.lock().failing_lists = count;
    }

    /// The next `count` minted validators carry a wrong deposit-data root.
    pub fn corrupt_next(&self, count: usize) {
        self.lock().corrupt_next = count;
    }

    /// Validators currently listed as ready.
    pub fn ready(&self) -> Vec<ValidatorRecord> {
        self.lock().ready.clone()
    }

    pub fn requests(&self) -> Vec<(Address, usize)> {
        self.lock().requests.clone()
    }
}

#[async_trait]
impl ProvisioningService for MockProvisioningService {
    async fn request_provisioning(
        &self,
        withdrawal_address: Address,
        count: usize,
    ) -> Result<RequestAccepted, ProvisioningError> {
        let mut state = self.lock();
        state.requests.push((withdrawal_address, count));
        for _ in 0..count {
            let record = self.mint(&mut state);
            state.pending.push_back(record);
        }
        Ok(RequestAccepted {
            request_id: Some(format!("req-{}", state.requests.len())),
            requested_count: count,
        })
    }

    async fn list_provisioned(
        &self,
        _withdrawal_address: Address,
    ) -> Result<Vec<ValidatorRecord>, ProvisioningError> {
        let mut state = self.lock();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(ProvisioningError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        let release = state.release_per_list.min(state.pending.len());
        for _ in 0..release {
            if let Some(record) = state.pending.pop_front() {
                state.ready.push(record);
            }
        }
        Ok(state.ready.clone())
    }
}
