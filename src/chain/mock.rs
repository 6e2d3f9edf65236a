//! In-memory chain used by the test suites. It understands the handful of calls this
//! crate makes: proxy deployment, `ProxyAdmin` upgrades, initializers, and the
//! staking-nodes manager's registration surface.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

use super::{ChainGateway, MethodCall, TxReceipt};
use crate::constants::{
    DEPOSIT_AMOUNT_WEI, EIP1967_ADMIN_SLOT, EIP1967_IMPLEMENTATION_SLOT, INITIALIZABLE_SLOT,
};
use crate::errors::GatewayError;

/// Creation code the mock recognises as a transparent proxy.
pub const MOCK_PROXY_CODE: [u8; 4] = [0xfe, 0xed, 0x00, 0x01];
/// Creation code the mock recognises as a `ProxyAdmin`.
pub const MOCK_ADMIN_CODE: [u8; 4] = [0xfe, 0xed, 0x00, 0x02];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockContract {
    Logic(Bytes),
    Proxy,
    ProxyAdmin { owner: Address },
}

#[derive(Default)]
struct MockState {
    nonce: u64,
    contracts: HashMap<Address, MockContract>,
    storage: HashMap<(Address, H256), H256>,
    balances: HashMap<Address, U256>,
    registered_total: U256,
    registered_keys: Vec<Vec<u8>>,
    pool: Option<Address>,
    views: Vec<(Address, String)>,
    fail_next: Vec<String>,
    transient_failures: u32,
    sent: Vec<String>,
}

pub struct MockChain {
    sender: Address,
    withdrawal_address: Address,
    stake: U256,
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        MockChain {
            sender: Address::repeat_byte(0x5e),
            withdrawal_address: Address::repeat_byte(0xa1),
            stake: U256::from(DEPOSIT_AMOUNT_WEI),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_withdrawal_address(mut self, address: Address) -> Self {
        self.withdrawal_address = address;
        self
    }

    /// The credentials `getWithdrawalCredentials` answers with for every node.
    pub fn withdrawal_credentials(&self) -> Vec<u8> {
        let mut creds = vec![0x01];
        creds.extend_from_slice(&[0u8; 11]);
        creds.extend_from_slice(self.withdrawal_address.as_bytes());
        creds
    }

    /// Stand-in for the on-chain commitment function: keccak over the packed inputs.
    pub fn deposit_root(
        public_key: &[u8],
        signature: &[u8],
        withdrawal_credentials: &[u8],
        amount: U256,
    ) -> H256 {
        let mut packed = Vec::new();
        packed.extend_from_slice(public_key);
        packed.extend_from_slice(signature);
        packed.extend_from_slice(withdrawal_credentials);
        let mut word = [0u8; 32];
        amount.to_big_endian(&mut word);
        packed.extend_from_slice(&word);
        H256(keccak256(packed))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_pool(&self, pool: Address) {
        self.lock().pool = Some(pool);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.lock().balances.insert(address, balance);
    }

    pub fn deposit(&self, address: Address, amount: U256) {
        let mut state = self.lock();
        let entry = state.balances.entry(address).or_default();
        *entry += amount;
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.lock().balances.get(&address).copied().unwrap_or_default()
    }

    pub fn registered_total(&self) -> U256 {
        self.lock().registered_total
    }

    pub fn registered_keys(&self) -> Vec<Vec<u8>> {
        self.lock().registered_keys.clone()
    }

    pub fn contract(&self, address: Address) -> Option<MockContract> {
        self.lock().contracts.get(&address).cloned()
    }

    pub fn initialized_version(&self, proxy: Address) -> u8 {
        let state = self.lock();
        state
            .storage
            .get(&(proxy, INITIALIZABLE_SLOT))
            .map(|w| w.as_bytes()[31])
            .unwrap_or(0)
    }

    /// The next transaction calling `method` reverts.
    pub fn fail_next(&self, method: &str) {
        self.lock().fail_next.push(method.to_string());
    }

    /// The next `count` reads fail as if the node were unreachable.
    pub fn fail_reads(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    /// `(contract, method)` of every view call so far.
    pub fn views(&self) -> Vec<(Address, String)> {
        self.lock().views.clone()
    }

    /// Method names of every transaction mined so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    fn revert(reason: &str) -> GatewayError {
        GatewayError::Reverted {
            tx_hash: None,
            reason: reason.to_string(),
        }
    }

    fn receipt(state: &mut MockState, contract_address: Option<Address>) -> TxReceipt {
        state.nonce += 1;
        TxReceipt {
            tx_hash: H256::from_low_u64_be(state.nonce),
            block_number: Some(state.nonce),
            gas_used: Some(U256::from(21_000)),
            contract_address,
        }
    }

    fn take_failure(state: &mut MockState, method: &str) -> bool {
        match state.fail_next.iter().position(|m| m == method) {
            Some(i) => {
                state.fail_next.remove(i);
                true
            }
            None => false,
        }
    }

    fn take_transient(state: &mut MockState) -> Result<(), GatewayError> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(GatewayError::Transport("connection refused".into()));
        }
        Ok(())
    }

    fn initialize(state: &mut MockState, proxy: Address) -> Result<(), GatewayError> {
        let word = state.storage.entry((proxy, INITIALIZABLE_SLOT)).or_default();
        if word.as_bytes()[31] != 0 {
            return Err(Self::revert("Initializable: contract is already initialized"));
        }
        *word = H256::from_low_u64_be(1);
        Ok(())
    }

    fn set_implementation(state: &mut MockState, proxy: Address, implementation: Address) {
        state
            .storage
            .insert((proxy, EIP1967_IMPLEMENTATION_SLOT), H256::from(implementation));
    }
}

fn arg_address(call: &MethodCall, i: usize) -> Result<Address, GatewayError> {
    match call.args.get(i) {
        Some(Token::Address(a)) => Ok(*a),
        other => Err(GatewayError::Encode {
            method: call.name().to_string(),
            reason: format!("argument {i} is {other:?}"),
        }),
    }
}

fn arg_bytes(call: &MethodCall, i: usize) -> Vec<u8> {
    match call.args.get(i) {
        Some(Token::Bytes(b)) => b.clone(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl ChainGateway for MockChain {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn call_view(&self, contract: Address, call: &MethodCall) -> Result<Bytes, GatewayError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        state.views.push((contract, call.name().to_string()));
        let out = match call.name() {
            "getNextNodeIdToUse" => vec![Token::Uint(U256::zero())],
            "getWithdrawalCredentials" => vec![Token::Bytes(self.withdrawal_credentials())],
            "generateDepositRoot" => {
                let amount = match call.args.get(3) {
                    Some(Token::Uint(v)) => *v,
                    _ => U256::zero(),
                };
                let root = Self::deposit_root(
                    &arg_bytes(call, 0),
                    &arg_bytes(call, 1),
                    &arg_bytes(call, 2),
                    amount,
                );
                vec![Token::FixedBytes(root.as_bytes().to_vec())]
            }
            "totalDepositedInValidators" => {
                if state.pool.map_or(false, |pool| pool != contract) {
                    return Err(Self::revert("totalDepositedInValidators is only on the pool"));
                }
                vec![Token::Uint(state.registered_total)]
            }
            "get_deposit_root" => vec![Token::FixedBytes(vec![0xd0; 32])],
            other => return Err(Self::revert(&format!("mock has no view {other}"))),
        };
        Ok(ethers::abi::encode(&out).into())
    }

    async fn send_transaction(
        &self,
        contract: Address,
        call: &MethodCall,
    ) -> Result<TxReceipt, GatewayError> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, call.name()) {
            return Err(Self::revert(&format!("{} reverted", call.name())));
        }
        match (state.contracts.get(&contract).cloned(), call.name()) {
            (Some(MockContract::ProxyAdmin { owner }), "upgrade" | "upgradeAndCall") => {
                if owner != self.sender {
                    return Err(Self::revert("Ownable: caller is not the owner"));
                }
                let proxy = arg_address(call, 0)?;
                let implementation = arg_address(call, 1)?;
                if state.contracts.get(&proxy) != Some(&MockContract::Proxy) {
                    return Err(Self::revert("not a proxy"));
                }
                Self::set_implementation(&mut state, proxy, implementation);
                if call.name() == "upgradeAndCall" && !arg_bytes(call, 2).is_empty() {
                    // reinitializer: bump the initialized version
                    let word = state.storage.entry((proxy, INITIALIZABLE_SLOT)).or_default();
                    *word = H256::from_low_u64_be(word.to_low_u64_be() + 1);
                }
            }
            (Some(MockContract::Proxy | MockContract::Logic(_)), name)
                if name.starts_with("initialize") =>
            {
                Self::initialize(&mut state, contract)?;
            }
            (_, "registerValidators") => {
                let count = match call.args.get(1) {
                    Some(Token::Array(items)) => items.clone(),
                    _ => return Err(Self::revert("bad batch")),
                };
                let total = self.stake * U256::from(count.len());
                if let Some(pool) = state.pool {
                    let balance = state.balances.entry(pool).or_default();
                    if *balance < total {
                        return Err(Self::revert("insufficient pool balance"));
                    }
                    *balance -= total;
                }
                state.registered_total += total;
                for item in count {
                    if let Token::Tuple(fields) = item {
                        if let Some(Token::Bytes(pk)) = fields.first() {
                            state.registered_keys.push(pk.clone());
                        }
                    }
                }
            }
            _ => {}
        }
        state.sent.push(call.name().to_string());
        Ok(Self::receipt(&mut state, None))
    }

    async fn deploy_contract(&self, creation_code: Bytes) -> Result<TxReceipt, GatewayError> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, "deploy") {
            return Err(Self::revert("deployment ran out of gas"));
        }
        let address = Address::from_low_u64_be(0x1000 + state.nonce);
        let code = creation_code.as_ref();
        let contract = if code.starts_with(&MOCK_PROXY_CODE) {
            let tokens = ethers::abi::decode(
                &[ParamType::Address, ParamType::Address, ParamType::Bytes],
                &code[MOCK_PROXY_CODE.len()..],
            )
            .map_err(|e| Self::revert(&e.to_string()))?;
            if let (Token::Address(logic), Token::Address(admin)) = (&tokens[0], &tokens[1]) {
                Self::set_implementation(&mut state, address, *logic);
                state
                    .storage
                    .insert((address, EIP1967_ADMIN_SLOT), H256::from(*admin));
            }
            if matches!(&tokens[2], Token::Bytes(data) if !data.is_empty()) {
                Self::initialize(&mut state, address)?;
            }
            MockContract::Proxy
        } else if code.starts_with(&MOCK_ADMIN_CODE) {
            MockContract::ProxyAdmin { owner: self.sender }
        } else {
            MockContract::Logic(creation_code.clone())
        };
        state.contracts.insert(address, contract);
        state.sent.push("deploy".to_string());
        Ok(Self::receipt(&mut state, Some(address)))
    }

    async fn read_storage_slot(&self, address: Address, slot: H256) -> Result<H256, GatewayError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        Ok(state.storage.get(&(address, slot)).copied().unwrap_or_default())
    }

    async fn get_balance(&self, address: Address) -> Result<U256, GatewayError> {
        let mut state = self.lock();
        Self::take_transient(&mut state)?;
        Ok(state.balances.get(&address).copied().unwrap_or_default())
    }
}
