//! Human readable ABI fragments of the protocol contracts this crate talks to.

use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256, U256};

use super::MethodCall;
use crate::errors::GatewayError;

pub const UPGRADE: &str = "function upgrade(address proxy, address implementation)";
pub const UPGRADE_AND_CALL: &str =
    "function upgradeAndCall(address proxy, address implementation, bytes data) payable";

pub const NEXT_NODE_ID: &str = "function getNextNodeIdToUse() view returns (uint256)";
pub const WITHDRAWAL_CREDENTIALS: &str =
    "function getWithdrawalCredentials(uint256 nodeId) view returns (bytes)";
pub const GENERATE_DEPOSIT_ROOT: &str = "function generateDepositRoot(bytes publicKey, bytes signature, bytes withdrawalCredentials, uint256 amount) pure returns (bytes32)";
pub const REGISTER_VALIDATORS: &str =
    "function registerValidators(bytes32 depositRoot, (bytes,bytes,bytes32)[] newValidators)";

pub const TOTAL_DEPOSITED_IN_VALIDATORS: &str =
    "function totalDepositedInValidators() view returns (uint256)";

pub const GET_DEPOSIT_ROOT: &str = "function get_deposit_root() view returns (bytes32)";

pub fn upgrade(proxy: Address, implementation: Address) -> Result<MethodCall, GatewayError> {
    MethodCall::new(
        UPGRADE,
        vec![Token::Address(proxy), Token::Address(implementation)],
    )
}

pub fn upgrade_and_call(
    proxy: Address,
    implementation: Address,
    data: Bytes,
) -> Result<MethodCall, GatewayError> {
    MethodCall::new(
        UPGRADE_AND_CALL,
        vec![
            Token::Address(proxy),
            Token::Address(implementation),
            Token::Bytes(data.to_vec()),
        ],
    )
}

pub fn next_node_id() -> Result<MethodCall, GatewayError> {
    MethodCall::new(NEXT_NODE_ID, vec![])
}

pub fn withdrawal_credentials(node_id: U256) -> Result<MethodCall, GatewayError> {
    MethodCall::new(WITHDRAWAL_CREDENTIALS, vec![Token::Uint(node_id)])
}

pub fn generate_deposit_root(
    public_key: &[u8],
    signature: &[u8],
    withdrawal_credentials: &[u8],
    amount: U256,
) -> Result<MethodCall, GatewayError> {
    MethodCall::new(
        GENERATE_DEPOSIT_ROOT,
        vec![
            Token::Bytes(public_key.to_vec()),
            Token::Bytes(signature.to_vec()),
            Token::Bytes(withdrawal_credentials.to_vec()),
            Token::Uint(amount),
        ],
    )
}

/// One `(publicKey, signature, depositDataRoot)` entry of a registration batch.
pub struct ValidatorData<'a> {
    pub public_key: &'a [u8],
    pub signature: &'a [u8],
    pub deposit_data_root: H256,
}

pub fn register_validators(
    deposit_root: H256,
    validators: &[ValidatorData<'_>],
) -> Result<MethodCall, GatewayError> {
    let batch = validators
        .iter()
        .map(|v| {
            Token::Tuple(vec![
                Token::Bytes(v.public_key.to_vec()),
                Token::Bytes(v.signature.to_vec()),
                Token::FixedBytes(v.deposit_data_root.as_bytes().to_vec()),
            ])
        })
        .collect();
    MethodCall::new(
        REGISTER_VALIDATORS,
        vec![
            Token::FixedBytes(deposit_root.as_bytes().to_vec()),
            Token::Array(batch),
        ],
    )
}

/// Served by the pool contract, not the staking-nodes manager.
pub fn total_deposited_in_validators() -> Result<MethodCall, GatewayError> {
    MethodCall::new(TOTAL_DEPOSITED_IN_VALIDATORS, vec![])
}

pub fn get_deposit_root() -> Result<MethodCall, GatewayError> {
    MethodCall::new(GET_DEPOSIT_ROOT, vec![])
}
