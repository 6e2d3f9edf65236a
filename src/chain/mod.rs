pub mod contracts;
pub mod ethers_gateway;
pub mod mock;

use async_trait::async_trait;
use ethers::abi::{Function, HumanReadableParser, Token};
use ethers::types::{Address, Bytes, H256, U256};

use crate::errors::GatewayError;

pub use ethers_gateway::EthersGateway;

/// A contract function together with the arguments it is invoked with.
#[derive(Clone, Debug)]
pub struct MethodCall {
    pub function: Function,
    pub args: Vec<Token>,
}

impl MethodCall {
    /// `signature` is human readable, e.g. `function totalDepositedInValidators() view returns (uint256)`.
    pub fn new(signature: &str, args: Vec<Token>) -> Result<Self, GatewayError> {
        let function =
            HumanReadableParser::parse_function(signature).map_err(|e| GatewayError::Encode {
                method: signature.to_string(),
                reason: e.to_string(),
            })?;
        Ok(MethodCall { function, args })
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn encode(&self) -> Result<Bytes, GatewayError> {
        self.function
            .encode_input(&self.args)
            .map(Bytes::from)
            .map_err(|e| GatewayError::Encode {
                method: self.function.signature(),
                reason: e.to_string(),
            })
    }

    pub fn decode_output(&self, output: &[u8]) -> Result<Vec<Token>, GatewayError> {
        self.function
            .decode_output(output)
            .map_err(|e| GatewayError::Decode {
                method: self.function.signature(),
                reason: e.to_string(),
            })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
    pub contract_address: Option<Address>,
}

/// Read/write access to a blockchain node. Every on-chain interaction of the
/// proxy manager, the registration pipeline and the keeper goes through this seam.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// The account transactions are sent from.
    fn sender(&self) -> Address;

    async fn call_view(&self, contract: Address, call: &MethodCall) -> Result<Bytes, GatewayError>;

    /// Sends the transaction and blocks until it is mined. A receipt with a failed
    /// status is returned as `GatewayError::Reverted`.
    async fn send_transaction(
        &self,
        contract: Address,
        call: &MethodCall,
    ) -> Result<TxReceipt, GatewayError>;

    /// Contract creation: a transaction without a target carrying `creation_code`.
    async fn deploy_contract(&self, creation_code: Bytes) -> Result<TxReceipt, GatewayError>;

    async fn read_storage_slot(&self, address: Address, slot: H256) -> Result<H256, GatewayError>;

    async fn get_balance(&self, address: Address) -> Result<U256, GatewayError>;
}

/// `call_view` followed by decoding the returned words.
pub async fn view<G: ChainGateway + ?Sized>(
    gateway: &G,
    contract: Address,
    call: &MethodCall,
) -> Result<Vec<Token>, GatewayError> {
    let output = gateway.call_view(contract, call).await?;
    call.decode_output(&output)
}

/// The address held in the low 20 bytes of a storage word.
pub fn slot_to_address(word: H256) -> Address {
    Address::from_slice(&word.as_bytes()[12..])
}

fn unexpected(call: &MethodCall, want: &str, got: Option<&Token>) -> GatewayError {
    GatewayError::Decode {
        method: call.function.signature(),
        reason: format!("expected {want}, got {got:?}"),
    }
}

pub fn first_uint(call: &MethodCall, tokens: Vec<Token>) -> Result<U256, GatewayError> {
    match tokens.first() {
        Some(Token::Uint(v)) => Ok(*v),
        other => Err(unexpected(call, "uint", other)),
    }
}

pub fn first_bytes(call: &MethodCall, tokens: Vec<Token>) -> Result<Vec<u8>, GatewayError> {
    match tokens.into_iter().next() {
        Some(Token::Bytes(b)) => Ok(b),
        other => Err(unexpected(call, "bytes", other.as_ref())),
    }
}

pub fn first_word(call: &MethodCall, tokens: Vec<Token>) -> Result<H256, GatewayError> {
    match tokens.first() {
        Some(Token::FixedBytes(b)) if b.len() == 32 => Ok(H256::from_slice(b)),
        other => Err(unexpected(call, "bytes32", other)),
    }
}
