use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, MiddlewareError, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, TransactionRequest, H256, U256, U64};
use log::{debug, info};

use super::{ChainGateway, MethodCall, TxReceipt};
use crate::errors::GatewayError;

pub type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// `ChainGateway` backed by a JSON-RPC node, signing with a local key.
pub struct EthersGateway {
    client: Arc<SignerClient>,
    confirmations: usize,
}

impl EthersGateway {
    pub async fn connect(
        rpc_url: &str,
        private_key: &str,
        chain_id: Option<u64>,
        confirmations: usize,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .with_context(|| format!("Bad rpc url {rpc_url}"))?;
        let chain_id = match chain_id {
            Some(id) => id,
            None => provider
                .get_chainid()
                .await
                .with_context(|| format!("Failed to reach node at {rpc_url}"))?
                .as_u64(),
        };
        let private_key: String = crate::strip_0x_prefix!(private_key);
        let wallet = private_key
            .parse::<LocalWallet>()
            .context("Bad private key")?
            .with_chain_id(chain_id);
        info!(
            "Connected to chain {chain_id} at {rpc_url} as {:?}",
            wallet.address()
        );
        Ok(EthersGateway {
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            confirmations,
        })
    }

    async fn submit(&self, tx: TypedTransaction) -> Result<TxReceipt, GatewayError> {
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(classify)?;
        let tx_hash = pending.tx_hash();
        debug!("Submitted transaction {tx_hash:?}, awaiting {} confirmation(s)", self.confirmations);

        let receipt = pending
            .confirmations(self.confirmations)
            .await
            .map_err(classify)?
            .ok_or(GatewayError::Dropped(tx_hash))?;

        if receipt.status != Some(U64::from(1)) {
            return Err(GatewayError::Reverted {
                tx_hash: Some(tx_hash),
                reason: format!("transaction mined with status {:?}", receipt.status),
            });
        }
        Ok(receipt.into())
    }
}

/// JSON-RPC error responses are answers from the node (reverts, rejected nonces);
/// anything else never reached it.
fn classify<E: MiddlewareError>(e: E) -> GatewayError {
    match e.as_error_response() {
        Some(resp) => GatewayError::Reverted {
            tx_hash: None,
            reason: resp.message.clone(),
        },
        None => GatewayError::Transport(e.to_string()),
    }
}

impl From<TransactionReceipt> for TxReceipt {
    fn from(r: TransactionReceipt) -> Self {
        TxReceipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number.map(|n| n.as_u64()),
            gas_used: r.gas_used,
            contract_address: r.contract_address,
        }
    }
}

#[async_trait]
impl ChainGateway for EthersGateway {
    fn sender(&self) -> Address {
        self.client.address()
    }

    async fn call_view(&self, contract: Address, call: &MethodCall) -> Result<Bytes, GatewayError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.sender())
            .to(contract)
            .data(call.encode()?)
            .into();
        self.client.call(&tx, None).await.map_err(classify)
    }

    async fn send_transaction(
        &self,
        contract: Address,
        call: &MethodCall,
    ) -> Result<TxReceipt, GatewayError> {
        debug!("Sending {} to {contract:?}", call.function.signature());
        let tx = TransactionRequest::new().to(contract).data(call.encode()?);
        self.submit(tx.into()).await
    }

    async fn deploy_contract(&self, creation_code: Bytes) -> Result<TxReceipt, GatewayError> {
        let tx = TransactionRequest::new().data(creation_code);
        self.submit(tx.into()).await
    }

    async fn read_storage_slot(&self, address: Address, slot: H256) -> Result<H256, GatewayError> {
        self.client
            .get_storage_at(address, slot, None)
            .await
            .map_err(classify)
    }

    async fn get_balance(&self, address: Address) -> Result<U256, GatewayError> {
        self.client.get_balance(address, None).await.map_err(classify)
    }
}
