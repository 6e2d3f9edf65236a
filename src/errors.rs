use ethers::types::{Address, H256, U256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("node unreachable: {0}")]
    Transport(String),
    #[error("call reverted: {reason}")]
    Reverted {
        tx_hash: Option<H256>,
        reason: String,
    },
    #[error("transaction {0:?} was dropped before being mined")]
    Dropped(H256),
    #[error("failed to encode call to {method}: {reason}")]
    Encode { method: String, reason: String },
    #[error("failed to decode output of {method}: {reason}")]
    Decode { method: String, reason: String },
}

impl GatewayError {
    /// Node or network unavailability; everything else is a definitive answer from the chain.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }

    pub fn is_revert(&self) -> bool {
        matches!(self, GatewayError::Reverted { .. })
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("artifact {name}: {reason}")]
    Artifact { name: String, reason: String },
    #[error("deploying {name} failed: {source}")]
    Send {
        name: String,
        #[source]
        source: GatewayError,
    },
    #[error("deployment of {name} was mined without a contract address")]
    MissingAddress { name: String },
}

#[derive(Debug, Error)]
#[error("initializer of {name} at {proxy:?} reverted: {source}")]
pub struct ProxyInitError {
    pub name: String,
    pub proxy: Address,
    #[source]
    pub source: GatewayError,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Init(#[from] ProxyInitError),
    #[error("{0:?} has an empty implementation slot and is not a proxy")]
    NotAProxy(Address),
    #[error("implementation of {proxy:?} is {actual:?} after upgrading to {expected:?}")]
    NotApplied {
        proxy: Address,
        expected: Address,
        actual: Address,
    },
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("explorer request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("explorer rejected verification: {0}")]
    Rejected(String),
    #[error("artifact {name} lacks `{field}` required for verification")]
    MissingMetadata { name: String, field: &'static str },
    #[error("verification cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("provisioning service unreachable: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provisioning service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed validator record: {0}")]
    Decode(String),
    #[error("validator listing still had a next page after {pages} pages")]
    TooManyPages { pages: u32 },
    #[error("waiting for provisioned validators was cancelled")]
    Cancelled,
}

impl ProvisioningError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProvisioningError::Http(e) => !e.is_decode(),
            ProvisioningError::Status { status, .. } => *status == 429 || *status >= 500,
            ProvisioningError::Decode(_)
            | ProvisioningError::TooManyPages { .. }
            | ProvisioningError::Cancelled => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error("withdrawal credentials {0} are not 0x01 execution-address credentials")]
    Credentials(String),
    #[error("no validator survived deposit-root validation ({rejected} rejected)")]
    NoValidRecords { rejected: usize },
    #[error("registration submission failed: {0}")]
    Submission(#[source] GatewayError),
}

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("registered total is {actual} but {expected} was expected after the cycle")]
    PostCondition { expected: U256, actual: U256 },
    #[error("cycle exceeded its deadline while waiting on provisioning")]
    DeadlineExceeded,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("address registry io: {0}")]
    Io(#[from] std::io::Error),
    #[error("address registry is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no address registered under `{0}`")]
    Missing(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("invalid config: {0}")]
    Invalid(String),
}
