use ethers::types::H256;

/// EIP-1967 implementation slot: `bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)`.
///
/// The implementation pointer of a transparent proxy must be read from this slot with
/// `eth_getStorageAt`. Asking the proxy through a call would be delegated into the
/// implementation itself and never returns the pointer.
pub const EIP1967_IMPLEMENTATION_SLOT: H256 = H256([
    0x36, 0x08, 0x94, 0xa1, 0x3b, 0xa1, 0xa3, 0x21, 0x06, 0x67, 0xc8, 0x28, 0x49, 0x2d, 0xb9, 0x8d,
    0xca, 0x3e, 0x20, 0x76, 0xcc, 0x37, 0x35, 0xa9, 0x20, 0xa3, 0xca, 0x50, 0x5d, 0x38, 0x2b, 0xbc,
]);

/// EIP-1967 admin slot: `bytes32(uint256(keccak256("eip1967.proxy.admin")) - 1)`.
pub const EIP1967_ADMIN_SLOT: H256 = H256([
    0xb5, 0x31, 0x27, 0x68, 0x4a, 0x56, 0x8b, 0x31, 0x73, 0xae, 0x13, 0xb9, 0xf8, 0xa6, 0x01, 0x6e,
    0x24, 0x3e, 0x63, 0xb6, 0xe8, 0xee, 0x11, 0x78, 0xd6, 0xa7, 0x17, 0x85, 0x0b, 0x5d, 0x61, 0x03,
]);

/// Slot 0 of an OpenZeppelin 4.x `Initializable` contract; the lowest byte holds
/// `_initialized`. 5.x contracts keep it in an ERC-7201 namespaced slot instead.
pub const INITIALIZABLE_SLOT: H256 = H256([0u8; 32]);

pub const PROXY_CONTRACT: &str = "TransparentUpgradeableProxy";
pub const PROXY_ADMIN_CONTRACT: &str = "ProxyAdmin";
pub const PROXY_ADMIN_KEY: &str = "proxyAdmin";
pub const DEFAULT_INITIALIZER: &str = "function initialize()";

pub const BLS_PUB_KEY_BYTES: usize = 48;
pub const BLS_SIGNATURE_BYTES: usize = 96;
pub const WITHDRAWAL_CREDENTIALS_BYTES: usize = 32;
pub const ETH1_ADDRESS_WITHDRAWAL_PREFIX: u8 = 0x01;

/// 32 ETH in wei, the stake required to activate one validator.
pub const DEPOSIT_AMOUNT_WEI: u128 = 32_000_000_000_000_000_000;

pub const DEFAULT_KEEPER_POLL_MS: u64 = 5_000;
pub const DEFAULT_KEEPER_ERROR_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 3_600;
pub const DEFAULT_PROVISIONING_POLL_MS: u64 = 10_000;
pub const DEFAULT_PROVISIONING_PAGE_SIZE: u32 = 50;
pub const DEFAULT_PER_POLL_RETRIES: u32 = 3;
pub const PER_POLL_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_VERIFY_RETRY_SECS: u64 = 10;
pub const DEFAULT_VERIFY_STATUS_POLL_SECS: u64 = 5;
pub const DEFAULT_CONFIRMATIONS: usize = 1;

pub const PRIVATE_KEY_ENV: &str = "PRIVATE_KEY";
pub const PROVISIONING_API_KEY_ENV: &str = "PROVISIONING_API_KEY";
pub const EXPLORER_API_KEY_ENV: &str = "EXPLORER_API_KEY";
