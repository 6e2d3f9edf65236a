//! Balance-triggered keeper: watches the pool's ETH balance and registers one
//! validator each time it reaches the funding threshold.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};
use log::{debug, error, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chain::{contracts, first_uint, view, ChainGateway};
use crate::config::KeeperConfig;
use crate::errors::{ConfigError, GatewayError, KeeperError, ProvisioningError, RegistrationError};
use crate::registration::RegistrationPipeline;

/// Validators registered per cycle.
const VALIDATORS_PER_CYCLE: usize = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeeperPhase {
    #[default]
    Idle,
    Triggering,
    Verifying,
}

/// In-memory only; everything here is re-derived from the chain after a restart.
#[derive(Clone, Debug, Default)]
pub struct KeeperCycleState {
    pub phase: KeeperPhase,
    pub last_observed_balance: U256,
    pub last_triggered_at: Option<Instant>,
    pub consecutive_error_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    BelowThreshold {
        balance: U256,
    },
    Registered {
        node_id: U256,
        validators: usize,
        registered_delta: U256,
    },
}

#[derive(Clone, Debug)]
pub struct KeeperSettings {
    /// Pool contract: its ETH balance holds pooled deposits and it reports
    /// `totalDepositedInValidators`.
    pub pool: Address,
    /// Per-validator stake; a cycle triggers once the pool holds this much.
    pub threshold: U256,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub cycle_timeout: Duration,
}

impl KeeperSettings {
    pub fn from_config(config: &KeeperConfig, pool: Address) -> Result<Self, ConfigError> {
        Ok(KeeperSettings {
            pool,
            threshold: config.funding_threshold()?,
            poll_interval: config.poll_interval(),
            error_backoff: config.error_backoff(),
            cycle_timeout: config.cycle_timeout(),
        })
    }
}

pub struct Keeper {
    gateway: Arc<dyn ChainGateway>,
    pipeline: RegistrationPipeline,
    settings: KeeperSettings,
    state: KeeperCycleState,
}

impl Keeper {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        pipeline: RegistrationPipeline,
        settings: KeeperSettings,
    ) -> Self {
        Keeper {
            gateway,
            pipeline,
            settings,
            state: KeeperCycleState::default(),
        }
    }

    pub fn state(&self) -> &KeeperCycleState {
        &self.state
    }

    async fn registered_total(&self) -> Result<U256, GatewayError> {
        let call = contracts::total_deposited_in_validators()?;
        let tokens = view(self.gateway.as_ref(), self.settings.pool, &call).await?;
        first_uint(&call, tokens)
    }

    /// One poll. Below the threshold nothing happens; otherwise one validator is
    /// registered and the growth of the registered total is checked.
    ///
    /// The cycle deadline and `shutdown` can only interrupt the wait for provisioned
    /// keys, never a submitted registration.
    pub async fn cycle(&mut self, shutdown: &CancellationToken) -> Result<CycleOutcome, KeeperError> {
        self.state.phase = KeeperPhase::Idle;
        let threshold = self.settings.threshold;
        let balance = self.gateway.get_balance(self.settings.pool).await?;
        self.state.last_observed_balance = balance;
        info!(
            "Pool balance {balance} wei, capacity {} validators",
            balance / threshold
        );
        if balance < threshold {
            return Ok(CycleOutcome::BelowThreshold { balance });
        }

        self.state.phase = KeeperPhase::Triggering;
        self.state.last_triggered_at = Some(Instant::now());
        let initial_total = self.registered_total().await?;
        let node_id = self.pipeline.next_node_id().await?;
        info!("Threshold reached, registering {VALIDATORS_PER_CYCLE} validator on node {node_id}");

        let deadline = shutdown.child_token();
        let _deadline_guard = deadline.clone().drop_guard();
        let timer = deadline.clone();
        let timeout = self.settings.cycle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => timer.cancel(),
            }
        });

        let result = match self
            .pipeline
            .register(node_id, threshold, VALIDATORS_PER_CYCLE, &deadline)
            .await
        {
            Ok(result) => result,
            Err(RegistrationError::Provisioning(ProvisioningError::Cancelled))
                if !shutdown.is_cancelled() =>
            {
                return Err(KeeperError::DeadlineExceeded)
            }
            Err(e) => return Err(e.into()),
        };

        self.state.phase = KeeperPhase::Verifying;
        let final_total = self.registered_total().await?;
        let registered_delta = threshold * U256::from(result.registered());
        let expected = initial_total + registered_delta;
        if final_total != expected {
            return Err(KeeperError::PostCondition {
                expected,
                actual: final_total,
            });
        }
        info!("Registered total {initial_total} -> {final_total}");
        self.state.phase = KeeperPhase::Idle;
        Ok(CycleOutcome::Registered {
            node_id,
            validators: result.registered(),
            registered_delta,
        })
    }

    /// Polls until `shutdown` fires. Errors are logged and followed by a longer
    /// pause; they never end the loop.
    pub async fn run(&mut self, shutdown: &CancellationToken) {
        info!(
            "Keeper watching {:?}, threshold {} wei",
            self.settings.pool, self.settings.threshold
        );
        while !shutdown.is_cancelled() {
            let pause = match self.cycle(shutdown).await {
                Ok(outcome) => {
                    debug!("Cycle finished: {outcome:?}");
                    self.state.consecutive_error_count = 0;
                    self.settings.poll_interval
                }
                Err(e) => {
                    self.state.consecutive_error_count += 1;
                    if matches!(e, KeeperError::PostCondition { .. }) {
                        error!("Post-condition violated: {e}");
                    } else {
                        warn!(
                            "Keeper cycle failed ({} in a row): {e}",
                            self.state.consecutive_error_count
                        );
                    }
                    self.settings.poll_interval + self.settings.error_backoff
                }
            };
            self.state.phase = KeeperPhase::Idle;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("Keeper stopped");
    }
}
