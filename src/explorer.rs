//! Block-explorer source verification. Verification never gates a deployment: it is
//! retried forever with a fixed delay, in a background task that can be stopped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, Bytes};
use log::{info, warn};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::VerifyError;
use crate::proxy::artifacts::Artifact;

#[derive(Clone, Debug)]
pub struct VerificationRequest {
    pub name: String,
    pub address: Address,
    pub constructor_args: Bytes,
    /// `contracts/ynETH.sol:ynETH`
    pub contract_name: String,
    pub compiler_version: String,
    pub standard_json_input: serde_json::Value,
}

impl VerificationRequest {
    pub fn from_artifact(
        artifact: &Artifact,
        address: Address,
        constructor_args: Bytes,
    ) -> Result<Self, VerifyError> {
        let missing = |field| VerifyError::MissingMetadata {
            name: artifact.contract_name.clone(),
            field,
        };
        let source_name = artifact.source_name.as_ref().ok_or_else(|| missing("sourceName"))?;
        Ok(VerificationRequest {
            name: artifact.contract_name.clone(),
            address,
            constructor_args,
            contract_name: format!("{source_name}:{}", artifact.contract_name),
            compiler_version: artifact
                .compiler_version
                .clone()
                .ok_or_else(|| missing("compilerVersion"))?,
            standard_json_input: artifact
                .standard_json_input
                .clone()
                .ok_or_else(|| missing("standardJsonInput"))?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submission {
    Queued(String),
    AlreadyVerified,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed(String),
}

#[async_trait]
pub trait ExplorerApi: Send + Sync {
    async fn submit(&self, request: &VerificationRequest) -> Result<Submission, VerifyError>;

    async fn status(&self, guid: &str) -> Result<VerificationStatus, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: String,
}

fn is_already_verified(text: &str) -> bool {
    text.to_lowercase().contains("already verified")
}

/// Etherscan-compatible `module=contract` API.
pub struct EtherscanClient {
    pub url: String,
    api_key: String,
    pub client: Arc<reqwest::Client>,
}

impl EtherscanClient {
    pub fn new(url: &str, api_key: &str) -> Self {
        EtherscanClient {
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: Arc::new(reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl ExplorerApi for EtherscanClient {
    async fn submit(&self, request: &VerificationRequest) -> Result<Submission, VerifyError> {
        let source = request.standard_json_input.to_string();
        let address = format!("{:?}", request.address);
        let constructor_args = hex::encode(&request.constructor_args);
        let form = [
            ("apikey", self.api_key.as_str()),
            ("module", "contract"),
            ("action", "verifysourcecode"),
            ("contractaddress", address.as_str()),
            ("sourceCode", source.as_str()),
            ("codeformat", "solidity-standard-json-input"),
            ("contractname", request.contract_name.as_str()),
            ("compilerversion", request.compiler_version.as_str()),
            // sic, the API spells it this way
            ("constructorArguements", constructor_args.as_str()),
        ];
        let resp: EtherscanResponse = self
            .client
            .post(&self.url)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match resp.status.as_str() {
            "1" => Ok(Submission::Queued(resp.result)),
            _ if is_already_verified(&resp.result) => Ok(Submission::AlreadyVerified),
            _ => Err(VerifyError::Rejected(format!("{}: {}", resp.message, resp.result))),
        }
    }

    async fn status(&self, guid: &str) -> Result<VerificationStatus, VerifyError> {
        let resp: EtherscanResponse = self
            .client
            .get(&self.url)
            .query(&[
                ("apikey", self.api_key.as_str()),
                ("module", "contract"),
                ("action", "checkverifystatus"),
                ("guid", guid),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if resp.result.starts_with("Pending") {
            return Ok(VerificationStatus::Pending);
        }
        if resp.status == "1" || is_already_verified(&resp.result) {
            return Ok(VerificationStatus::Verified);
        }
        Ok(VerificationStatus::Failed(resp.result))
    }
}

/// One submission, followed until the explorer reaches a verdict.
pub async fn verify_once(
    api: &dyn ExplorerApi,
    request: &VerificationRequest,
    status_poll: Duration,
) -> Result<(), VerifyError> {
    let guid = match api.submit(request).await? {
        Submission::AlreadyVerified => return Ok(()),
        Submission::Queued(guid) => guid,
    };
    loop {
        tokio::time::sleep(status_poll).await;
        match api.status(&guid).await? {
            VerificationStatus::Pending => continue,
            VerificationStatus::Verified => return Ok(()),
            VerificationStatus::Failed(reason) => return Err(VerifyError::Rejected(reason)),
        }
    }
}

/// Retries `verify_once` with a fixed delay until it succeeds or `cancel` fires.
/// Returns the number of attempts it took.
pub async fn verify_until_done(
    api: &dyn ExplorerApi,
    request: &VerificationRequest,
    retry_delay: Duration,
    status_poll: Duration,
    cancel: &CancellationToken,
) -> Result<u32, VerifyError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
            r = verify_once(api, request, status_poll) => r,
        };
        match result {
            Ok(()) => {
                info!("{} verified successfully at {:?}", request.name, request.address);
                return Ok(attempts);
            }
            Err(e) => warn!(
                "Error verifying {}, retrying in {:?}: {e}",
                request.name, retry_delay
            ),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

/// A verification loop running on its own task.
pub struct VerificationTask {
    pub name: String,
    pub address: Address,
    cancel: CancellationToken,
    handle: JoinHandle<Result<u32, VerifyError>>,
}

impl VerificationTask {
    /// The task stops when `stop` is called or `parent` is cancelled.
    pub fn spawn(
        api: Arc<dyn ExplorerApi>,
        request: VerificationRequest,
        retry_delay: Duration,
        status_poll: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let name = request.name.clone();
        let address = request.address;
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            verify_until_done(api.as_ref(), &request, retry_delay, status_poll, &token).await
        });
        VerificationTask {
            name,
            address,
            cancel,
            handle,
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<u32, VerifyError> {
        match self.handle.await {
            Ok(result) => result,
            Err(_) => Err(VerifyError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers with the scripted submissions in order, then with the last one forever.
    struct ScriptedExplorer {
        submissions: Mutex<Vec<Result<Submission, String>>>,
        statuses: Mutex<Vec<VerificationStatus>>,
        calls: Mutex<u32>,
    }

    impl ScriptedExplorer {
        fn new(
            submissions: Vec<Result<Submission, String>>,
            statuses: Vec<VerificationStatus>,
        ) -> Self {
            ScriptedExplorer {
                submissions: Mutex::new(submissions),
                statuses: Mutex::new(statuses),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ExplorerApi for ScriptedExplorer {
        async fn submit(&self, _request: &VerificationRequest) -> Result<Submission, VerifyError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.submissions.lock().unwrap();
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            };
            next.map_err(VerifyError::Rejected)
        }

        async fn status(&self, _guid: &str) -> Result<VerificationStatus, VerifyError> {
            let mut script = self.statuses.lock().unwrap();
            Ok(if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            })
        }
    }

    fn request() -> VerificationRequest {
        VerificationRequest {
            name: "ynETH".into(),
            address: Address::repeat_byte(7),
            constructor_args: Bytes::default(),
            contract_name: "contracts/ynETH.sol:ynETH".into(),
            compiler_version: "v0.8.21+commit.d9974bed".into(),
            standard_json_input: serde_json::json!({}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_through_rate_limits_until_verified() {
        let api = ScriptedExplorer::new(
            vec![
                Err("Max rate limit reached".into()),
                Err("Max rate limit reached".into()),
                Ok(Submission::Queued("guid".into())),
            ],
            vec![VerificationStatus::Pending, VerificationStatus::Verified],
        );
        let attempts = verify_until_done(
            &api,
            &request(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn already_verified_is_success() {
        let api = ScriptedExplorer::new(vec![Ok(Submission::AlreadyVerified)], vec![]);
        let attempts = verify_until_done(
            &api,
            &request(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_stops_on_signal() {
        let api = Arc::new(ScriptedExplorer::new(vec![Err("explorer down".into())], vec![]));
        let parent = CancellationToken::new();
        let task = VerificationTask::spawn(
            api.clone(),
            request(),
            Duration::from_secs(10),
            Duration::from_secs(1),
            &parent,
        );
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!task.is_finished());

        parent.cancel();
        assert!(matches!(task.join().await, Err(VerifyError::Cancelled)));
        assert!(*api.calls.lock().unwrap() >= 3);
    }

    #[test]
    fn request_needs_verification_metadata() {
        let artifact = Artifact {
            contract_name: "Oracle".into(),
            source_name: Some("contracts/Oracle.sol".into()),
            bytecode: vec![0x60].into(),
            compiler_version: None,
            standard_json_input: None,
        };
        assert!(matches!(
            VerificationRequest::from_artifact(&artifact, Address::zero(), Bytes::default()),
            Err(VerifyError::MissingMetadata {
                field: "compilerVersion",
                ..
            })
        ));
    }
}
