use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use log::{debug, warn};
use serde::Deserialize;

use super::{ProvisioningRequest, ProvisioningService, RequestAccepted, ValidatorRecord, ValidatorStatus};
use crate::constants::{BLS_PUB_KEY_BYTES, BLS_SIGNATURE_BYTES, WITHDRAWAL_CREDENTIALS_BYTES};
use crate::errors::ProvisioningError;
use crate::strip_0x_prefix;

/// Status the provider reports for keys that are generated and not yet deposited.
const READY_STATUS: &str = "provisioned";
const DEFAULT_MAX_PAGES: u32 = 1000;

#[derive(Debug, Deserialize)]
struct ListPage {
    data: Vec<ApiValidator>,
    #[serde(default)]
    links: Option<PageLinks>,
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiValidator {
    pubkey: String,
    status: String,
    #[serde(default)]
    deposit_data: Option<ApiDepositData>,
}

#[derive(Debug, Deserialize)]
struct ApiDepositData {
    withdrawal_credentials: String,
    signature: String,
    deposit_data_root: String,
}

#[derive(Debug, Deserialize)]
struct ApiAccepted {
    #[serde(default)]
    id: Option<String>,
}

fn decode_hex(field: &str, value: &str, len: usize) -> Result<Vec<u8>, ProvisioningError> {
    let stripped: String = strip_0x_prefix!(value);
    let bytes = hex::decode(stripped)
        .map_err(|e| ProvisioningError::Decode(format!("{field} {value}: {e}")))?;
    if bytes.len() != len {
        return Err(ProvisioningError::Decode(format!(
            "{field} is {} bytes, expected {len}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

impl TryFrom<ApiValidator> for ValidatorRecord {
    type Error = ProvisioningError;

    fn try_from(v: ApiValidator) -> Result<Self, Self::Error> {
        let deposit = v.deposit_data.ok_or_else(|| {
            ProvisioningError::Decode(format!("validator {} has no deposit data", v.pubkey))
        })?;
        Ok(ValidatorRecord {
            public_key: Bytes::from(decode_hex("pubkey", &v.pubkey, BLS_PUB_KEY_BYTES)?),
            signature: Bytes::from(decode_hex(
                "signature",
                &deposit.signature,
                BLS_SIGNATURE_BYTES,
            )?),
            deposit_data_root: H256::from_slice(&decode_hex(
                "deposit_data_root",
                &deposit.deposit_data_root,
                32,
            )?),
            withdrawal_credentials: Bytes::from(decode_hex(
                "withdrawal_credentials",
                &deposit.withdrawal_credentials,
                WITHDRAWAL_CREDENTIALS_BYTES,
            )?),
            status: ValidatorStatus::Provisioned,
        })
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProvisioningError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProvisioningError::Status {
        status: status.as_u16(),
        body,
    })
}

/// REST client for the validator provisioning provider.
pub struct HttpProvisioningClient {
    pub url: String,
    pub network: String,
    api_key: String,
    page_size: u32,
    max_pages: u32,
    pub client: Arc<reqwest::Client>,
}

impl HttpProvisioningClient {
    pub fn new(url: &str, network: &str, api_key: &str, page_size: u32) -> Self {
        HttpProvisioningClient {
            url: url.trim_end_matches('/').to_string(),
            network: network.to_string(),
            api_key: api_key.to_string(),
            page_size: page_size.max(1),
            max_pages: DEFAULT_MAX_PAGES,
            client: Arc::new(reqwest::Client::new()),
        }
    }

    /// A listing that still points at a next page after `max_pages` pages is an error.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn validators_url(&self) -> String {
        format!("{}/ethereum/validators", self.url)
    }

    async fn fetch_page(
        &self,
        withdrawal_address: Address,
        page: u32,
    ) -> Result<ListPage, ProvisioningError> {
        let resp = self
            .client
            .get(self.validators_url())
            .bearer_auth(&self.api_key)
            .query(&[
                ("network", self.network.clone()),
                ("withdrawal_address", format!("{withdrawal_address:?}")),
                ("status", READY_STATUS.to_string()),
                ("page[number]", page.to_string()),
                ("page[size]", self.page_size.to_string()),
            ])
            .send()
            .await?;
        let body = check_status(resp).await?.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ProvisioningError::Decode(format!("validator page {page}: {e}")))
    }
}

#[async_trait]
impl ProvisioningService for HttpProvisioningClient {
    async fn request_provisioning(
        &self,
        withdrawal_address: Address,
        count: usize,
    ) -> Result<RequestAccepted, ProvisioningError> {
        let request = ProvisioningRequest {
            network: self.network.clone(),
            withdrawal_address,
            requested_count: count,
        };
        let resp = self
            .client
            .post(self.validators_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let body = check_status(resp).await?.text().await?;
        // an empty or unfamiliar acknowledgement still means accepted
        let accepted: Option<ApiAccepted> = serde_json::from_str(&body).ok();
        Ok(RequestAccepted {
            request_id: accepted.and_then(|a| a.id),
            requested_count: count,
        })
    }

    async fn list_provisioned(
        &self,
        withdrawal_address: Address,
    ) -> Result<Vec<ValidatorRecord>, ProvisioningError> {
        let mut records = Vec::new();
        let mut page = 1;
        loop {
            let ListPage { data, links } = self.fetch_page(withdrawal_address, page).await?;
            let fetched = data.len();
            for validator in data {
                if validator.status != READY_STATUS {
                    continue;
                }
                let pubkey = validator.pubkey.clone();
                match ValidatorRecord::try_from(validator) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping provisioned validator {pubkey}: {e}"),
                }
            }
            let has_next = links
                .and_then(|l| l.next)
                .map_or(false, |next| !next.is_empty());
            if !has_next || fetched == 0 {
                break;
            }
            if page >= self.max_pages {
                return Err(ProvisioningError::TooManyPages {
                    pages: self.max_pages,
                });
            }
            page += 1;
        }
        debug!(
            "{} provisioned validators listed for {withdrawal_address:?}",
            records.len()
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Provider {
        posted: Arc<Mutex<Vec<(Option<String>, Value)>>>,
        pages: Arc<Mutex<Vec<u32>>>,
        unavailable: bool,
        malformed: bool,
    }

    fn validator(byte: u8, status: &str) -> Value {
        json!({
            "pubkey": format!("0x{}", hex::encode([byte; 48])),
            "status": status,
            "deposit_data": {
                "withdrawal_credentials": format!("0x01{}", "00".repeat(31)),
                "signature": hex::encode([byte; 96]),
                "deposit_data_root": format!("0x{}", hex::encode([byte; 32])),
            }
        })
    }

    async fn list(
        State(provider): State<Provider>,
        Query(query): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        if provider.unavailable {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
        }
        let page: u32 = query
            .get("page[number]")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        provider.pages.lock().unwrap().push(page);
        let body = match page {
            1 => {
                let mut data = vec![validator(1, "provisioned"), validator(2, "deposited")];
                if provider.malformed {
                    let mut bad = validator(9, "provisioned");
                    bad["deposit_data"]["signature"] = json!("0xabcd");
                    data.push(bad);
                }
                json!({
                    "data": data,
                    "links": { "next": "/ethereum/validators?page[number]=2" }
                })
            }
            _ => json!({ "data": [validator(3, "provisioned")], "links": { "next": null } }),
        };
        (StatusCode::OK, Json(body))
    }

    async fn create(
        State(provider): State<Provider>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        provider.posted.lock().unwrap().push((auth, body));
        (StatusCode::CREATED, Json(json!({ "id": "req-1" })))
    }

    async fn serve(provider: Provider) -> String {
        let app = Router::new()
            .route("/ethereum/validators", get(list).post(create))
            .with_state(provider);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn drains_every_page_and_keeps_ready_validators() {
        let provider = Provider::default();
        let url = serve(provider.clone()).await;
        let client = HttpProvisioningClient::new(&url, "goerli", "secret", 2);

        let records = client
            .list_provisioned(Address::repeat_byte(0xa1))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].public_key.as_ref(), &[1u8; 48][..]);
        assert_eq!(records[1].deposit_data_root, H256::repeat_byte(3));
        assert_eq!(*provider.pages.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn malformed_record_is_skipped() {
        let provider = Provider {
            malformed: true,
            ..Default::default()
        };
        let url = serve(provider).await;
        let client = HttpProvisioningClient::new(&url, "goerli", "secret", 3);

        let records = client
            .list_provisioned(Address::repeat_byte(0xa1))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.public_key.as_ref() != &[9u8; 48][..]));
    }

    #[tokio::test]
    async fn listing_past_the_page_cap_fails() {
        let provider = Provider::default();
        let url = serve(provider.clone()).await;
        let client = HttpProvisioningClient::new(&url, "goerli", "secret", 2).with_max_pages(1);

        let err = client.list_provisioned(Address::zero()).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::TooManyPages { pages: 1 }));
        assert!(!err.is_transient());
        assert_eq!(*provider.pages.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn request_carries_count_and_credentials() {
        let provider = Provider::default();
        let url = serve(provider.clone()).await;
        let client = HttpProvisioningClient::new(&url, "goerli", "secret", 50);

        let accepted = client
            .request_provisioning(Address::repeat_byte(0xa1), 4)
            .await
            .unwrap();
        assert_eq!(accepted.request_id.as_deref(), Some("req-1"));

        let posted = provider.posted.lock().unwrap();
        let (auth, body) = &posted[0];
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
        assert_eq!(body["validators_count"], 4);
        assert_eq!(body["network"], "goerli");
    }

    #[tokio::test]
    async fn unavailable_provider_is_transient() {
        let provider = Provider {
            unavailable: true,
            ..Default::default()
        };
        let url = serve(provider).await;
        let client = HttpProvisioningClient::new(&url, "goerli", "secret", 50);

        let err = client.list_provisioned(Address::zero()).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn short_signature_is_malformed() {
        let mut v: ApiValidator = serde_json::from_value(validator(1, "provisioned")).unwrap();
        if let Some(d) = v.deposit_data.as_mut() {
            d.signature = "0xabcd".into();
        }
        let err = ValidatorRecord::try_from(v).unwrap_err();
        assert!(matches!(err, ProvisioningError::Decode(_)));
        assert!(!err.is_transient());
    }
}
