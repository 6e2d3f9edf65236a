use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use ethers::types::{Address, U256};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use ynops::chain::mock::MockChain;
use ynops::chain::ChainGateway;
use ynops::constants::DEPOSIT_AMOUNT_WEI;
use ynops::keeper::{Keeper, KeeperSettings};
use ynops::provisioning::{HttpProvisioningClient, Provisioner};
use ynops::registration::RegistrationPipeline;

/// Provider stub: every requested validator is ready on the next listing.
#[derive(Clone)]
struct Provider {
    credentials: Vec<u8>,
    validators: Arc<Mutex<Vec<Value>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

async fn list(State(provider): State<Provider>) -> Json<Value> {
    let data = provider.validators.lock().unwrap().clone();
    Json(json!({ "data": data, "links": { "next": null } }))
}

async fn create(State(provider): State<Provider>, Json(body): Json<Value>) -> StatusCode {
    let count = body["validators_count"].as_u64().unwrap_or(0);
    let mut validators = provider.validators.lock().unwrap();
    for _ in 0..count {
        let byte = validators.len() as u8 + 1;
        let root = MockChain::deposit_root(
            &[byte; 48],
            &[byte; 96],
            &provider.credentials,
            U256::from(DEPOSIT_AMOUNT_WEI),
        );
        validators.push(json!({
            "pubkey": format!("0x{}", hex::encode([byte; 48])),
            "status": "provisioned",
            "deposit_data": {
                "withdrawal_credentials": format!("0x{}", hex::encode(&provider.credentials)),
                "signature": format!("0x{}", hex::encode([byte; 96])),
                "deposit_data_root": format!("{root:?}"),
            }
        }));
    }
    provider.requests.lock().unwrap().push(body);
    StatusCode::ACCEPTED
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
async fn deposit_of_one_threshold_registers_exactly_one_validator() {
    let pool = Address::repeat_byte(0x77);
    let threshold = U256::from(DEPOSIT_AMOUNT_WEI);
    let chain = Arc::new(MockChain::new());
    chain.set_pool(pool);

    let provider = Provider {
        credentials: chain.withdrawal_credentials(),
        validators: Arc::new(Mutex::new(Vec::new())),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let url = serve(provider.clone()).await;

    let gateway: Arc<dyn ChainGateway> = chain.clone();
    let service = Arc::new(HttpProvisioningClient::new(&url, "goerli", "secret", 50));
    let provisioner = Arc::new(Provisioner::new(service, Duration::from_millis(50), 2));
    let manager = Address::repeat_byte(0x33);
    let pipeline = RegistrationPipeline::new(gateway.clone(), provisioner, manager, None);
    let settings = KeeperSettings {
        pool,
        threshold,
        poll_interval: Duration::from_millis(20),
        error_backoff: Duration::from_millis(10),
        cycle_timeout: Duration::from_secs(30),
    };
    let mut keeper = Keeper::new(gateway, pipeline, settings);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        keeper.run(&token).await;
        keeper
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(chain.registered_total(), U256::zero());
    assert!(provider.requests.lock().unwrap().is_empty());

    chain.deposit(pool, threshold);
    let mut waited = Duration::ZERO;
    while chain.registered_total().is_zero() && waited < Duration::from_secs(10) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    // a few more polls must not trigger again
    tokio::time::sleep(Duration::from_millis(200)).await;

    shutdown.cancel();
    let keeper = handle.await.unwrap();

    assert_eq!(chain.registered_total(), threshold);
    assert_eq!(chain.balance(pool), U256::zero());
    assert_eq!(chain.registered_keys(), vec![vec![1u8; 48]]);
    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["validators_count"], 1);
    assert_eq!(
        requests[0]["withdrawal_address"],
        format!("{:?}", Address::repeat_byte(0xa1))
    );
    assert_eq!(keeper.state().consecutive_error_count, 0);
}
