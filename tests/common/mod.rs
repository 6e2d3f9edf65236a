use std::path::Path;

use ynops::chain::mock::{MOCK_ADMIN_CODE, MOCK_PROXY_CODE};
use ynops::constants::{PROXY_ADMIN_CONTRACT, PROXY_CONTRACT};

/// Writes a hardhat-style artifact without verification metadata.
pub fn write_artifact(dir: &Path, name: &str, bytecode: &[u8]) {
    let artifact = serde_json::json!({
        "_format": "hh-sol-artifact-1",
        "contractName": name,
        "sourceName": format!("contracts/{name}.sol"),
        "abi": [],
        "bytecode": format!("0x{}", hex::encode(bytecode)),
        "deployedBytecode": "0x",
    });
    std::fs::write(
        dir.join(format!("{name}.json")),
        serde_json::to_string_pretty(&artifact).unwrap(),
    )
    .unwrap();
}

/// Proxy, `ProxyAdmin` and the given logic contracts, in the form the mock chain
/// recognises.
pub fn write_artifacts(dir: &Path, logic: &[&str]) {
    write_artifact(dir, PROXY_CONTRACT, &MOCK_PROXY_CODE);
    write_artifact(dir, PROXY_ADMIN_CONTRACT, &MOCK_ADMIN_CODE);
    for (i, name) in logic.iter().enumerate() {
        write_artifact(dir, name, &[0x60, i as u8]);
    }
}
