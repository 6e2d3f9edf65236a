use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ethers::types::Address;
use log::debug;

use crate::errors::RegistryError;

/// Flat `key -> address` mapping, one entry per deployment unit.
pub type AddressBook = BTreeMap<String, Address>;

/// Where every contract address is resolved from. Callers load a fresh copy when
/// they need one and replace the whole book in one step after a successful change.
pub trait AddressRegistry: Send + Sync {
    fn load(&self) -> Result<AddressBook, RegistryError>;

    fn replace(&self, book: &AddressBook) -> Result<(), RegistryError>;

    fn resolve(&self, key: &str) -> Result<Address, RegistryError> {
        self.load()?
            .get(key)
            .copied()
            .ok_or_else(|| RegistryError::Missing(key.to_string()))
    }

    /// Read, modify and replace in one step.
    fn update(&self, f: &dyn Fn(&mut AddressBook)) -> Result<AddressBook, RegistryError> {
        let mut book = self.load()?;
        f(&mut book);
        self.replace(&book)?;
        Ok(book)
    }
}

/// `ynETH -> ynETH`, `StakingNodesManager -> stakingNodesManager`.
pub fn registry_key(contract_name: &str) -> String {
    let mut chars = contract_name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// The registry as a pretty-printed JSON file, e.g. `goerli-addresses.json`.
pub struct JsonFileRegistry {
    path: PathBuf,
}

impl JsonFileRegistry {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        JsonFileRegistry {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AddressRegistry for JsonFileRegistry {
    fn load(&self) -> Result<AddressBook, RegistryError> {
        if !self.path.exists() {
            return Ok(AddressBook::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Writes a sibling temp file and renames it over the registry so readers never
    /// observe a half-written book.
    fn replace(&self, book: &AddressBook) -> Result<(), RegistryError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(book)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Wrote {} addresses to {:?}", book.len(), self.path);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    book: Mutex<AddressBook>,
}

impl MemoryRegistry {
    pub fn new(book: AddressBook) -> Self {
        MemoryRegistry {
            book: Mutex::new(book),
        }
    }
}

impl AddressRegistry for MemoryRegistry {
    fn load(&self) -> Result<AddressBook, RegistryError> {
        Ok(self
            .book
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn replace(&self, book: &AddressBook) -> Result<(), RegistryError> {
        *self
            .book
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = book.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_lower_camel() {
        assert_eq!(registry_key("StakingNodesManager"), "stakingNodesManager");
        assert_eq!(registry_key("ynETH"), "ynETH");
        assert_eq!(registry_key(""), "");
    }

    #[test]
    fn missing_file_is_an_empty_book() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JsonFileRegistry::new(dir.path().join("addresses.json"));
        assert!(registry.load().unwrap().is_empty());
        assert!(matches!(
            registry.resolve("ynETH"),
            Err(RegistryError::Missing(_))
        ));
    }

    #[test]
    fn replace_rewrites_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JsonFileRegistry::new(dir.path().join("nested/addresses.json"));

        registry
            .update(&|book| {
                book.insert("ynETH".into(), Address::repeat_byte(1));
                book.insert("oracle".into(), Address::repeat_byte(2));
            })
            .unwrap();
        registry
            .update(&|book| {
                book.remove("oracle");
            })
            .unwrap();

        let book = registry.load().unwrap();
        assert_eq!(book.len(), 1);
        assert_eq!(registry.resolve("ynETH").unwrap(), Address::repeat_byte(1));
        assert!(!registry.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.json");
        fs::write(&path, "{ not json").unwrap();
        let registry = JsonFileRegistry::new(&path);
        assert!(matches!(registry.load(), Err(RegistryError::Json(_))));
    }
}
