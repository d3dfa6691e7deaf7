// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Operator keystore bootstrap for the service chain bridge.
//!
//! Each side (parent/child) owns one keystore directory holding a single
//! encrypted secp256k1 key named `<address>.json` and a plain password file
//! named `<address>`. The password is generated on first run.

use anyhow::{anyhow, Context, Result};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};

pub const PASSWORD_LENGTH: usize = 100;
const KEYSTORE_EXTENSION: &str = "json";

/// A decrypted operator key together with the files it was read from.
#[derive(Debug, Clone)]
pub struct OperatorKey {
    pub wallet: LocalWallet,
    pub key_path: PathBuf,
    pub password_path: PathBuf,
}

impl OperatorKey {
    pub fn address(&self) -> Address {
        self.wallet.address()
    }
}

pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

pub fn generate_password<R: Rng>(rng: &mut R) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Opens the operator key stored in `dir`, creating a fresh key and password
/// file when the directory holds none.
pub fn init_operator_keystore(dir: &Path) -> Result<OperatorKey> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create keystore dir {:?}", dir))?;
    match find_keystore_file(dir)? {
        Some(key_path) => open_keystore_file(&key_path),
        None => create_operator_key(dir),
    }
}

/// Opens the operator key stored in `dir` without creating one.
pub fn open_operator_keystore(dir: &Path) -> Result<OperatorKey> {
    let key_path =
        find_keystore_file(dir)?.ok_or_else(|| anyhow!("no keystore found in {:?}", dir))?;
    open_keystore_file(&key_path)
}

/// Loads the key of `address` from `dir`, used for fee payer accounts that
/// share an operator keystore directory.
pub fn load_operator_key(dir: &Path, address: &Address) -> Result<OperatorKey> {
    let key_path = dir
        .join(format_address(address))
        .with_extension(KEYSTORE_EXTENSION);
    if !key_path.exists() {
        return Err(anyhow!(
            "no keystore for {} in {:?}",
            format_address(address),
            dir
        ));
    }
    open_keystore_file(&key_path)
}

fn find_keystore_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut candidates = vec![];
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) == Some(KEYSTORE_EXTENSION) {
            candidates.push(path);
        }
    }
    candidates.sort();
    Ok(candidates.into_iter().next())
}

fn open_keystore_file(key_path: &Path) -> Result<OperatorKey> {
    let stem = key_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("invalid keystore file name {:?}", key_path))?;
    let password_path = key_path.with_file_name(stem);
    let password = std::fs::read_to_string(&password_path)
        .with_context(|| format!("failed to read password file {:?}", password_path))?;
    let wallet = LocalWallet::decrypt_keystore(key_path, password.trim())
        .map_err(|e| anyhow!("failed to decrypt keystore {:?}: {}", key_path, e))?;
    if format_address(&wallet.address()) != stem.to_lowercase() {
        return Err(anyhow!(
            "keystore {:?} holds key for {}",
            key_path,
            format_address(&wallet.address())
        ));
    }
    Ok(OperatorKey {
        wallet,
        key_path: key_path.to_path_buf(),
        password_path,
    })
}

fn create_operator_key(dir: &Path) -> Result<OperatorKey> {
    let mut rng = rand::thread_rng();
    let password = generate_password(&mut rng);
    let (wallet, file_name) = LocalWallet::new_keystore(dir, &mut rng, &password, None)
        .map_err(|e| anyhow!("failed to create keystore in {:?}: {}", dir, e))?;
    let name = format_address(&wallet.address());
    let key_path = dir.join(&name).with_extension(KEYSTORE_EXTENSION);
    std::fs::rename(dir.join(&file_name), &key_path)?;
    let password_path = dir.join(&name);
    std::fs::write(&password_path, &password)
        .with_context(|| format!("failed to write password file {:?}", password_path))?;
    tracing::info!("Created operator key {} in {:?}", name, dir);
    Ok(OperatorKey {
        wallet,
        key_path,
        password_path,
    })
}

/// Keccak address of an uncompressed secp256k1 public key.
pub fn public_key_to_address(key: &k256::ecdsa::VerifyingKey) -> Address {
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use sha3::{Digest, Keccak256};

    let uncompressed = key.to_encoded_point(false);
    let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}
