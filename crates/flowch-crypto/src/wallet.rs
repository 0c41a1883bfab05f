use async_trait::async_trait;
use dashmap::DashMap;
use flowch_core::{Address, SignedVoucher};

use crate::error::CryptoError;
use crate::keys::KeyPair;
use crate::signing::{sign, Signature};

/// Signs on behalf of local account addresses.
///
/// The manager only ever asks for signatures over canonical voucher bytes;
/// where the keys live (memory, HSM, remote wallet) is up to the implementor.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `data` with the key controlling `addr`.
    async fn sign(&self, addr: &Address, data: &[u8]) -> Result<Signature, CryptoError>;

    /// Whether this signer holds the key for `addr`.
    async fn has_key(&self, addr: &Address) -> bool;
}

/// Sign a voucher in place with the key controlling `from`.
pub async fn sign_voucher(
    signer: &dyn Signer,
    from: &Address,
    voucher: &mut SignedVoucher,
) -> Result<(), CryptoError> {
    voucher.signature = None;
    let bytes = voucher.signing_bytes()?;
    let sig = signer.sign(from, &bytes).await?;
    voucher.signature = Some(sig.to_bytes().to_vec());
    Ok(())
}

/// In-memory signer keyed by key-derived address.
#[derive(Default)]
pub struct LocalWallet {
    keys: DashMap<Address, KeyPair>,
}

impl LocalWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh key and return its address.
    pub fn generate(&self) -> Address {
        self.import(KeyPair::generate())
    }

    /// Add an existing key pair; returns its address.
    pub fn import(&self, keypair: KeyPair) -> Address {
        let addr = keypair.address();
        tracing::debug!(address = %addr, "key imported into wallet");
        self.keys.insert(addr.clone(), keypair);
        addr
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl Signer for LocalWallet {
    async fn sign(&self, addr: &Address, data: &[u8]) -> Result<Signature, CryptoError> {
        let kp = self
            .keys
            .get(addr)
            .ok_or_else(|| CryptoError::KeyNotFound(addr.clone()))?;
        Ok(sign(data, kp.value()))
    }

    async fn has_key(&self, addr: &Address) -> bool {
        self.keys.contains_key(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::verify_voucher;

    #[tokio::test]
    async fn test_wallet_signs_for_known_address() {
        let wallet = LocalWallet::new();
        let kp = KeyPair::from_seed(&[9u8; 32]);
        let pk = kp.public_key();
        let addr = wallet.import(kp);
        assert!(wallet.has_key(&addr).await);

        let mut v = SignedVoucher::new(Address::new("f2ch").unwrap(), 1, 1, 10);
        sign_voucher(&wallet, &addr, &mut v).await.unwrap();
        assert!(v.is_signed());
        assert!(verify_voucher(&v, &pk).is_ok());
    }

    #[tokio::test]
    async fn test_wallet_unknown_address() {
        let wallet = LocalWallet::new();
        wallet.generate();
        let stranger = Address::new("f1stranger").unwrap();
        assert!(!wallet.has_key(&stranger).await);
        assert!(matches!(
            wallet.sign(&stranger, b"data").await,
            Err(CryptoError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resigning_replaces_signature() {
        let wallet = LocalWallet::new();
        let kp = KeyPair::from_seed(&[3u8; 32]);
        let pk = kp.public_key();
        let addr = wallet.import(kp);

        let mut v = SignedVoucher::new(Address::new("f2ch").unwrap(), 0, 1, 10);
        sign_voucher(&wallet, &addr, &mut v).await.unwrap();
        v.amount = 20;
        v.nonce = 2;
        sign_voucher(&wallet, &addr, &mut v).await.unwrap();
        assert!(verify_voucher(&v, &pk).is_ok());
        assert_eq!(wallet.len(), 1);
    }
}
