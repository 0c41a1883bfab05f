pub mod error;
pub mod keys;
pub mod signing;
pub mod wallet;

pub use error::CryptoError;
pub use keys::{KeyPair, PublicKey};
pub use signing::{sign, verify, verify_voucher, Signature};
pub use wallet::{sign_voucher, LocalWallet, Signer};
