//! Services backing the `eth` RPC namespace: the gas price oracle sampling
//! recent blocks, and the per-sender nonce reservation service arbitrating
//! concurrent transaction submission.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod error;
pub mod gas_oracle;
pub mod nonce;

pub use error::EthApiError;
pub use gas_oracle::{GasPriceOracle, GasPriceOracleConfig};
pub use nonce::{NonceManager, NonceReservation};
