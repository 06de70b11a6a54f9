//! An implementation of the eth gas price oracle, used for providing gas price estimates based on
//! previous blocks.

use crate::error::EthApiError;
use alloy_consensus::{transaction::SignerRecoverable, Transaction, TxEnvelope};
use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

/// A full block as sampled by the oracle.
pub type Block = alloy_consensus::Block<TxEnvelope>;

/// The number of transactions sampled in a block.
pub const SAMPLE_NUMBER: usize = 3;

/// The default maximum gas price to use for the estimate: 500 Gwei.
pub const DEFAULT_MAX_PRICE: U256 = U256::from_limbs([500_000_000_000u64, 0, 0, 0]);

/// The default gas price used when a sampled block contains no usable
/// transactions: 1 Gwei.
pub const DEFAULT_GAS_PRICE: U256 = U256::from_limbs([1_000_000_000u64, 0, 0, 0]);

/// Access to the blocks the oracle samples.
pub trait BlockProvider: Send + Sync {
    /// Returns the current head block.
    fn head_block(&self) -> Option<Block>;

    /// Returns the block with the given number.
    fn block_by_number(&self, number: u64) -> Option<Block>;
}

/// Settings for the [`GasPriceOracle`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasPriceOracleConfig {
    /// The number of blocks to walk back from the head to produce the
    /// estimate.
    pub blocks: u32,

    /// The percentile of gas prices to use for the estimate.
    pub percentile: u32,

    /// The number of cheapest transactions sampled per block.
    pub tx_limit_per_block: usize,

    /// Once this many samples are collected (counting the remaining block
    /// allowance), the walk stops.
    pub soft_tx_threshold: usize,

    /// The gas price recorded for blocks without usable transactions.
    pub default_price: U256,

    /// The maximum gas price to return.
    pub max_price: U256,

    /// Transactions below this effective gas price are ignored.
    pub ignore_under: U256,
}

impl Default for GasPriceOracleConfig {
    fn default() -> Self {
        Self {
            blocks: 20,
            percentile: 60,
            tx_limit_per_block: SAMPLE_NUMBER,
            soft_tx_threshold: 40,
            default_price: DEFAULT_GAS_PRICE,
            max_price: DEFAULT_MAX_PRICE,
            ignore_under: U256::ZERO,
        }
    }
}

/// Calculates a gas price depending on recent blocks.
#[derive(Debug)]
pub struct GasPriceOracle<Provider> {
    /// The type used to get block and transaction info.
    provider: Provider,
    /// The config for the oracle.
    oracle_config: GasPriceOracleConfig,
    /// The most recent estimate, keyed by the head block it was computed at.
    last_price: Mutex<Option<GasPriceOracleResult>>,
}

impl<Provider> GasPriceOracle<Provider>
where
    Provider: BlockProvider,
{
    /// Creates and returns the [`GasPriceOracle`].
    pub fn new(provider: Provider, mut oracle_config: GasPriceOracleConfig) -> Self {
        // sanitize the percentile to be less than 100
        if oracle_config.percentile > 100 {
            warn!(prev_percentile = ?oracle_config.percentile, "invalid gas price percentile, using 100 instead");
            oracle_config.percentile = 100;
        }

        Self { provider, oracle_config, last_price: Mutex::new(None) }
    }

    /// Suggests a gas price estimate based on recent blocks, using the
    /// configured percentile. Serving the same head block returns the cached
    /// value.
    pub async fn suggest_gas_price(&self) -> Result<U256, EthApiError> {
        let head = self.provider.head_block().ok_or(EthApiError::UnknownHeadBlock)?;
        let head_hash = head.header.hash_slow();

        let mut last_price = self.last_price.lock().await;
        if let Some(cached) = last_price.as_ref() {
            if cached.block_hash == head_hash {
                return Ok(cached.price)
            }
        }

        let mut samples = Vec::new();
        let mut block = Some(head);
        let config = &self.oracle_config;

        for walked in 0..config.blocks {
            let Some(current) = block.take() else { break };
            let number = current.header.number;

            let block_samples = self.sample_block(&current);
            if block_samples.is_empty() {
                // an empty block still produces a sample, otherwise a quiet
                // chain would starve the estimate
                samples.push(config.default_price);
            } else {
                samples.extend(block_samples);
            }

            let remaining = (config.blocks - walked - 1) as usize;
            if samples.len() + remaining >= config.soft_tx_threshold {
                break
            }

            if number == 0 {
                // genesis reached
                break
            }
            block = self.provider.block_by_number(number - 1);
            if block.is_none() {
                return Err(EthApiError::UnknownBlock(number - 1))
            }
        }

        samples.sort_unstable();
        let index = ((samples.len() - 1) as f64 * config.percentile as f64 / 100.0).round() as usize;
        let price = samples[index].min(config.max_price);

        *last_price = Some(GasPriceOracleResult { block_hash: head_hash, price });

        Ok(price)
    }

    /// Returns up to `tx_limit_per_block` effective gas prices from the
    /// block, cheapest first.
    ///
    /// Transactions paid by the block beneficiary are skipped: those are
    /// typically self-paid and would skew the estimate. On a pre-1559 chain
    /// dynamic-fee transactions are skipped as well.
    fn sample_block(&self, block: &Block) -> Vec<U256> {
        let base_fee = block.header.base_fee_per_gas;
        let beneficiary = block.header.beneficiary;
        let config = &self.oracle_config;

        let mut prices: Vec<U256> = block
            .body
            .transactions
            .iter()
            .filter(|tx: &&TxEnvelope| base_fee.is_some() || !(**tx).is_dynamic_fee())
            .filter_map(|tx| {
                let price = U256::from(tx.effective_gas_price(base_fee));
                if price < config.ignore_under {
                    return None
                }
                let sender = tx.recover_signer().ok()?;
                (sender != beneficiary).then_some(price)
            })
            .collect();

        prices.sort_unstable();
        prices.truncate(config.tx_limit_per_block);
        prices
    }
}

/// Stores the last result that the oracle returned.
#[derive(Debug, Clone)]
pub struct GasPriceOracleResult {
    /// The block hash that the oracle used to calculate the price.
    pub block_hash: B256,
    /// The price that the oracle calculated.
    pub price: U256,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_consensus::{Header, Signed, TxLegacy};
    use alloy_primitives::{Address, Signature, TxKind};
    use std::{collections::HashMap, str::FromStr};

    /// A valid secp256k1 signature (the EIP-155 example transaction), reused
    /// so recovery succeeds and yields a deterministic sender.
    fn test_signature() -> Signature {
        Signature::new(
            U256::from_str(
                "18515461264373351373200002665853028612451056578545711640558177340181847433846",
            )
            .unwrap(),
            U256::from_str(
                "46948507304638947509940763649030358759909902576025900602547168820602576006531",
            )
            .unwrap(),
            false,
        )
    }

    fn legacy_tx(gas_price: u128) -> TxEnvelope {
        let tx = TxLegacy {
            chain_id: Some(1),
            nonce: 0,
            gas_price,
            gas_limit: 21_000,
            to: TxKind::Call(Address::ZERO),
            value: U256::ZERO,
            input: Default::default(),
        };
        TxEnvelope::Legacy(Signed::new_unchecked(tx, test_signature(), B256::ZERO))
    }

    struct StaticChain {
        head: Block,
        blocks: HashMap<u64, Block>,
    }

    impl StaticChain {
        /// Builds a chain whose head is the block with the highest number.
        fn new(blocks_with_prices: Vec<Vec<u128>>) -> Self {
            let mut blocks = HashMap::new();
            let mut head = None;
            for (number, prices) in blocks_with_prices.into_iter().enumerate() {
                let header = Header {
                    number: number as u64,
                    base_fee_per_gas: None,
                    ..Default::default()
                };
                let transactions = prices.into_iter().map(legacy_tx).collect();
                let block = Block::new(
                    header,
                    alloy_consensus::BlockBody { transactions, ..Default::default() },
                );
                head = Some(block.clone());
                blocks.insert(number as u64, block);
            }
            Self { head: head.expect("at least one block"), blocks }
        }
    }

    impl BlockProvider for StaticChain {
        fn head_block(&self) -> Option<Block> {
            Some(self.head.clone())
        }

        fn block_by_number(&self, number: u64) -> Option<Block> {
            self.blocks.get(&number).cloned()
        }
    }

    struct EmptyChain;

    impl BlockProvider for EmptyChain {
        fn head_block(&self) -> Option<Block> {
            None
        }

        fn block_by_number(&self, _number: u64) -> Option<Block> {
            None
        }
    }

    #[test]
    fn max_price_sanity() {
        assert_eq!(DEFAULT_MAX_PRICE, U256::from(500_000_000_000u64));
        assert_eq!(DEFAULT_GAS_PRICE, U256::from(1_000_000_000u64));
    }

    #[tokio::test]
    async fn missing_head_is_an_error() {
        let oracle = GasPriceOracle::new(EmptyChain, GasPriceOracleConfig::default());
        assert_eq!(oracle.suggest_gas_price().await, Err(EthApiError::UnknownHeadBlock));
    }

    #[tokio::test]
    async fn estimates_percentile_of_cheap_transactions() {
        // 4 blocks with three usable transactions each
        let chain = StaticChain::new(vec![
            vec![10, 20, 30],
            vec![40, 50, 60],
            vec![70, 80, 90],
            vec![100, 110, 120],
        ]);
        let oracle = GasPriceOracle::new(chain, GasPriceOracleConfig::default());

        let price = oracle.suggest_gas_price().await.unwrap();
        // 12 samples sorted ascending, percentile 60 rounds to index 7
        assert_eq!(price, U256::from(80));
    }

    #[tokio::test]
    async fn empty_blocks_contribute_the_default_price() {
        let chain = StaticChain::new(vec![vec![], vec![]]);
        let oracle = GasPriceOracle::new(chain, GasPriceOracleConfig::default());

        let price = oracle.suggest_gas_price().await.unwrap();
        assert_eq!(price, DEFAULT_GAS_PRICE);
    }

    #[tokio::test]
    async fn only_the_cheapest_transactions_are_sampled() {
        // a single block with more transactions than the per-block limit
        let chain = StaticChain::new(vec![vec![500, 400, 10, 20, 30]]);
        let oracle = GasPriceOracle::new(chain, GasPriceOracleConfig::default());

        let price = oracle.suggest_gas_price().await.unwrap();
        // only {10, 20, 30} are sampled, percentile 60 of 3 samples is index 1
        assert_eq!(price, U256::from(20));
    }

    #[tokio::test]
    async fn estimate_is_capped() {
        let chain = StaticChain::new(vec![vec![
            600_000_000_000,
            700_000_000_000,
            800_000_000_000,
        ]]);
        let oracle = GasPriceOracle::new(chain, GasPriceOracleConfig::default());

        let price = oracle.suggest_gas_price().await.unwrap();
        assert_eq!(price, DEFAULT_MAX_PRICE);
    }

    #[tokio::test]
    async fn result_is_cached_per_head() {
        let chain = StaticChain::new(vec![vec![10, 20, 30]]);
        let oracle = GasPriceOracle::new(chain, GasPriceOracleConfig::default());

        let first = oracle.suggest_gas_price().await.unwrap();
        let second = oracle.suggest_gas_price().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn prices_below_the_floor_are_ignored() {
        let config =
            GasPriceOracleConfig { ignore_under: U256::from(50), ..Default::default() };
        let chain = StaticChain::new(vec![vec![10, 20, 60, 70, 80]]);
        let oracle = GasPriceOracle::new(chain, config);

        let price = oracle.suggest_gas_price().await.unwrap();
        // {60, 70, 80} remain, percentile 60 is index 1
        assert_eq!(price, U256::from(70));
    }
}
