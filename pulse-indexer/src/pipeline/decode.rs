//! Log decoding and activity classification.
//!
//! The only event decoded in full is the canonical ERC-20 Transfer
//! (topic arity 3). Other recognized topic-0 values map to coarser
//! activity tags through a static table; unknown topics fold into
//! `CONTRACT_EVENT`. Native-value transactions from the full-block walk
//! become `ETH_TRANSFER`, contract creations become `DEPLOY`.
//!
//! Tags other than TRANSFER/ETH_TRANSFER are best-effort heuristics:
//! any contract can emit a log whose signature collides with a DEX
//! event.

use alloy::primitives::B256;
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use evm_pool::RpcTransaction;
use tracing::trace;

use crate::abi::{dex, erc20, faucet};
use crate::types::chain::{ActivityType, SYNTHETIC_LOG_BASE, Transfer};
use crate::types::primitives::{BlockNumber, EthAddress, TokenAmount};

/// Classify a log by its topic 0.
#[must_use]
pub fn classify_topic(topic0: &B256) -> ActivityType {
    match *topic0 {
        t if t == erc20::Transfer::SIGNATURE_HASH => ActivityType::Transfer,
        t if t == erc20::Approval::SIGNATURE_HASH => ActivityType::Approve,
        t if t == dex::Swap::SIGNATURE_HASH => ActivityType::Swap,
        t if t == dex::Mint::SIGNATURE_HASH => ActivityType::Mint,
        t if t == faucet::FaucetClaimed::SIGNATURE_HASH => ActivityType::FaucetClaim,
        _ => ActivityType::ContractEvent,
    }
}

/// Decode a raw log into a [`Transfer`], when it carries enough
/// identity to persist (`block_number` and `log_index`).
///
/// ERC-20 transfers (topic arity 3) are decoded in full; everything
/// else is recorded with its activity tag, the emitting contract and a
/// zero amount.
#[must_use]
pub fn decode_log(log: &Log) -> Option<Transfer> {
    let block_number = BlockNumber::new(log.block_number?);
    let log_index = log.log_index?;
    let tx_hash = log.transaction_hash?;
    let topic0 = log.topics().first().copied()?;
    let activity = classify_topic(&topic0);

    if activity == ActivityType::Transfer {
        if log.topics().len() != 3 {
            // Right signature, wrong arity (ERC-721 uses 4 topics).
            trace!(block = %block_number, log_index, "transfer topic with non-ERC20 arity");
            return Some(contract_event(log, block_number, log_index, tx_hash));
        }
        let Ok(decoded) = erc20::Transfer::decode_log(&log.inner) else {
            trace!(block = %block_number, log_index, "undecodable transfer payload");
            return Some(contract_event(log, block_number, log_index, tx_hash));
        };
        let event = decoded.data;
        return Some(Transfer {
            block_number,
            tx_hash,
            log_index,
            from: event.from.into(),
            to: event.to.into(),
            amount: TokenAmount::from_u256(event.value),
            token: log.address().into(),
            activity: ActivityType::Transfer,
            symbol: None,
        });
    }

    Some(Transfer {
        block_number,
        tx_hash,
        log_index,
        from: EthAddress::ZERO,
        to: EthAddress::ZERO,
        amount: TokenAmount::zero(),
        token: log.address().into(),
        activity,
        symbol: None,
    })
}

fn contract_event(
    log: &Log,
    block_number: BlockNumber,
    log_index: u64,
    tx_hash: B256,
) -> Transfer {
    Transfer {
        block_number,
        tx_hash,
        log_index,
        from: EthAddress::ZERO,
        to: EthAddress::ZERO,
        amount: TokenAmount::zero(),
        token: log.address().into(),
        activity: ActivityType::ContractEvent,
        symbol: None,
    }
}

/// Synthesize transfers from the full-block transaction walk.
///
/// Value-moving transactions become `ETH_TRANSFER` with the zero token
/// address; contract creations become `DEPLOY`. Synthetic log indexes
/// start at [`SYNTHETIC_LOG_BASE`] so they never collide with real logs.
#[must_use]
pub fn decode_transactions(block_number: BlockNumber, txs: &[RpcTransaction]) -> Vec<Transfer> {
    txs.iter()
        .filter_map(|tx| {
            let (activity, to) = match tx.to {
                None => (ActivityType::Deploy, EthAddress::ZERO),
                Some(to) if !tx.value.is_zero() => (ActivityType::EthTransfer, to.into()),
                Some(_) => return None,
            };
            Some(Transfer {
                block_number,
                tx_hash: tx.hash,
                log_index: SYNTHETIC_LOG_BASE + tx.transaction_index,
                from: tx.from.into(),
                to,
                amount: TokenAmount::from_u256(tx.value),
                token: EthAddress::ZERO,
                activity,
                symbol: None,
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use alloy::primitives::{Address, LogData, U256, address, b256};
    use rstest::rstest;

    use super::*;

    fn raw_log(topics: Vec<B256>, data: Vec<u8>) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: address!("00000000000000000000000000000000000000aa"),
                data: LogData::new_unchecked(topics, data.into()),
            },
            block_hash: Some(b256!(
                "1111111111111111111111111111111111111111111111111111111111111111"
            )),
            block_number: Some(100),
            block_timestamp: None,
            transaction_hash: Some(b256!(
                "2222222222222222222222222222222222222222222222222222222222222222"
            )),
            transaction_index: Some(0),
            log_index: Some(3),
            removed: false,
        }
    }

    fn topic_address(addr: Address) -> B256 {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(addr.as_slice());
        B256::from(bytes)
    }

    #[test]
    fn decodes_erc20_transfer() {
        let from = address!("1000000000000000000000000000000000000001");
        let to = address!("2000000000000000000000000000000000000002");
        let amount = U256::from(1_500_000_000_000_000_000_u128);

        let log = raw_log(
            vec![
                erc20::Transfer::SIGNATURE_HASH,
                topic_address(from),
                topic_address(to),
            ],
            amount.to_be_bytes_vec(),
        );

        let transfer = decode_log(&log).unwrap();
        assert_eq!(transfer.activity, ActivityType::Transfer);
        assert_eq!(transfer.from, EthAddress::from(from));
        assert_eq!(transfer.to, EthAddress::from(to));
        assert_eq!(transfer.amount, TokenAmount::from_u256(amount));
        assert_eq!(transfer.block_number.value(), 100);
        assert_eq!(transfer.log_index, 3);
        assert!(transfer.symbol.is_none());
    }

    #[test]
    fn transfer_topic_with_four_topics_is_contract_event() {
        // ERC-721 Transfer has an indexed tokenId as topic 3.
        let log = raw_log(
            vec![
                erc20::Transfer::SIGNATURE_HASH,
                B256::from([1; 32]),
                B256::from([2; 32]),
                B256::from([3; 32]),
            ],
            vec![],
        );
        let transfer = decode_log(&log).unwrap();
        assert_eq!(transfer.activity, ActivityType::ContractEvent);
    }

    #[rstest]
    #[case(erc20::Approval::SIGNATURE_HASH, ActivityType::Approve)]
    #[case(dex::Swap::SIGNATURE_HASH, ActivityType::Swap)]
    #[case(dex::Mint::SIGNATURE_HASH, ActivityType::Mint)]
    #[case(faucet::FaucetClaimed::SIGNATURE_HASH, ActivityType::FaucetClaim)]
    #[case(B256::from([0xEE; 32]), ActivityType::ContractEvent)]
    fn topic_table_classification(#[case] topic: B256, #[case] expected: ActivityType) {
        assert_eq!(classify_topic(&topic), expected);
    }

    #[test]
    fn log_without_identity_is_dropped() {
        let mut log = raw_log(vec![erc20::Transfer::SIGNATURE_HASH], vec![]);
        log.log_index = None;
        assert!(decode_log(&log).is_none());
    }

    #[test]
    fn native_transfer_walk() {
        let txs = vec![
            RpcTransaction {
                hash: b256!("3333333333333333333333333333333333333333333333333333333333333333"),
                from: address!("1000000000000000000000000000000000000001"),
                to: Some(address!("2000000000000000000000000000000000000002")),
                value: U256::from(42u64),
                gas: 21_000,
                transaction_index: 0,
            },
            // Zero-value call: not a transfer.
            RpcTransaction {
                hash: b256!("4444444444444444444444444444444444444444444444444444444444444444"),
                from: address!("1000000000000000000000000000000000000001"),
                to: Some(address!("2000000000000000000000000000000000000002")),
                value: U256::ZERO,
                gas: 50_000,
                transaction_index: 1,
            },
            // Contract creation.
            RpcTransaction {
                hash: b256!("5555555555555555555555555555555555555555555555555555555555555555"),
                from: address!("1000000000000000000000000000000000000001"),
                to: None,
                value: U256::ZERO,
                gas: 1_000_000,
                transaction_index: 2,
            },
        ];

        let transfers = decode_transactions(BlockNumber::new(7), &txs);
        assert_eq!(transfers.len(), 2);

        assert_eq!(transfers[0].activity, ActivityType::EthTransfer);
        assert!(transfers[0].token.is_zero());
        assert_eq!(transfers[0].log_index, SYNTHETIC_LOG_BASE);

        assert_eq!(transfers[1].activity, ActivityType::Deploy);
        assert_eq!(transfers[1].log_index, SYNTHETIC_LOG_BASE + 2);
    }
}
