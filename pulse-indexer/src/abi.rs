//! ABI bindings for the event signatures the decoder recognizes.
//!
//! Type-safe bindings via the `alloy::sol!` macro. The decoder matches
//! `topics[0]` against `SIGNATURE_HASH` constants generated here; only
//! the ERC-20 Transfer event is fully decoded, the rest feed the
//! coarse activity-type table.
//!
//! # Usage
//!
//! ```ignore
//! use alloy::sol_types::SolEvent;
//! use pulse_indexer::abi::erc20::Transfer;
//!
//! if log.topics().first() == Some(&Transfer::SIGNATURE_HASH) {
//!     let event = Transfer::decode_log(&log.inner)?;
//! }
//! ```

/// ERC-20 events.
pub mod erc20 {
    use alloy::sol;

    sol! {
        /// Canonical ERC-20 transfer event (topic arity 3).
        ///
        /// `from` is 0x0 for mints, `to` is 0x0 for burns.
        #[derive(Debug, PartialEq, Eq)]
        event Transfer(
            address indexed from,
            address indexed to,
            uint256 value
        );

        /// ERC-20 approval event.
        #[derive(Debug, PartialEq, Eq)]
        event Approval(
            address indexed owner,
            address indexed spender,
            uint256 value
        );

        /// `symbol()` and `decimals()` views, batched by the enricher.
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }
}

/// Uniswap-V2-style pair events, used for coarse activity tagging only.
pub mod dex {
    use alloy::sol;

    sol! {
        /// Pair swap.
        #[derive(Debug, PartialEq, Eq)]
        event Swap(
            address indexed sender,
            uint256 amount0In,
            uint256 amount1In,
            uint256 amount0Out,
            uint256 amount1Out,
            address indexed to
        );

        /// Liquidity mint.
        #[derive(Debug, PartialEq, Eq)]
        event Mint(
            address indexed sender,
            uint256 amount0,
            uint256 amount1
        );
    }
}

/// Devnet faucet events.
pub mod faucet {
    use alloy::sol;

    sol! {
        /// A faucet drip was claimed.
        #[derive(Debug, PartialEq, Eq)]
        event FaucetClaimed(
            address indexed recipient,
            uint256 amount
        );
    }
}

/// Multicall3 aggregate call, used to batch metadata lookups.
///
/// Deployed at the same address on effectively every EVM chain.
pub mod multicall {
    use alloy::sol;

    sol! {
        /// One call in an aggregate batch.
        #[derive(Debug)]
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        /// One result from an aggregate batch.
        #[derive(Debug)]
        struct Result3 {
            bool success;
            bytes returnData;
        }

        /// Batched calls with per-call failure tolerance.
        function aggregate3(Call3[] calldata calls) external payable returns (Result3[] memory returnData);
    }

    /// Canonical Multicall3 deployment address.
    pub const MULTICALL3_ADDRESS: alloy::primitives::Address =
        alloy::primitives::address!("cA11bde05977b3631167028862bE2a173976CA11");
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use alloy::sol_types::SolEvent;

    use super::*;

    #[test]
    fn transfer_signature_is_canonical() {
        // keccak256("Transfer(address,address,uint256)")
        assert_eq!(
            format!("{:x}", erc20::Transfer::SIGNATURE_HASH),
            "ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn signatures_are_distinct() {
        let hashes = [
            erc20::Transfer::SIGNATURE_HASH,
            erc20::Approval::SIGNATURE_HASH,
            dex::Swap::SIGNATURE_HASH,
            dex::Mint::SIGNATURE_HASH,
            faucet::FaucetClaimed::SIGNATURE_HASH,
        ];
        for (i, a) in hashes.iter().enumerate() {
            for b in &hashes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
