//! Contract bindings for leverage tokens and the rebalancer executor.
//!
//! - `ILeverageManager`: token state, adapters, creation events
//! - `IRebalanceAdapter`: Dutch auction and pre-liquidation policy
//! - `ILendingAdapter`: collateral/debt conversions
//! - `IRebalancer`: our executor contract (flash take + swap calls)

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolError};

sol! {
    /// Leverage token state as reported by the manager.
    #[derive(Debug, PartialEq, Eq)]
    struct LeverageTokenState {
        uint256 collateralInDebtAsset;
        uint256 debt;
        uint256 equity;
        uint256 collateralRatio;
    }

    #[derive(Debug)]
    struct LeverageTokenConfig {
        address lendingAdapter;
        address rebalanceAdapter;
        uint256 mintTokenFee;
        uint256 redeemTokenFee;
    }

    #[sol(rpc)]
    interface ILeverageManager {
        event LeverageTokenCreated(
            address indexed token,
            address collateralAsset,
            address debtAsset,
            LeverageTokenConfig config
        );

        error InvalidLeverageTokenStateAfterRebalance(address token);

        function getLeverageTokenState(address token)
            external
            view
            returns (LeverageTokenState memory state);
    }

    #[sol(rpc)]
    interface IRebalanceAdapter {
        error AuctionNotValid();

        function getLeverageTokenTargetCollateralRatio() external view returns (uint256);
        function getCollateralRatioThreshold() external view returns (uint256);
        function getRebalanceReward() external view returns (uint256);
        function isAuctionValid() external view returns (bool);
        function getAmountIn(uint256 amountOut) external view returns (uint256);
        function isEligibleForRebalance(
            address token,
            LeverageTokenState memory state,
            address caller
        ) external view returns (bool);
        function createAuction() external;
    }

    #[sol(rpc)]
    interface ILendingAdapter {
        function convertDebtToCollateralAsset(uint256 debt) external view returns (uint256);
        function convertCollateralToDebtAsset(uint256 collateral) external view returns (uint256);
    }

    interface IRebalancer {
        struct Call {
            address target;
            uint256 value;
            bytes data;
        }

        function takeAuction(address rebalanceAdapter, uint256 amountOut, Call[] calldata swapCalls)
            external;

        function preLiquidationRebalance(
            address leverageToken,
            uint256 collateralAmount,
            Call[] calldata swapCalls
        ) external;
    }
}

/// Revert selectors that mean "state moved since we read it".
pub fn stale_state_selectors() -> [[u8; 4]; 2] {
    [
        ILeverageManager::InvalidLeverageTokenStateAfterRebalance::SELECTOR,
        IRebalanceAdapter::AuctionNotValid::SELECTOR,
    ]
}

/// Error names matched in RPC messages when no revert data is returned.
pub const STALE_STATE_NAMES: [&str; 2] = ["InvalidLeverageTokenStateAfterRebalance", "AuctionNotValid"];

/// Unsigned call to a contract, ready for simulation or submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// Short label for logs (e.g. "takeAuction")
    pub label: &'static str,
}

/// Encode `createAuction()` on a rebalance adapter.
pub fn encode_create_auction(rebalance_adapter: Address) -> ExecutionRequest {
    ExecutionRequest {
        to: rebalance_adapter,
        data: IRebalanceAdapter::createAuctionCall {}.abi_encode().into(),
        value: U256::ZERO,
        label: "createAuction",
    }
}

/// Encode a flash auction take through the rebalancer contract.
pub fn encode_take_auction(
    rebalancer: Address,
    rebalance_adapter: Address,
    amount_out: U256,
    swap_calls: Vec<IRebalancer::Call>,
) -> ExecutionRequest {
    let call = IRebalancer::takeAuctionCall {
        rebalanceAdapter: rebalance_adapter,
        amountOut: amount_out,
        swapCalls: swap_calls,
    };
    ExecutionRequest {
        to: rebalancer,
        data: call.abi_encode().into(),
        value: U256::ZERO,
        label: "takeAuction",
    }
}

/// Encode a pre-liquidation rebalance through the rebalancer contract.
pub fn encode_pre_liquidation(
    rebalancer: Address,
    leverage_token: Address,
    collateral_amount: U256,
    swap_calls: Vec<IRebalancer::Call>,
) -> ExecutionRequest {
    let call = IRebalancer::preLiquidationRebalanceCall {
        leverageToken: leverage_token,
        collateralAmount: collateral_amount,
        swapCalls: swap_calls,
    };
    ExecutionRequest {
        to: rebalancer,
        data: call.abi_encode().into(),
        value: U256::ZERO,
        label: "preLiquidationRebalance",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_auction_roundtrip() {
        let rebalancer = Address::repeat_byte(0x01);
        let adapter = Address::repeat_byte(0x02);
        let calls = vec![IRebalancer::Call {
            target: Address::repeat_byte(0x03),
            value: U256::ZERO,
            data: Bytes::from(vec![0xab]),
        }];

        let req = encode_take_auction(rebalancer, adapter, U256::from(1_000u64), calls);
        assert_eq!(req.to, rebalancer);
        assert_eq!(req.label, "takeAuction");

        let decoded = IRebalancer::takeAuctionCall::abi_decode(&req.data, true).unwrap();
        assert_eq!(decoded.rebalanceAdapter, adapter);
        assert_eq!(decoded.amountOut, U256::from(1_000u64));
        assert_eq!(decoded.swapCalls.len(), 1);
        assert_eq!(decoded.swapCalls[0].data, Bytes::from(vec![0xab]));
    }

    #[test]
    fn test_create_auction_targets_adapter() {
        let adapter = Address::repeat_byte(0x22);
        let req = encode_create_auction(adapter);
        assert_eq!(req.to, adapter);
        assert_eq!(&req.data[..], &IRebalanceAdapter::createAuctionCall::SELECTOR[..]);
    }

    #[test]
    fn test_stale_selectors_are_distinct() {
        let [a, b] = stale_state_selectors();
        assert_ne!(a, b);
    }
}
