//! Virtual-bank custodian contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe call and event bindings for
//! the multisig contract deployed on account-model chains.

use alloy::sol;

sol! {
    /// Custodian multisig contract
    interface IVirtualBank {
        /// Create (first signer) or co-sign a withdrawal keyed by `txKey`.
        /// `signatures` is the concatenation of 65-byte custodian signatures.
        function createOrSignWithdraw(
            string txKey,
            address to,
            uint256 amount,
            bool isContractAsset,
            address erc20,
            bytes signatures
        ) external;

        /// Add and remove custodians; `count` is the current custodian count
        function createOrSignManagerChange(
            string txKey,
            address[] adds,
            address[] removes,
            uint8 count,
            bytes signatures
        ) external;

        /// Move custody to an upgraded contract
        function createOrSignUpgrade(
            string txKey,
            address upgradeContract,
            bytes signatures
        ) external;

        /// Deposit entry point. `to` is the home-ledger recipient address,
        /// `erc20` is zero for native deposits.
        function crossOut(string to, uint256 amount, address erc20) external payable;

        event CrossOutFunds(address from, string to, uint256 amount, address erc20);
        event TxWithdrawCompleted(string txKey);
        event TxManagerChangeCompleted(string txKey);
        event TxUpgradeCompleted(string txKey);
    }

    /// Minimal ERC-20 surface seen in direct token deposits
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);

        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}
