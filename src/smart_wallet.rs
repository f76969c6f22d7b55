use ethers::contract::abigen;

// Minimal smart wallet ABI: owner read-back after the replay, and the single-call
// `execute` the rescue operation runs.
abigen!(
    SmartWallet,
    r#"[
        function isOwnerAddress(address account) view returns (bool)
        function ownerAtIndex(uint256 index) view returns (bytes)
        function execute(address target, uint256 value, bytes data)
    ]"#
);
