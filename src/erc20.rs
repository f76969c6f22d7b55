use ethers::contract::abigen;

// Minimal ERC20 ABI for the rescue: read balances, build the transfer executed by the
// wallet, and recognise the resulting Transfer log.
abigen!(
    Erc20,
    r#"[
        function balanceOf(address account) view returns (uint256)
        function transfer(address to, uint256 amount) returns (bool)
        event Transfer(address indexed from, address indexed to, uint256 value)
    ]"#
);
