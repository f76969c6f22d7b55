pub mod codec;
pub mod config;
pub mod encoding;
pub mod entry_point;
pub mod erc20;
pub mod error;
pub mod gateway;
pub mod rescue;
pub mod scanner;
pub mod smart_wallet;
pub mod trace;
pub mod types;
