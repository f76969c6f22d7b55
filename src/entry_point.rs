use crate::codec::selector;
use crate::error::CodecError;
use crate::types::UserOperation;
use ethers::abi::{self, Tokenizable};
use ethers::contract::abigen;
use ethers::types::{Bytes, H256};

// EntryPoint v0.6 reads. `getUserOpHash` takes the UserOperation tuple, so it is encoded
// by hand below instead of through the binding.
abigen!(
    EntryPoint,
    r#"[
        function getNonce(address sender, uint192 key) view returns (uint256)
    ]"#
);

pub const GET_USER_OP_HASH_SIGNATURE: &str = "getUserOpHash((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes))";

pub fn get_user_op_hash_selector() -> [u8; 4] {
    selector(GET_USER_OP_HASH_SIGNATURE)
}

/// Calldata for `EntryPoint.getUserOpHash(op)`.
pub fn encode_get_user_op_hash(op: &UserOperation) -> Bytes {
    let mut out = get_user_op_hash_selector().to_vec();
    out.extend(abi::encode(&[op.clone().into_token()]));
    Bytes::from(out)
}

pub fn decode_user_op_hash(raw: &[u8]) -> Result<H256, CodecError> {
    if raw.len() != 32 {
        return Err(CodecError::Malformed {
            what: "getUserOpHash result",
            reason: format!("expected 32 bytes, got {}", raw.len()),
        });
    }
    Ok(H256::from_slice(raw))
}
