//! EntryPoint v0.6 wire format: `handleOps` calldata, the cross-chain nonce key and the
//! smart-wallet signature wrapper. Pure transforms; failures are [`CodecError`]s.

use crate::error::CodecError;
use crate::types::UserOperation;
use ethers::abi::{self, ParamType, Token, Tokenizable};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::keccak256;

pub const HANDLE_OPS_SIGNATURE: &str = "handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)[],address)";

/// Nonce key the smart wallet reserves for operations validated without the chain id.
/// The value is Base's chain id, but the key means "every chain".
pub const REPLAYABLE_NONCE_KEY: u64 = 8453;

const NONCE_SEQUENCE_BITS: usize = 64;
const ADDRESS_LEN: usize = 20;

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// `0x1fad948c`
pub fn handle_ops_selector() -> [u8; 4] {
    selector(HANDLE_OPS_SIGNATURE)
}

pub fn user_operation_param() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Bytes,
        ParamType::Bytes,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Bytes,
        ParamType::Bytes,
    ])
}

fn sequence_mask() -> U256 {
    U256::from(u64::MAX)
}

/// Packs a chain id into the key bits above the 64-bit sequence. Every other bit,
/// sequence included, is zero, so the result is also the first nonce of that key.
pub fn encode_nonce_key(chain_id: u64) -> U256 {
    U256::from(chain_id) << NONCE_SEQUENCE_BITS
}

/// `key | sequence` for a key from [`encode_nonce_key`], the layout of the EntryPoint's
/// 2D nonces.
pub fn compose_nonce(key: U256, sequence: u64) -> U256 {
    (key & !sequence_mask()) | U256::from(sequence)
}

pub fn nonce_key(nonce: U256) -> U256 {
    nonce >> NONCE_SEQUENCE_BITS
}

pub fn nonce_sequence(nonce: U256) -> u64 {
    nonce.low_u64()
}

/// True iff the nonce carries the all-chains key. The sequence is not inspected and
/// the answer does not depend on the chain the caller is connected to.
pub fn is_replayable_nonce(nonce: U256) -> bool {
    nonce & !sequence_mask() == encode_nonce_key(REPLAYABLE_NONCE_KEY)
}

/// Decodes `handleOps(ops, beneficiary)` calldata into its operations.
pub fn decode_batch_call(calldata: &[u8]) -> Result<Vec<UserOperation>, CodecError> {
    if calldata.len() < 4 || calldata[..4] != handle_ops_selector() {
        return Err(CodecError::NotABatchCall {
            selector: hex::encode(&calldata[..calldata.len().min(4)]),
        });
    }

    let tokens = abi::decode(
        &[
            ParamType::Array(Box::new(user_operation_param())),
            ParamType::Address,
        ],
        &calldata[4..],
    )
    .map_err(|e| CodecError::Malformed {
        what: "handleOps calldata",
        reason: e.to_string(),
    })?;

    let ops = match tokens.into_iter().next() {
        Some(Token::Array(ops)) => ops,
        other => {
            return Err(CodecError::Malformed {
                what: "handleOps calldata",
                reason: format!("expected an array of operations, got {other:?}"),
            })
        }
    };

    ops.into_iter()
        .map(|token| {
            UserOperation::from_token(token).map_err(|e| CodecError::Malformed {
                what: "UserOperation",
                reason: e.0,
            })
        })
        .collect()
}

pub fn encode_handle_ops(ops: &[UserOperation], beneficiary: Address) -> Bytes {
    let tokens = [
        Token::Array(ops.iter().cloned().map(Tokenizable::into_token).collect()),
        Token::Address(beneficiary),
    ];
    let mut out = handle_ops_selector().to_vec();
    out.extend(abi::encode(&tokens));
    Bytes::from(out)
}

/// Submission payload for a single operation carrying `signature`.
pub fn encode_signed_operation(
    op: &UserOperation,
    signature: Bytes,
    beneficiary: Address,
) -> Bytes {
    let signed = UserOperation {
        signature,
        ..op.clone()
    };
    encode_handle_ops(std::slice::from_ref(&signed), beneficiary)
}

/// initCode = factory address (20 bytes) ‖ factory calldata.
pub fn split_init_code(init_code: &[u8]) -> Result<(Address, Bytes), CodecError> {
    if init_code.len() < ADDRESS_LEN {
        return Err(CodecError::InitCodeTooShort {
            len: init_code.len(),
        });
    }
    let factory = Address::from_slice(&init_code[..ADDRESS_LEN]);
    Ok((factory, Bytes::from(init_code[ADDRESS_LEN..].to_vec())))
}

/// The smart wallet's owner encoding for an address owner.
pub fn encode_owner_address(owner: Address) -> Bytes {
    Bytes::from(abi::encode(&[Token::Address(owner)]))
}

/// `abi.encode(SignatureWrapper { ownerIndex, signatureData })`, the signature format
/// the smart wallet validates against the owner at `owner_index`.
pub fn wrap_owner_signature(owner_index: U256, signature: &[u8]) -> Bytes {
    Bytes::from(abi::encode(&[Token::Tuple(vec![
        Token::Uint(owner_index),
        Token::Bytes(signature.to_vec()),
    ])]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(sender: u8, nonce: U256) -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(sender),
            nonce,
            init_code: Bytes::from(vec![0xaa; 24]),
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            call_gas_limit: U256::from(2_000_000u64),
            verification_gas_limit: U256::from(1_000_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_fee_per_gas: U256::exp10(9),
            max_priority_fee_per_gas: U256::exp10(9),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::from(vec![0x01; 65]),
        }
    }

    #[test]
    fn handle_ops_selector_matches_entry_point_v06() {
        assert_eq!(hex::encode(handle_ops_selector()), "1fad948c");
    }

    #[test]
    fn encoded_sentinel_key_is_replayable_and_no_other_chain_is() {
        let key = encode_nonce_key(REPLAYABLE_NONCE_KEY);
        assert!(is_replayable_nonce(key));
        assert_eq!(key, U256::from(8453u64) << 64);
        assert_eq!(nonce_sequence(key), 0);

        for chain_id in [0u64, 1, 10, 8452, 8454, 84532, 666_666_666, u64::MAX] {
            assert!(
                !is_replayable_nonce(encode_nonce_key(chain_id)),
                "chain id {chain_id}"
            );
        }
    }

    #[test]
    fn replayable_nonce_depends_only_on_key() {
        let replayable = compose_nonce(encode_nonce_key(REPLAYABLE_NONCE_KEY), 0);
        assert!(is_replayable_nonce(replayable));
        assert_eq!(replayable, encode_nonce_key(REPLAYABLE_NONCE_KEY));

        // Sequence bits do not matter.
        assert!(is_replayable_nonce(compose_nonce(
            encode_nonce_key(REPLAYABLE_NONCE_KEY),
            41
        )));

        for chain_id in [0u64, 1, 10, 8452, 8454, 666_666_666, u64::MAX] {
            let nonce = compose_nonce(encode_nonce_key(chain_id), 0);
            assert!(!is_replayable_nonce(nonce), "chain id {chain_id}");
        }

        // A plain sequential nonce has key 0.
        assert!(!is_replayable_nonce(U256::from(8453u64)));
        // Key bits above the chain id also count.
        assert!(!is_replayable_nonce(
            encode_nonce_key(REPLAYABLE_NONCE_KEY) | (U256::one() << 128)
        ));
    }

    #[test]
    fn nonce_parts_split_back() {
        let nonce = compose_nonce(encode_nonce_key(77), 9);
        assert_eq!(nonce_key(nonce), U256::from(77));
        assert_eq!(nonce_sequence(nonce), 9);
    }

    #[test]
    fn decode_batch_call_returns_encoded_operations() {
        let ops = vec![
            op(0x11, U256::zero()),
            op(0x22, compose_nonce(encode_nonce_key(REPLAYABLE_NONCE_KEY), 0)),
        ];
        let calldata = encode_handle_ops(&ops, Address::repeat_byte(0x99));
        assert_eq!(decode_batch_call(&calldata).unwrap(), ops);
    }

    #[test]
    fn decode_batch_call_rejects_other_selectors() {
        let err = decode_batch_call(&[0xde, 0xad, 0xbe, 0xef, 0x00]).unwrap_err();
        assert_eq!(
            err,
            CodecError::NotABatchCall {
                selector: "deadbeef".into()
            }
        );
        assert!(matches!(
            decode_batch_call(&[0x1f]),
            Err(CodecError::NotABatchCall { .. })
        ));
    }

    #[test]
    fn decode_batch_call_rejects_truncated_payload() {
        let calldata = encode_handle_ops(&[op(0x11, U256::zero())], Address::zero());
        let truncated = &calldata[..calldata.len() - 40];
        assert!(matches!(
            decode_batch_call(truncated),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn signed_operation_replaces_only_the_signature() {
        let unsigned = UserOperation {
            signature: Bytes::default(),
            ..op(0x11, U256::from(3))
        };
        let signature = Bytes::from(vec![0x42; 97]);
        let calldata = encode_signed_operation(&unsigned, signature.clone(), Address::zero());

        let decoded = decode_batch_call(&calldata).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].signature, signature);
        assert_eq!(
            UserOperation {
                signature: Bytes::default(),
                ..decoded[0].clone()
            },
            unsigned
        );
    }

    #[test]
    fn split_init_code_separates_factory() {
        let mut init_code = Address::repeat_byte(0x0b).as_bytes().to_vec();
        init_code.extend_from_slice(&[0x3f, 0xfb, 0xa3, 0x6f]);
        let (factory, payload) = split_init_code(&init_code).unwrap();
        assert_eq!(factory, Address::repeat_byte(0x0b));
        assert_eq!(payload.as_ref(), &[0x3f, 0xfb, 0xa3, 0x6f]);

        assert_eq!(
            split_init_code(&[1, 2, 3]).unwrap_err(),
            CodecError::InitCodeTooShort { len: 3 }
        );
    }

    #[test]
    fn owner_encoding_is_one_word() {
        let encoded = encode_owner_address(Address::repeat_byte(0xcd));
        assert_eq!(encoded.len(), 32);
        assert!(encoded[..12].iter().all(|b| *b == 0));
        assert_eq!(&encoded[12..], Address::repeat_byte(0xcd).as_bytes());
    }

    #[test]
    fn signature_wrapper_is_a_dynamic_tuple() {
        let wrapped = wrap_owner_signature(U256::one(), &[0x07; 65]);
        let tokens = abi::decode(
            &[ParamType::Tuple(vec![ParamType::Uint(256), ParamType::Bytes])],
            &wrapped,
        )
        .unwrap();
        assert_eq!(
            tokens,
            vec![Token::Tuple(vec![
                Token::Uint(U256::one()),
                Token::Bytes(vec![0x07; 65])
            ])]
        );
        // tuple offset, index, bytes offset, bytes length, three data words
        assert_eq!(wrapped.len(), 32 * 7);
    }
}
