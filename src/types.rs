use ethers::abi::{InvalidOutputType, Token, Tokenizable};
use ethers::types::{Address, Bytes, H256, U256};

/// Owner bytes length of an address owner (`abi.encode(address)`), as opposed to a
/// 64-byte passkey owner.
pub const ADDRESS_OWNER_LEN: usize = 32;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Note: EntryPoint v0.7 uses a *different* packed struct layout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// True for the operation that deployed its sender.
    pub fn has_init_code(&self) -> bool {
        !self.init_code.is_empty()
    }
}

// Field order matches the Solidity struct, so the token is a drop-in argument for
// `handleOps` / `getUserOpHash`.
impl Tokenizable for UserOperation {
    fn from_token(token: Token) -> Result<Self, InvalidOutputType> {
        let fields = match token {
            Token::Tuple(fields) => fields,
            other => {
                return Err(InvalidOutputType(format!(
                    "expected UserOperation tuple, got {other:?}"
                )))
            }
        };
        let fields: [Token; 11] = fields.try_into().map_err(|f: Vec<Token>| {
            InvalidOutputType(format!("expected 11 UserOperation fields, got {}", f.len()))
        })?;
        let [sender, nonce, init_code, call_data, call_gas_limit, verification_gas_limit, pre_verification_gas, max_fee_per_gas, max_priority_fee_per_gas, paymaster_and_data, signature] =
            fields;

        Ok(Self {
            sender: Address::from_token(sender)?,
            nonce: U256::from_token(nonce)?,
            init_code: Bytes::from_token(init_code)?,
            call_data: Bytes::from_token(call_data)?,
            call_gas_limit: U256::from_token(call_gas_limit)?,
            verification_gas_limit: U256::from_token(verification_gas_limit)?,
            pre_verification_gas: U256::from_token(pre_verification_gas)?,
            max_fee_per_gas: U256::from_token(max_fee_per_gas)?,
            max_priority_fee_per_gas: U256::from_token(max_priority_fee_per_gas)?,
            paymaster_and_data: Bytes::from_token(paymaster_and_data)?,
            signature: Bytes::from_token(signature)?,
        })
    }

    fn into_token(self) -> Token {
        Token::Tuple(vec![
            self.sender.into_token(),
            self.nonce.into_token(),
            self.init_code.into_token(),
            self.call_data.into_token(),
            self.call_gas_limit.into_token(),
            self.verification_gas_limit.into_token(),
            self.pre_verification_gas.into_token(),
            self.max_fee_per_gas.into_token(),
            self.max_priority_fee_per_gas.into_token(),
            self.paymaster_and_data.into_token(),
            self.signature.into_token(),
        ])
    }
}

/// Decoded `AddOwner(uint256 indexed index, bytes owner)` log of a smart wallet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipEvent {
    pub account: Address,
    /// Owner slot the wallet assigned.
    pub index: U256,
    /// Raw owner identifier: a 32-byte ABI-encoded address or a 64-byte passkey.
    pub owner: Bytes,
    /// Absent when the log source does not report it.
    pub block_number: Option<u64>,
    pub transaction_hash: H256,
}

impl OwnershipEvent {
    /// A 32-byte owner is the address-style recovery credential.
    pub fn is_recovery_owner(&self) -> bool {
        self.owner.len() == ADDRESS_OWNER_LEN
    }

    /// The owner as an address, if it is an ABI-encoded address.
    pub fn owner_address(&self) -> Option<Address> {
        if !self.is_recovery_owner() || self.owner[..12].iter().any(|b| *b != 0) {
            return None;
        }
        Some(Address::from_slice(&self.owner[12..]))
    }
}

/// One call frame of a re-executed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallFrame {
    /// CALL, DELEGATECALL, STATICCALL, CREATE, ...
    pub kind: String,
    /// Absent for contract creations.
    pub to: Option<Address>,
    pub input: Bytes,
    /// 0 for the top-level call.
    pub depth: usize,
}

impl CallFrame {
    pub fn is_call(&self) -> bool {
        self.kind.eq_ignore_ascii_case("CALL")
    }
}

/// Flat, ordered call frames of one transaction (outer-to-inner).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionTrace {
    pub tx_hash: H256,
    pub frames: Vec<CallFrame>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_operation_token_roundtrip_keeps_field_order() {
        let op = UserOperation {
            sender: Address::repeat_byte(0x11),
            nonce: U256::from(7),
            init_code: Bytes::from(vec![1, 2, 3]),
            call_gas_limit: U256::from(100),
            max_fee_per_gas: U256::from(5),
            signature: Bytes::from(vec![9; 65]),
            ..Default::default()
        };

        let token = op.clone().into_token();
        match &token {
            Token::Tuple(fields) => {
                assert_eq!(fields.len(), 11);
                assert_eq!(fields[0], Token::Address(op.sender));
                assert_eq!(fields[4], Token::Uint(U256::from(100)));
            }
            other => panic!("unexpected token {other:?}"),
        }
        assert_eq!(UserOperation::from_token(token).unwrap(), op);
    }

    #[test]
    fn from_token_rejects_short_tuple() {
        let token = Token::Tuple(vec![Token::Address(Address::zero())]);
        assert!(UserOperation::from_token(token).is_err());
    }

    #[test]
    fn recovery_owner_is_the_32_byte_owner() {
        let mut encoded = vec![0u8; 12];
        encoded.extend_from_slice(Address::repeat_byte(0xab).as_bytes());
        let event = OwnershipEvent {
            account: Address::repeat_byte(1),
            index: U256::one(),
            owner: Bytes::from(encoded),
            block_number: Some(10),
            transaction_hash: H256::zero(),
        };
        assert!(event.is_recovery_owner());
        assert_eq!(event.owner_address(), Some(Address::repeat_byte(0xab)));

        let passkey = OwnershipEvent {
            owner: Bytes::from(vec![7u8; 64]),
            ..event
        };
        assert!(!passkey.is_recovery_owner());
        assert_eq!(passkey.owner_address(), None);
    }
}
