//! Call encoding for the HashedTimelock registry contract
//!
//! Shared by the EVM and Tron adapters, which run the same contract.

use crate::chain::{ContractStatus, HtlcParams};
use crate::error::{SwapError, SwapResult};
use crate::secret::{Secret, SECRET_LEN};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, U256};
use sha3::{Digest, Keccak256};

pub const NEW_CONTRACT: &str = "newContract(address,bytes32,uint256)";
pub const WITHDRAW: &str = "withdraw(bytes32,bytes32)";
pub const REFUND: &str = "refund(bytes32)";
pub const GET_CONTRACT: &str = "getContract(bytes32)";

pub const EVENT_NEW: &str = "HTLCNew(bytes32,address,address,uint256,bytes32,uint256)";
pub const EVENT_WITHDRAW: &str = "HTLCWithdraw(bytes32)";
pub const EVENT_REFUND: &str = "HTLCRefund(bytes32)";

pub fn keccak(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak(signature.as_bytes())
}

fn call(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend(abi::encode(tokens));
    data
}

/// ABI-encoded arguments without the selector (Tron takes them separately)
pub fn encode_args(tokens: &[Token]) -> Vec<u8> {
    abi::encode(tokens)
}

pub fn new_contract_args(receiver: Address, params: &HtlcParams) -> Vec<Token> {
    vec![
        Token::Address(receiver),
        Token::FixedBytes(params.hash_lock.as_bytes().to_vec()),
        Token::Uint(U256::from(params.time_lock)),
    ]
}

pub fn new_contract(receiver: Address, params: &HtlcParams) -> Vec<u8> {
    call(NEW_CONTRACT, &new_contract_args(receiver, params))
}

pub fn withdraw_args(contract_id: [u8; 32], secret: &Secret) -> Vec<Token> {
    vec![
        Token::FixedBytes(contract_id.to_vec()),
        Token::FixedBytes(secret.as_bytes().to_vec()),
    ]
}

pub fn withdraw(contract_id: [u8; 32], secret: &Secret) -> Vec<u8> {
    call(WITHDRAW, &withdraw_args(contract_id, secret))
}

pub fn id_args(contract_id: [u8; 32]) -> Vec<Token> {
    vec![Token::FixedBytes(contract_id.to_vec())]
}

pub fn refund(contract_id: [u8; 32]) -> Vec<u8> {
    call(REFUND, &id_args(contract_id))
}

pub fn get_contract(contract_id: [u8; 32]) -> Vec<u8> {
    call(GET_CONTRACT, &id_args(contract_id))
}

/// Decoded `getContract` result
#[derive(Debug, Clone, PartialEq)]
pub struct OnChainHtlc {
    pub sender: Address,
    pub receiver: Address,
    pub amount: U256,
    pub hash_lock: [u8; 32],
    pub time_lock: U256,
    pub withdrawn: bool,
    pub refunded: bool,
    pub preimage: [u8; 32],
}

impl OnChainHtlc {
    /// Unknown ids decode to an all-zero record
    pub fn exists(&self) -> bool {
        self.sender != Address::zero()
    }

    pub fn into_status(self, funding_tx: Option<String>) -> ContractStatus {
        let revealed_secret = if self.withdrawn && self.preimage != [0u8; SECRET_LEN] {
            Some(Secret::from_bytes(self.preimage))
        } else {
            None
        };

        ContractStatus {
            exists: self.exists(),
            redeemed: self.withdrawn,
            refunded: self.refunded,
            revealed_secret,
            funding_tx,
        }
    }
}

pub fn decode_get_contract(data: &[u8]) -> SwapResult<OnChainHtlc> {
    let tokens = abi::decode(
        &[
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::FixedBytes(32),
            ParamType::Uint(256),
            ParamType::Bool,
            ParamType::Bool,
            ParamType::FixedBytes(32),
        ],
        data,
    )
    .map_err(|e| SwapError::Contract(format!("Failed to decode getContract: {}", e)))?;

    let mut it = tokens.into_iter();
    let mut next = || {
        it.next()
            .ok_or_else(|| SwapError::Contract("Short getContract result".to_string()))
    };

    let bad = || SwapError::Contract("Unexpected getContract token types".to_string());

    Ok(OnChainHtlc {
        sender: next()?.into_address().ok_or_else(bad)?,
        receiver: next()?.into_address().ok_or_else(bad)?,
        amount: next()?.into_uint().ok_or_else(bad)?,
        hash_lock: next()?.into_fixed_bytes().and_then(to_array32).ok_or_else(bad)?,
        time_lock: next()?.into_uint().ok_or_else(bad)?,
        withdrawn: next()?.into_bool().ok_or_else(bad)?,
        refunded: next()?.into_bool().ok_or_else(bad)?,
        preimage: next()?.into_fixed_bytes().and_then(to_array32).ok_or_else(bad)?,
    })
}

fn to_array32(bytes: Vec<u8>) -> Option<[u8; 32]> {
    bytes.try_into().ok()
}

pub fn parse_contract_id(id: &str) -> SwapResult<[u8; 32]> {
    let bytes = hex::decode(id.trim_start_matches("0x"))
        .map_err(|e| SwapError::Validation(format!("Invalid contract id {}: {}", id, e)))?;
    to_array32(bytes).ok_or_else(|| SwapError::Validation(format!("Contract id {} is not 32 bytes", id)))
}
