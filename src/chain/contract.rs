//! Settlement contract interface descriptor
//!
//! The batch entry point is described by a standard JSON ABI fragment loaded
//! once at startup. The settler depends on exactly one function: an entry
//! point taking the ordered agreement identifier array. A malformed
//! descriptor is a fatal startup error - a settler running against the wrong
//! interface would spend gas on calls the contract cannot decode.

use crate::error::{SettlerError, SettlerResult};
use crate::settle::source::AgreementBatch;

use ethers::abi::{Abi, Function, ParamType, Token};
use ethers::types::{Address, Bytes, U256};

/// Parsed interface for the on-chain settlement contract.
#[derive(Debug, Clone)]
pub struct SettlementContract {
    address: Address,
    entry_point: Function,
}

impl SettlementContract {
    /// Load the descriptor file and resolve the batch entry point.
    pub fn load(abi_path: &str, entry_point: &str, address: Address) -> SettlerResult<Self> {
        let raw = std::fs::read_to_string(abi_path).map_err(|e| {
            SettlerError::Descriptor(format!("cannot read {}: {}", abi_path, e))
        })?;
        Self::parse(&raw, entry_point, address)
    }

    /// Parse a descriptor string (a JSON array of method descriptors).
    pub fn parse(raw: &str, entry_point: &str, address: Address) -> SettlerResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| SettlerError::Descriptor(format!("not valid JSON: {}", e)))?;

        if !value.is_array() {
            return Err(SettlerError::Descriptor(
                "descriptor must be a JSON array of method descriptors".to_string(),
            ));
        }

        let abi: Abi = serde_json::from_value(value)
            .map_err(|e| SettlerError::Descriptor(format!("unsupported descriptor entry: {}", e)))?;

        let function = abi
            .function(entry_point)
            .map_err(|_| {
                SettlerError::Descriptor(format!(
                    "entry point {} not found in descriptor",
                    entry_point
                ))
            })?
            .clone();

        // The settler only knows how to hand the contract an ordered list of
        // integer identifiers.
        let takes_id_array = function.inputs.len() == 1
            && matches!(&function.inputs[0].kind, ParamType::Array(inner) if **inner == ParamType::Uint(256));
        if !takes_id_array {
            return Err(SettlerError::Descriptor(format!(
                "entry point {} must take a single uint256[] parameter",
                entry_point
            )));
        }

        Ok(Self {
            address,
            entry_point: function,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn entry_point_name(&self) -> &str {
        &self.entry_point.name
    }

    /// Encode calldata invoking the entry point with one batch.
    pub fn encode_batch(&self, batch: &AgreementBatch) -> SettlerResult<Bytes> {
        let ids: Vec<Token> = batch
            .ids()
            .iter()
            .map(|id| Token::Uint(U256::from(*id)))
            .collect();

        let data = self
            .entry_point
            .encode_input(&[Token::Array(ids)])
            .map_err(|e| SettlerError::Descriptor(format!("calldata encoding failed: {}", e)))?;

        Ok(data.into())
    }

    /// Decode the entry point's declared return value.
    pub fn decode_return(&self, data: &[u8]) -> SettlerResult<Vec<Token>> {
        self.entry_point
            .decode_output(data)
            .map_err(|e| SettlerError::Descriptor(format!("cannot decode return value: {}", e)))
    }
}
