use anyhow::{Context, Result};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use serde::Serialize;

/// Offset added to a homestead `v` (27/28) to mark a private transaction.
const PRIVATE_V_OFFSET: u64 = 10;

/// Arguments of `eth_sendTransaction`/`eth_sendTransactionAsync`, and the
/// template every signed transaction is built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionArgs {
    pub from: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    pub gas: U256,
    pub gas_price: U256,
    pub value: U256,
    pub data: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_from: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub private_for: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl TransactionArgs {
    pub fn with_callback(mut self, callback_url: impl Into<String>) -> Self {
        self.callback_url = Some(callback_url.into());
        self
    }

    fn legacy(&self, nonce: u64, data: Bytes, chain_id: Option<u64>) -> TypedTransaction {
        let mut request = TransactionRequest::new()
            .from(self.from)
            .gas(self.gas)
            .gas_price(self.gas_price)
            .value(self.value)
            .data(data)
            .nonce(nonce);
        if let Some(to) = self.to {
            request = request.to(to);
        }
        if let Some(chain_id) = chain_id {
            request = request.chain_id(chain_id);
        }
        request.into()
    }

    /// EIP-155 signed, RLP encoded transaction for `eth_sendRawTransaction`.
    pub fn sign(&self, wallet: &LocalWallet, nonce: u64) -> Result<Bytes> {
        let tx = self.legacy(nonce, self.data.clone(), Some(wallet.chain_id()));
        let signature = wallet
            .sign_transaction_sync(&tx)
            .context("Failed to sign transaction")?;
        Ok(tx.rlp_signed(&signature))
    }

    /// Homestead signed transaction carrying `payload_key` as data, with `v`
    /// moved to 37/38.
    pub fn sign_private(&self, wallet: &LocalWallet, nonce: u64, payload_key: Bytes) -> Result<Bytes> {
        let tx = self.legacy(nonce, payload_key, None);
        let mut signature = wallet
            .sign_hash(tx.sighash())
            .context("Failed to sign private transaction")?;
        signature.v += PRIVATE_V_OFFSET;
        Ok(tx.rlp_signed(&signature))
    }
}

/// Parses a hex payload, with or without `0x`.
pub fn parse_payload(payload: &str) -> Result<Bytes> {
    let trimmed = payload.trim_start_matches("0x");
    let bytes =
        hex::decode(trimmed).with_context(|| format!("Invalid hex payload '{}'", payload))?;
    Ok(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::utils::rlp::Rlp;

    // Well-known dev key (hardhat account #0)
    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn args(from: Address) -> TransactionArgs {
        TransactionArgs {
            from,
            to: Some(Address::repeat_byte(0x11)),
            gas: U256::from(90_000u64),
            gas_price: U256::zero(),
            value: U256::zero(),
            data: Bytes::from(vec![0u8]),
            private_from: None,
            private_for: Vec::new(),
            callback_url: None,
        }
    }

    #[test]
    fn test_args_serialize_as_rpc_object() {
        let tx =
            args(Address::zero()).with_callback("http://localhost:18547/sendTransactionAsync");
        let json = serde_json::to_value(&tx).unwrap();

        assert_eq!(json["gas"], "0x15f90");
        assert_eq!(json["gasPrice"], "0x0");
        assert_eq!(json["data"], "0x00");
        assert_eq!(json["callbackUrl"], "http://localhost:18547/sendTransactionAsync");
        assert!(json.get("privateFor").is_none());
    }

    #[test]
    fn test_signed_transaction_recovers_sender() {
        let wallet = KEY.parse::<LocalWallet>().unwrap().with_chain_id(1337u64);
        let raw = args(wallet.address()).sign(&wallet, 7).unwrap();

        let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(&raw)).unwrap();
        assert_eq!(tx.nonce(), Some(&U256::from(7)));
        assert_eq!(signature.recover(tx.sighash()).unwrap(), wallet.address());
        // EIP-155: v = chain_id * 2 + 35/36
        assert!(signature.v == 1337 * 2 + 35 || signature.v == 1337 * 2 + 36);
    }

    #[test]
    fn test_private_signature_uses_v_37_or_38() {
        let wallet = KEY.parse::<LocalWallet>().unwrap();
        let raw = args(wallet.address())
            .sign_private(&wallet, 0, Bytes::from(vec![0xab; 64]))
            .unwrap();

        let rlp = Rlp::new(&raw);
        let v: u64 = rlp.val_at(6).unwrap();
        assert!(v == 37 || v == 38);
        let data: Vec<u8> = rlp.val_at(5).unwrap();
        assert_eq!(data, vec![0xab; 64]);
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload("00").unwrap(), Bytes::from(vec![0u8]));
        assert_eq!(parse_payload("0xdead").unwrap(), Bytes::from(vec![0xde, 0xad]));
        assert!(parse_payload("zz").is_err());
    }
}
