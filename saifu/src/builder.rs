//! Legacy P2PKH transaction construction.
//!
//! Candidates are consumed greedily in the order given until they cover the
//! requested amount plus the fee, with the fee recomputed as inputs are
//! added. When the selected inputs equal the amount exactly, the fee is
//! taken out of the payout instead and no change output is created.
//! Otherwise change above the dust limit returns to the key that contributed
//! the last selected input; dust-sized change is folded into the fee.
//!
//! Every built transaction is signed and then re-verified input by input
//! before it is handed back.

use std::fmt;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::{self, Instruction, Instructions, PushBytesBuf};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use tracing::{debug, error};

use crate::error::{Result, WalletError};
use crate::keys::WalletKey;
use crate::ledger::Utxo;

/// Serialized size of one signed P2PKH input in bytes.
pub const INPUT_SIZE: u64 = 148;
/// Serialized size of one P2PKH output in bytes.
pub const OUTPUT_SIZE: u64 = 34;
/// Version, locktime and count fields of a transaction in bytes.
pub const TX_OVERHEAD: u64 = 10;

/// Sighash flag appended to every signature.
const SIGHASH_ALL_FLAG: u8 = 0x01;

/// Estimated serialized size of a signed transaction in bytes.
#[must_use]
pub const fn estimate_size(inputs: u64, outputs: u64) -> u64 {
    TX_OVERHEAD + inputs * INPUT_SIZE + outputs * OUTPUT_SIZE
}

/// A spendable output paired with the key that can sign for it.
#[derive(Debug, Clone)]
pub struct CandidateInput {
    /// Ledger entry to consume.
    pub utxo: Utxo,
    /// Key owning the entry's locking script.
    pub key: WalletKey,
}

/// A signed, verified transaction with its accounting.
#[derive(Debug, Clone)]
pub struct BuiltTransfer {
    /// The fully signed transaction.
    pub tx: Transaction,
    /// Its transaction id.
    pub txid: Txid,
    /// Satoshis the destination receives.
    pub sent_sats: u64,
    /// Satoshis paid as fee, including any folded dust change.
    pub fee_sats: u64,
    /// Satoshis returned as change, zero when no change output exists.
    pub change_sats: u64,
    /// Outpoints the transaction consumes, in input order.
    pub consumed: Vec<OutPoint>,
}

enum Selection {
    /// Inputs equal the amount exactly; the fee comes out of the payout.
    Exact,
    /// Inputs cover amount plus fee.
    Funded { fee_sats: u64 },
}

/// Builds and signs P2PKH transfers at a fixed fee rate.
pub struct TxBuilder {
    fee_rate: u64,
    dust_limit: u64,
    secp: Secp256k1<All>,
}

impl TxBuilder {
    /// Create a builder with the given fee rate (sats per byte) and dust
    /// limit (sats).
    #[must_use]
    pub fn new(fee_rate: u64, dust_limit: u64) -> Self {
        Self {
            fee_rate,
            dust_limit,
            secp: Secp256k1::new(),
        }
    }

    /// Fee rate in satoshis per byte.
    #[must_use]
    pub const fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    /// Smallest output value the builder will create.
    #[must_use]
    pub const fn dust_limit(&self) -> u64 {
        self.dust_limit
    }

    /// Build, sign and verify a transfer paying `amount_sats` to
    /// `destination` out of `candidates`.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Validation`] for a zero amount or a payout
    /// below the dust limit, [`WalletError::InsufficientFunds`] when the
    /// candidates cannot cover amount plus fee, and [`WalletError::Build`]
    /// when signing or verification fails.
    pub fn build(
        &self,
        candidates: &[CandidateInput],
        destination: ScriptBuf,
        amount_sats: u64,
    ) -> Result<BuiltTransfer> {
        if amount_sats == 0 {
            return Err(WalletError::validation("transfer amount must be positive"));
        }
        let (selected, total, selection) = self.select(candidates, amount_sats)?;

        let (output, sent_sats, change_sats) = match selection {
            Selection::Exact => {
                // the payout absorbs the fee, still estimated at two outputs
                let fee_sats = self.fee_for(selected.len() as u64);
                let net = amount_sats.checked_sub(fee_sats).ok_or_else(|| {
                    WalletError::validation(format!(
                        "amount {amount_sats} cannot cover the fee {fee_sats}"
                    ))
                })?;
                if net <= self.dust_limit {
                    return Err(WalletError::validation(format!(
                        "payout {net} after fee is not above the dust limit {}",
                        self.dust_limit
                    )));
                }
                let output = vec![TxOut {
                    value: Amount::from_sat(net),
                    script_pubkey: destination,
                }];
                (output, net, 0)
            }
            Selection::Funded { fee_sats } => {
                let change = total - amount_sats - fee_sats;
                let mut output = vec![TxOut {
                    value: Amount::from_sat(amount_sats),
                    script_pubkey: destination,
                }];
                let change_sats = if change > self.dust_limit {
                    let recipient = selected.last().ok_or_else(|| {
                        WalletError::build("change requested with no selected inputs")
                    })?;
                    output.push(TxOut {
                        value: Amount::from_sat(change),
                        script_pubkey: recipient.key.script_pubkey().clone(),
                    });
                    change
                } else {
                    if change > 0 {
                        debug!(change_sats = change, "dust change folded into fee");
                    }
                    0
                };
                (output, amount_sats, change_sats)
            }
        };
        let fee_sats = total - sent_sats - change_sats;

        let input: Vec<TxIn> = selected
            .iter()
            .map(|candidate| TxIn {
                previous_output: candidate.utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();
        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        };
        self.sign(&mut tx, &selected)?;
        self.verify_transaction(&tx, &selected)?;

        let txid = tx.compute_txid();
        let consumed = selected
            .iter()
            .map(|candidate| candidate.utxo.outpoint)
            .collect();
        Ok(BuiltTransfer {
            tx,
            txid,
            sent_sats,
            fee_sats,
            change_sats,
            consumed,
        })
    }

    /// Check every input's signature against its claimed key and the key
    /// against the locking script.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Build`] naming the first failing input.
    pub fn verify_transaction(&self, tx: &Transaction, inputs: &[CandidateInput]) -> Result<()> {
        if tx.input.len() != inputs.len() {
            return Err(WalletError::build(format!(
                "signed {} inputs but {} were selected",
                tx.input.len(),
                inputs.len()
            )));
        }
        let cache = SighashCache::new(tx);
        for (index, (txin, candidate)) in tx.input.iter().zip(inputs).enumerate() {
            let mut instructions = txin.script_sig.instructions();
            let sig_bytes = next_push(&mut instructions)
                .ok_or_else(|| verify_failure(index, "missing signature push"))?;
            let key_bytes = next_push(&mut instructions)
                .ok_or_else(|| verify_failure(index, "missing public key push"))?;
            if instructions.next().is_some() {
                return Err(verify_failure(index, "trailing script data"));
            }
            let Some((flag, der)) = sig_bytes.split_last() else {
                return Err(verify_failure(index, "empty signature"));
            };
            if *flag != SIGHASH_ALL_FLAG {
                return Err(verify_failure(index, "unexpected sighash flag"));
            }
            let signature = Signature::from_der(der)
                .map_err(|err| verify_failure(index, &format!("bad DER signature: {err}")))?;
            let public_key = PublicKey::from_slice(&key_bytes)
                .map_err(|err| verify_failure(index, &format!("bad public key: {err}")))?;
            if &ScriptBuf::new_p2pkh(&public_key.pubkey_hash()) != candidate.key.script_pubkey() {
                return Err(verify_failure(
                    index,
                    "public key does not match the locking script",
                ));
            }
            let sighash = cache
                .legacy_signature_hash(index, candidate.key.script_pubkey(), u32::from(*flag))
                .map_err(|err| WalletError::build(format!("sighash for input {index}: {err}")))?;
            let message = Message::from_digest(sighash.to_byte_array());
            self.secp
                .verify_ecdsa(&message, &signature, &public_key.inner)
                .map_err(|err| verify_failure(index, &format!("signature rejected: {err}")))?;
        }
        Ok(())
    }

    fn select(
        &self,
        candidates: &[CandidateInput],
        amount_sats: u64,
    ) -> Result<(Vec<CandidateInput>, u64, Selection)> {
        let mut selected = Vec::new();
        let mut total = 0u64;
        for candidate in candidates {
            selected.push(candidate.clone());
            total += candidate.utxo.value_sats;
            if total < amount_sats {
                continue;
            }
            if total == amount_sats {
                return Ok((selected, total, Selection::Exact));
            }
            let fee_sats = self.fee_for(selected.len() as u64);
            if total >= amount_sats + fee_sats {
                return Ok((selected, total, Selection::Funded { fee_sats }));
            }
        }
        let available: u64 = candidates
            .iter()
            .map(|candidate| candidate.utxo.value_sats)
            .sum();
        Err(WalletError::InsufficientFunds {
            available,
            required: amount_sats + self.fee_for(candidates.len() as u64),
        })
    }

    fn sign(&self, tx: &mut Transaction, inputs: &[CandidateInput]) -> Result<()> {
        let script_sigs = {
            let cache = SighashCache::new(&*tx);
            let mut script_sigs = Vec::with_capacity(inputs.len());
            for (index, candidate) in inputs.iter().enumerate() {
                let sighash = cache
                    .legacy_signature_hash(
                        index,
                        candidate.key.script_pubkey(),
                        EcdsaSighashType::All.to_u32(),
                    )
                    .map_err(|err| {
                        WalletError::build(format!("sighash for input {index}: {err}"))
                    })?;
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = self
                    .secp
                    .sign_ecdsa(&message, &candidate.key.private_key().inner);
                let mut sig_bytes = signature.serialize_der().to_vec();
                sig_bytes.push(SIGHASH_ALL_FLAG);
                let push = PushBytesBuf::try_from(sig_bytes)
                    .map_err(|err| WalletError::build(format!("signature push: {err}")))?;
                script_sigs.push(
                    script::Builder::new()
                        .push_slice(push)
                        .push_key(candidate.key.public_key())
                        .into_script(),
                );
            }
            script_sigs
        };
        for (txin, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            txin.script_sig = script_sig;
        }
        Ok(())
    }

    fn fee_for(&self, inputs: u64) -> u64 {
        // selection always budgets for a payout and a change output
        estimate_size(inputs, 2) * self.fee_rate
    }
}

impl fmt::Debug for TxBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxBuilder")
            .field("fee_rate", &self.fee_rate)
            .field("dust_limit", &self.dust_limit)
            .finish_non_exhaustive()
    }
}

fn verify_failure(index: usize, detail: &str) -> WalletError {
    error!(input = index, detail, "signature verification failed");
    WalletError::build(format!("verify input {index}: {detail}"))
}

fn next_push(instructions: &mut Instructions<'_>) -> Option<Vec<u8>> {
    match instructions.next() {
        Some(Ok(Instruction::PushBytes(push))) => Some(push.as_bytes().to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{DerivationParams, KeyDerivation};

    fn test_key(user_id: &str, seed_byte: u8) -> WalletKey {
        KeyDerivation::new(DerivationParams::default())
            .unwrap()
            .derive(user_id, &[seed_byte; 32])
            .unwrap()
    }

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn candidate(key: &WalletKey, txid_byte: u8, value_sats: u64) -> CandidateInput {
        CandidateInput {
            utxo: Utxo {
                outpoint: OutPoint::new(txid(txid_byte), 0),
                value_sats,
                owner: key.user_id().to_string(),
            },
            key: key.clone(),
        }
    }

    fn destination() -> ScriptBuf {
        test_key("cli:dest", 0xd0).script_pubkey().clone()
    }

    #[test]
    fn single_input_pays_amount_plus_change() {
        let builder = TxBuilder::new(2, 546);
        let key = test_key("cli:alice", 1);
        let candidates = vec![candidate(&key, 0xaa, 50_000_000)];

        let built = builder
            .build(&candidates, destination(), 10_000_000)
            .unwrap();
        // 1 input, 2 outputs: (10 + 148 + 68) bytes at 2 sats each
        assert_eq!(built.fee_sats, 452);
        assert_eq!(built.sent_sats, 10_000_000);
        assert_eq!(built.change_sats, 39_999_548);
        assert_eq!(built.consumed, vec![OutPoint::new(txid(0xaa), 0)]);
        assert_eq!(built.txid, built.tx.compute_txid());

        assert_eq!(built.tx.output.len(), 2);
        assert_eq!(built.tx.output[0].value, Amount::from_sat(10_000_000));
        assert_eq!(built.tx.output[1].value, Amount::from_sat(39_999_548));
        assert_eq!(&built.tx.output[1].script_pubkey, key.script_pubkey());
    }

    #[test]
    fn exact_cover_subtracts_fee_from_payout() {
        let builder = TxBuilder::new(2, 546);
        let key = test_key("cli:alice", 1);
        let candidates = vec![candidate(&key, 0xaa, 1_000_000)];

        let built = builder.build(&candidates, destination(), 1_000_000).unwrap();
        assert_eq!(built.tx.output.len(), 1);
        assert_eq!(built.sent_sats, 999_548);
        assert_eq!(built.fee_sats, 452);
        assert_eq!(built.change_sats, 0);
    }

    #[test]
    fn exact_cover_rejects_dust_payout() {
        let builder = TxBuilder::new(2, 546);
        let key = test_key("cli:alice", 1);
        let candidates = vec![candidate(&key, 0xaa, 900)];

        let err = builder.build(&candidates, destination(), 900).unwrap_err();
        assert!(matches!(err, WalletError::Validation(_)));
    }

    #[test]
    fn change_goes_to_last_contributing_key() {
        let builder = TxBuilder::new(2, 546);
        let first = test_key("cli:alice", 1);
        let second = test_key("cli:alice", 2);
        let candidates = vec![
            candidate(&first, 0xaa, 300_000),
            candidate(&second, 0xbb, 300_000),
        ];

        let built = builder.build(&candidates, destination(), 500_000).unwrap();
        // 2 inputs, 2 outputs: (10 + 296 + 68) bytes at 2 sats each
        assert_eq!(built.fee_sats, 748);
        assert_eq!(built.change_sats, 99_252);
        assert_eq!(built.tx.input.len(), 2);
        assert_eq!(&built.tx.output[1].script_pubkey, second.script_pubkey());
    }

    #[test]
    fn dust_change_is_folded_into_the_fee() {
        let builder = TxBuilder::new(2, 546);
        let key = test_key("cli:alice", 1);
        let candidates = vec![candidate(&key, 0xaa, 500_900)];

        let built = builder.build(&candidates, destination(), 500_000).unwrap();
        assert_eq!(built.tx.output.len(), 1);
        assert_eq!(built.change_sats, 0);
        assert_eq!(built.fee_sats, 900);
        assert_eq!(built.sent_sats, 500_000);
    }

    #[test]
    fn shortfall_reports_available_and_required() {
        let builder = TxBuilder::new(2, 546);
        let key = test_key("cli:alice", 1);
        let candidates = vec![candidate(&key, 0xaa, 100_000)];

        let err = builder.build(&candidates, destination(), 200_000).unwrap_err();
        match err {
            WalletError::InsufficientFunds {
                available,
                required,
            } => {
                assert_eq!(available, 100_000);
                assert_eq!(required, 200_452);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_amount_is_rejected() {
        let builder = TxBuilder::new(2, 546);
        let key = test_key("cli:alice", 1);
        let candidates = vec![candidate(&key, 0xaa, 100_000)];

        let err = builder.build(&candidates, destination(), 0).unwrap_err();
        assert!(matches!(err, WalletError::Validation(_)));
    }

    #[test]
    fn tampered_output_fails_verification() {
        let builder = TxBuilder::new(2, 546);
        let key = test_key("cli:alice", 1);
        let candidates = vec![candidate(&key, 0xaa, 50_000_000)];

        let mut built = builder
            .build(&candidates, destination(), 10_000_000)
            .unwrap();
        built.tx.output[0].value = Amount::from_sat(10_000_001);

        let err = builder
            .verify_transaction(&built.tx, &candidates)
            .unwrap_err();
        assert!(matches!(err, WalletError::Build(_)));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let builder = TxBuilder::new(2, 546);
        let key = test_key("cli:alice", 1);
        let other = test_key("cli:bob", 2);
        let candidates = vec![candidate(&key, 0xaa, 50_000_000)];

        let built = builder
            .build(&candidates, destination(), 10_000_000)
            .unwrap();
        let mismatched = vec![candidate(&other, 0xaa, 50_000_000)];

        let err = builder
            .verify_transaction(&built.tx, &mismatched)
            .unwrap_err();
        assert!(matches!(err, WalletError::Build(_)));
    }
}
