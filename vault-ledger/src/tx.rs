//! Legacy transaction wire format and program instruction builders
//!
//! ```text
//! transaction := compact(n) signature*n message
//! message     := header(3) compact(k) key*k blockhash(32) compact(m) instruction*m
//! instruction := program_index(1) compact(a) index*a compact(d) data
//! ```
//!
//! Account keys are ordered signer-writable, signer-readonly, writable,
//! readonly, with the fee payer first.

use crate::codec::{discriminator, Reader, Writer};
use crate::pda::{SYSTEM_PROGRAM_ID, TOKEN_PROGRAM_ID};
use crate::types::{Hash, Pubkey, Signature};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Account reference of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountMeta {
    /// Account address
    pub pubkey: Pubkey,
    /// Must sign the transaction
    pub is_signer: bool,
    /// Written by the instruction
    pub is_writable: bool,
}

impl AccountMeta {
    /// Writable account
    pub fn writable(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: true,
        }
    }

    /// Read-only account
    pub fn readonly(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: false,
        }
    }
}

/// Program invocation before compilation into a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Program to invoke
    pub program_id: Pubkey,
    /// Accounts, in the order the program expects them
    pub accounts: Vec<AccountMeta>,
    /// Instruction data
    pub data: Vec<u8>,
}

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Leading keys that must sign
    pub num_required_signatures: u8,
    /// Trailing signers that are read-only
    pub num_readonly_signed_accounts: u8,
    /// Trailing non-signers that are read-only
    pub num_readonly_unsigned_accounts: u8,
}

/// Instruction referencing accounts by index into the message keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledInstruction {
    /// Index of the program key
    pub program_id_index: u8,
    /// Indices of the account keys
    pub accounts: Vec<u8>,
    /// Instruction data
    pub data: Vec<u8>,
}

/// Legacy message: the bytes every signature covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header
    pub header: MessageHeader,
    /// Ordered account keys
    pub account_keys: Vec<Pubkey>,
    /// Blockhash bounding the transaction's lifetime
    pub recent_blockhash: Hash,
    /// Compiled instructions
    pub instructions: Vec<CompiledInstruction>,
}

fn write_compact_u16(w: &mut Writer, value: usize) -> Result<()> {
    let mut rem = u16::try_from(value)
        .map_err(|_| Error::Decode(format!("length {} exceeds compact-u16", value)))?;
    loop {
        let mut byte = (rem & 0x7f) as u8;
        rem >>= 7;
        if rem == 0 {
            w.u8(byte);
            return Ok(());
        }
        byte |= 0x80;
        w.u8(byte);
    }
}

fn read_compact_u16(r: &mut Reader<'_>) -> Result<usize> {
    let mut value: usize = 0;
    for i in 0..3 {
        let byte = r.u8()?;
        value |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::Decode("compact-u16 longer than 3 bytes".to_string()))
}

fn key_index(keys: &[Pubkey], key: &Pubkey) -> Result<u8> {
    keys.iter()
        .position(|k| k == key)
        .and_then(|i| u8::try_from(i).ok())
        .ok_or_else(|| Error::Decode(format!("account {} missing from message", key)))
}

fn keys_where(metas: &[(Pubkey, bool, bool)], signer: bool, writable: bool) -> Vec<Pubkey> {
    metas
        .iter()
        .filter(|(_, s, w)| *s == signer && *w == writable)
        .map(|(k, _, _)| *k)
        .collect()
}

impl Message {
    /// Compile instructions with `payer` as the fee payer
    pub fn new(instructions: &[Instruction], payer: &Pubkey, recent_blockhash: Hash) -> Result<Self> {
        // (key, signer, writable), merged across instructions
        let mut metas: Vec<(Pubkey, bool, bool)> = vec![(*payer, true, true)];
        let mut upsert = |key: Pubkey, signer: bool, writable: bool| {
            match metas.iter_mut().find(|(k, _, _)| *k == key) {
                Some(entry) => {
                    entry.1 |= signer;
                    entry.2 |= writable;
                }
                None => metas.push((key, signer, writable)),
            }
        };
        for ix in instructions {
            for meta in &ix.accounts {
                upsert(meta.pubkey, meta.is_signer, meta.is_writable);
            }
            upsert(ix.program_id, false, false);
        }

        let signer_readonly = keys_where(&metas, true, false);
        let unsigned_readonly = keys_where(&metas, false, false);
        let mut account_keys: Vec<Pubkey> = Vec::with_capacity(metas.len());
        account_keys.extend(keys_where(&metas, true, true));
        account_keys.extend(signer_readonly.iter().copied());
        account_keys.extend(keys_where(&metas, false, true));
        account_keys.extend(unsigned_readonly.iter().copied());

        if account_keys.len() > u8::MAX as usize {
            return Err(Error::Decode("too many accounts".to_string()));
        }
        let num_signers = metas.iter().filter(|(_, s, _)| *s).count();

        let compiled = instructions
            .iter()
            .map(|ix| {
                Ok(CompiledInstruction {
                    program_id_index: key_index(&account_keys, &ix.program_id)?,
                    accounts: ix
                        .accounts
                        .iter()
                        .map(|meta| key_index(&account_keys, &meta.pubkey))
                        .collect::<Result<Vec<u8>>>()?,
                    data: ix.data.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            header: MessageHeader {
                num_required_signatures: num_signers as u8,
                num_readonly_signed_accounts: signer_readonly.len() as u8,
                num_readonly_unsigned_accounts: unsigned_readonly.len() as u8,
            },
            account_keys,
            recent_blockhash,
            instructions: compiled,
        })
    }

    /// Fee payer
    pub fn payer(&self) -> Option<&Pubkey> {
        self.account_keys.first()
    }

    /// Keys that must sign, in signature order
    pub fn signers(&self) -> &[Pubkey] {
        let n = (self.header.num_required_signatures as usize).min(self.account_keys.len());
        &self.account_keys[..n]
    }

    /// Whether key `index` signs
    pub fn is_signer(&self, index: usize) -> bool {
        index < self.header.num_required_signatures as usize
    }

    /// Whether key `index` is writable
    pub fn is_writable(&self, index: usize) -> bool {
        let signers = self.header.num_required_signatures as usize;
        if index < signers {
            index < signers.saturating_sub(self.header.num_readonly_signed_accounts as usize)
        } else {
            index
                < self
                    .account_keys
                    .len()
                    .saturating_sub(self.header.num_readonly_unsigned_accounts as usize)
        }
    }

    /// Resolve a compiled instruction back to program and account keys
    pub fn resolve(&self, ix: &CompiledInstruction) -> Result<(Pubkey, Vec<Pubkey>)> {
        let lookup = |i: u8| {
            self.account_keys
                .get(i as usize)
                .copied()
                .ok_or_else(|| Error::Decode(format!("account index {} out of range", i)))
        };
        let program = lookup(ix.program_id_index)?;
        let accounts = ix.accounts.iter().map(|i| lookup(*i)).collect::<Result<Vec<_>>>()?;
        Ok((program, accounts))
    }

    /// Wire bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        self.write(&mut w)?;
        Ok(w.into_bytes())
    }

    fn write(&self, w: &mut Writer) -> Result<()> {
        w.u8(self.header.num_required_signatures)
            .u8(self.header.num_readonly_signed_accounts)
            .u8(self.header.num_readonly_unsigned_accounts);
        write_compact_u16(w, self.account_keys.len())?;
        for key in &self.account_keys {
            w.pubkey(key);
        }
        w.bytes(self.recent_blockhash.as_bytes());
        write_compact_u16(w, self.instructions.len())?;
        for ix in &self.instructions {
            w.u8(ix.program_id_index);
            write_compact_u16(w, ix.accounts.len())?;
            w.bytes(&ix.accounts);
            write_compact_u16(w, ix.data.len())?;
            w.bytes(&ix.data);
        }
        Ok(())
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        let header = MessageHeader {
            num_required_signatures: r.u8()?,
            num_readonly_signed_accounts: r.u8()?,
            num_readonly_unsigned_accounts: r.u8()?,
        };
        let key_count = read_compact_u16(r)?;
        let account_keys = (0..key_count).map(|_| r.pubkey()).collect::<Result<Vec<_>>>()?;
        let recent_blockhash = Hash::new(r.bytes32()?);

        let ix_count = read_compact_u16(r)?;
        let mut instructions = Vec::with_capacity(ix_count);
        for _ in 0..ix_count {
            let program_id_index = r.u8()?;
            let account_count = read_compact_u16(r)?;
            let accounts = r.take(account_count)?.to_vec();
            let data_len = read_compact_u16(r)?;
            let data = r.take(data_len)?.to_vec();
            instructions.push(CompiledInstruction {
                program_id_index,
                accounts,
                data,
            });
        }

        if header.num_required_signatures as usize > account_keys.len() {
            return Err(Error::Decode("more signers than account keys".to_string()));
        }
        Ok(Self {
            header,
            account_keys,
            recent_blockhash,
            instructions,
        })
    }
}

/// Signed (or partially signed) transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// One slot per required signer; unsigned slots are all zeros
    pub signatures: Vec<Signature>,
    /// Signed message
    pub message: Message,
}

impl Transaction {
    /// Wrap a message with empty signature slots
    pub fn new_unsigned(message: Message) -> Self {
        let slots = message.header.num_required_signatures as usize;
        Self {
            signatures: vec![Signature::default(); slots],
            message,
        }
    }

    /// Bytes each signer signs
    pub fn message_data(&self) -> Result<Vec<u8>> {
        self.message.serialize()
    }

    /// Place `signature` in the slot of `signer`
    pub fn add_signature(&mut self, signer: &Pubkey, signature: Signature) -> Result<()> {
        let slot = self
            .message
            .signers()
            .iter()
            .position(|k| k == signer)
            .ok_or_else(|| Error::UnauthorizedSigner(format!("{} is not a required signer", signer)))?;
        self.signatures[slot] = signature;
        Ok(())
    }

    /// First signature, which identifies the transaction
    pub fn signature(&self) -> Option<&Signature> {
        self.signatures.first()
    }

    /// Check every required signature against the message
    pub fn verify(&self) -> Result<()> {
        let signers = self.message.signers();
        if self.signatures.len() != signers.len() {
            return Err(Error::SignatureError(format!(
                "{} signatures for {} signers",
                self.signatures.len(),
                signers.len()
            )));
        }
        let data = self.message_data()?;
        for (signature, signer) in self.signatures.iter().zip(signers) {
            if !signature.verify(&data, signer) {
                return Err(Error::SignatureError(format!("invalid signature for {}", signer)));
            }
        }
        Ok(())
    }

    /// Wire bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        write_compact_u16(&mut w, self.signatures.len())?;
        for sig in &self.signatures {
            w.bytes(sig.as_bytes());
        }
        self.message.write(&mut w)?;
        Ok(w.into_bytes())
    }

    /// Parse wire bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let count = read_compact_u16(&mut r)?;
        let signatures = (0..count)
            .map(|_| Ok(Signature::from_bytes(r.bytes64()?)))
            .collect::<Result<Vec<_>>>()?;
        let message = Message::read(&mut r)?;
        if r.remaining() != 0 {
            return Err(Error::Decode(format!("{} trailing bytes", r.remaining())));
        }
        Ok(Self {
            signatures,
            message,
        })
    }

    /// Base64 wire form, as `sendTransaction` takes it
    pub fn to_base64(&self) -> Result<String> {
        Ok(BASE64.encode(self.serialize()?))
    }

    /// Parse the base64 wire form
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::Decode(format!("transaction base64: {}", e)))?;
        Self::deserialize(&bytes)
    }
}

/// Instructions of the vault and registry programs that off-chain code builds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramInstruction {
    /// Route a payment through the vault
    ReceiveRevenue {
        /// Gross payment
        amount: u64,
    },
    /// Record a job receipt
    RecordJob {
        /// Artifact digest
        artifact_hash: Hash,
        /// Amount paid
        payment_amount: u64,
        /// Payment transaction reference
        payment_tx_ref: [u8; 64],
    },
}

impl ProgramInstruction {
    const RECEIVE_REVENUE: &'static str = "receive_revenue";
    const RECORD_JOB: &'static str = "record_job";

    /// Discriminator + borsh arguments
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ProgramInstruction::ReceiveRevenue { amount } => {
                let mut w = Writer::with_discriminator(discriminator("global", Self::RECEIVE_REVENUE));
                w.u64(*amount);
                w.into_bytes()
            }
            ProgramInstruction::RecordJob {
                artifact_hash,
                payment_amount,
                payment_tx_ref,
            } => {
                let mut w = Writer::with_discriminator(discriminator("global", Self::RECORD_JOB));
                w.bytes(artifact_hash.as_bytes())
                    .u64(*payment_amount)
                    .bytes(payment_tx_ref);
                w.into_bytes()
            }
        }
    }

    /// Decode instruction data; `Ok(None)` for instructions not modelled here
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < 8 {
            return Err(Error::Decode("instruction data shorter than discriminator".to_string()));
        }
        let mut r = Reader::new(&data[8..]);
        if data[..8] == discriminator("global", Self::RECEIVE_REVENUE) {
            return Ok(Some(ProgramInstruction::ReceiveRevenue { amount: r.u64()? }));
        }
        if data[..8] == discriminator("global", Self::RECORD_JOB) {
            return Ok(Some(ProgramInstruction::RecordJob {
                artifact_hash: Hash::new(r.bytes32()?),
                payment_amount: r.u64()?,
                payment_tx_ref: r.bytes64()?,
            }));
        }
        Ok(None)
    }
}

/// Accounts of `receive_revenue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRevenueAccounts {
    /// Vault state
    pub vault: Pubkey,
    /// Operator (signer and payer)
    pub operator: Pubkey,
    /// Vault token account
    pub vault_token_account: Pubkey,
    /// Operator's token account
    pub operator_token_account: Pubkey,
    /// Protocol treasury token account
    pub protocol_treasury: Pubkey,
}

/// Build `receive_revenue(amount)`
pub fn receive_revenue(program_id: Pubkey, accounts: &ReceiveRevenueAccounts, amount: u64) -> Instruction {
    Instruction {
        program_id,
        accounts: vec![
            AccountMeta::writable(accounts.vault, false),
            AccountMeta::writable(accounts.operator, true),
            AccountMeta::writable(accounts.vault_token_account, false),
            AccountMeta::writable(accounts.operator_token_account, false),
            AccountMeta::writable(accounts.protocol_treasury, false),
            AccountMeta::readonly(*TOKEN_PROGRAM_ID, false),
        ],
        data: ProgramInstruction::ReceiveRevenue { amount }.encode(),
    }
}

/// Accounts of `record_job`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordJobAccounts {
    /// Registry state
    pub registry: Pubkey,
    /// Receipt address for the current job counter
    pub job_receipt: Pubkey,
    /// Operator or job signer (signer and payer)
    pub signer: Pubkey,
    /// Paying client
    pub client: Pubkey,
}

/// Build `record_job(artifact_hash, payment_amount, payment_tx_ref)`
pub fn record_job(
    program_id: Pubkey,
    accounts: &RecordJobAccounts,
    artifact_hash: Hash,
    payment_amount: u64,
    payment_tx_ref: [u8; 64],
) -> Instruction {
    Instruction {
        program_id,
        accounts: vec![
            AccountMeta::writable(accounts.registry, false),
            AccountMeta::writable(accounts.job_receipt, false),
            AccountMeta::writable(accounts.signer, true),
            AccountMeta::readonly(accounts.client, false),
            AccountMeta::readonly(SYSTEM_PROGRAM_ID, false),
        ],
        data: ProgramInstruction::RecordJob {
            artifact_hash,
            payment_amount,
            payment_tx_ref,
        }
        .encode(),
    }
}
