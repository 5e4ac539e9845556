//! Wire format of legacy Solana transactions.
//!
//! A transaction on the wire is the bincode form of [`Transaction`], the same
//! bytes `sendTransaction` expects once base58 or base64 encoded. Decoding
//! refuses what a node would refuse: versioned messages, trailing bytes,
//! signature counts that disagree with the message header, messages that fail
//! sanitization and payloads above [`PACKET_DATA_SIZE`].

use {
    base64::{Engine, prelude::BASE64_STANDARD},
    bincode::Options,
    solana_sdk::{
        message::{Message, VersionedMessage},
        packet::PACKET_DATA_SIZE,
        sanitize::{Sanitize, SanitizeError},
        transaction::{Transaction, VersionedTransaction},
    },
    std::io,
    thiserror::Error,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedData {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid transaction bytes: {0}")]
    Bincode(String),

    #[error("{0} trailing bytes after transaction")]
    TrailingBytes(usize),

    #[error("versioned messages are not supported")]
    VersionedMessage,

    #[error("expected {expected} signatures, found {actual}")]
    SignatureCount { expected: usize, actual: usize },

    #[error("transaction failed sanitization: {0}")]
    Sanitize(#[from] SanitizeError),

    #[error("transaction is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("invalid base58: {0}")]
    Base58(String),

    #[error("invalid base64: {0}")]
    Base64(String),
}

impl From<bincode::Error> for MalformedData {
    fn from(error: bincode::Error) -> Self {
        match *error {
            bincode::ErrorKind::Io(ref error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                Self::UnexpectedEof
            }
            ref error => Self::Bincode(error.to_string()),
        }
    }
}

const fn check_size(size: usize) -> Result<(), MalformedData> {
    if size > PACKET_DATA_SIZE {
        return Err(MalformedData::TooLarge {
            size,
            limit: PACKET_DATA_SIZE,
        });
    }
    Ok(())
}

fn check_signature_count(expected: u8, actual: usize) -> Result<(), MalformedData> {
    let expected = usize::from(expected);
    if expected != actual {
        return Err(MalformedData::SignatureCount { expected, actual });
    }
    Ok(())
}

/// Serializes a message, i.e. the bytes every signer signs.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, MalformedData> {
    message.sanitize()?;
    Ok(message.serialize())
}

pub fn encode(transaction: &Transaction) -> Result<Vec<u8>, MalformedData> {
    check_signature_count(
        transaction.message.header.num_required_signatures,
        transaction.signatures.len(),
    )?;
    transaction.sanitize()?;
    let bytes = bincode::serialize(transaction)?;
    check_size(bytes.len())?;
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Transaction, MalformedData> {
    check_size(bytes.len())?;

    let transaction: VersionedTransaction = bincode::options()
        .with_limit(PACKET_DATA_SIZE as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .deserialize(bytes)?;
    let consumed = bincode::serialized_size(&transaction)? as usize;
    if consumed < bytes.len() {
        return Err(MalformedData::TrailingBytes(bytes.len() - consumed));
    }

    if let VersionedMessage::V0(_) = transaction.message {
        return Err(MalformedData::VersionedMessage);
    }
    check_signature_count(
        transaction.message.header().num_required_signatures,
        transaction.signatures.len(),
    )?;
    transaction.sanitize()?;

    transaction
        .into_legacy_transaction()
        .ok_or(MalformedData::VersionedMessage)
}

pub fn to_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

pub fn from_base58(text: &str) -> Result<Vec<u8>, MalformedData> {
    bs58::decode(text)
        .into_vec()
        .map_err(|error| MalformedData::Base58(error.to_string()))
}

pub fn to_base64(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

pub fn from_base64(text: &str) -> Result<Vec<u8>, MalformedData> {
    BASE64_STANDARD
        .decode(text)
        .map_err(|error| MalformedData::Base64(error.to_string()))
}
