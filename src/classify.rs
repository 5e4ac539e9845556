use {
    crate::rpc::{RpcClientError, RpcErrorData, TransportError},
    solana_rpc_client_api::custom_error::{
        JSON_RPC_SERVER_ERROR_BLOCK_NOT_AVAILABLE, JSON_RPC_SERVER_ERROR_BLOCK_STATUS_NOT_AVAILABLE_YET,
        JSON_RPC_SERVER_ERROR_MIN_CONTEXT_SLOT_NOT_REACHED, JSON_RPC_SERVER_ERROR_NODE_UNHEALTHY,
        JSON_RPC_SERVER_ERROR_SLOT_SKIPPED,
    },
    solana_sdk::transaction::TransactionError,
};

// generic JSON-RPC 2.0 code, the node specific ones live in `custom_error`
pub const JSON_RPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Same request may succeed later
    Retriable,
    /// Retrying cannot help
    NonRetriable,
    /// Transaction blockhash is no longer accepted, rebuild required
    Expired,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retriable => "retriable",
            Self::NonRetriable => "non_retriable",
            Self::Expired => "expired",
        }
    }
}

pub trait SolanaRpcErrorKindExt {
    fn is_transient(&self) -> bool;
}

impl SolanaRpcErrorKindExt for TransportError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionRefused(_) | Self::Request(_) => true,
            Self::HttpStatus(code) => *code == 429 || (500..600).contains(code),
        }
    }
}

impl SolanaRpcErrorKindExt for RpcClientError {
    fn is_transient(&self) -> bool {
        classify(self) == ErrorClass::Retriable
    }
}

///
/// Maps every client error to the action the submission engine should take.
///
pub fn classify(error: &RpcClientError) -> ErrorClass {
    match error {
        RpcClientError::Transport(error) => {
            if error.is_transient() {
                ErrorClass::Retriable
            } else {
                ErrorClass::NonRetriable
            }
        }
        RpcClientError::Rpc { code, .. } => {
            if is_blockhash_not_found(error) {
                return ErrorClass::Expired;
            }
            match *code {
                JSON_RPC_SERVER_ERROR_NODE_UNHEALTHY
                | JSON_RPC_SERVER_ERROR_BLOCK_NOT_AVAILABLE
                | JSON_RPC_SERVER_ERROR_MIN_CONTEXT_SLOT_NOT_REACHED
                | JSON_RPC_SERVER_ERROR_BLOCK_STATUS_NOT_AVAILABLE_YET
                | JSON_RPC_SERVER_ERROR_SLOT_SKIPPED
                | JSON_RPC_INTERNAL_ERROR => ErrorClass::Retriable,
                _ => ErrorClass::NonRetriable,
            }
        }
        RpcClientError::InvalidResponse(_)
        | RpcClientError::UnsupportedEncoding(_)
        | RpcClientError::MalformedData(_) => ErrorClass::NonRetriable,
    }
}

// simulation result attached to a preflight failure
fn preflight_err(error: &RpcClientError) -> Option<&TransactionError> {
    match error {
        RpcClientError::Rpc {
            data: RpcErrorData::SendTransactionPreflightFailure(result),
            ..
        } => result.err.as_ref(),
        _ => None,
    }
}

fn message_contains(error: &RpcClientError, needles: &[&str]) -> bool {
    match error {
        RpcClientError::Rpc { message, .. } => needles.iter().any(|needle| message.contains(needle)),
        _ => false,
    }
}

///
/// `sendTransaction` rejected the transaction because an earlier copy of it
/// already landed, e.g. a retry after a timed out request.
///
pub fn is_already_processed(error: &RpcClientError) -> bool {
    preflight_err(error) == Some(&TransactionError::AlreadyProcessed)
        || message_contains(error, &["already been processed"])
}

fn is_blockhash_not_found(error: &RpcClientError) -> bool {
    preflight_err(error) == Some(&TransactionError::BlockhashNotFound)
        || message_contains(error, &["Blockhash not found", "BlockhashNotFound"])
}
