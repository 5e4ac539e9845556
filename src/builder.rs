use {
    crate::{
        blockhash_cache::{Blockhash, BlockhashCache},
        encoding::{self, MalformedData},
        rpc::RpcClientError,
        util::BlockHeight,
    },
    solana_sdk::{
        hash::Hash,
        instruction::Instruction,
        message::Message,
        native_token::LAMPORTS_PER_SOL,
        pubkey::Pubkey,
        signature::Signature,
        signer::{Signer, SignerError},
        transaction::Transaction,
    },
    std::{collections::HashMap, fmt, sync::Arc},
    thiserror::Error,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("transaction has no instructions")]
    NoInstructions,

    #[error("missing signatures for {missing:?}")]
    IncompleteSignatures { missing: Vec<Pubkey> },

    #[error("signer {0} is not a required signer of the transaction")]
    SignerMismatch(Pubkey),

    #[error("transaction references {0} accounts, at most 256 are allowed")]
    TooManyAccounts(usize),

    #[error("failed to fetch blockhash: {0}")]
    Blockhash(#[source] RpcClientError),

    #[error("signer failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Malformed(#[from] MalformedData),
}

/// Converts a SOL amount, `None` for negative, non finite or overflowing input.
///
/// Unlike `native_token::sol_to_lamports` this rounds to the nearest lamport,
/// so `0.3` SOL is exactly `300_000_000` lamports.
pub fn sol_to_lamports(sol: f64) -> Option<u64> {
    let lamports = (sol * LAMPORTS_PER_SOL as f64).round();
    (lamports.is_finite() && lamports >= 0.0 && lamports <= u64::MAX as f64)
        .then_some(lamports as u64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    fee_payer: Pubkey,
    instructions: Vec<Instruction>,
    blockhash: Blockhash,
    message: Message,
}

impl UnsignedTransaction {
    pub const fn fee_payer(&self) -> &Pubkey {
        &self.fee_payer
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub const fn blockhash(&self) -> Blockhash {
        self.blockhash
    }

    pub const fn message(&self) -> &Message {
        &self.message
    }
}

///
/// A fully signed transaction ready for submission.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    transaction: Transaction,
    signature: Signature,
    last_valid_block_height: BlockHeight,
}

impl SignedTransaction {
    /// Checks the wire constraints and every required signature.
    pub fn new(
        transaction: Transaction,
        last_valid_block_height: BlockHeight,
    ) -> Result<Self, BuildError> {
        encoding::encode(&transaction)?;
        // signature count equals the number of required signers once encoded
        let missing = transaction
            .verify_with_results()
            .into_iter()
            .zip(&transaction.message.account_keys)
            .filter(|(verified, _)| !verified)
            .map(|(_, pubkey)| *pubkey)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(BuildError::IncompleteSignatures { missing });
        }
        let signature = transaction.signatures[0];
        Ok(Self {
            transaction,
            signature,
            last_valid_block_height,
        })
    }

    pub const fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub const fn signature(&self) -> Signature {
        self.signature
    }

    pub const fn last_valid_block_height(&self) -> BlockHeight {
        self.last_valid_block_height
    }

    pub const fn recent_blockhash(&self) -> Hash {
        self.transaction.message.recent_blockhash
    }
}

///
/// Everything needed to rebuild and re-sign a transaction with a new blockhash.
///
#[derive(Clone)]
pub struct TransactionIntent {
    fee_payer: Pubkey,
    instructions: Vec<Instruction>,
    signers: Vec<Arc<dyn Signer + Send + Sync>>,
}

impl fmt::Debug for TransactionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionIntent")
            .field("fee_payer", &self.fee_payer)
            .field("instructions", &self.instructions)
            .field(
                "signers",
                &self
                    .signers
                    .iter()
                    .map(|signer| signer.pubkey())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl TransactionIntent {
    pub const fn new(
        fee_payer: Pubkey,
        instructions: Vec<Instruction>,
        signers: Vec<Arc<dyn Signer + Send + Sync>>,
    ) -> Self {
        Self {
            fee_payer,
            instructions,
            signers,
        }
    }

    pub const fn fee_payer(&self) -> &Pubkey {
        &self.fee_payer
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn signers(&self) -> Vec<&dyn Signer> {
        self.signers
            .iter()
            .map(|signer| signer.as_ref() as &dyn Signer)
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct AccountFlags {
    is_signer: bool,
    is_writable: bool,
}

///
/// `Message::new_with_blockhash` panics when a header count does not fit into
/// a `u8` and truncates account indices past 255, so the account set is
/// checked up front with the same merging rules: the fee payer is a writable
/// signer, program ids carry no flags and repeated metas are OR-merged.
///
fn check_account_limits(fee_payer: &Pubkey, instructions: &[Instruction]) -> Result<(), BuildError> {
    let mut accounts = HashMap::<Pubkey, AccountFlags>::new();
    accounts.insert(
        *fee_payer,
        AccountFlags {
            is_signer: true,
            is_writable: true,
        },
    );
    for instruction in instructions {
        accounts.entry(instruction.program_id).or_default();
        for meta in &instruction.accounts {
            let flags = accounts.entry(meta.pubkey).or_default();
            flags.is_signer |= meta.is_signer;
            flags.is_writable |= meta.is_writable;
        }
    }

    let total = accounts.len();
    let count = |is_signer: bool, is_writable: Option<bool>| {
        accounts
            .values()
            .filter(|flags| {
                flags.is_signer == is_signer
                    && is_writable.is_none_or(|is_writable| flags.is_writable == is_writable)
            })
            .count()
    };
    let fits = |n: usize| u8::try_from(n).is_ok();
    if !(fits(total - 1)
        && fits(count(true, None))
        && fits(count(true, Some(false)))
        && fits(count(false, Some(false))))
    {
        return Err(BuildError::TooManyAccounts(total));
    }
    Ok(())
}

/// Compiles `instructions` against an explicit blockhash.
///
/// Accounts end up in the order the runtime expects: fee payer, writable
/// signers, readonly signers, writable non-signers, readonly non-signers.
pub fn build_with_blockhash(
    fee_payer: &Pubkey,
    instructions: &[Instruction],
    blockhash: Blockhash,
) -> Result<UnsignedTransaction, BuildError> {
    if instructions.is_empty() {
        return Err(BuildError::NoInstructions);
    }
    check_account_limits(fee_payer, instructions)?;
    let message = Message::new_with_blockhash(instructions, Some(fee_payer), &blockhash.hash());

    // reject oversized transactions before anybody signs them
    let placeholder = Transaction::new_unsigned(message);
    encoding::encode(&placeholder)?;

    Ok(UnsignedTransaction {
        fee_payer: *fee_payer,
        instructions: instructions.to_vec(),
        blockhash,
        message: placeholder.message,
    })
}

fn signing_error(
    error: SignerError,
    transaction: &Transaction,
    signers: &[&dyn Signer],
) -> BuildError {
    let required = transaction.message.signer_keys();
    match error {
        SignerError::KeypairPubkeyMismatch => signers
            .iter()
            .filter_map(|signer| signer.try_pubkey().ok())
            .find(|pubkey| !required.contains(&pubkey))
            .map_or_else(
                || BuildError::Signing(SignerError::KeypairPubkeyMismatch.to_string()),
                BuildError::SignerMismatch,
            ),
        SignerError::NotEnoughSigners => BuildError::IncompleteSignatures {
            missing: required
                .into_iter()
                .zip(&transaction.signatures)
                .filter(|(_, signature)| **signature == Signature::default())
                .map(|(pubkey, _)| *pubkey)
                .collect(),
        },
        error => BuildError::Signing(error.to_string()),
    }
}

/// Signs with every required signer, each signer must be required.
pub fn sign(
    unsigned: UnsignedTransaction,
    signers: &[&dyn Signer],
) -> Result<SignedTransaction, BuildError> {
    let recent_blockhash = unsigned.message.recent_blockhash;
    let mut transaction = Transaction::new_unsigned(unsigned.message);
    if let Err(error) = transaction.try_sign(signers, recent_blockhash) {
        return Err(signing_error(error, &transaction, signers));
    }
    SignedTransaction::new(transaction, unsigned.blockhash.last_valid_block_height())
}

///
/// Builds transactions against the shared blockhash cache.
///
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    blockhash_cache: Arc<BlockhashCache>,
}

impl TransactionBuilder {
    pub const fn new(blockhash_cache: Arc<BlockhashCache>) -> Self {
        Self { blockhash_cache }
    }

    pub const fn blockhash_cache(&self) -> &Arc<BlockhashCache> {
        &self.blockhash_cache
    }

    pub async fn build(
        &self,
        fee_payer: &Pubkey,
        instructions: &[Instruction],
    ) -> Result<UnsignedTransaction, BuildError> {
        if instructions.is_empty() {
            return Err(BuildError::NoInstructions);
        }
        let blockhash = self
            .blockhash_cache
            .get()
            .await
            .map_err(BuildError::Blockhash)?;
        build_with_blockhash(fee_payer, instructions, blockhash)
    }

    pub async fn build_and_sign(
        &self,
        intent: &TransactionIntent,
    ) -> Result<SignedTransaction, BuildError> {
        let unsigned = self.build(intent.fee_payer(), intent.instructions()).await?;
        sign(unsigned, &intent.signers())
    }
}
