use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    solana_sdk::{
        native_token::lamports_to_sol,
        pubkey::Pubkey,
        signature::{Keypair, Signature},
        signer::Signer,
        system_instruction,
    },
    std::{
        path::PathBuf,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    },
    tokio::runtime::Builder,
    tracing::info,
    yellowstone_sender::{
        blockhash_cache::BlockhashCache,
        builder::{TransactionIntent, sol_to_lamports},
        config::{ConfigSender, load_config},
        engine::{SubmissionEngine, SubmissionStatus},
        metrics::collect_to_text,
        rpc::RpcClient,
        setup_tracing,
        util::CommitmentLevel,
    },
};

#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Path to config, built-in defaults when omitted
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Only check config and exit
    #[clap(long, default_value_t = false)]
    pub check: bool,

    /// Override `rpc.url` from config
    #[clap(long, env = "SENDER_RPC_URL")]
    pub rpc_url: Option<String>,

    /// Base58 secret key, used when config has no identity keypair
    #[clap(long, env = "SENDER_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: Option<String>,

    /// Print collected metrics before exit
    #[clap(long, default_value_t = false)]
    pub print_metrics: bool,

    #[command(subcommand)]
    pub command: ArgsCommands,
}

#[derive(Debug, Subcommand)]
enum ArgsCommands {
    /// Print latest blockhash and its last valid block height
    Blockhash,
    /// Print balance in SOL
    Balance {
        /// Account to query, identity when omitted
        #[clap(long)]
        address: Option<Pubkey>,
    },
    /// Transfer SOL from identity and wait for confirmation
    Transfer {
        /// Recipient
        #[clap(long)]
        to: Pubkey,
        /// Amount in SOL
        #[clap(long)]
        sol: f64,
        /// Return as soon as the transaction is confirmed instead of finalized
        #[clap(long, default_value_t = false)]
        confirmed: bool,
    },
    /// Print status of a transaction signature
    Status { signature: Signature },
    /// Print SPL token balance summed over the owner's accounts for a mint
    TokenBalance {
        /// Token owner, identity when omitted
        #[clap(long)]
        owner: Option<Pubkey>,
        /// Token mint
        #[clap(long)]
        mint: Pubkey,
    },
    /// Print recent transaction signatures of an address
    History {
        /// Account to query, identity when omitted
        #[clap(long)]
        address: Option<Pubkey>,
        /// Maximum number of signatures
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    Builder::new_multi_thread()
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::Relaxed);
            format!("sender.tokio{id:02}")
        })
        .enable_all()
        .build()?
        .block_on(main2())
}

async fn main2() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config: ConfigSender = match &args.config {
        Some(path) => load_config(path).await?,
        None => ConfigSender::default(),
    };
    if args.check {
        return Ok(());
    }

    setup_tracing(config.tracing.json)?;

    if let Some(url) = args.rpc_url.clone() {
        config.rpc.url = url;
    }
    let identity = match config.identity.keypair.take() {
        Some(keypair) => Some(keypair),
        None => args
            .private_key
            .as_deref()
            .map(keypair_from_base58)
            .transpose()?,
    };

    let rpc = Arc::new(
        RpcClient::new_http(&config.rpc.url, config.rpc.timeout, config.rpc.commitment)
            .context("failed to create rpc client")?,
    );
    info!(url = %config.rpc.url, commitment = config.rpc.commitment.as_str(), "rpc client created");

    let result = run_command(args.command, config, rpc, identity).await;
    if args.print_metrics {
        println!("{}", collect_to_text());
    }
    result
}

fn keypair_from_base58(secret: &str) -> anyhow::Result<Keypair> {
    let bytes = bs58::decode(secret.trim())
        .into_vec()
        .context("private key is not valid base58")?;
    Keypair::from_bytes(&bytes).map_err(|error| anyhow::anyhow!("invalid private key: {error}"))
}

async fn run_command(
    command: ArgsCommands,
    config: ConfigSender,
    rpc: Arc<RpcClient>,
    identity: Option<Keypair>,
) -> anyhow::Result<()> {
    match command {
        ArgsCommands::Blockhash => {
            let blockhash = rpc.get_latest_blockhash().await?;
            println!(
                "{} (last valid block height {})",
                blockhash.hash(),
                blockhash.last_valid_block_height()
            );
        }
        ArgsCommands::Balance { address } => {
            let address = address_or_identity(address, identity.as_ref(), "--address")?;
            let lamports = rpc.get_balance(&address).await?;
            println!("{address}: {} SOL", lamports_to_sol(lamports));
        }
        ArgsCommands::Transfer { to, sol, confirmed } => {
            let identity = identity.context("transfer requires an identity keypair")?;
            let lamports = sol_to_lamports(sol)
                .with_context(|| format!("invalid amount: {sol} SOL"))?;
            anyhow::ensure!(lamports > 0, "amount must be positive");

            let cache = Arc::new(BlockhashCache::new(Arc::clone(&rpc)));
            let engine = SubmissionEngine::new(rpc, cache, config.submission);
            let from = identity.pubkey();
            let signer: Arc<dyn Signer + Send + Sync> = Arc::new(identity);
            let intent = TransactionIntent::new(
                from,
                vec![system_instruction::transfer(&from, &to, lamports)],
                vec![signer],
            );

            let handle = engine.submit(intent).await?;
            println!("submitted {}", handle.signature());
            let record = if confirmed {
                handle.wait_for(SubmissionStatus::Confirmed).await?
            } else {
                handle.wait().await?
            };
            println!(
                "{} {} in slot {}",
                record.signature,
                record.status.as_str(),
                record
                    .slot
                    .map(|slot| slot.to_string())
                    .unwrap_or_else(|| "unknown".to_owned())
            );
        }
        ArgsCommands::Status { signature } => {
            let cache = Arc::new(BlockhashCache::new(Arc::clone(&rpc)));
            let engine = SubmissionEngine::new(rpc, cache, config.submission);
            match engine.check_status(&signature).await? {
                Some(status) => println!(
                    "{signature}: {} in slot {}{}",
                    CommitmentLevel::from(status.confirmation_status()).as_str(),
                    status.slot,
                    status
                        .err
                        .map(|err| format!(", failed: {err}"))
                        .unwrap_or_default()
                ),
                None => println!("{signature}: not found"),
            }
        }
        ArgsCommands::TokenBalance { owner, mint } => {
            let owner = address_or_identity(owner, identity.as_ref(), "--owner")?;
            println!("{}", token_balance(&rpc, &owner, &mint).await?);
        }
        ArgsCommands::History { address, limit } => {
            let address = address_or_identity(address, identity.as_ref(), "--address")?;
            for line in history(&rpc, &address, limit).await? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn address_or_identity(
    address: Option<Pubkey>,
    identity: Option<&Keypair>,
    flag: &str,
) -> anyhow::Result<Pubkey> {
    match (address, identity) {
        (Some(address), _) => Ok(address),
        (None, Some(identity)) => Ok(identity.pubkey()),
        (None, None) => anyhow::bail!("no {flag} given and no identity configured"),
    }
}

async fn token_balance(rpc: &RpcClient, owner: &Pubkey, mint: &Pubkey) -> anyhow::Result<String> {
    let balance = rpc
        .get_token_accounts_balance(owner, mint)
        .await
        .with_context(|| format!("failed to get {mint} balance of {owner}"))?;
    Ok(format!(
        "{owner}: {} of {mint} in {} account(s)",
        balance.ui_amount(),
        balance.accounts
    ))
}

async fn history(rpc: &RpcClient, address: &Pubkey, limit: usize) -> anyhow::Result<Vec<String>> {
    let signatures = rpc
        .get_signatures_for_address(address, limit)
        .await
        .with_context(|| format!("failed to get signatures of {address}"))?;
    Ok(signatures
        .into_iter()
        .map(|entry| {
            let status = match (&entry.err, entry.confirmation_status) {
                (Some(err), _) => format!("failed: {err}"),
                (None, Some(status)) => CommitmentLevel::from(status).as_str().to_owned(),
                (None, None) => "unknown".to_owned(),
            };
            format!("{} slot {} {status}", entry.signature, entry.slot)
        })
        .collect())
}
