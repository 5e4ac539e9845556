use {
    crate::{
        rpc::TransactionEncoding,
        util::CommitmentLevel,
    },
    anyhow::Context,
    serde::{
        Deserialize,
        de::{self, Deserializer},
    },
    solana_rpc_client_api::config::RpcSendTransactionConfig,
    solana_sdk::signature::{Keypair, read_keypair_file},
    std::{
        num::NonZeroUsize,
        path::{Path, PathBuf},
    },
    tokio::{fs, time::Duration},
};

pub async fn load_config<T>(path: impl AsRef<Path>) -> anyhow::Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let contents = fs::read(path)
        .await
        .with_context(|| "failed to read config")?;
    serde_yaml::from_slice(&contents).map_err(Into::into)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSender {
    #[serde(default)]
    pub tracing: ConfigTracing,

    /// Fee payer identity
    #[serde(default)]
    pub identity: ConfigIdentity,

    /// JSON-RPC endpoint
    #[serde(default)]
    pub rpc: ConfigRpc,

    /// Retry, polling and resubmission options
    #[serde(default)]
    pub submission: ConfigSubmission,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigTracing {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigIdentity {
    /// Load specified keypair from file
    #[serde(
        default,
        deserialize_with = "ConfigIdentity::deserialize_maybe_keypair"
    )]
    pub keypair: Option<Keypair>,
}

impl ConfigIdentity {
    fn deserialize_maybe_keypair<'de, D>(deserializer: D) -> Result<Option<Keypair>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<PathBuf>::deserialize(deserializer)? {
            Some(path) => read_keypair_file(path).map(Some).map_err(de::Error::custom),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigRpc {
    #[serde(default = "ConfigRpc::default_url")]
    pub url: String,

    /// Per request timeout
    #[serde(default = "ConfigRpc::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Commitment used for `getLatestBlockhash`, `getBlockHeight` and `getBalance`
    #[serde(default = "ConfigRpc::default_commitment")]
    pub commitment: CommitmentLevel,
}

impl Default for ConfigRpc {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            timeout: Self::default_timeout(),
            commitment: Self::default_commitment(),
        }
    }
}

impl ConfigRpc {
    fn default_url() -> String {
        "http://127.0.0.1:8899".to_owned()
    }

    const fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    const fn default_commitment() -> CommitmentLevel {
        CommitmentLevel::Confirmed
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigSubmission {
    /// Delay between two `getSignatureStatuses` polls
    #[serde(
        default = "ConfigSubmission::default_poll_interval",
        with = "humantime_serde"
    )]
    pub poll_interval: Duration,

    /// Overall deadline of a submission, resubmissions included
    #[serde(
        default = "ConfigSubmission::default_timeout",
        with = "humantime_serde"
    )]
    pub timeout: Duration,

    ///
    /// Retry strategy
    /// This strategy will be used when an rpc call failed due to transient error.
    #[serde(default = "ConfigSubmission::default_retry")]
    pub retry: RetryStrategy,

    /// Rebuilds allowed after the blockhash expired
    #[serde(default = "ConfigSubmission::default_max_resubmissions")]
    pub max_resubmissions: usize,

    #[serde(default)]
    pub skip_preflight: bool,

    #[serde(default = "ConfigSubmission::default_preflight_commitment")]
    pub preflight_commitment: CommitmentLevel,

    #[serde(default)]
    pub encoding: TransactionEncoding,

    /// `maxRetries` forwarded to `sendTransaction`, node default when unset
    #[serde(default)]
    pub node_max_retries: Option<usize>,
}

impl Default for ConfigSubmission {
    fn default() -> Self {
        Self {
            poll_interval: Self::default_poll_interval(),
            timeout: Self::default_timeout(),
            retry: Self::default_retry(),
            max_resubmissions: Self::default_max_resubmissions(),
            skip_preflight: false,
            preflight_commitment: Self::default_preflight_commitment(),
            encoding: TransactionEncoding::default(),
            node_max_retries: None,
        }
    }
}

impl ConfigSubmission {
    const fn default_poll_interval() -> Duration {
        Duration::from_secs(1)
    }

    const fn default_timeout() -> Duration {
        Duration::from_secs(120)
    }

    const fn default_retry() -> RetryStrategy {
        RetryStrategy::Exponential {
            base: Duration::from_millis(250),
            factor: 2.0,
            retries: RetryStrategy::default_retries(),
        }
    }

    const fn default_max_resubmissions() -> usize {
        3
    }

    const fn default_preflight_commitment() -> CommitmentLevel {
        CommitmentLevel::Confirmed
    }

    pub fn send_config(&self) -> RpcSendTransactionConfig {
        RpcSendTransactionConfig {
            skip_preflight: self.skip_preflight,
            preflight_commitment: Some(self.preflight_commitment.into()),
            encoding: Some(self.encoding.into()),
            max_retries: self.node_max_retries,
            min_context_slot: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum RetryStrategy {
    #[serde(rename = "fixed")]
    Fixed {
        #[serde(with = "humantime_serde")]
        interval: Duration,
        #[serde(default = "RetryStrategy::default_retries")]
        retries: NonZeroUsize,
    },
    #[serde(rename = "exponential")]
    Exponential {
        #[serde(with = "humantime_serde")]
        base: Duration,
        factor: f64,
        #[serde(default = "RetryStrategy::default_retries")]
        retries: NonZeroUsize,
    },
}

impl RetryStrategy {
    const fn default_retries() -> NonZeroUsize {
        NonZeroUsize::new(5).expect("non zero")
    }

    pub const fn retries(&self) -> usize {
        match self {
            Self::Fixed { retries, .. } | Self::Exponential { retries, .. } => retries.get(),
        }
    }
}

impl IntoIterator for RetryStrategy {
    type Item = Duration;

    type IntoIter = Box<dyn Iterator<Item = Duration> + Send>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            Self::Fixed { interval, retries } => Box::new(
                retry::delay::Fixed::from_millis(interval.as_millis() as u64).take(retries.get()),
            ),
            Self::Exponential {
                base,
                factor,
                retries,
            } => Box::new(
                retry::delay::Exponential::from_millis_with_factor(base.as_millis() as u64, factor)
                    .take(retries.get()),
            ),
        }
    }
}
