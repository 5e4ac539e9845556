use {
    crate::{
        blockhash_cache::BlockhashCache,
        builder::{BuildError, SignedTransaction, TransactionBuilder, TransactionIntent},
        classify::{ErrorClass, classify, is_already_processed},
        config::{ConfigSubmission, RetryStrategy},
        metrics::sender as metrics,
        rpc::{RpcClient, RpcClientError},
        util::{BlockHeight, CommitmentLevel, Slot, ms_since_epoch},
    },
    solana_rpc_client_api::request::RpcRequest,
    solana_sdk::{signature::Signature, transaction::TransactionError},
    solana_transaction_status::TransactionStatus,
    std::{
        collections::HashMap,
        future::Future,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    thiserror::Error,
    tokio::{
        sync::{Notify, watch},
        time::{Instant, sleep, sleep_until},
    },
    tracing::{debug, info, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionStatus {
    Created,
    Sent,
    Pending,
    Confirmed,
    Finalized,
    Failed,
    Expired,
}

impl SubmissionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Sent => "sent",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    // position on the happy path, `None` for dead ends
    const fn progress(self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Sent => Some(1),
            Self::Pending => Some(2),
            Self::Confirmed => Some(3),
            Self::Finalized => Some(4),
            Self::Failed | Self::Expired => None,
        }
    }

    /// `true` once `self` is `target` or a later step of the happy path.
    pub const fn has_reached(self, target: Self) -> bool {
        match (self.progress(), target.progress()) {
            (Some(current), Some(target)) => current >= target,
            _ => matches!(
                (self, target),
                (Self::Failed, Self::Failed) | (Self::Expired, Self::Expired)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub signature: Signature,
    /// Milliseconds since unix epoch
    pub submitted_at: u64,
    pub status: SubmissionStatus,
    pub retries: usize,
    pub resubmission_of: Option<Signature>,
    pub last_valid_block_height: BlockHeight,
    pub slot: Option<Slot>,
}

impl SubmissionRecord {
    fn new(transaction: &SignedTransaction, resubmission_of: Option<Signature>) -> Self {
        Self {
            signature: transaction.signature(),
            submitted_at: ms_since_epoch(),
            status: SubmissionStatus::Created,
            retries: 0,
            resubmission_of,
            last_valid_block_height: transaction.last_valid_block_height(),
            slot: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmissionError {
    #[error("blockhash expired after {resubmissions} resubmissions")]
    Expired { resubmissions: usize },

    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: RpcClientError,
    },

    #[error("rejected: {0}")]
    Rejected(#[source] RpcClientError),

    #[error("transaction failed: {0}")]
    TransactionFailed(TransactionError),

    #[error("submission timed out")]
    Timeout,

    #[error("submission cancelled")]
    Cancelled,

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("submission task stopped unexpectedly")]
    Aborted,
}

impl SubmissionError {
    const fn outcome(&self) -> &'static str {
        match self {
            Self::Expired { .. } => "expired",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Rejected(_) => "rejected",
            Self::TransactionFailed(_) => "transaction_failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Build(_) => "build",
            Self::Aborted => "aborted",
        }
    }
}

///
/// Everything known about one submission: the chain of records (the original
/// transaction first, then one record per resubmission) and how it ended.
///
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionState {
    pub chain: Vec<SubmissionRecord>,
    /// Every status change of every record, oldest first. Subscribers that
    /// wake up late still see the transitions they missed.
    pub transitions: Vec<(Signature, SubmissionStatus)>,
    pub cancelled: bool,
    pub error: Option<SubmissionError>,
}

impl SubmissionState {
    fn new(record: SubmissionRecord) -> Self {
        Self {
            transitions: vec![(record.signature, record.status)],
            chain: vec![record],
            cancelled: false,
            error: None,
        }
    }

    fn push_record(&mut self, record: SubmissionRecord) {
        self.transitions.push((record.signature, record.status));
        self.chain.push(record);
    }

    fn modify_current(&mut self, modify: impl FnOnce(&mut SubmissionRecord)) {
        let Some(record) = self.chain.last_mut() else {
            return;
        };
        let previous = record.status;
        modify(record);
        if record.status != previous {
            self.transitions.push((record.signature, record.status));
        }
    }

    pub fn current(&self) -> &SubmissionRecord {
        // the chain is created with one record and only grows
        &self.chain[self.chain.len() - 1]
    }

    pub fn is_finished(&self) -> bool {
        self.error.is_some() || self.current().status == SubmissionStatus::Finalized
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionHandle {
    signature: Signature,
    state: watch::Receiver<SubmissionState>,
    cancel: Arc<Notify>,
}

impl SubmissionHandle {
    /// Signature of the first transaction of the chain.
    pub const fn signature(&self) -> Signature {
        self.signature
    }

    pub fn current(&self) -> SubmissionRecord {
        self.state.borrow().current().clone()
    }

    pub fn chain(&self) -> Vec<SubmissionRecord> {
        self.state.borrow().chain.clone()
    }

    pub fn status(&self) -> SubmissionStatus {
        self.state.borrow().current().status
    }

    pub fn state(&self) -> SubmissionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SubmissionState> {
        self.state.clone()
    }

    /// Resolves once the submission is finalized or failed.
    pub async fn wait(&self) -> Result<SubmissionRecord, SubmissionError> {
        self.wait_until(SubmissionState::is_finished).await
    }

    /// Resolves once the current record reached `status` or the submission ended.
    pub async fn wait_for(
        &self,
        status: SubmissionStatus,
    ) -> Result<SubmissionRecord, SubmissionError> {
        self.wait_until(|state| state.is_finished() || state.current().status.has_reached(status))
            .await
    }

    async fn wait_until(
        &self,
        predicate: impl FnMut(&SubmissionState) -> bool,
    ) -> Result<SubmissionRecord, SubmissionError> {
        let mut state = self.state.clone();
        let state = state
            .wait_for(predicate)
            .await
            .map_err(|_| SubmissionError::Aborted)?;
        match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(state.current().clone()),
        }
    }

    /// Stops retrying and polling. A transaction already sent may still land.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    fn is_same_submission(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cancel, &other.cancel)
    }
}

type InflightMap = Arc<Mutex<HashMap<Signature, SubmissionHandle>>>;

fn lock_inflight(inflight: &InflightMap) -> MutexGuard<'_, HashMap<Signature, SubmissionHandle>> {
    inflight.lock().unwrap_or_else(PoisonError::into_inner)
}

///
/// Sends transactions and drives each one to a terminal state in its own task.
///
#[derive(Debug, Clone)]
pub struct SubmissionEngine {
    rpc: Arc<RpcClient>,
    builder: TransactionBuilder,
    config: ConfigSubmission,
    inflight: InflightMap,
}

impl SubmissionEngine {
    pub fn new(
        rpc: Arc<RpcClient>,
        blockhash_cache: Arc<BlockhashCache>,
        config: ConfigSubmission,
    ) -> Self {
        metrics::init();
        Self {
            rpc,
            builder: TransactionBuilder::new(blockhash_cache),
            config,
            inflight: Arc::default(),
        }
    }

    pub const fn builder(&self) -> &TransactionBuilder {
        &self.builder
    }

    ///
    /// Builds, signs and submits `intent`. The intent is kept so the
    /// transaction can be rebuilt with a fresh blockhash when it expires.
    ///
    pub async fn submit(
        &self,
        intent: TransactionIntent,
    ) -> Result<SubmissionHandle, SubmissionError> {
        let transaction = self.builder.build_and_sign(&intent).await?;
        Ok(self.start(transaction, Some(intent)))
    }

    ///
    /// Submits an already signed transaction. It cannot be rebuilt, so
    /// blockhash expiry fails the submission.
    ///
    pub fn submit_transaction(&self, transaction: SignedTransaction) -> SubmissionHandle {
        self.start(transaction, None)
    }

    /// One-shot status lookup, e.g. after cancelling a submission.
    pub async fn check_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionStatus>, RpcClientError> {
        let statuses = self.rpc.get_signature_statuses(&[*signature]).await?;
        Ok(statuses.into_iter().next().flatten())
    }

    pub fn inflight(&self, signature: &Signature) -> Option<SubmissionHandle> {
        lock_inflight(&self.inflight).get(signature).cloned()
    }

    fn start(
        &self,
        transaction: SignedTransaction,
        intent: Option<TransactionIntent>,
    ) -> SubmissionHandle {
        let signature = transaction.signature();
        let mut inflight = lock_inflight(&self.inflight);
        if let Some(handle) = inflight.get(&signature) {
            debug!(%signature, "transaction already in flight");
            return handle.clone();
        }

        let (state_tx, state_rx) =
            watch::channel(SubmissionState::new(SubmissionRecord::new(&transaction, None)));
        let handle = SubmissionHandle {
            signature,
            state: state_rx,
            cancel: Arc::new(Notify::new()),
        };
        inflight.insert(signature, handle.clone());
        drop(inflight);

        metrics::submissions_inflight_inc();
        info!(%signature, last_valid_block_height = transaction.last_valid_block_height(), "submitting transaction");

        let now = Instant::now();
        let task = SubmissionTask {
            rpc: Arc::clone(&self.rpc),
            builder: self.builder.clone(),
            config: self.config.clone(),
            intent,
            state: state_tx,
            handle: handle.clone(),
            inflight: Arc::clone(&self.inflight),
            started: now,
            deadline: now + self.config.timeout,
        };
        tokio::spawn(task.run(transaction));
        handle
    }
}

/// Delays between retries of transient errors, restarted after every successful step.
struct RetryBudget {
    strategy: RetryStrategy,
    delays: Box<dyn Iterator<Item = Duration> + Send>,
    attempts: usize,
}

impl RetryBudget {
    fn new(strategy: RetryStrategy) -> Self {
        Self {
            delays: strategy.clone().into_iter(),
            strategy,
            attempts: 0,
        }
    }

    fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        self.delays.next()
    }

    fn reset(&mut self) {
        if self.attempts > 0 {
            *self = Self::new(self.strategy.clone());
        }
    }
}

enum Stage {
    Send(SignedTransaction),
    Poll(SignedTransaction),
    Expire(SignedTransaction),
    Done,
}

struct SubmissionTask {
    rpc: Arc<RpcClient>,
    builder: TransactionBuilder,
    config: ConfigSubmission,
    intent: Option<TransactionIntent>,
    state: watch::Sender<SubmissionState>,
    handle: SubmissionHandle,
    inflight: InflightMap,
    started: Instant,
    deadline: Instant,
}

impl SubmissionTask {
    async fn run(self, transaction: SignedTransaction) {
        let mut retry = RetryBudget::new(self.config.retry.clone());
        let mut stage = Stage::Send(transaction);
        let result = loop {
            let next = match stage {
                Stage::Send(transaction) => self.send(transaction, &mut retry).await,
                Stage::Poll(transaction) => self.poll(transaction, &mut retry).await,
                Stage::Expire(transaction) => self.expire(transaction, &mut retry).await,
                Stage::Done => break Ok(()),
            };
            match next {
                Ok(next) => stage = next,
                Err(error) => break Err(error),
            }
        };
        self.finish(result);
    }

    fn signature(&self) -> Signature {
        self.state.borrow().current().signature
    }

    fn update(&self, modify: impl FnOnce(&mut SubmissionRecord)) {
        self.state.send_modify(|state| state.modify_current(modify));
    }

    /// Every await of the task goes through here so cancel and timeout apply everywhere.
    async fn suspend<F>(&self, future: F) -> Result<F::Output, SubmissionError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.handle.cancel.notified() => Err(SubmissionError::Cancelled),
            () = sleep_until(self.deadline) => Err(SubmissionError::Timeout),
            output = future => Ok(output),
        }
    }

    async fn backoff(
        &self,
        retry: &mut RetryBudget,
        method: RpcRequest,
        error: RpcClientError,
    ) -> Result<(), SubmissionError> {
        let Some(delay) = retry.next_delay() else {
            return Err(SubmissionError::RetriesExhausted {
                attempts: retry.attempts,
                source: error,
            });
        };
        self.update(|record| record.retries += 1);
        metrics::incr_submission_retries();
        warn!(signature = %self.signature(), %method, %error, ?delay, "transient rpc error, retrying");
        self.suspend(sleep(delay)).await
    }

    async fn send(
        &self,
        transaction: SignedTransaction,
        retry: &mut RetryBudget,
    ) -> Result<Stage, SubmissionError> {
        metrics::incr_send_transaction_attempt();
        let config = self.config.send_config();
        let result = self
            .suspend(self.rpc.send_transaction(transaction.transaction(), &config))
            .await?;

        match result {
            Ok(_) => {}
            Err(error) if is_already_processed(&error) => {
                debug!(signature = %transaction.signature(), "transaction already processed");
            }
            Err(error) => {
                let class = classify(&error);
                metrics::incr_rpc_error(RpcRequest::SendTransaction, class);
                return match class {
                    ErrorClass::Retriable => {
                        self.backoff(retry, RpcRequest::SendTransaction, error).await?;
                        Ok(Stage::Send(transaction))
                    }
                    ErrorClass::Expired => {
                        debug!(signature = %transaction.signature(), %error, "blockhash rejected by node");
                        Ok(Stage::Expire(transaction))
                    }
                    ErrorClass::NonRetriable => Err(SubmissionError::Rejected(error)),
                };
            }
        }

        retry.reset();
        self.update(|record| record.status = SubmissionStatus::Sent);
        self.update(|record| record.status = SubmissionStatus::Pending);
        debug!(signature = %transaction.signature(), "transaction sent");
        Ok(Stage::Poll(transaction))
    }

    async fn poll(
        &self,
        transaction: SignedTransaction,
        retry: &mut RetryBudget,
    ) -> Result<Stage, SubmissionError> {
        self.suspend(sleep(self.config.poll_interval)).await?;

        let block_height = match self.suspend(self.rpc.get_block_height()).await? {
            Ok(block_height) => block_height,
            Err(error) => {
                return self
                    .poll_failed(transaction, retry, RpcRequest::GetBlockHeight, error)
                    .await;
            }
        };
        self.builder
            .blockhash_cache()
            .observe_block_height(block_height);

        let signature = transaction.signature();
        let status = match self
            .suspend(self.rpc.get_signature_statuses(&[signature]))
            .await?
        {
            Ok(statuses) => statuses.into_iter().next().flatten(),
            Err(error) => {
                return self
                    .poll_failed(transaction, retry, RpcRequest::GetSignatureStatuses, error)
                    .await;
            }
        };
        retry.reset();

        let previous = self.handle.status();
        let Some(status) = status else {
            if block_height > transaction.last_valid_block_height() {
                return Ok(Stage::Expire(transaction));
            }
            if previous == SubmissionStatus::Confirmed {
                warn!(%signature, block_height, "confirmed transaction disappeared, fork");
                self.update(|record| {
                    record.status = SubmissionStatus::Pending;
                    record.slot = None;
                });
            }
            return Ok(Stage::Poll(transaction));
        };

        if let Some(err) = &status.err {
            warn!(%signature, slot = status.slot, %err, "transaction failed");
            self.update(|record| {
                record.status = SubmissionStatus::Failed;
                record.slot = Some(status.slot);
            });
            return Err(SubmissionError::TransactionFailed(err.clone()));
        }

        let next = match CommitmentLevel::from(status.confirmation_status()) {
            CommitmentLevel::Processed => SubmissionStatus::Pending,
            CommitmentLevel::Confirmed => SubmissionStatus::Confirmed,
            CommitmentLevel::Finalized => SubmissionStatus::Finalized,
        };
        if next != previous {
            debug!(%signature, slot = status.slot, status = next.as_str(), "transaction status changed");
        }
        if next.has_reached(SubmissionStatus::Confirmed)
            && !previous.has_reached(SubmissionStatus::Confirmed)
        {
            metrics::observe_transaction_landing_time(self.started.elapsed());
        }
        self.update(|record| {
            record.status = next;
            record.slot = Some(status.slot);
        });

        if next == SubmissionStatus::Finalized {
            info!(%signature, slot = status.slot, "transaction finalized");
            Ok(Stage::Done)
        } else {
            Ok(Stage::Poll(transaction))
        }
    }

    async fn poll_failed(
        &self,
        transaction: SignedTransaction,
        retry: &mut RetryBudget,
        method: RpcRequest,
        error: RpcClientError,
    ) -> Result<Stage, SubmissionError> {
        let class = classify(&error);
        metrics::incr_rpc_error(method, class);
        match class {
            ErrorClass::Retriable => {
                self.backoff(retry, method, error).await?;
                Ok(Stage::Poll(transaction))
            }
            ErrorClass::NonRetriable | ErrorClass::Expired => Err(SubmissionError::Rejected(error)),
        }
    }

    async fn expire(
        &self,
        transaction: SignedTransaction,
        retry: &mut RetryBudget,
    ) -> Result<Stage, SubmissionError> {
        let signature = transaction.signature();
        let resubmissions = self.state.borrow().chain.len() - 1;
        self.update(|record| record.status = SubmissionStatus::Expired);
        info!(%signature, last_valid_block_height = transaction.last_valid_block_height(), "transaction expired");

        let intent = match &self.intent {
            Some(intent) if resubmissions < self.config.max_resubmissions => intent,
            _ => return Err(SubmissionError::Expired { resubmissions }),
        };

        let cache = self.builder.blockhash_cache();
        cache.invalidate_if(&transaction.recent_blockhash()).await;
        let resubmitted = loop {
            match self.suspend(self.builder.build_and_sign(intent)).await? {
                Ok(resubmitted) if resubmitted.signature() == signature => {
                    // node keeps serving the expired blockhash
                    cache.invalidate().await;
                    let error = RpcClientError::InvalidResponse(format!(
                        "blockhash {} is still returned after expiry",
                        transaction.recent_blockhash()
                    ));
                    self.backoff(retry, RpcRequest::GetLatestBlockhash, error)
                        .await?;
                }
                Ok(resubmitted) => break resubmitted,
                Err(BuildError::Blockhash(error)) if classify(&error) == ErrorClass::Retriable => {
                    metrics::incr_rpc_error(RpcRequest::GetLatestBlockhash, ErrorClass::Retriable);
                    self.backoff(retry, RpcRequest::GetLatestBlockhash, error)
                        .await?;
                }
                Err(error) => return Err(error.into()),
            }
        };
        retry.reset();

        metrics::incr_resubmissions();
        info!(
            %signature,
            resubmission = %resubmitted.signature(),
            last_valid_block_height = resubmitted.last_valid_block_height(),
            "resubmitting with fresh blockhash"
        );
        self.state.send_modify(|state| {
            state.push_record(SubmissionRecord::new(&resubmitted, Some(signature)));
        });
        lock_inflight(&self.inflight).insert(resubmitted.signature(), self.handle.clone());
        Ok(Stage::Send(resubmitted))
    }

    fn finish(self, result: Result<(), SubmissionError>) {
        let signature = self.signature();
        let outcome = match result {
            Ok(()) => "finalized",
            Err(error) => {
                let outcome = error.outcome();
                match &error {
                    SubmissionError::Cancelled => info!(%signature, "submission cancelled"),
                    error => warn!(%signature, %error, "submission failed"),
                }
                self.state.send_modify(|state| {
                    if error == SubmissionError::Cancelled {
                        state.cancelled = true;
                    } else {
                        state.modify_current(|record| record.status = SubmissionStatus::Failed);
                    }
                    state.error = Some(error);
                });
                outcome
            }
        };

        let mut inflight = lock_inflight(&self.inflight);
        for record in &self.state.borrow().chain {
            if inflight
                .get(&record.signature)
                .is_some_and(|handle| handle.is_same_submission(&self.handle))
            {
                inflight.remove(&record.signature);
            }
        }
        drop(inflight);

        metrics::submissions_inflight_dec();
        metrics::incr_submission_outcome(outcome);
    }
}
