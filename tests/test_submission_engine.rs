
use {
    serde_json::json,
    solana_rpc_client_api::request::RpcRequest,
    solana_sdk::{
        hash::Hash,
        instruction::InstructionError,
        signature::Signature,
        transaction::TransactionError,
    },
    std::time::Duration,
    testkit::{TestEnv, default_config_submission, status},
    yellowstone_sender::{
        blockhash_cache::Blockhash,
        config::ConfigSubmission,
        engine::{SubmissionError, SubmissionStatus},
        rpc::{
            testkit::{
                return_blockhash, return_fatal_error, return_rpc_error,
                return_signature_statuses, return_transient_error, return_unique_blockhash,
            },
        },
        util::CommitmentLevel,
    },
};

#[tokio::test(start_paused = true)]
async fn transient_send_errors_are_retried() {
    let env = TestEnv::new(default_config_submission());
    for _ in 0..3 {
        env.mock
            .push_method_return(RpcRequest::SendTransaction, return_transient_error());
    }
    env.finalize_all();

    let handle = env
        .engine
        .submit(env.transfer_intent(10))
        .await
        .expect("submit");
    let record = handle.wait().await.expect("finalized");

    assert_eq!(record.status, SubmissionStatus::Finalized);
    assert_eq!(record.retries, 3);
    assert_eq!(record.slot, Some(42));
    assert_eq!(handle.chain().len(), 1);
    assert_eq!(env.mock.get_stats_for_call(RpcRequest::SendTransaction), 4);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_is_bounded() {
    let env = TestEnv::new(default_config_submission());
    env.mock
        .set_method_return(RpcRequest::SendTransaction, return_transient_error());

    let handle = env
        .engine
        .submit(env.transfer_intent(10))
        .await
        .expect("submit");
    let error = handle.wait().await.expect_err("retries exhausted");

    assert!(
        matches!(error, SubmissionError::RetriesExhausted { attempts: 6, .. }),
        "{error:?}"
    );
    assert_eq!(handle.status(), SubmissionStatus::Failed);
    assert_eq!(handle.current().retries, 5);
    assert_eq!(env.mock.get_stats_for_call(RpcRequest::SendTransaction), 6);
}

#[tokio::test(start_paused = true)]
async fn non_retriable_rejection_is_not_retried() {
    let env = TestEnv::new(default_config_submission());
    env.mock
        .set_method_return(RpcRequest::SendTransaction, return_fatal_error());

    let handle = env
        .engine
        .submit(env.transfer_intent(10))
        .await
        .expect("submit");
    let error = handle.wait().await.expect_err("rejected");

    assert!(matches!(error, SubmissionError::Rejected(_)), "{error:?}");
    assert_eq!(handle.status(), SubmissionStatus::Failed);
    assert_eq!(handle.current().retries, 0);
    assert_eq!(env.mock.get_stats_for_call(RpcRequest::SendTransaction), 1);
    assert_eq!(env.mock.get_stats_for_call(RpcRequest::GetSignatureStatuses), 0);
}

#[tokio::test(start_paused = true)]
async fn expired_transaction_is_rebuilt_and_resubmitted() {
    let env = TestEnv::new(default_config_submission());
    let stale = Blockhash::new(Hash::new_unique(), 100);
    env.mock.push_method_return(
        RpcRequest::GetLatestBlockhash,
        return_blockhash(stale.hash(), stale.last_valid_block_height()),
    );
    env.mock.set_block_height(101);

    let intent = env.transfer_intent(10);
    let first = env.sign_with(&intent, stale).signature();
    let second = env.sign_with(&intent, env.blockhash).signature();
    assert_ne!(first, second);
    env.finalize_only(second);

    let handle = env.engine.submit(intent).await.expect("submit");
    assert_eq!(handle.signature(), first);
    let mut updates = handle.subscribe();
    let record = handle.wait().await.expect("finalized");
    assert_eq!(record.signature, second);

    let transitions = updates
        .wait_for(|state| state.is_finished())
        .await
        .expect("state")
        .transitions
        .clone();
    assert_ordered(
        &transitions,
        &[
            (first, SubmissionStatus::Pending),
            (first, SubmissionStatus::Expired),
            (second, SubmissionStatus::Created),
            (second, SubmissionStatus::Sent),
            (second, SubmissionStatus::Pending),
            (second, SubmissionStatus::Finalized),
        ],
    );

    let chain = handle.chain();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].signature, first);
    assert_eq!(chain[0].status, SubmissionStatus::Expired);
    assert_eq!(chain[0].last_valid_block_height, 100);
    assert_eq!(chain[1].status, SubmissionStatus::Finalized);
    assert_eq!(chain[1].resubmission_of, Some(first));
    assert_eq!(chain[1].last_valid_block_height, 300);
    assert_eq!(env.mock.get_stats_for_call(RpcRequest::GetLatestBlockhash), 2);
    assert_eq!(env.cache.block_height_estimate(), 101);
}

#[tokio::test(start_paused = true)]
async fn blockhash_not_found_on_send_triggers_resubmission() {
    let env = TestEnv::new(default_config_submission());
    let unknown = Blockhash::new(Hash::new_unique(), 300);
    env.mock.push_method_return(
        RpcRequest::GetLatestBlockhash,
        return_blockhash(unknown.hash(), unknown.last_valid_block_height()),
    );
    env.mock.push_method_return(
        RpcRequest::SendTransaction,
        return_rpc_error(
            -32002,
            "Transaction simulation failed: Blockhash not found",
            Some(json!({ "err": "BlockhashNotFound", "logs": [] })),
        ),
    );

    let intent = env.transfer_intent(10);
    let second = env.sign_with(&intent, env.blockhash).signature();
    env.finalize_only(second);

    let handle = env.engine.submit(intent).await.expect("submit");
    let record = handle.wait().await.expect("finalized");

    assert_eq!(record.signature, second);
    let chain = handle.chain();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].status, SubmissionStatus::Expired);
    assert_eq!(chain[1].resubmission_of, Some(handle.signature()));
}

#[tokio::test(start_paused = true)]
async fn resubmissions_are_bounded() {
    let env = TestEnv::new(ConfigSubmission {
        max_resubmissions: 1,
        ..default_config_submission()
    });
    // every blockhash is already expired at height 400
    env.mock.set_method_return(
        RpcRequest::GetLatestBlockhash,
        return_unique_blockhash(300),
    );
    env.mock.set_block_height(400);
    env.mock.set_method_return(
        RpcRequest::GetSignatureStatuses,
        return_signature_statuses(|_| None),
    );

    let handle = env
        .engine
        .submit(env.transfer_intent(10))
        .await
        .expect("submit");
    let error = handle.wait().await.expect_err("expired");

    assert_eq!(error, SubmissionError::Expired { resubmissions: 1 });
    let chain = handle.chain();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].status, SubmissionStatus::Expired);
    assert_eq!(chain[1].status, SubmissionStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn expired_signed_transaction_cannot_be_rebuilt() {
    let env = TestEnv::new(default_config_submission());
    env.mock.set_block_height(301);
    env.mock.set_method_return(
        RpcRequest::GetSignatureStatuses,
        return_signature_statuses(|_| None),
    );

    let handle = env.engine.submit_transaction(env.signed_transfer(10));
    let error = handle.wait().await.expect_err("expired");

    assert_eq!(error, SubmissionError::Expired { resubmissions: 0 });
    assert_eq!(handle.chain().len(), 1);
    assert_eq!(handle.status(), SubmissionStatus::Failed);
    assert_eq!(env.mock.get_stats_for_call(RpcRequest::GetLatestBlockhash), 0);
}

#[tokio::test(start_paused = true)]
async fn on_chain_failure_is_reported() {
    let env = TestEnv::new(default_config_submission());
    let err = TransactionError::InstructionError(0, InstructionError::Custom(1));
    let status_err = err.clone();
    env.mock.set_method_return(
        RpcRequest::GetSignatureStatuses,
        return_signature_statuses(move |_| {
            Some(status(42, CommitmentLevel::Confirmed, Some(status_err.clone())))
        }),
    );

    let handle = env.engine.submit_transaction(env.signed_transfer(10));
    let error = handle.wait().await.expect_err("failed");

    assert_eq!(error, SubmissionError::TransactionFailed(err));
    assert_eq!(handle.status(), SubmissionStatus::Failed);
    assert_eq!(handle.current().slot, Some(42));
}

#[tokio::test(start_paused = true)]
async fn transient_poll_errors_are_retried() {
    let env = TestEnv::new(default_config_submission());
    env.mock
        .push_method_return(RpcRequest::GetBlockHeight, return_transient_error());
    env.mock.push_method_return(
        RpcRequest::GetSignatureStatuses,
        return_rpc_error(-32005, "Node is unhealthy", None),
    );
    env.finalize_all();

    let handle = env.engine.submit_transaction(env.signed_transfer(10));
    let record = handle.wait().await.expect("finalized");

    assert_eq!(record.status, SubmissionStatus::Finalized);
    assert_eq!(record.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn confirmed_status_reverts_to_pending_on_fork() {
    let env = TestEnv::new(default_config_submission());
    env.mock.push_method_return(
        RpcRequest::GetSignatureStatuses,
        return_signature_statuses(|_| Some(status(40, CommitmentLevel::Confirmed, None))),
    );
    env.mock.push_method_return(
        RpcRequest::GetSignatureStatuses,
        return_signature_statuses(|_| None),
    );
    env.finalize_all();

    let handle = env.engine.submit_transaction(env.signed_transfer(10));
    let mut updates = handle.subscribe();
    let collector = tokio::spawn(async move {
        let mut seen = vec![];
        while updates.changed().await.is_ok() {
            seen.push(updates.borrow_and_update().current().status);
        }
        seen
    });

    let confirmed = handle
        .wait_for(SubmissionStatus::Confirmed)
        .await
        .expect("confirmed");
    assert_eq!(confirmed.slot, Some(40));

    let record = handle.wait().await.expect("finalized");
    assert_eq!(record.status, SubmissionStatus::Finalized);

    let seen = collector.await.expect("collector");
    assert!(
        seen.windows(2)
            .any(|pair| pair == [SubmissionStatus::Confirmed, SubmissionStatus::Pending]),
        "{seen:?}"
    );
    assert_eq!(seen.last(), Some(&SubmissionStatus::Finalized));
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_polling() {
    let env = TestEnv::new(default_config_submission());
    env.mock.set_method_return(
        RpcRequest::GetSignatureStatuses,
        return_signature_statuses(|_| None),
    );

    let handle = env.engine.submit_transaction(env.signed_transfer(10));
    handle
        .wait_for(SubmissionStatus::Pending)
        .await
        .expect("pending");
    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.cancel();

    let error = handle.wait().await.expect_err("cancelled");
    assert_eq!(error, SubmissionError::Cancelled);
    assert!(handle.state().cancelled);
    assert_eq!(handle.status(), SubmissionStatus::Pending);

    let polls = env.mock.get_stats_for_call(RpcRequest::GetSignatureStatuses);
    assert!(polls > 0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        env.mock.get_stats_for_call(RpcRequest::GetSignatureStatuses),
        polls
    );
}

#[tokio::test(start_paused = true)]
async fn overall_timeout_fails_submission() {
    let env = TestEnv::new(ConfigSubmission {
        timeout: Duration::from_secs(10),
        ..default_config_submission()
    });
    env.mock.set_method_return(
        RpcRequest::GetSignatureStatuses,
        return_signature_statuses(|_| None),
    );

    let handle = env.engine.submit_transaction(env.signed_transfer(10));
    let error = handle.wait().await.expect_err("timeout");

    assert_eq!(error, SubmissionError::Timeout);
    assert_eq!(handle.status(), SubmissionStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn identical_transaction_joins_inflight_submission() {
    let env = TestEnv::new(default_config_submission());
    env.mock.set_method_return(
        RpcRequest::GetSignatureStatuses,
        return_signature_statuses(|_| None),
    );

    let transaction = env.signed_transfer(10);
    let signature = transaction.signature();
    let first = env.engine.submit_transaction(transaction.clone());
    let second = env.engine.submit_transaction(transaction);
    assert_eq!(first.signature(), second.signature());
    assert!(env.engine.inflight(&signature).is_some());

    first
        .wait_for(SubmissionStatus::Pending)
        .await
        .expect("pending");
    second.cancel();
    assert_eq!(first.wait().await, Err(SubmissionError::Cancelled));
    assert_eq!(env.mock.get_stats_for_call(RpcRequest::SendTransaction), 1);
    assert!(env.engine.inflight(&signature).is_none());
}

#[tokio::test(start_paused = true)]
async fn check_status_queries_node() {
    let env = TestEnv::new(default_config_submission());
    env.finalize_all();

    let signature = env.signed_transfer(10).signature();
    let status = env
        .engine
        .check_status(&signature)
        .await
        .expect("status")
        .expect("known signature");
    assert_eq!(
        CommitmentLevel::from(status.confirmation_status()),
        CommitmentLevel::Finalized
    );
    assert_eq!(status.slot, 42);
}

/// Asserts `expected` appears in `transitions` in order, other entries may sit in between.
fn assert_ordered(
    transitions: &[(Signature, SubmissionStatus)],
    expected: &[(Signature, SubmissionStatus)],
) {
    let mut remaining = transitions.iter();
    for wanted in expected {
        assert!(
            remaining.any(|transition| transition == wanted),
            "{wanted:?} missing or out of order in {transitions:?}"
        );
    }
}
