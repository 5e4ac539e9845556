use {
    futures::future::join_all,
    solana_rpc_client_api::request::RpcRequest,
    solana_sdk::hash::Hash,
    std::{sync::Arc, time::Duration},
    yellowstone_sender::{
        blockhash_cache::{BlockhashCache, BlockhashState},
        rpc::{
            RpcClient,
            testkit::{MockRpcSender, return_blockhash, return_unique_blockhash},
        },
        util::CommitmentLevel,
    },
};

fn slow_node() -> MockRpcSender {
    let mock = MockRpcSender::default();
    mock.set_method_delay(RpcRequest::GetLatestBlockhash, Duration::from_millis(500));
    mock
}

#[tokio::test(start_paused = true)]
async fn concurrent_gets_share_one_refresh() {
    let mock = slow_node();
    let hash = Hash::new_unique();
    mock.set_method_return(RpcRequest::GetLatestBlockhash, return_blockhash(hash, 300));
    let rpc = Arc::new(RpcClient::new(mock.clone(), CommitmentLevel::Confirmed));
    let cache = Arc::new(BlockhashCache::new(rpc));

    let results = join_all((0..16).map(|_| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get().await })
    }))
    .await;

    for result in results {
        let blockhash = result.expect("join").expect("blockhash");
        assert_eq!(blockhash.hash(), hash);
    }
    assert_eq!(mock.get_stats_for_call(RpcRequest::GetLatestBlockhash), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_gets_after_expiry_share_one_refresh() {
    let mock = slow_node();
    mock.set_method_return(RpcRequest::GetLatestBlockhash, return_unique_blockhash(300));
    let rpc = Arc::new(RpcClient::new(mock.clone(), CommitmentLevel::Confirmed));
    let cache = Arc::new(BlockhashCache::new(rpc));

    let first = cache.get().await.expect("blockhash");
    cache.observe_block_height(301);
    assert_eq!(cache.state().await, BlockhashState::Expired(first));

    let results = join_all((0..16).map(|_| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get().await })
    }))
    .await;

    let hashes = results
        .into_iter()
        .map(|result| result.expect("join").expect("blockhash").hash())
        .collect::<Vec<_>>();
    assert!(hashes.iter().all(|hash| *hash == hashes[0]));
    assert_ne!(hashes[0], first.hash());
    assert_eq!(mock.get_stats_for_call(RpcRequest::GetLatestBlockhash), 2);
}
