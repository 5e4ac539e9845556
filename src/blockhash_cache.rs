use {
    crate::{
        metrics::sender as metrics,
        rpc::{RpcClient, RpcClientError},
        util::BlockHeight,
    },
    solana_sdk::hash::Hash,
    std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    tokio::sync::{Mutex, RwLock},
    tracing::{debug, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blockhash {
    hash: Hash,
    last_valid_block_height: BlockHeight,
}

impl Blockhash {
    pub const fn new(hash: Hash, last_valid_block_height: BlockHeight) -> Self {
        Self {
            hash,
            last_valid_block_height,
        }
    }

    pub const fn hash(&self) -> Hash {
        self.hash
    }

    pub const fn last_valid_block_height(&self) -> BlockHeight {
        self.last_valid_block_height
    }

    /// Transactions using this blockhash are accepted up to and including `last_valid_block_height`.
    pub const fn is_valid_at(&self, block_height: BlockHeight) -> bool {
        block_height <= self.last_valid_block_height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockhashState {
    Empty,
    Valid(Blockhash),
    Expired(Blockhash),
}

#[derive(Debug, Default)]
struct CacheSlot {
    blockhash: Option<Blockhash>,
    invalidated: bool,
    // bumped on every successful refresh
    generation: u64,
}

///
/// Holds the most recent blockhash and refreshes it once the locally tracked
/// block height moves past its last valid height.
///
/// Concurrent callers hitting an empty or expired cache wait for a single
/// `getLatestBlockhash` request instead of issuing their own.
///
#[derive(Debug)]
pub struct BlockhashCache {
    rpc: Arc<RpcClient>,
    slot: RwLock<CacheSlot>,
    refresh_lock: Mutex<()>,
    block_height: AtomicU64,
}

impl BlockhashCache {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            rpc,
            slot: RwLock::new(CacheSlot::default()),
            refresh_lock: Mutex::new(()),
            block_height: AtomicU64::new(0),
        }
    }

    pub fn block_height_estimate(&self) -> BlockHeight {
        self.block_height.load(Ordering::Acquire)
    }

    /// Advances the height estimate, lower values are ignored.
    pub fn observe_block_height(&self, block_height: BlockHeight) {
        let previous = self.block_height.fetch_max(block_height, Ordering::AcqRel);
        if block_height > previous {
            metrics::set_block_height_estimate(block_height);
        }
    }

    pub async fn state(&self) -> BlockhashState {
        let slot = self.slot.read().await;
        match slot.blockhash {
            None => BlockhashState::Empty,
            Some(blockhash)
                if !slot.invalidated && blockhash.is_valid_at(self.block_height_estimate()) =>
            {
                BlockhashState::Valid(blockhash)
            }
            Some(blockhash) => BlockhashState::Expired(blockhash),
        }
    }

    async fn cached(&self) -> Result<Blockhash, u64> {
        let slot = self.slot.read().await;
        match slot.blockhash {
            Some(blockhash)
                if !slot.invalidated && blockhash.is_valid_at(self.block_height_estimate()) =>
            {
                Ok(blockhash)
            }
            _ => Err(slot.generation),
        }
    }

    pub async fn get(&self) -> Result<Blockhash, RpcClientError> {
        let seen = match self.cached().await {
            Ok(blockhash) => return Ok(blockhash),
            Err(generation) => generation,
        };

        let _refresh = self.refresh_lock.lock().await;
        {
            // refreshed by the caller holding the lock before us, even if the
            // node handed out a blockhash that is already past our estimate
            let slot = self.slot.read().await;
            if slot.generation != seen && !slot.invalidated {
                if let Some(blockhash) = slot.blockhash {
                    return Ok(blockhash);
                }
            }
        }

        match self.rpc.get_latest_blockhash().await {
            Ok(blockhash) => {
                metrics::incr_blockhash_refresh("ok");
                metrics::set_blockhash_last_valid_block_height(blockhash.last_valid_block_height());
                let block_height = self.block_height_estimate();
                if !blockhash.is_valid_at(block_height) {
                    warn!(
                        blockhash = %blockhash.hash(),
                        last_valid_block_height = blockhash.last_valid_block_height(),
                        block_height,
                        "node returned a blockhash that is already expired"
                    );
                }
                debug!(
                    blockhash = %blockhash.hash(),
                    last_valid_block_height = blockhash.last_valid_block_height(),
                    "blockhash refreshed"
                );
                let mut slot = self.slot.write().await;
                slot.blockhash = Some(blockhash);
                slot.invalidated = false;
                slot.generation += 1;
                Ok(blockhash)
            }
            Err(error) => {
                metrics::incr_blockhash_refresh("error");
                warn!(?error, "failed to refresh blockhash");
                Err(error)
            }
        }
    }

    /// Forces the next `get` to fetch a new blockhash.
    pub async fn invalidate(&self) {
        self.slot.write().await.invalidated = true;
    }

    /// Invalidates only when `hash` is still the cached blockhash.
    pub async fn invalidate_if(&self, hash: &Hash) -> bool {
        let mut slot = self.slot.write().await;
        let matches = slot
            .blockhash
            .is_some_and(|blockhash| blockhash.hash() == *hash);
        if matches {
            slot.invalidated = true;
        }
        matches
    }
}
