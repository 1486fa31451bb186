use crate::config::EngineConfig;
use crate::error::{Error, Result};
use ahash::{AHashMap, AHashSet, RandomState};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::{BuildHasher, Hash, Hasher};

struct PrefixEntry {
    parent: Option<u64>,
    block: u32,
    children: usize,
    access_id: u64,
}

/// Cached full prompt blocks keyed by the hash chain of their contents.
/// Only leaves (entries no other entry extends) are evicted, oldest first.
struct PrefixPool {
    block_size: usize,
    max_cached_blocks: usize,
    hasher: RandomState,
    entries: AHashMap<u64, PrefixEntry>,
    leaf_set: AHashSet<u64>,
    leaf_lru: VecDeque<(u64, u64)>,
    access_counter: u64,
}

impl PrefixPool {
    fn new(block_size: usize, max_cached_blocks: usize) -> Self {
        Self {
            block_size,
            max_cached_blocks,
            hasher: RandomState::new(),
            entries: AHashMap::new(),
            leaf_set: AHashSet::new(),
            leaf_lru: VecDeque::new(),
            access_counter: 0,
        }
    }

    fn hash_block(&self, parent_hash: u64, tokens: &[u32]) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        parent_hash.hash(&mut hasher);
        tokens.hash(&mut hasher);
        hasher.finish()
    }

    /// Blocks matching the leading full blocks of `tokens`, in order.
    fn match_prefix(&mut self, tokens: &[u32]) -> Vec<u32> {
        let mut matched = Vec::new();
        let mut parent_hash = 0u64;
        for block_tokens in tokens.chunks_exact(self.block_size) {
            let hash = self.hash_block(parent_hash, block_tokens);
            let access_id = self.next_access_id();
            match self.entries.get_mut(&hash) {
                Some(entry) => {
                    entry.access_id = access_id;
                    matched.push(entry.block);
                }
                None => break,
            }
            self.touch_leaf(hash);
            parent_hash = hash;
        }
        matched
    }

    /// Returns the blocks that became cached; the caller takes a reference
    /// on each of them.
    fn insert(&mut self, tokens: &[u32], blocks: &[u32]) -> Vec<u32> {
        let mut inserted = Vec::new();
        let mut parent_hash = None;
        for (block, block_tokens) in blocks.iter().zip(tokens.chunks_exact(self.block_size)) {
            let hash = self.hash_block(parent_hash.unwrap_or(0), block_tokens);
            let access_id = self.next_access_id();
            if let Some(entry) = self.entries.get_mut(&hash) {
                entry.access_id = access_id;
                self.touch_leaf(hash);
            } else {
                if let Some(parent) = parent_hash {
                    if let Some(parent_entry) = self.entries.get_mut(&parent) {
                        if parent_entry.children == 0 {
                            self.leaf_set.remove(&parent);
                        }
                        parent_entry.children += 1;
                    }
                }
                self.entries.insert(
                    hash,
                    PrefixEntry {
                        parent: parent_hash,
                        block: *block,
                        children: 0,
                        access_id,
                    },
                );
                self.leaf_set.insert(hash);
                self.push_lru(hash, access_id);
                inserted.push(*block);
            }
            parent_hash = Some(hash);
        }
        inserted
    }

    fn evict_one(&mut self) -> Option<u32> {
        while let Some((hash, access_id)) = self.leaf_lru.pop_front() {
            if !self.leaf_set.contains(&hash) {
                continue;
            }
            match self.entries.get(&hash) {
                Some(entry) if entry.access_id == access_id && entry.children == 0 => {}
                _ => continue,
            }
            let entry = self.entries.remove(&hash)?;
            self.leaf_set.remove(&hash);
            if let Some(parent) = entry.parent {
                if let Some(parent_entry) = self.entries.get_mut(&parent) {
                    parent_entry.children = parent_entry.children.saturating_sub(1);
                    if parent_entry.children == 0 {
                        let access_id = parent_entry.access_id;
                        self.leaf_set.insert(parent);
                        self.push_lru(parent, access_id);
                    }
                }
            }
            return Some(entry.block);
        }
        None
    }

    fn evict_if_needed(&mut self) -> Vec<u32> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max_cached_blocks {
            match self.evict_one() {
                Some(block) => evicted.push(block),
                None => break,
            }
        }
        evicted
    }

    fn touch_leaf(&mut self, hash: u64) {
        if self.leaf_set.contains(&hash) {
            if let Some(access_id) = self.entries.get(&hash).map(|entry| entry.access_id) {
                self.push_lru(hash, access_id);
            }
        }
    }

    /// Queues a leaf access. Superseded accesses are only skipped lazily on
    /// eviction, so the queue is compacted once it outgrows the pool.
    fn push_lru(&mut self, hash: u64, access_id: u64) {
        self.leaf_lru.push_back((hash, access_id));
        if self.leaf_lru.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            let leaf_set = &self.leaf_set;
            self.leaf_lru.retain(|(hash, access_id)| {
                leaf_set.contains(hash)
                    && entries
                        .get(hash)
                        .is_some_and(|entry| entry.access_id == *access_id)
            });
        }
    }

    fn next_access_id(&mut self) -> u64 {
        self.access_counter = self.access_counter.wrapping_add(1);
        self.access_counter
    }
}

struct Blocks {
    free_blocks: Vec<u32>,
    refcounts: Vec<usize>,
    prefix: Option<PrefixPool>,
}

impl Blocks {
    fn take(&mut self, block: u32) {
        self.refcounts[block as usize] += 1;
    }

    fn drop_ref(&mut self, block: u32) {
        let refcount = &mut self.refcounts[block as usize];
        if *refcount == 0 {
            tracing::error!("KV block {} freed twice", block);
            return;
        }
        *refcount -= 1;
        if *refcount == 0 {
            self.free_blocks.push(block);
        }
    }

    /// Evicts cached prefixes until `needed` blocks are free or nothing is
    /// left to evict.
    fn reclaim(&mut self, needed: usize) {
        while self.free_blocks.len() < needed {
            let evicted = match self.prefix.as_mut().and_then(|pool| pool.evict_one()) {
                Some(block) => block,
                None => return,
            };
            self.drop_ref(evicted);
        }
    }

    fn allocate(&mut self, needed: usize) -> Result<Vec<u32>> {
        self.reclaim(needed);
        if self.free_blocks.len() < needed {
            return Err(Error::CacheExhausted {
                needed,
                available: self.free_blocks.len(),
            });
        }
        let at = self.free_blocks.len() - needed;
        let blocks = self.free_blocks.split_off(at);
        for block in &blocks {
            self.refcounts[*block as usize] = 1;
        }
        Ok(blocks)
    }
}

/// Refcounted pool of fixed-size KV-cache blocks, optionally keeping
/// finished prompts around for reuse by later requests.
pub struct KvCacheManager {
    block_size: usize,
    num_blocks: usize,
    blocks: Mutex<Blocks>,
}

impl KvCacheManager {
    pub fn new(block_size: usize, num_blocks: usize, max_cached_blocks: Option<usize>) -> Self {
        let prefix = max_cached_blocks
            .filter(|max| *max > 0)
            .map(|max| PrefixPool::new(block_size, max));
        Self {
            block_size,
            num_blocks,
            blocks: Mutex::new(Blocks {
                free_blocks: (0..num_blocks as u32).rev().collect(),
                refcounts: vec![0; num_blocks],
                prefix,
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let max_cached_blocks = config.reuse_cache.then_some(config.max_cached_blocks);
        Self::new(config.block_size, config.num_blocks, max_cached_blocks)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_free_blocks(&self) -> usize {
        self.blocks.lock().free_blocks.len()
    }

    pub fn num_cached_blocks(&self) -> usize {
        self.blocks
            .lock()
            .prefix
            .as_ref()
            .map_or(0, |pool| pool.entries.len())
    }

    pub fn reuse_enabled(&self) -> bool {
        self.blocks.lock().prefix.is_some()
    }

    /// Blocks needed to hold `tokens` tokens.
    pub fn blocks_for(&self, tokens: usize) -> usize {
        tokens.div_ceil(self.block_size)
    }

    /// Allocates the prompt's block table for every beam. Cached prefix
    /// blocks are shared by all beams; at least the last prompt token is
    /// always recomputed. Returns the table and the reused token count.
    pub fn allocate_prompt(&self, prompt: &[u32], num_beams: usize) -> Result<(Vec<Vec<u32>>, usize)> {
        let mut blocks = self.blocks.lock();
        let mut shared = match blocks.prefix.as_mut() {
            Some(pool) => pool.match_prefix(prompt),
            None => Vec::new(),
        };
        if shared.len() * self.block_size >= prompt.len() {
            shared.pop();
        }
        // Pin the shared blocks so reclaiming below cannot hand them out.
        for block in &shared {
            blocks.take(*block);
        }

        let per_beam = self.blocks_for(prompt.len()) - shared.len();
        let fresh = match blocks.allocate(per_beam * num_beams) {
            Ok(fresh) => fresh,
            Err(e) => {
                for block in &shared {
                    blocks.drop_ref(*block);
                }
                return Err(e);
            }
        };
        // One pin is already held; every further beam adds its own.
        for block in &shared {
            for _ in 1..num_beams {
                blocks.take(*block);
            }
        }

        let table = (0..num_beams)
            .map(|beam| {
                let own = &fresh[beam * per_beam..(beam + 1) * per_beam];
                shared.iter().chain(own).copied().collect()
            })
            .collect();
        Ok((table, shared.len() * self.block_size))
    }

    /// Fresh blocks for one stream, `per_beam` for each of `num_beams` beams.
    pub fn allocate(&self, per_beam: usize, num_beams: usize) -> Result<Vec<Vec<u32>>> {
        let fresh = self.blocks.lock().allocate(per_beam * num_beams)?;
        if per_beam == 0 {
            return Ok(vec![Vec::new(); num_beams]);
        }
        Ok(fresh.chunks(per_beam).map(|c| c.to_vec()).collect())
    }

    pub fn release(&self, table: Vec<Vec<u32>>) {
        let mut blocks = self.blocks.lock();
        for block in table.into_iter().flatten() {
            blocks.drop_ref(block);
        }
    }

    /// Offers beam 0's full prompt blocks to the reuse pool, then drops the
    /// stream's references.
    pub fn release_finished(&self, prompt: &[u32], table: Vec<Vec<u32>>) {
        let mut blocks = self.blocks.lock();
        let (inserted, evicted) = match (blocks.prefix.as_mut(), table.first()) {
            (Some(pool), Some(beam0)) => {
                let inserted = pool.insert(prompt, beam0);
                (inserted, pool.evict_if_needed())
            }
            _ => (Vec::new(), Vec::new()),
        };
        for block in inserted {
            blocks.take(block);
        }
        for block in evicted {
            blocks.drop_ref(block);
        }
        for block in table.into_iter().flatten() {
            blocks.drop_ref(block);
        }
    }
}

impl std::fmt::Debug for KvCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvCacheManager")
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("free", &self.num_free_blocks())
            .field("cached", &self.num_cached_blocks())
            .finish()
    }
}
