//! The repair scheduler: builds chunks from file metadata, feeds the upload
//! heap one directory at a time, and drives the background repair loops.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;
use rand::Rng;
use silo_core::StopListener;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_health, ChunkId, UnfinishedChunk};
use crate::dirheap::{DirEntry, DirectoryHeap};
use crate::error::RepairError;
use crate::heap::{ChunkEntry, UploadHeap};
use crate::traits::{
    ChunkRepairer, DirPath, FileEntry, FileSet, Gateway, HostContractor, HostKey, MemoryManager,
    MemoryPriority,
};
use crate::workercache::WorkerCache;

/// Which chunks a heap-building pass targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTarget {
    /// Stuck chunks, for the low-priority retry path.
    StuckChunks,
    /// Regular repairs.
    UnstuckChunks,
    /// Chunks of backup files; queued at high priority.
    BackupChunks,
}

/// Tunables for the repair scheduler.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Chunks at or above this health need repair.
    pub repair_threshold: f64,
    /// Upload heap capacity. The transient per-directory staging heap is
    /// allowed twice this before it compacts.
    pub max_upload_heap_chunks: usize,
    /// The repair loop returns once the heap drops below this, so the next
    /// pass can refill it with the newest worst chunks.
    pub min_upload_heap_size: usize,
    /// Cap on queued stuck chunks.
    pub max_stuck_in_heap: usize,
    /// Pause at the top of every main-loop pass.
    pub loop_sleep: Duration,
    /// Backoff after a pass that found nothing to do or failed.
    pub error_sleep: Duration,
    /// How often the stuck loop injects a random stuck chunk.
    pub stuck_loop_interval: Duration,
    /// Poll interval while waiting to come online.
    pub online_check_interval: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            repair_threshold: 0.25,
            max_upload_heap_chunks: 500,
            min_upload_heap_size: 20,
            max_stuck_in_heap: 10,
            loop_sleep: Duration::from_secs(5),
            error_sleep: Duration::from_secs(15 * 60),
            stuck_loop_interval: Duration::from_secs(30 * 60),
            online_check_interval: Duration::from_secs(10),
        }
    }
}

/// The external collaborators the scheduler drives.
pub struct Collaborators {
    pub file_set: Arc<dyn FileSet>,
    pub contractor: Arc<dyn HostContractor>,
    pub memory: Arc<dyn MemoryManager>,
    pub repairer: Arc<dyn ChunkRepairer>,
    pub gateway: Arc<dyn Gateway>,
}

/// Selects the worst-health chunks in the file system and hands them to a
/// bounded worker pool.
pub struct RepairScheduler {
    config: RepairConfig,
    file_set: Arc<dyn FileSet>,
    contractor: Arc<dyn HostContractor>,
    memory: Arc<dyn MemoryManager>,
    repairer: Arc<dyn ChunkRepairer>,
    gateway: Arc<dyn Gateway>,
    stop: StopListener,
    upload_heap: UploadHeap,
    dir_heap: DirectoryHeap,
    worker_cache: ArcSwap<WorkerCache>,
}

impl RepairScheduler {
    #[must_use]
    pub fn new(config: RepairConfig, collaborators: Collaborators, stop: StopListener) -> Arc<Self> {
        let upload_heap = UploadHeap::new(config.max_stuck_in_heap);
        Arc::new(Self {
            config,
            file_set: collaborators.file_set,
            contractor: collaborators.contractor,
            memory: collaborators.memory,
            repairer: collaborators.repairer,
            gateway: collaborators.gateway,
            stop,
            upload_heap,
            dir_heap: DirectoryHeap::new(),
            worker_cache: ArcSwap::from_pointee(WorkerCache::empty()),
        })
    }

    /// The upload heap, exposed so uploads can be pushed directly.
    pub fn upload_heap(&self) -> &UploadHeap {
        &self.upload_heap
    }

    /// The directory heap.
    pub fn directory_heap(&self) -> &DirectoryHeap {
        &self.dir_heap
    }

    /// The current worker-cache snapshot. Never blocks.
    pub fn worker_cache(&self) -> Arc<WorkerCache> {
        self.worker_cache.load_full()
    }

    /// Rebuild the worker cache from the contractor and swap it in.
    pub fn refresh_worker_cache(&self) -> Arc<WorkerCache> {
        let cache = Arc::new(WorkerCache::snapshot(self.contractor.as_ref()));
        self.worker_cache.store(Arc::clone(&cache));
        cache
    }

    /// Reset the directory heap to the unexplored file-system root.
    pub fn init_directory_heap(&self) {
        self.dir_heap.reset();
        let root = DirPath::root();
        let health = self.file_set.dir_health(&root);
        self.dir_heap.push(DirEntry {
            path: root,
            aggregate_health: health.aggregate_health,
            health: health.health,
            explored: false,
        });
    }

    /// Pop directories until an explored one surfaces, expanding unexplored
    /// directories into their subtrees along the way.
    fn next_explored_directory(&self) -> Option<DirEntry> {
        loop {
            let dir = self.dir_heap.pop()?;
            if dir.explored {
                return Some(dir);
            }
            for sub in self.file_set.subdirs(&dir.path) {
                let health = self.file_set.dir_health(&sub);
                let entry = DirEntry {
                    path: sub,
                    aggregate_health: health.aggregate_health,
                    health: health.health,
                    explored: false,
                };
                if !self.dir_heap.push(entry.clone()) {
                    self.dir_heap.update(entry);
                }
            }
            let health = self.file_set.dir_health(&dir.path);
            let explored = DirEntry {
                path: dir.path,
                aggregate_health: health.aggregate_health,
                health: health.health,
                explored: true,
            };
            if !self.dir_heap.push(explored.clone()) {
                self.dir_heap.update(explored);
            }
        }
    }

    /// Build one chunk's repair state from its file metadata.
    fn build_unfinished_chunk(
        &self,
        file: &Arc<dyn FileEntry>,
        index: u64,
        priority: bool,
        cache: &WorkerCache,
    ) -> Option<UnfinishedChunk> {
        let pieces = match file.pieces(index) {
            Ok(pieces) => pieces,
            Err(err) => {
                warn!(file = %file.id().0, index, error = %err, "failed to load pieces, marking chunk stuck");
                if let Err(err) = file.set_stuck(index, true) {
                    warn!(file = %file.id().0, index, error = %err, "failed to mark chunk stuck");
                }
                return None;
            }
        };

        // Walk the piece sets, counting redundancy. A host contributes at
        // most once per chunk even if it holds several pieces; contracts no
        // longer being renewed do not count.
        let num_pieces = file.num_pieces();
        let min_pieces = file.min_pieces();
        let mut unused_hosts: HashSet<HostKey> = cache.hosts.clone();
        let mut piece_usage = vec![false; num_pieces as usize];
        let mut completed: u32 = 0;
        for (slot, piece_set) in pieces.iter().enumerate().take(num_pieces as usize) {
            for piece in piece_set {
                let Some(utility) = self.contractor.contract_utility(&piece.host) else {
                    continue;
                };
                if !utility.good_for_renew {
                    continue;
                }
                if unused_hosts.remove(&piece.host) && !piece_usage[slot] {
                    piece_usage[slot] = true;
                    completed += 1;
                }
            }
        }

        Some(UnfinishedChunk {
            id: ChunkId {
                file: file.id(),
                index,
            },
            priority,
            stuck: file.stuck(index),
            stuck_repair: false,
            health: chunk_health(completed, num_pieces, min_pieces),
            pieces_completed: completed,
            pieces_needed: num_pieces,
            min_pieces,
            memory_needed: file.piece_size() * u64::from(num_pieces + min_pieces),
            file: Arc::clone(file),
        })
    }

    /// Build every unfinished chunk of one file for a target, applying the
    /// repairability rules: a chunk that needs repair but cannot be repaired
    /// is marked stuck and released.
    fn build_unfinished_chunks(
        &self,
        file: &Arc<dyn FileEntry>,
        target: RepairTarget,
        cache: &WorkerCache,
    ) -> Vec<UnfinishedChunk> {
        let min_pieces = file.min_pieces();
        if cache.workers() < min_pieces as usize {
            debug!(file = %file.id().0, "not enough workers to build chunks from file");
            if cache.allowance.hosts < u64::from(min_pieces) && target == RepairTarget::UnstuckChunks
            {
                warn!(
                    file = %file.id().0,
                    have = cache.allowance.hosts,
                    need = min_pieces,
                    "allowance has insufficient hosts for minimum redundancy, marking all chunks stuck"
                );
                if let Err(err) = file.set_all_stuck(true) {
                    warn!(file = %file.id().0, error = %err, "unable to mark all chunks stuck");
                }
            }
            return Vec::new();
        }

        let wants_stuck = target == RepairTarget::StuckChunks;
        let priority = target == RepairTarget::BackupChunks;
        let mut built = Vec::new();
        for index in 0..file.num_chunks() {
            if file.stuck(index) != wants_stuck {
                continue;
            }
            if let Some(chunk) = self.build_unfinished_chunk(file, index, priority, cache) {
                built.push(chunk);
            }
        }

        let on_disk = file.on_disk();
        let mut incomplete = Vec::new();
        for chunk in built {
            let repairable = chunk.health <= 1.0 || on_disk;
            let needs_repair = chunk.health >= self.config.repair_threshold;
            if needs_repair && (repairable || wants_stuck) {
                incomplete.push(chunk);
                continue;
            }
            if !repairable {
                info!(chunk = %chunk.id, "marking chunk as stuck: below minimum redundancy and no local source");
                self.set_stuck_and_close(&chunk, true);
                continue;
            }
            self.set_stuck_and_close(&chunk, false);
        }
        incomplete
    }

    fn set_stuck_and_close(&self, chunk: &UnfinishedChunk, stuck: bool) {
        if let Err(err) = chunk.file.set_stuck(chunk.id.index, stuck) {
            debug!(chunk = %chunk.id, error = %err, "unable to update chunk stuck status");
        }
        chunk.close();
    }

    /// Stage a directory's chunks in a bounded temp heap, then move the
    /// worst of them into the upload heap.
    ///
    /// Chunks healthier than the directory heap's next directory are skipped
    /// (another directory would hand us worse ones); the worst skipped
    /// health decides whether this directory re-enters the heap.
    fn build_and_push_chunks(
        &self,
        files: &[Arc<dyn FileEntry>],
        dir: &DirPath,
        target: RepairTarget,
        cache: &WorkerCache,
    ) {
        let max = self.config.max_upload_heap_chunks;
        let dir_heap_health = self.dir_heap.peek_health();
        let mut temp: BinaryHeap<ChunkEntry> = BinaryHeap::new();
        let mut worst_ignored: f64 = 0.0;

        for file in files {
            let file_health = file.cached_health();
            if file_health < dir_heap_health {
                worst_ignored = worst_ignored.max(file_health);
                continue;
            }

            for chunk in self.build_unfinished_chunks(file, target, cache) {
                if self.upload_heap.exists(chunk.id) {
                    chunk.close();
                    continue;
                }
                if chunk.health < dir_heap_health {
                    worst_ignored = worst_ignored.max(chunk.health);
                    chunk.close();
                    continue;
                }
                temp.push(ChunkEntry(chunk));

                // Bound the temp heap at twice the upload heap size: keep
                // the worst half, remember the health of the best dropped
                // chunk, release the rest.
                if temp.len() < max * 2 {
                    continue;
                }
                let mut keep = Vec::with_capacity(max);
                for _ in 0..max {
                    if let Some(entry) = temp.pop() {
                        keep.push(entry);
                    }
                }
                if let Some(ChunkEntry(next)) = temp.pop() {
                    worst_ignored = worst_ignored.max(next.health);
                    next.close();
                }
                for ChunkEntry(rest) in temp.drain() {
                    rest.close();
                }
                temp.extend(keep);
            }
        }

        // Feed the upload heap until it is full.
        while self.upload_heap.len() < max {
            let Some(ChunkEntry(chunk)) = temp.pop() else { break };
            if let Err(rejected) = self.upload_heap.push(chunk) {
                rejected.close();
            }
        }
        if let Some(ChunkEntry(next)) = temp.pop() {
            worst_ignored = worst_ignored.max(next.health);
            next.close();
        }
        for ChunkEntry(rest) in temp.drain() {
            rest.close();
        }

        // If we ignored chunks that still need repair, the directory has to
        // come back around.
        if worst_ignored < self.config.repair_threshold {
            return;
        }
        let entry = DirEntry {
            path: dir.clone(),
            aggregate_health: worst_ignored,
            health: worst_ignored,
            explored: true,
        };
        if !self.dir_heap.push(entry.clone()) && !self.dir_heap.update(entry) {
            warn!(dir = %dir, "unable to push or update directory in the directory heap");
        }
    }

    /// Build stuck chunks from randomly chosen files and push one random
    /// chunk per file. Returns the number of chunks queued.
    fn build_and_push_random_chunk(
        &self,
        files: &[Arc<dyn FileEntry>],
        chunks_to_add: usize,
        cache: &WorkerCache,
    ) -> usize {
        let mut order: Vec<usize> = (0..files.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut pushed = 0;
        for &file_index in order.iter().take(chunks_to_add) {
            let file = &files[file_index];
            let mut chunks = self.build_unfinished_chunks(file, RepairTarget::StuckChunks, cache);
            if chunks.is_empty() {
                continue;
            }
            let pick = rand::thread_rng().gen_range(0..chunks.len());
            let mut chunk = chunks.swap_remove(pick);
            chunk.stuck_repair = true;
            match self.upload_heap.push(chunk) {
                Ok(()) => pushed += 1,
                Err(rejected) => {
                    debug!(chunk = %rejected.id, "stuck chunk was not added to the heap");
                    rejected.close();
                }
            }
            for unused in chunks {
                unused.close();
            }
        }
        pushed
    }

    /// Build chunks for one directory and push them to the upload heap.
    pub fn build_chunk_heap(&self, dir: &DirPath, target: RepairTarget, cache: &WorkerCache) {
        let mut files = Vec::new();
        for file in self.file_set.open_files(dir) {
            let keep = match target {
                RepairTarget::StuckChunks => file.num_stuck_chunks() > 0,
                // The cached health is maintained by bubble, so it is
                // accurate enough to skip files with nothing to repair.
                RepairTarget::UnstuckChunks => {
                    file.num_chunks() != file.num_stuck_chunks()
                        && file.cached_health() >= self.config.repair_threshold
                }
                RepairTarget::BackupChunks => true,
            };
            if keep {
                files.push(file);
            } else {
                file.close();
            }
        }
        if files.is_empty() {
            debug!(dir = %dir, "no files pulled from directory for the repair heap");
            return;
        }

        match target {
            RepairTarget::StuckChunks => {
                self.build_and_push_random_chunk(&files, self.config.max_stuck_in_heap, cache);
            }
            RepairTarget::UnstuckChunks | RepairTarget::BackupChunks => {
                self.build_and_push_chunks(&files, dir, target, cache);
            }
        }

        for file in files {
            file.close();
        }
    }

    /// Fill the upload heap one directory at a time until it is full, the
    /// directory heap empties, or the worst remaining directory is healthy.
    /// Returns the directories whose chunks were queued, for bubbling.
    pub fn add_chunks_to_heap(&self, cache: &WorkerCache) -> HashSet<DirPath> {
        let mut touched = HashSet::new();
        let mut prev_len = self.upload_heap.len();
        while self.upload_heap.len() < self.config.max_upload_heap_chunks
            && !self.dir_heap.is_empty()
        {
            if self.stop.is_stopped() {
                break;
            }
            let Some(dir) = self.next_explored_directory() else {
                break;
            };
            if dir.health < self.config.repair_threshold {
                // The worst directory is healthy: the file system is healthy.
                break;
            }
            self.build_chunk_heap(&dir.path, RepairTarget::UnstuckChunks, cache);

            let len = self.upload_heap.len();
            if len == prev_len {
                // The worst chunks are already queued or being repaired.
                debug!("no more chunks added to the upload heap");
                break;
            }
            prev_len = len;
            touched.insert(dir.path.clone());
            debug!(dir = %dir.path, heap_len = len, "added chunks to the upload heap");
        }
        touched
    }

    /// Pop chunks and dispatch them to workers until the heap drains (small
    /// repairs) or drops below the minimum occupancy (large repairs).
    pub async fn repair_loop(
        self: &Arc<Self>,
        cache: &Arc<WorkerCache>,
    ) -> Result<(), RepairError> {
        let small_repair = self.upload_heap.len() < self.config.min_upload_heap_size;
        while self.upload_heap.len() >= self.config.min_upload_heap_size || small_repair {
            if self.stop.is_stopped() {
                return Err(RepairError::Stopped);
            }
            if !self.gateway.online() {
                return Err(RepairError::Offline);
            }

            let Some(chunk) = self.upload_heap.pop() else {
                self.upload_heap.reset();
                return Ok(());
            };
            debug!(chunk = %chunk.id, "sending next chunk to the workers");

            // The chunk needs at least min_pieces workers to reach minimum
            // redundancy. Too few workers with too few allowance hosts is a
            // file problem; too few workers alone is temporary.
            if cache.workers() < chunk.min_pieces as usize {
                if cache.allowance.hosts < u64::from(chunk.min_pieces) && !chunk.stuck {
                    warn!(
                        chunk = %chunk.id,
                        have = cache.allowance.hosts,
                        need = chunk.min_pieces,
                        "allowance has insufficient hosts for minimum redundancy, marking chunk stuck"
                    );
                    if let Err(err) = chunk.file.set_stuck(chunk.id.index, true) {
                        debug!(chunk = %chunk.id, error = %err, "unable to mark chunk as stuck");
                    }
                }
                chunk.close();
                self.upload_heap.mark_repair_done(chunk.id);
                continue;
            }

            // Reserve memory before dispatch; refusal is a resource issue,
            // not a file issue, so the chunk is skipped rather than stuck.
            if !self
                .memory
                .request(chunk.memory_needed, MemoryPriority::Low)
                .await
            {
                debug!(chunk = %chunk.id, "memory reservation refused, skipping chunk");
                chunk.close();
                self.upload_heap.mark_repair_done(chunk.id);
                continue;
            }

            let scheduler = Arc::clone(self);
            let hosts = cache.hosts.clone();
            tokio::spawn(async move {
                scheduler.fetch_and_repair_chunk(chunk, hosts).await;
            });
        }
        Ok(())
    }

    /// The asynchronous fetch-encode-distribute task for one chunk.
    async fn fetch_and_repair_chunk(&self, chunk: UnfinishedChunk, hosts: HashSet<HostKey>) {
        let result = self.repairer.repair_chunk(&chunk, &hosts).await;
        self.memory.release(chunk.memory_needed);
        match result {
            Ok(()) => {
                if chunk.stuck || chunk.stuck_repair {
                    if let Err(err) = chunk.file.set_stuck(chunk.id.index, false) {
                        debug!(chunk = %chunk.id, error = %err, "unable to unstick repaired chunk");
                    }
                }
            }
            Err(err) => {
                warn!(chunk = %chunk.id, error = %err, "chunk repair failed, marking chunk stuck");
                if let Err(err) = chunk.file.set_stuck(chunk.id.index, true) {
                    debug!(chunk = %chunk.id, error = %err, "unable to mark chunk as stuck");
                }
            }
        }
        chunk.close();
        self.upload_heap.mark_repair_done(chunk.id);
    }

    /// Build one random stuck chunk and queue it at low priority.
    pub fn inject_random_stuck_chunk(&self) {
        let cache = self.refresh_worker_cache();
        let files = self.file_set.files_with_stuck_chunks();
        if files.is_empty() {
            return;
        }
        let pushed = self.build_and_push_random_chunk(&files, 1, &cache);
        for file in files {
            file.close();
        }
        if pushed > 0 {
            self.upload_heap.repair_needed.notify_one();
        }
    }

    async fn block_until_online(&self) -> bool {
        while !self.gateway.online() {
            tokio::select! {
                () = self.stop.stopped() => return false,
                () = tokio::time::sleep(self.config.online_check_interval) => {}
            }
        }
        true
    }

    /// The main background loop: keeps the upload heap fed and drained
    /// until shutdown.
    pub async fn run(self: Arc<Self>) {
        self.init_directory_heap();
        loop {
            if self.stop.is_stopped() {
                return;
            }
            tokio::select! {
                () = self.stop.stopped() => return,
                () = tokio::time::sleep(self.config.loop_sleep) => {}
            }

            // Queue any backup chunks that did not finish uploading before
            // the last shutdown; they ride at high priority.
            let cache = self.refresh_worker_cache();
            let before = self.upload_heap.len();
            self.build_chunk_heap(&DirPath::root(), RepairTarget::BackupChunks, &cache);
            let backup_chunks = self.upload_heap.len() - before;
            if backup_chunks > 0 {
                info!(backup_chunks, "added backup chunks to the upload heap");
            }

            if !self.block_until_online().await {
                return;
            }

            // A healthy file system with an empty heap has nothing to do:
            // wait for a new upload or an injected stuck chunk. Going
            // straight into the repair pass afterward matters, because the
            // directory metadata may not reflect the new work yet.
            if self.dir_heap.peek_health() < self.config.repair_threshold
                && self.upload_heap.is_empty()
            {
                tokio::select! {
                    () = self.upload_heap.new_uploads.notified() => {}
                    () = self.upload_heap.repair_needed.notified() => {}
                    () = self.stop.stopped() => return,
                }
                // Another task may have queued a directory for repair while
                // we slept; only rebuild if the heap still looks healthy.
                if self.dir_heap.peek_health() < self.config.repair_threshold {
                    self.init_directory_heap();
                }
            }

            let cache = self.refresh_worker_cache();
            let touched = self.add_chunks_to_heap(&cache);

            let heap_len = self.upload_heap.len();
            if heap_len == 0 {
                // Possibly just a pass raced with in-flight repairs; backoff
                // prevents rapid cycling either way.
                debug!("no chunks in the upload heap after an add pass");
                tokio::select! {
                    () = self.stop.stopped() => return,
                    () = tokio::time::sleep(self.config.error_sleep) => {}
                }
                continue;
            }

            debug!(heap_len, "executing an upload and repair cycle");
            if let Err(err) = self.repair_loop(&cache).await {
                warn!(error = %err, "repair loop exited early");
                tokio::select! {
                    () = self.stop.stopped() => return,
                    () = tokio::time::sleep(self.config.error_sleep) => {}
                }
            }

            // Recompute metadata for every directory we touched, off the
            // repair path.
            for dir in touched {
                let file_set = Arc::clone(&self.file_set);
                tokio::spawn(async move {
                    file_set.bubble(&dir).await;
                });
            }
        }
    }

    /// The lower-priority stuck loop: occasionally retries a random stuck
    /// chunk without letting stuck work monopolize the heap.
    pub async fn run_stuck_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.stop.stopped() => return,
                () = tokio::time::sleep(self.config.stuck_loop_interval) => {}
            }
            if !self.gateway.online() {
                continue;
            }
            self.inject_random_stuck_chunk();
        }
    }
}
