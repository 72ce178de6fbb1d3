// Sharded voxel/image data.
//
// A shard is a safetensors file holding one voxel tensor and one stimulus
// tensor, records on axis 0. Shard lists come from brace patterns such as
// `train_{0..49}.safetensors`, either local paths or files under
// `<remote_base_url>/resolve/<data_commit>/` cached in `cache_dir/<commit>/`.

use crate::config::RunConfig;
use crate::error::TrainError;
use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

/// One batch of `(voxels, images)`.
#[derive(Clone, Debug)]
pub struct Batch {
    pub voxels: Tensor,
    pub images: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.voxels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        Ok(Batch {
            voxels: self.voxels.to_device(device)?.to_dtype(DType::F32)?,
            images: self.images.to_device(device)?.to_dtype(DType::F32)?,
        })
    }

    /// The first `n` records (all of them when `n >= len`).
    pub fn head(&self, n: usize) -> Result<Batch> {
        let n = n.min(self.len());
        Ok(Batch { voxels: self.voxels.narrow(0, 0, n)?, images: self.images.narrow(0, 0, n)? })
    }
}

pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + Send + 'a>;

pub trait BatchSource: Send + Sync {
    /// Batches for one pass. `epoch` seeds the shuffle.
    fn batches(&self, epoch: usize) -> BatchIter<'_>;
}

/// Fixed batches replayed every epoch (debug `first_batch` mode, tests).
pub struct MemoryBatches {
    batches: Vec<Batch>,
}

impl MemoryBatches {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl BatchSource for MemoryBatches {
    fn batches(&self, _epoch: usize) -> BatchIter<'_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}

/// First batch of a source, or an error when it yields nothing.
pub fn first_batch(source: &dyn BatchSource) -> Result<Batch> {
    source
        .batches(0)
        .next()
        .context("data source produced no batches")?
}

// ---------------------------------------------------------------------------
// Shard lists
// ---------------------------------------------------------------------------

/// Expand every `{a..b}` range in `pattern`, keeping zero padding of `a`.
pub fn expand_braces(pattern: &str) -> Result<Vec<String>> {
    let Some(open) = pattern.find('{') else {
        return Ok(vec![pattern.to_string()]);
    };
    let close = pattern[open..]
        .find('}')
        .map(|i| open + i)
        .with_context(|| format!("unclosed brace in {pattern}"))?;
    let body = &pattern[open + 1..close];
    let (lo, hi) = body
        .split_once("..")
        .with_context(|| format!("expected {{a..b}} in {pattern}"))?;
    let width = if lo.len() > 1 && lo.starts_with('0') { lo.len() } else { 0 };
    let lo: usize = lo.parse().with_context(|| format!("bad range start in {pattern}"))?;
    let hi: usize = hi.parse().with_context(|| format!("bad range end in {pattern}"))?;
    anyhow::ensure!(lo <= hi, "empty range in {pattern}");

    let prefix = &pattern[..open];
    let mut out = Vec::new();
    for rest in expand_braces(&pattern[close + 1..])? {
        for i in lo..=hi {
            out.push(format!("{prefix}{i:0width$}{rest}"));
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

pub fn remote_url(base: &str, commit: &str, path: &str) -> String {
    format!(
        "{}/resolve/{}/{}",
        base.trim_end_matches('/'),
        commit,
        path.trim_start_matches('/')
    )
}

/// Download `url` to `dest` unless it is already there.
pub fn fetch_shard(url: &str, dest: &Path) -> Result<PathBuf> {
    if dest.exists() {
        tracing::debug!(path = %dest.display(), "shard cached");
        return Ok(dest.to_path_buf());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(%url, "downloading shard");
    let response = ureq::get(url).call().with_context(|| format!("fetching {url}"))?;
    let tmp = dest.with_extension("part");
    let mut file = std::fs::File::create(&tmp)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    std::fs::rename(&tmp, dest)?;
    Ok(dest.to_path_buf())
}

/// Local paths for every shard `pattern` names, downloading remote ones.
pub fn resolve_shards(config: &RunConfig, pattern: &str) -> Result<Vec<PathBuf>> {
    let names = expand_braces(pattern)?;
    if !config.remote_data {
        return Ok(names.into_iter().map(PathBuf::from).collect());
    }
    let cache = Path::new(&config.cache_dir).join(&config.data_commit);
    names
        .iter()
        .map(|name| {
            let url = remote_url(&config.remote_base_url, &config.data_commit, name);
            fetch_shard(&url, &cache.join(name.trim_start_matches('/')))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Shard loader
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RecordKeys {
    pub voxels: String,
    pub images: String,
}

impl RecordKeys {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            voxels: config.voxel_layout().record_key().to_string(),
            images: config.modality().record_key().to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShardLoader {
    shards: Vec<PathBuf>,
    keys: RecordKeys,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    /// When set, every pass yields exactly this many batches, cycling
    /// through the shards as needed.
    batches_per_epoch: Option<usize>,
}

impl ShardLoader {
    pub fn new(shards: Vec<PathBuf>, keys: RecordKeys, batch_size: usize, seed: u64) -> Self {
        Self {
            shards,
            keys,
            batch_size: batch_size.max(1),
            shuffle: false,
            drop_last: false,
            seed,
            batches_per_epoch: None,
        }
    }

    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    pub fn drop_last(mut self) -> Self {
        self.drop_last = true;
        self
    }

    pub fn with_batches_per_epoch(mut self, n: usize) -> Self {
        self.batches_per_epoch = Some(n.max(1));
        self
    }

    /// Keep the shards replica `rank` of `world_size` reads. With fewer
    /// shards than replicas every replica reads them all.
    pub fn for_rank(mut self, rank: usize, world_size: usize) -> Self {
        if world_size > 1 && self.shards.len() >= world_size {
            self.shards = self
                .shards
                .into_iter()
                .enumerate()
                .filter(|(i, _)| i % world_size == rank)
                .map(|(_, p)| p)
                .collect();
        }
        self.seed = self.seed.wrapping_add(rank as u64);
        self
    }

    pub fn shards(&self) -> &[PathBuf] {
        &self.shards
    }

    fn load_shard(&self, path: &Path) -> Result<(Tensor, Tensor)> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("loading shard {}", path.display()))?;
        let mut take = |key: &str| {
            tensors.remove(key).ok_or_else(|| TrainError::MissingRecordKey {
                shard: path.display().to_string(),
                key: key.to_string(),
            })
        };
        let voxels = take(&self.keys.voxels)?.to_dtype(DType::F32)?;
        let images = take(&self.keys.images)?;
        let images = match images.dtype() {
            DType::U8 => (images.to_dtype(DType::F32)? / 255.0)?,
            _ => images.to_dtype(DType::F32)?,
        };
        let (nv, ni) = (voxels.dim(0)?, images.dim(0)?);
        if nv != ni {
            return Err(TrainError::ShapeMismatch(format!(
                "{}: {nv} voxel records but {ni} stimulus records",
                path.display()
            ))
            .into());
        }
        Ok((voxels, images))
    }
}

impl BatchSource for ShardLoader {
    fn batches(&self, epoch: usize) -> BatchIter<'_> {
        let seed = self.seed.wrapping_add((epoch as u64).wrapping_mul(1_000_003));
        Box::new(ShardBatches {
            loader: self,
            rng: StdRng::seed_from_u64(seed),
            order: Vec::new(),
            next_shard: 0,
            current: None,
            pending: Vec::new(),
            pending_len: 0,
            emitted: 0,
            rows_this_cycle: 0,
            done: false,
        })
    }
}

struct OpenShard {
    voxels: Tensor,
    images: Tensor,
    perm: Vec<u32>,
    cursor: usize,
}

struct ShardBatches<'a> {
    loader: &'a ShardLoader,
    rng: StdRng,
    order: Vec<usize>,
    next_shard: usize,
    current: Option<OpenShard>,
    pending: Vec<Batch>,
    pending_len: usize,
    emitted: usize,
    rows_this_cycle: usize,
    done: bool,
}

impl ShardBatches<'_> {
    fn start_cycle(&mut self) {
        self.order = (0..self.loader.shards.len()).collect();
        if self.loader.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.next_shard = 0;
        self.rows_this_cycle = 0;
    }

    /// Open the next shard. `Ok(false)` when the pass has no more data.
    fn open_next(&mut self) -> Result<bool> {
        if self.next_shard >= self.order.len() {
            let first_cycle = self.order.is_empty();
            let may_cycle = self.loader.batches_per_epoch.is_some() && self.rows_this_cycle > 0;
            if !(first_cycle || may_cycle) || self.loader.shards.is_empty() {
                return Ok(false);
            }
            self.start_cycle();
        }
        let path = &self.loader.shards[self.order[self.next_shard]];
        self.next_shard += 1;
        let (voxels, images) = self.loader.load_shard(path)?;
        let n = voxels.dim(0)?;
        let mut perm: Vec<u32> = (0..n as u32).collect();
        if self.loader.shuffle {
            perm.shuffle(&mut self.rng);
        }
        self.rows_this_cycle += n;
        self.current = Some(OpenShard { voxels, images, perm, cursor: 0 });
        Ok(true)
    }

    fn flush(&mut self) -> Result<Batch> {
        let voxels: Vec<&Tensor> = self.pending.iter().map(|b| &b.voxels).collect();
        let images: Vec<&Tensor> = self.pending.iter().map(|b| &b.images).collect();
        let batch = Batch { voxels: Tensor::cat(&voxels, 0)?, images: Tensor::cat(&images, 0)? };
        self.pending.clear();
        self.pending_len = 0;
        self.emitted += 1;
        Ok(batch)
    }

    fn advance(&mut self) -> Result<Option<Batch>> {
        let batch_size = self.loader.batch_size;
        loop {
            if self.pending_len == batch_size {
                return self.flush().map(Some);
            }
            let exhausted = self.current.as_ref().map_or(true, |s| s.cursor >= s.perm.len());
            if exhausted {
                if !self.open_next()? {
                    if self.pending_len > 0 && !self.loader.drop_last {
                        return self.flush().map(Some);
                    }
                    return Ok(None);
                }
                continue;
            }
            let Some(shard) = self.current.as_mut() else { continue };
            let n = (batch_size - self.pending_len).min(shard.perm.len() - shard.cursor);
            let idx = Tensor::from_slice(&shard.perm[shard.cursor..shard.cursor + n], n, &Device::Cpu)?;
            shard.cursor += n;
            let part = Batch {
                voxels: shard.voxels.index_select(&idx, 0)?,
                images: shard.images.index_select(&idx, 0)?,
            };
            self.pending.push(part);
            self.pending_len += n;
        }
    }
}

impl Iterator for ShardBatches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.loader.batches_per_epoch.is_some_and(|max| self.emitted >= max) {
            return None;
        }
        match self.advance() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
