//! One pipeline instance per loaded source: owns the quantized store and the
//! background sort task, and enforces the request/response protocol between
//! the render schedule and the sorter.

use std::path::Path;
use std::time::Duration;

use foldhash::{HashMap, HashMapExt, HashSet, HashSetExt};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::error::SplatError;
use crate::ingest::{ChunkAssembler, IngestEvent, ProgressThrottle};
use crate::pack::QuantizedStore;
use crate::sort::Sorter;
use crate::structures::{SortKey, SplatRow, UploadRect, ROW_LENGTH};

/// Transport read size; transport chunks may be any size, this is just the
/// buffer handed to the reader.
const READ_BUFFER_LEN: usize = 64 * 1024;

/// Interval of the texture-readiness poll.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows buffered before a packer flush.
    pub chunk_size: usize,
    /// Device-reported maximum 2D texture dimension.
    pub max_texture_size: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 25000,
            max_texture_size: 4096,
        }
    }
}

/// Renderer-side introspection of the two data textures backing a source.
/// Implementations report whether both initial uploads have completed.
pub trait TextureProbe {
    fn textures_ready(&self) -> bool;
}

/// Polls `probe` every 10 ms until the textures report ready.
pub async fn wait_for_textures(
    probe: &dyn TextureProbe,
    timeout: Option<Duration>,
) -> Result<(), SplatError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    while !probe.textures_ready() {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(SplatError::ReadyTimeout);
            }
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
    Ok(())
}

/// One rendered object consuming sort results from a pipeline.
///
/// `ready` is the request gate: cleared when a sort is issued, set again when
/// the matching result is claimed, so at most one request per target is ever
/// in flight.
#[derive(Debug)]
pub struct SplatTarget {
    key: SortKey,
    ready: bool,
    settled: bool,
}

impl SplatTarget {
    pub fn key(&self) -> SortKey {
        self.key
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Arms the target for its first sort request. Called after the texture
    /// handshake; headless callers may call it directly.
    pub fn arm(&mut self) {
        self.ready = true;
    }
}

/// The splat data pipeline for one loaded source.
pub struct SplatPipeline {
    config: PipelineConfig,
    store: QuantizedStore,
    sorter: Sorter,
    pending: HashMap<SortKey, Vec<u32>>,
    live: HashSet<SortKey>,
    total_bytes: u64,
    loaded: bool,
}

impl SplatPipeline {
    /// Creates a pipeline for a source of `total_bytes` canonical bytes.
    ///
    /// The store is allocated immediately from `total_bytes / 32`, so the
    /// transport must report its length up front; `None` is a hard failure.
    pub fn new(total_bytes: Option<u64>, config: PipelineConfig) -> Result<Self, SplatError> {
        let total_bytes = total_bytes.ok_or(SplatError::UnknownContentLength)?;
        let estimated = (total_bytes / ROW_LENGTH as u64) as usize;
        let store = QuantizedStore::new(estimated, config.max_texture_size);

        Ok(Self {
            config,
            store,
            sorter: Sorter::spawn(),
            pending: HashMap::new(),
            live: HashSet::new(),
            total_bytes,
            loaded: false,
        })
    }

    /// Streams a native-format file through the pipeline, using its metadata
    /// length as the content length.
    pub async fn load_file(
        path: impl AsRef<Path>,
        config: PipelineConfig,
        on_event: impl FnMut(IngestEvent<'_>),
    ) -> Result<Self, SplatError> {
        let file = tokio::fs::File::open(path).await.map_err(SplatError::IoError)?;
        let len = file.metadata().await.map_err(SplatError::IoError)?.len();
        let mut pipeline = Self::new(Some(len), config)?;
        pipeline.ingest(BufReader::new(file), on_event).await?;
        Ok(pipeline)
    }

    pub fn store(&self) -> &QuantizedStore {
        &self.store
    }

    /// True once the terminal flush has run.
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    /// Packs decoded rows directly (the PLY path, which converts the whole
    /// buffer before packing) and forwards the transforms to the sorter.
    pub fn push_rows(&mut self, rows: &[SplatRow]) -> Result<Vec<UploadRect>, SplatError> {
        let (batch, rects) = self.store.push_rows(rows);
        if !batch.is_empty() {
            self.sorter.push(batch)?;
        }
        Ok(rects)
    }

    /// Reads the canonical binary stream to completion, packing whole-row
    /// chunks as they accumulate and reporting progress through `on_event`.
    ///
    /// Trailing bytes that never form a complete row are dropped with a
    /// warning; they do not fail the load.
    pub async fn ingest<R: AsyncRead + Unpin>(
        &mut self,
        mut reader: R,
        mut on_event: impl FnMut(IngestEvent<'_>),
    ) -> Result<(), SplatError> {
        let total_bytes = self.total_bytes;
        let mut assembler = ChunkAssembler::new(self.config.chunk_size);
        let mut throttle = ProgressThrottle::new(total_bytes);
        let mut bytes_downloaded = 0u64;
        let mut buffer = vec![0u8; READ_BUFFER_LEN];

        loop {
            let n = reader.read(&mut buffer).await.map_err(SplatError::IoError)?;
            if n == 0 {
                break;
            }
            bytes_downloaded += n as u64;
            if throttle.should_report(bytes_downloaded) {
                on_event(IngestEvent::Progress {
                    bytes_downloaded,
                    total_bytes,
                });
            }

            assembler.extend(&buffer[..n]);
            let rows = assembler.take_rows(false);
            if !rows.is_empty() {
                let rects = self.push_rows(&rows)?;
                on_event(IngestEvent::Packed {
                    store: &self.store,
                    rects,
                });
            }
        }

        // Terminal progress report, unthrottled.
        on_event(IngestEvent::Progress {
            bytes_downloaded,
            total_bytes,
        });
        let rows = assembler.take_rows(true);
        if !rows.is_empty() {
            let rects = self.push_rows(&rows)?;
            on_event(IngestEvent::Packed {
                store: &self.store,
                rects,
            });
        }
        if assembler.leftover_bytes() > 0 {
            log::warn!(
                "{} trailing bytes did not form a complete row and were dropped",
                assembler.leftover_bytes()
            );
        }

        self.loaded = true;
        on_event(IngestEvent::Loaded);
        Ok(())
    }

    /// Connects a new rendered target. The target is not ready until the
    /// texture handshake completes (or [`SplatTarget::arm`] is called).
    ///
    /// Every connected target must eventually be passed to
    /// [`Self::disconnect`]; until then the pipeline may hold one pending
    /// result for its key.
    pub fn connect(&mut self) -> SplatTarget {
        let key = SortKey::next();
        self.live.insert(key);
        SplatTarget {
            key,
            ready: false,
            settled: false,
        }
    }

    /// Connects a target and runs the texture-readiness handshake before
    /// arming it.
    pub async fn connect_when_ready(
        &mut self,
        probe: &dyn TextureProbe,
        timeout: Option<Duration>,
    ) -> Result<SplatTarget, SplatError> {
        wait_for_textures(probe, timeout).await?;
        let mut target = self.connect();
        target.arm();
        Ok(target)
    }

    /// Issues a sort request for `target` if its gate allows one.
    ///
    /// Returns false without requesting while a previous request is
    /// outstanding, and once a hashed target has settled. With `hashed` the
    /// sorter keeps every splat (stable index set for order-independent
    /// blending); after the store has fully loaded such a target settles and
    /// skips further resorts.
    pub fn update(
        &mut self,
        target: &mut SplatTarget,
        view: [f32; 4],
        hashed: bool,
    ) -> Result<bool, SplatError> {
        if !target.ready {
            return Ok(false);
        }
        if hashed && target.settled {
            return Ok(false);
        }
        target.ready = false;
        self.sorter.request_sort(target.key, view, hashed)?;
        if hashed && self.loaded {
            target.settled = true;
        }
        Ok(true)
    }

    /// Claims the sort result for `target`, if one has arrived, and re-arms
    /// its gate. Results for other live keys stay routed to their own
    /// targets; results for disconnected keys are discarded at the drain.
    pub fn poll(&mut self, target: &mut SplatTarget) -> Option<Vec<u32>> {
        for result in self.sorter.poll_results() {
            if self.live.contains(&result.key) {
                self.pending.insert(result.key, result.indices);
            }
        }
        let indices = self.pending.remove(&target.key)?;
        target.ready = true;
        Some(indices)
    }

    /// Drops a target. Any result for it, whether already parked or still in
    /// flight in the sorter, is discarded.
    pub fn disconnect(&mut self, target: SplatTarget) {
        self.live.remove(&target.key);
        self.pending.remove(&target.key);
    }
}
