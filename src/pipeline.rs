//! Pipeline supervisor.
//!
//! One `SourcePipeline` per configured source runs
//! `pace -> classify -> record history -> publish state -> encode -> distribute`.
//! The `Supervisor` steps every pipeline in turn from a single thread. A source that
//! failed to open, errors on a frame, or has nothing due never holds up the others,
//! and a tick on which no source produced a frame ends with a short sleep.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::classify::{classify, ClassifierParams};
use crate::config::{ParkwatchConfig, SourceSettings};
use crate::distribute::FrameDistributor;
use crate::frame::encode_jpeg;
use crate::history::{HistoryLog, HistorySampler};
use crate::ingest::{FileConfig, FileSource, FrameSource, Pace, SourcePacer};
use crate::spots::SpotStore;
use crate::state::{LotRegistry, LotState};
use crate::Region;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Per-source tuning shared by every pipeline.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub classifier: ClassifierParams,
    pub history_capacity: usize,
    pub history_every_n_frames: u64,
    pub history_min_interval: Option<Duration>,
    pub jpeg_quality: u8,
}

impl From<&ParkwatchConfig> for PipelineSettings {
    fn from(cfg: &ParkwatchConfig) -> Self {
        Self {
            classifier: ClassifierParams {
                occupancy_threshold: cfg.occupancy_threshold,
            },
            history_capacity: cfg.history.capacity,
            history_every_n_frames: cfg.history.every_n_frames,
            history_min_interval: cfg.history.min_interval,
            jpeg_quality: cfg.stream.jpeg_quality,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&ParkwatchConfig::default())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub processed: u64,
    pub errors: u64,
}

pub struct SourcePipeline {
    source_id: String,
    pacer: SourcePacer,
    regions: Vec<Region>,
    params: ClassifierParams,
    history: HistoryLog,
    sampler: HistorySampler,
    distributor: Arc<FrameDistributor>,
    jpeg_quality: u8,
    skipped: Vec<usize>,
    last_captured: Option<SystemTime>,
    failing: bool,
    stats: PipelineStats,
}

impl SourcePipeline {
    pub fn new(
        pacer: SourcePacer,
        regions: Vec<Region>,
        settings: &PipelineSettings,
        distributor: Arc<FrameDistributor>,
    ) -> Self {
        Self {
            source_id: pacer.source_id().to_string(),
            pacer,
            regions,
            params: settings.classifier,
            history: HistoryLog::new(settings.history_capacity),
            sampler: HistorySampler::new(
                settings.history_every_n_frames,
                settings.history_min_interval,
            ),
            distributor,
            jpeg_quality: settings.jpeg_quality,
            skipped: Vec::new(),
            last_captured: None,
            failing: false,
            stats: PipelineStats::default(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn pacer(&self) -> &SourcePacer {
        &self.pacer
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn distributor(&self) -> &Arc<FrameDistributor> {
        &self.distributor
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// The state readers should see before the first frame is classified.
    pub fn initial_state(&self) -> LotState {
        if self.pacer.is_available() {
            LotState::pending(self.regions.len())
        } else {
            LotState::unavailable()
        }
    }

    /// Run one pipeline step. Returns `true` when a frame was processed.
    pub fn step(&mut self, now: Instant, registry: &LotRegistry) -> Result<bool> {
        let frame = match self.pacer.advance(now)? {
            Pace::Frame(frame) => frame,
            Pace::Skip => return Ok(false),
        };

        let classification = classify(&frame.image, &self.regions, &self.params);
        if classification.skipped != self.skipped {
            if classification.skipped.is_empty() {
                log::info!("source {}: all spots within frame bounds", self.source_id);
            } else {
                log::warn!(
                    "source {}: spots {:?} lie outside the {}x{} frame and are skipped",
                    self.source_id,
                    classification.skipped,
                    frame.width(),
                    frame.height()
                );
            }
            self.skipped = classification.skipped.clone();
        }

        // Wall clock may step backwards; history order must not.
        let captured_at = match self.last_captured {
            Some(last) => SystemTime::now().max(last),
            None => SystemTime::now(),
        };
        self.last_captured = Some(captured_at);
        let snapshot = classification.snapshot(captured_at);
        if self.sampler.should_record(now) {
            self.history.record(snapshot);
        }
        registry.publish(&self.source_id, LotState::active(&snapshot, &self.history));

        let encoded = encode_jpeg(&classification.annotated, self.jpeg_quality)?;
        self.distributor.publish(encoded);
        self.stats.processed += 1;
        Ok(true)
    }

    fn record_error(&mut self, err: anyhow::Error) {
        self.stats.errors += 1;
        if !self.failing {
            log::warn!("source {}: pipeline step failed: {:#}", self.source_id, err);
            self.failing = true;
        } else {
            log::debug!("source {}: pipeline step failed: {:#}", self.source_id, err);
        }
    }

    fn log_health(&self, registry: &LotRegistry) {
        let pacing = self.pacer.stats();
        let (available, total) = registry
            .get(&self.source_id)
            .map(|state| (state.available, state.total))
            .unwrap_or((0, 0));
        log::info!(
            "source {} state={:?} processed={} paced_skips={} discarded={} rewinds={} errors={} free={}/{} viewers={}",
            self.source_id,
            self.pacer.state(),
            self.stats.processed,
            pacing.skips,
            pacing.discarded,
            pacing.rewinds,
            self.stats.errors,
            available,
            total,
            self.distributor.viewer_count()
        );
    }
}

pub struct Supervisor {
    pipelines: Vec<SourcePipeline>,
    registry: Arc<LotRegistry>,
    idle_sleep: Duration,
}

impl Supervisor {
    /// Build a supervisor from prepared pipelines. The registry is seeded with each
    /// pipeline's initial state.
    pub fn new(pipelines: Vec<SourcePipeline>, idle_sleep: Duration) -> Self {
        let registry = LotRegistry::new(
            pipelines
                .iter()
                .map(|pipeline| (pipeline.source_id().to_string(), pipeline.initial_state())),
        );
        Self {
            pipelines,
            registry: Arc::new(registry),
            idle_sleep,
        }
    }

    /// Open every configured source and load its spots. Sources that fail to open
    /// or whose spot file cannot be read are kept, degraded, rather than aborting.
    pub fn from_config(cfg: &ParkwatchConfig, spots: &dyn SpotStore) -> Self {
        let settings = PipelineSettings::from(cfg);
        let now = Instant::now();
        let pipelines = cfg
            .sources
            .iter()
            .map(|source| {
                let regions = spots.load(&source.id).unwrap_or_else(|err| {
                    log::warn!(
                        "source {}: spot geometry unavailable ({:#}), no spots configured",
                        source.id,
                        err
                    );
                    Vec::new()
                });
                let pacer = SourcePacer::open(&source.id, || open_file_source(source), now);
                let distributor = Arc::new(FrameDistributor::new(cfg.stream.buffer_frames));
                SourcePipeline::new(pacer, regions, &settings, distributor)
            })
            .collect();
        Self::new(pipelines, cfg.idle_sleep)
    }

    pub fn registry(&self) -> Arc<LotRegistry> {
        self.registry.clone()
    }

    /// Distributor per source id, for the stream server.
    pub fn distributors(&self) -> BTreeMap<String, Arc<FrameDistributor>> {
        self.pipelines
            .iter()
            .map(|pipeline| {
                (
                    pipeline.source_id().to_string(),
                    pipeline.distributor().clone(),
                )
            })
            .collect()
    }

    pub fn pipelines(&self) -> &[SourcePipeline] {
        &self.pipelines
    }

    /// Step every source once. Returns how many produced a frame.
    pub fn step_all(&mut self, now: Instant) -> usize {
        let mut processed = 0;
        for pipeline in &mut self.pipelines {
            match pipeline.step(now, &self.registry) {
                Ok(true) => {
                    processed += 1;
                    pipeline.failing = false;
                }
                Ok(false) => {}
                Err(err) => pipeline.record_error(err),
            }
        }
        processed
    }

    /// Run until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        log::info!(
            "supervisor running {} source(s), idle sleep {:?}",
            self.pipelines.len(),
            self.idle_sleep
        );
        let mut last_health_log = Instant::now();
        while !shutdown.load(Ordering::SeqCst) {
            let processed = self.step_all(Instant::now());
            if processed == 0 {
                std::thread::sleep(self.idle_sleep);
            }
            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                for pipeline in &self.pipelines {
                    pipeline.log_health(&self.registry);
                }
                last_health_log = Instant::now();
            }
        }
        log::info!("supervisor stopped");
    }
}

fn open_file_source(source: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let config = FileConfig {
        path: source.path.clone(),
        fps: source.fps,
    };
    Ok(Box::new(FileSource::open(config)?))
}
