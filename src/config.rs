use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::distribute::DEFAULT_BUFFER_FRAMES;
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::history::{DEFAULT_HISTORY_CAPACITY, DEFAULT_SAMPLE_EVERY_N_FRAMES};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_MAX_VIEWERS: usize = 16;
const DEFAULT_STREAM_WAIT_MS: u64 = 500;
const DEFAULT_IDLE_SLEEP_MS: u64 = 5;
const DEFAULT_SOURCES: &[(&str, &str, &str)] = &[
    ("lot1", "assets/video-1.mp4", "assets/coordinate-video-1.json"),
    ("lot2", "assets/video-3.mp4", "assets/coordinate-video-3.json"),
];

#[derive(Debug, Deserialize, Default)]
struct ParkwatchConfigFile {
    api: Option<ApiConfigFile>,
    sources: Option<Vec<SourceConfigFile>>,
    classifier: Option<ClassifierConfigFile>,
    history: Option<HistoryConfigFile>,
    stream: Option<StreamConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_viewers: Option<usize>,
    stream_wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SourceConfigFile {
    id: String,
    path: String,
    spots: Option<PathBuf>,
    fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassifierConfigFile {
    occupancy_threshold: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryConfigFile {
    capacity: Option<usize>,
    every_n_frames: Option<u64>,
    min_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    buffer_frames: Option<usize>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    idle_sleep_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ParkwatchConfig {
    pub api: ApiSettings,
    pub sources: Vec<SourceSettings>,
    pub occupancy_threshold: f64,
    pub history: HistorySettings,
    pub stream: StreamSettings,
    pub idle_sleep: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub max_viewers: usize,
    pub stream_wait: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub id: String,
    pub path: String,
    pub spots: PathBuf,
    pub fps: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HistorySettings {
    pub capacity: usize,
    pub every_n_frames: u64,
    pub min_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub buffer_frames: usize,
    pub jpeg_quality: u8,
}

impl ParkwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PARKWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ParkwatchConfigFile) -> Self {
        let api_file = file.api.unwrap_or_default();
        let api = ApiSettings {
            addr: api_file
                .addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_viewers: api_file.max_viewers.unwrap_or(DEFAULT_MAX_VIEWERS),
            stream_wait: Duration::from_millis(
                api_file.stream_wait_ms.unwrap_or(DEFAULT_STREAM_WAIT_MS),
            ),
        };
        let sources = match file.sources {
            Some(sources) => sources
                .into_iter()
                .map(|source| {
                    let spots = source
                        .spots
                        .unwrap_or_else(|| default_spot_path(&source.id));
                    SourceSettings {
                        id: source.id,
                        path: source.path,
                        spots,
                        fps: source.fps,
                    }
                })
                .collect(),
            None => default_sources(),
        };
        let occupancy_threshold = file
            .classifier
            .and_then(|classifier| classifier.occupancy_threshold)
            .unwrap_or(crate::OCCUPANCY_THRESHOLD);
        let history_file = file.history.unwrap_or_default();
        let history = HistorySettings {
            capacity: history_file.capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY),
            every_n_frames: history_file
                .every_n_frames
                .unwrap_or(DEFAULT_SAMPLE_EVERY_N_FRAMES),
            min_interval: history_file.min_interval_ms.map(Duration::from_millis),
        };
        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            buffer_frames: stream_file.buffer_frames.unwrap_or(DEFAULT_BUFFER_FRAMES),
            jpeg_quality: stream_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };
        let idle_sleep = Duration::from_millis(
            file.pipeline
                .and_then(|pipeline| pipeline.idle_sleep_ms)
                .unwrap_or(DEFAULT_IDLE_SLEEP_MS),
        );
        Self {
            api,
            sources,
            occupancy_threshold,
            history,
            stream,
            idle_sleep,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("PARKWATCH_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(viewers) = std::env::var("PARKWATCH_MAX_VIEWERS") {
            self.api.max_viewers = viewers
                .trim()
                .parse()
                .map_err(|_| anyhow!("PARKWATCH_MAX_VIEWERS must be a positive integer"))?;
        }
        if let Ok(sources) = std::env::var("PARKWATCH_SOURCES") {
            let parsed = parse_sources(&sources)?;
            if !parsed.is_empty() {
                self.sources = parsed;
            }
        }
        if let Ok(sleep) = std::env::var("PARKWATCH_IDLE_SLEEP_MS") {
            let millis: u64 = sleep.trim().parse().map_err(|_| {
                anyhow!("PARKWATCH_IDLE_SLEEP_MS must be an integer number of milliseconds")
            })?;
            self.idle_sleep = Duration::from_millis(millis);
        }
        if let Ok(quality) = std::env::var("PARKWATCH_JPEG_QUALITY") {
            self.stream.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("PARKWATCH_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("at least one source must be configured"));
        }
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            crate::validate_source_id(&source.id)?;
            if !seen.insert(source.id.as_str()) {
                return Err(anyhow!("duplicate source id '{}'", source.id));
            }
            if source.path.trim().is_empty() {
                return Err(anyhow!("source '{}' has an empty path", source.id));
            }
            if let Some(fps) = source.fps {
                if !(fps.is_finite() && fps > 0.0) {
                    return Err(anyhow!("source '{}' fps must be positive", source.id));
                }
            }
        }
        if !(self.occupancy_threshold > 0.0 && self.occupancy_threshold <= 1.0) {
            return Err(anyhow!(
                "classifier.occupancy_threshold must be in (0, 1], got {}",
                self.occupancy_threshold
            ));
        }
        if self.api.max_viewers == 0 {
            return Err(anyhow!("api.max_viewers must be greater than zero"));
        }
        if self.api.stream_wait.is_zero() {
            return Err(anyhow!("api.stream_wait_ms must be greater than zero"));
        }
        if self.history.capacity == 0 || self.history.every_n_frames == 0 {
            return Err(anyhow!(
                "history.capacity and history.every_n_frames must be greater than zero"
            ));
        }
        if self.stream.buffer_frames == 0 {
            return Err(anyhow!("stream.buffer_frames must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!(
                "stream.jpeg_quality must be in 1..=100, got {}",
                self.stream.jpeg_quality
            ));
        }
        Ok(())
    }
}

/// Built-in defaults, without reading the environment.
impl Default for ParkwatchConfig {
    fn default() -> Self {
        Self::from_file(ParkwatchConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<ParkwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn default_sources() -> Vec<SourceSettings> {
    DEFAULT_SOURCES
        .iter()
        .map(|(id, path, spots)| SourceSettings {
            id: id.to_string(),
            path: path.to_string(),
            spots: PathBuf::from(spots),
            fps: None,
        })
        .collect()
}

fn default_spot_path(source_id: &str) -> PathBuf {
    PathBuf::from("assets").join(format!("spots-{}.json", source_id))
}

/// Parse `id=path[@spots],...`.
fn parse_sources(value: &str) -> Result<Vec<SourceSettings>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, rest) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("PARKWATCH_SOURCES entry '{}' must be id=path", entry))?;
            let id = id.trim().to_string();
            let (path, spots) = match rest.split_once('@') {
                Some((path, spots)) => (path.trim(), PathBuf::from(spots.trim())),
                None => (rest.trim(), default_spot_path(&id)),
            };
            Ok(SourceSettings {
                path: path.to_string(),
                spots,
                fps: None,
                id,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_two_lot_deployment() -> Result<()> {
        let cfg = ParkwatchConfig::from_file(ParkwatchConfigFile::default());
        cfg.validate()?;
        assert_eq!(cfg.api.addr, "127.0.0.1:5000");
        let ids: Vec<&str> = cfg.sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["lot1", "lot2"]);
        assert_eq!(cfg.sources[1].spots, PathBuf::from("assets/coordinate-video-3.json"));
        assert_eq!(cfg.history.capacity, 50);
        assert_eq!(cfg.history.every_n_frames, 10);
        assert_eq!(cfg.stream.buffer_frames, 5);
        assert_eq!(cfg.occupancy_threshold, 0.2);
        Ok(())
    }

    #[test]
    fn parses_source_list() -> Result<()> {
        let sources = parse_sources("a=stub://a, b=/videos/b.mp4@/spots/b.json,")?;
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].path, "stub://a");
        assert_eq!(sources[0].spots, PathBuf::from("assets/spots-a.json"));
        assert_eq!(sources[1].path, "/videos/b.mp4");
        assert_eq!(sources[1].spots, PathBuf::from("/spots/b.json"));
        assert!(parse_sources("missing-equals").is_err());
        Ok(())
    }

    #[test]
    fn rejects_duplicate_and_invalid_ids() {
        let mut cfg = ParkwatchConfig::from_file(ParkwatchConfigFile::default());
        cfg.sources[1].id = "lot1".to_string();
        assert!(cfg.validate().is_err());
        cfg.sources[1].id = "lot 2".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let base = ParkwatchConfig::from_file(ParkwatchConfigFile::default());

        let mut cfg = base.clone();
        cfg.occupancy_threshold = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.stream.jpeg_quality = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.sources[0].fps = Some(-1.0);
        assert!(cfg.validate().is_err());

        let mut cfg = base;
        cfg.history.capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
