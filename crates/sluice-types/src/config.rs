// Engine configuration. Every numeric threshold lives here rather than in the
// components that consume it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ── Codec selection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodecKind {
    None      = 0,
    OneBit    = 1,
    RandomK   = 2,
    TopK      = 3,
    Dithering = 4,
}

impl CodecKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None      => "none",
            Self::OneBit    => "onebit",
            Self::RandomK   => "randomk",
            Self::TopK      => "topk",
            Self::Dithering => "dithering",
        }
    }

    /// Whether the codec loses information (and therefore gets error feedback).
    pub fn is_lossy(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl FromStr for CodecKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "identity" => Ok(Self::None),
            "onebit" | "one-bit" | "one_bit" => Ok(Self::OneBit),
            "randomk" | "random-k" | "random_k" => Ok(Self::RandomK),
            "topk" | "top-k" | "top_k" => Ok(Self::TopK),
            "dithering" => Ok(Self::Dithering),
            other => Err(ConfigError::UnknownCodec(other.to_string())),
        }
    }
}

/// How dithering spaces its quantization levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DitherPartition {
    /// Levels `0, 1/s, 2/s, …, 1`.
    Linear,
    /// Levels `0, 2^-(s-1), …, 1/2, 1`.
    Natural,
}

/// Norm dithering divides by before quantizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DitherNorm {
    Max,
    L2,
}

/// Declarative codec configuration, resolved into a compressor stack once per
/// tensor at registration.
///
/// String form: `name[:key=value,...]`, e.g.
/// `topk:k=0.01,ef=vanilla,momentum=nesterov,mu=0.9`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    pub kind: CodecKind,
    /// random-k / top-k: fraction of elements when `< 1.0`, count otherwise.
    pub k: f32,
    /// one-bit: scale by the mean absolute value instead of 1.0.
    pub scaling: bool,
    /// dithering: number of quantization levels (1..=127).
    pub levels: u8,
    pub partition: DitherPartition,
    pub normalize: DitherNorm,
    /// Wrap lossy codecs in error feedback.
    pub error_feedback: bool,
    /// Nesterov momentum coefficient, if momentum correction is enabled.
    pub momentum: Option<f32>,
    /// Base seed for the stochastic codecs.
    pub seed: u64,
}

impl CodecConfig {
    pub fn new(kind: CodecKind) -> Self {
        Self {
            kind,
            k: 0.01,
            scaling: false,
            levels: 16,
            partition: DitherPartition::Linear,
            normalize: DitherNorm::Max,
            error_feedback: kind.is_lossy(),
            momentum: None,
            seed: 0,
        }
    }

    pub fn none() -> Self {
        Self::new(CodecKind::None)
    }

    pub fn with_k(mut self, k: f32) -> Self {
        self.k = k;
        self
    }

    pub fn with_error_feedback(mut self, enabled: bool) -> Self {
        self.error_feedback = enabled;
        self
    }

    pub fn with_momentum(mut self, mu: f32) -> Self {
        self.momentum = Some(mu);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of elements random-k / top-k keep out of `n`.
    pub fn k_for(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let k = if self.k < 1.0 {
            // `k` is stored as f32; shave its representation error so 0.1 of
            // 100 keeps 10, not 11.
            let exact = self.k as f64 * n as f64;
            (exact - exact * f32::EPSILON as f64).ceil() as usize
        } else {
            self.k as usize
        };
        k.clamp(1, n)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.k.is_finite() || self.k <= 0.0 {
            return Err(ConfigError::invalid("k", self.k, "must be a positive number"));
        }
        if self.levels == 0 || self.levels > 127 {
            return Err(ConfigError::invalid("s", self.levels, "must be within 1..=127"));
        }
        if let Some(mu) = self.momentum {
            if !(0.0..1.0).contains(&mu) {
                return Err(ConfigError::invalid("mu", mu, "must be within [0, 1)"));
            }
        }
        Ok(())
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl FromStr for CodecConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, opts) = match s.split_once(':') {
            Some((name, opts)) => (name, opts),
            None => (s, ""),
        };
        let mut cfg = CodecConfig::new(name.parse()?);

        for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = opt
                .split_once('=')
                .ok_or_else(|| ConfigError::invalid("codec option", opt, "expected key=value"))?;
            let value = value.trim();
            match key.trim() {
                "k" => cfg.k = parse_value("k", value)?,
                "scaling" => cfg.scaling = parse_value("scaling", value)?,
                "s" | "levels" => cfg.levels = parse_value("s", value)?,
                "seed" => cfg.seed = parse_value("seed", value)?,
                "mu" => cfg.momentum = Some(parse_value("mu", value)?),
                "partition" => {
                    cfg.partition = match value {
                        "linear" => DitherPartition::Linear,
                        "natural" => DitherPartition::Natural,
                        _ => return Err(ConfigError::invalid("partition", value, "expected linear|natural")),
                    }
                }
                "normalize" => {
                    cfg.normalize = match value {
                        "max" => DitherNorm::Max,
                        "l2" => DitherNorm::L2,
                        _ => return Err(ConfigError::invalid("normalize", value, "expected max|l2")),
                    }
                }
                "ef" => {
                    cfg.error_feedback = match value {
                        "vanilla" | "true" => true,
                        "none" | "false" => false,
                        _ => return Err(ConfigError::invalid("ef", value, "expected vanilla|none")),
                    }
                }
                "momentum" => match value {
                    "nesterov" => {
                        cfg.momentum.get_or_insert(0.9);
                    }
                    "none" => cfg.momentum = None,
                    _ => return Err(ConfigError::invalid("momentum", value, "expected nesterov|none")),
                },
                other => return Err(ConfigError::invalid("codec option", other, "unknown option")),
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

impl fmt::Display for CodecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.name())?;
        match self.kind {
            CodecKind::None => return Ok(()),
            CodecKind::OneBit => write!(f, ":scaling={}", self.scaling)?,
            CodecKind::RandomK | CodecKind::TopK => write!(f, ":k={}", self.k)?,
            CodecKind::Dithering => write!(f, ":s={}", self.levels)?,
        }
        write!(f, ",ef={}", if self.error_feedback { "vanilla" } else { "none" })?;
        if let Some(mu) = self.momentum {
            write!(f, ",momentum=nesterov,mu={mu}")?;
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::invalid(key, value, "could not parse"))
}

// ── Engine configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum bytes per partition. Default: 4 000 000.
    pub partition_bytes: usize,

    /// A trailing remainder smaller than this is folded into the previous
    /// partition instead of travelling as its own tiny message.
    pub min_merge_bytes: usize,

    /// Size of the worker-thread pool. Fixed for the engine's lifetime.
    pub worker_threads: usize,

    /// Codec applied to tensors without an override.
    pub default_codec: CodecConfig,

    /// Per-tensor codec overrides, keyed by tensor key.
    pub codec_overrides: HashMap<String, CodecConfig>,

    /// Producer-side queue bound. `None` = unbounded (Ready Table gating
    /// throttles producers instead).
    pub queue_bound: Option<usize>,

    /// Number of local devices contributing to each intra-node reduction.
    pub local_size: usize,

    /// Number of aggregation servers partitions are spread across.
    pub num_servers: usize,

    /// Partitions smaller than this bypass lossy compression. 0 = compress all.
    pub min_compress_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partition_bytes: 4_000_000,
            min_merge_bytes: 1024,
            worker_threads: 4,
            default_codec: CodecConfig::none(),
            codec_overrides: HashMap::new(),
            queue_bound: None,
            local_size: 1,
            num_servers: 1,
            min_compress_bytes: 0,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `SLUICE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `SLUICE_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("SLUICE_PARTITION_BYTES") {
            cfg.partition_bytes = parse_value("SLUICE_PARTITION_BYTES", &v)?;
        }
        if let Some(v) = lookup("SLUICE_MIN_MERGE_BYTES") {
            cfg.min_merge_bytes = parse_value("SLUICE_MIN_MERGE_BYTES", &v)?;
        }
        if let Some(v) = lookup("SLUICE_WORKER_THREADS") {
            cfg.worker_threads = parse_value("SLUICE_WORKER_THREADS", &v)?;
        }
        if let Some(v) = lookup("SLUICE_CODEC") {
            cfg.default_codec = v.parse()?;
        }
        if let Some(v) = lookup("SLUICE_CODEC_OVERRIDES") {
            for entry in v.split(';').map(str::trim).filter(|e| !e.is_empty()) {
                let (key, spec) = entry.split_once('=').ok_or_else(|| {
                    ConfigError::invalid("SLUICE_CODEC_OVERRIDES", entry, "expected key=codec")
                })?;
                cfg.codec_overrides
                    .insert(key.trim().to_string(), spec.trim().parse()?);
            }
        }
        if let Some(v) = lookup("SLUICE_QUEUE_BOUND") {
            cfg.queue_bound = Some(parse_value("SLUICE_QUEUE_BOUND", &v)?);
        }
        if let Some(v) = lookup("SLUICE_LOCAL_SIZE") {
            cfg.local_size = parse_value("SLUICE_LOCAL_SIZE", &v)?;
        }
        if let Some(v) = lookup("SLUICE_NUM_SERVERS") {
            cfg.num_servers = parse_value("SLUICE_NUM_SERVERS", &v)?;
        }
        if let Some(v) = lookup("SLUICE_MIN_COMPRESS_BYTES") {
            cfg.min_compress_bytes = parse_value("SLUICE_MIN_COMPRESS_BYTES", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_bytes == 0 {
            return Err(ConfigError::invalid("partition_bytes", 0, "must be > 0"));
        }
        if self.min_merge_bytes >= self.partition_bytes {
            return Err(ConfigError::invalid(
                "min_merge_bytes",
                self.min_merge_bytes,
                "must be smaller than partition_bytes",
            ));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::invalid("worker_threads", 0, "must be > 0"));
        }
        if self.local_size == 0 {
            return Err(ConfigError::invalid("local_size", 0, "must be > 0"));
        }
        if self.num_servers == 0 {
            return Err(ConfigError::invalid("num_servers", 0, "must be > 0"));
        }
        if self.queue_bound == Some(0) {
            return Err(ConfigError::invalid("queue_bound", 0, "must be > 0 when set"));
        }
        self.default_codec.validate()?;
        for codec in self.codec_overrides.values() {
            codec.validate()?;
        }
        Ok(())
    }

    /// Codec for a tensor key, before any per-spec override.
    pub fn codec_for(&self, key: &str) -> &CodecConfig {
        self.codec_overrides.get(key).unwrap_or(&self.default_codec)
    }
}
