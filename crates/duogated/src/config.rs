use std::path::PathBuf;
use std::time::Duration;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture width; the driver may negotiate another size.
    pub camera_width: u32,
    /// Requested capture height.
    pub camera_height: u32,
    /// Path to the SQLite person database.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive face match.
    pub similarity_threshold: f32,
    /// How long a passed factor stays valid without re-confirmation.
    pub valid_time_secs: u64,
    /// Minimum spacing between barcode decode attempts.
    pub barcode_interval_ms: u64,
    /// Minimum spacing between face embedding dispatches.
    pub face_interval_ms: u64,
    /// Session fails if no badge is presented for this long.
    pub badge_timeout_secs: u64,
    /// Bounded wait on the task slot per worker iteration.
    pub task_wait_ms: u64,
    /// Number of concurrent face-embedding jobs.
    pub embed_workers: usize,
    /// External face-embedding helper.
    pub embed_command: PathBuf,
    /// Extra arguments passed to the embedding helper.
    pub embed_args: Vec<String>,
    /// Width frames are scaled to before embedding.
    pub embed_width: u32,
    /// How long an enrollment waits for the capture signal.
    pub enroll_timeout_secs: u64,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `DUOGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("duogate");

        let db_path = std::env::var("DUOGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("people.db"));

        let bus = match std::env::var("DUOGATE_BUS").as_deref() {
            Ok("session") => BusKind::Session,
            _ => BusKind::System,
        };

        Self {
            camera_device: std::env::var("DUOGATE_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_parse("DUOGATE_CAMERA_WIDTH", 640),
            camera_height: env_parse("DUOGATE_CAMERA_HEIGHT", 480),
            db_path,
            similarity_threshold: env_parse("DUOGATE_SIMILARITY_THRESHOLD", 0.5),
            valid_time_secs: env_parse("DUOGATE_VALID_TIME_SECS", 7),
            barcode_interval_ms: env_parse("DUOGATE_BARCODE_INTERVAL_MS", 500),
            face_interval_ms: env_parse("DUOGATE_FACE_INTERVAL_MS", 500),
            badge_timeout_secs: env_parse("DUOGATE_BADGE_TIMEOUT_SECS", 10),
            task_wait_ms: env_parse("DUOGATE_TASK_WAIT_MS", 500),
            embed_workers: env_parse::<usize>("DUOGATE_EMBED_WORKERS", 2).max(1),
            embed_command: std::env::var("DUOGATE_EMBED_COMMAND")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("duogate-embed")),
            embed_args: std::env::var("DUOGATE_EMBED_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            embed_width: env_parse("DUOGATE_EMBED_WIDTH", duogate_core::embedder::DEFAULT_EMBED_WIDTH),
            enroll_timeout_secs: env_parse("DUOGATE_ENROLL_TIMEOUT_SECS", 10),
            bus,
        }
    }

    pub fn verifier_settings(&self) -> VerifierSettings {
        VerifierSettings {
            valid_for: Duration::from_secs(self.valid_time_secs),
            barcode_interval: Duration::from_millis(self.barcode_interval_ms),
            face_interval: Duration::from_millis(self.face_interval_ms),
            similarity_threshold: self.similarity_threshold,
            task_wait: Duration::from_millis(self.task_wait_ms),
        }
    }

    pub fn badge_timeout(&self) -> Duration {
        Duration::from_secs(self.badge_timeout_secs)
    }
}

/// Timing and threshold knobs of the verification worker.
#[derive(Debug, Clone, Copy)]
pub struct VerifierSettings {
    pub valid_for: Duration,
    pub barcode_interval: Duration,
    pub face_interval: Duration,
    pub similarity_threshold: f32,
    pub task_wait: Duration,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            valid_for: Duration::from_secs(7),
            barcode_interval: Duration::from_millis(500),
            face_interval: Duration::from_millis(500),
            similarity_threshold: 0.5,
            task_wait: Duration::from_millis(500),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
