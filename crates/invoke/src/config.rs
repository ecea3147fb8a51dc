use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use comfyrun_comfyui::poll::PollConfig;
use comfyrun_core::params::ParamValues;
use comfyrun_core::workflow::TitleSource;

/// Default ComfyUI base URL.
pub const DEFAULT_SERVER_ADDRESS: &str = "http://127.0.0.1:8188";

/// Errors raised while reading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Invocation configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local ComfyUI server.
#[derive(Debug, Clone)]
pub struct InvokeConfig {
    /// ComfyUI base URL.
    pub server_address: String,
    /// Directory missing input images are uploaded from.
    pub input_dir: PathBuf,
    /// Replace `seed` / `noise_seed` inputs before submission.
    pub randomize_seeds: bool,
    /// Values for the titled parameter nodes.
    pub params: ParamValues,
    /// Which node title parameter labels are matched against.
    pub title_source: TitleSource,
    /// History polling limits and pacing.
    pub poll: PollConfig,
    /// Remove the prompt from the server queue when waiting is abandoned.
    pub cancel_on_abort: bool,
    /// Download output images after generation.
    pub fetch_images: bool,
    /// Upload fetched images to this bucket.
    pub s3_bucket: Option<String>,
    /// Key prefix inside `s3_bucket`.
    pub s3_key_prefix: Option<String>,
}

impl InvokeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                 |
    /// |---------------------------|-------------------------|
    /// | `COMFYUI_SERVER_ADDRESS`  | `http://127.0.0.1:8188` |
    /// | `COMFYUI_INPUT_DIR`       | `.`                     |
    /// | `RANDOMIZE_SEEDS`         | `true`                  |
    /// | `COLOR_INPUT_DETAILS`     | `5005441`               |
    /// | `COLOR_INPUT_BODY`        | `12227444`              |
    /// | `PROMPT_TOKEN`            | `Oarfish`               |
    /// | `POLL_INTERVAL_MS`        | `1000`                  |
    /// | `POLL_BACKOFF_MULTIPLIER` | `1.0`                   |
    /// | `POLL_MAX_INTERVAL_SECS`  | `30`                    |
    /// | `POLL_MAX_ATTEMPTS`       | `0` (unbounded)         |
    /// | `POLL_TIMEOUT_SECS`       | `1800` (`0` disables)   |
    /// | `CANCEL_ON_ABORT`         | `true`                  |
    /// | `FETCH_IMAGES`            | `false`                 |
    /// | `S3_BUCKET_NAME`          | unset                   |
    /// | `S3_KEY_PREFIX`           | unset                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable
    /// lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server_address =
            lookup("COMFYUI_SERVER_ADDRESS").unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.into());
        let input_dir = PathBuf::from(lookup("COMFYUI_INPUT_DIR").unwrap_or_else(|| ".".into()));

        let randomize_seeds = parse_bool(&lookup, "RANDOMIZE_SEEDS", true)?;

        let params = ParamValues {
            color_details: lookup("COLOR_INPUT_DETAILS").unwrap_or_else(|| "5005441".into()),
            color_body: lookup("COLOR_INPUT_BODY").unwrap_or_else(|| "12227444".into()),
            prompt_token: lookup("PROMPT_TOKEN").unwrap_or_else(|| "Oarfish".into()),
        };

        let interval_ms: u64 = parse_var(&lookup, "POLL_INTERVAL_MS", 1000)?;
        if interval_ms == 0 {
            return Err(ConfigError::Invalid {
                var: "POLL_INTERVAL_MS",
                value: interval_ms.to_string(),
                reason: "must be greater than 0".into(),
            });
        }
        let multiplier: f64 = parse_var(&lookup, "POLL_BACKOFF_MULTIPLIER", 1.0)?;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                var: "POLL_BACKOFF_MULTIPLIER",
                value: multiplier.to_string(),
                reason: "must be a finite number >= 1.0".into(),
            });
        }
        let max_interval_secs: u64 = parse_var(&lookup, "POLL_MAX_INTERVAL_SECS", 30)?;
        if Duration::from_secs(max_interval_secs) < Duration::from_millis(interval_ms) {
            return Err(ConfigError::Invalid {
                var: "POLL_MAX_INTERVAL_SECS",
                value: max_interval_secs.to_string(),
                reason: format!("must not be shorter than POLL_INTERVAL_MS ({interval_ms} ms)"),
            });
        }
        let max_attempts: u32 = parse_var(&lookup, "POLL_MAX_ATTEMPTS", 0)?;
        let timeout_secs: u64 = parse_var(&lookup, "POLL_TIMEOUT_SECS", 1800)?;

        let poll = PollConfig {
            interval: Duration::from_millis(interval_ms),
            max_interval: Duration::from_secs(max_interval_secs),
            multiplier,
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        };

        let cancel_on_abort = parse_bool(&lookup, "CANCEL_ON_ABORT", true)?;
        let fetch_images = parse_bool(&lookup, "FETCH_IMAGES", false)?;
        let s3_bucket = non_empty(lookup("S3_BUCKET_NAME"));
        let s3_key_prefix = non_empty(lookup("S3_KEY_PREFIX"));

        Ok(Self {
            server_address,
            input_dir,
            randomize_seeds,
            params,
            title_source: TitleSource::Meta,
            poll,
            cancel_on_abort,
            fetch_images,
            s3_bucket,
            s3_key_prefix,
        })
    }

    /// Images are fetched when asked for, or when they are to be uploaded.
    pub fn should_fetch_images(&self) -> bool {
        self.fetch_images || self.s3_bucket.is_some()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
    }
}

fn parse_bool<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value,
            reason: "expected true or false".into(),
        }),
    }
}
