use std::env;
use std::sync::OnceLock;

/// Run-wide options forwarded to the runtime autotuner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugOptions {
    /// 0 disables runtime autotuning; 2 and above zero result buffers before benchmarking.
    pub autotune_level: u32,
    /// Restrict candidates to algorithms with deterministic results.
    pub deterministic_ops: bool,
    /// Upper bound on scratch a benchmarking pass may allocate.
    pub autotune_scratch_limit_bytes: u64,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            autotune_level: 1,
            deterministic_ops: false,
            autotune_scratch_limit_bytes: 4 << 30,
        }
    }
}

static PROCESS_OPTIONS: OnceLock<DebugOptions> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn env_bool(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let value = env::var(name).ok()?;
    match value.trim().parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("ignoring {name}={value:?}: expected an unsigned integer");
            None
        }
    }
}

impl DebugOptions {
    /// Defaults overridden by `CONV_RS_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(level) = env_u64("CONV_RS_AUTOTUNE_LEVEL") {
            options.autotune_level = u32::try_from(level).unwrap_or(u32::MAX);
        }
        if let Some(flag) = env_bool("CONV_RS_DETERMINISTIC_OPS") {
            options.deterministic_ops = flag;
        }
        if let Some(limit) = env_u64("CONV_RS_AUTOTUNE_SCRATCH_LIMIT") {
            options.autotune_scratch_limit_bytes = limit;
        }
        options
    }

    /// Environment-derived options, read once per process.
    pub fn process() -> &'static DebugOptions {
        PROCESS_OPTIONS.get_or_init(Self::from_env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(value), "{value:?} should be truthy");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value:?} should be falsy");
        }
    }
}
