use super::fatal::FatalMode;
use std::env;

/// Alignment of every allocation header and of the data that follows it.
pub const FORCED_ALIGNMENT: usize = 16;

/// Number of reader slots an rwlock tracks for diagnostics.
pub const LOCK_MAX_READERS: usize = 32;

/// Size of a lock's ring of acquisition sites. Must be a power of two.
pub const LOCK_DEBUG_RING: usize = 8;

/// This structure contains the configuration settings for a runtime.
#[derive(Copy, Clone, Debug)]
pub struct RuntimeConfig {
    /// Size of the first arena attached to the default heap.
    pub default_heap_size: usize,
    /// Size of the arena added when a heap has to grow without collecting
    /// (pinned heaps, suspended collections, or allocation while the
    /// collector itself is running).
    pub scratch_heap_size: usize,
    /// Number of value slots in each VM thread's stack.
    pub vm_stack_size: usize,
    /// Maximum number of active call frames in a VM thread.
    pub max_call_depth: usize,
    /// Once the survivors of a collection fill more than this fraction of
    /// the fresh arena, the next collection doubles the arena it asks for.
    pub expand_threshold: f32,
    /// Overrides what a fatal error does. `None` keeps the process default.
    pub fatal_mode: Option<FatalMode>,
}

pub const RUNTIME_CONFIG_DEFAULT_HEAP_SIZE: usize = 1 << 26;
pub const RUNTIME_CONFIG_DEFAULT_SCRATCH_HEAP_SIZE: usize = 1 << 20;
pub const RUNTIME_CONFIG_DEFAULT_VM_STACK_SIZE: usize = 1 << 17;
pub const RUNTIME_CONFIG_DEFAULT_MAX_CALL_DEPTH: usize = 100;
pub const RUNTIME_CONFIG_DEFAULT_EXPAND_THRESHOLD: f32 = 0.75;

impl RuntimeConfig {
    /// Creates a default RuntimeConfig. Good for most use cases.
    pub fn default() -> Self {
        RuntimeConfig {
            default_heap_size: RUNTIME_CONFIG_DEFAULT_HEAP_SIZE,
            scratch_heap_size: RUNTIME_CONFIG_DEFAULT_SCRATCH_HEAP_SIZE,
            vm_stack_size: RUNTIME_CONFIG_DEFAULT_VM_STACK_SIZE,
            max_call_depth: RUNTIME_CONFIG_DEFAULT_MAX_CALL_DEPTH,
            expand_threshold: RUNTIME_CONFIG_DEFAULT_EXPAND_THRESHOLD,
            fatal_mode: None,
        }
    }

    /// Starts from the defaults and applies any `N00B_*` environment
    /// overrides. Unparseable values are ignored with a warning.
    ///
    /// | Variable                   | Field               |
    /// |----------------------------|---------------------|
    /// | `N00B_DEFAULT_HEAP_SIZE`   | `default_heap_size` |
    /// | `N00B_SCRATCH_HEAP_SIZE`   | `scratch_heap_size` |
    /// | `N00B_STACK_SIZE`          | `vm_stack_size`     |
    /// | `N00B_MAX_CALL_DEPTH`      | `max_call_depth`    |
    /// | `N00B_GC_GROWTH_THRESHOLD` | `expand_threshold`  |
    /// | `N00B_ABORT_ON_FATAL`      | `fatal_mode`        |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("N00B_DEFAULT_HEAP_SIZE") {
            config.default_heap_size = v;
        }
        if let Some(v) = env_parse("N00B_SCRATCH_HEAP_SIZE") {
            config.scratch_heap_size = v;
        }
        if let Some(v) = env_parse("N00B_STACK_SIZE") {
            config.vm_stack_size = v;
        }
        if let Some(v) = env_parse("N00B_MAX_CALL_DEPTH") {
            config.max_call_depth = v;
        }
        if let Some(v) = env_parse::<f32>("N00B_GC_GROWTH_THRESHOLD") {
            if v > 0.0 && v <= 1.0 {
                config.expand_threshold = v;
            } else {
                log::warn!("ignoring N00B_GC_GROWTH_THRESHOLD={v}: must be in (0, 1]");
            }
        }
        if let Ok(v) = env::var("N00B_ABORT_ON_FATAL") {
            config.fatal_mode = match v.to_lowercase().as_str() {
                "1" | "true" | "yes" => Some(FatalMode::Abort),
                "0" | "false" | "no" => Some(FatalMode::Panic),
                _ => {
                    log::warn!("ignoring N00B_ABORT_ON_FATAL={v}");
                    None
                }
            };
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;

    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {name}={raw}: not a valid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();

        assert!(config.default_heap_size.is_power_of_two());
        assert!(config.scratch_heap_size <= config.default_heap_size);
        assert!(LOCK_DEBUG_RING.is_power_of_two());
        assert_eq!(FORCED_ALIGNMENT % std::mem::size_of::<usize>(), 0);
        assert!(config.fatal_mode.is_none());
    }
}
