//! Engine configuration parameters.
//!
//! Cache sizes, widening limits and diagnostics switches. Defaults suit an
//! interactive runtime that defines methods and calls them in the same
//! session.

use thiserror::Error;

/// Whether and how aggressively instances are compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    /// Infer and compile every dispatched instance.
    #[default]
    On,
    /// Prefer the unspecialized or interpreted entry point; compile only
    /// when asked to explicitly.
    Min,
    /// Never compile; run everything through the interpreter fallback.
    Off,
}

/// Configuration for a dispatch engine.
///
/// # Example
///
/// ```ignore
/// use meridian_dispatch::EngineConfig;
///
/// let config = EngineConfig {
///     call_cache_size: 1024,
///     warn_overwrite: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // =========================================================================
    // Call-Site Cache
    // =========================================================================
    /// Number of slots in the call-site cache.
    ///
    /// Must be a power of two; call sites hash into it with a mask.
    ///
    /// Default: 4096
    pub call_cache_size: usize,

    // =========================================================================
    // Cache Widening
    // =========================================================================
    /// Most conflicting methods tolerated when caching a widened signature.
    ///
    /// When a widened signature intersects more methods than this, the
    /// literal signature is cached instead.
    ///
    /// Default: 32
    pub max_unspecialized_conflicts: usize,

    /// Number of vararg arguments unrolled into compilation signatures.
    ///
    /// `None` derives it from the largest arity defined for the function.
    ///
    /// Default: None
    pub default_max_varargs: Option<usize>,

    /// Cache entries for one function before the exact-type table is
    /// consulted ahead of the signature cache.
    ///
    /// Default: 8
    pub leafcache_min_entries: u8,

    // =========================================================================
    // Specialization
    // =========================================================================
    /// Specializations kept in a linear list before a hashed index is built.
    ///
    /// Default: 8
    pub specialization_inline_threshold: usize,

    /// Maximum nesting of inference requests on one thread.
    ///
    /// Deeper requests are declined and fall back to unspecialized code.
    ///
    /// Default: 3
    pub max_inference_depth: usize,

    /// Compilation policy.
    ///
    /// Default: [`CompileMode::On`]
    pub compile: CompileMode,

    // =========================================================================
    // Diagnostics
    // =========================================================================
    /// Warn when a method definition replaces an identical signature.
    ///
    /// Default: false
    pub warn_overwrite: bool,

    /// Emit a precompile trace event for every compilation.
    ///
    /// Default: false
    pub trace_compile: bool,

    /// Emit a dispatch trace event the first time an instance is dispatched.
    ///
    /// Default: false
    pub trace_dispatch: bool,

    /// Record the invalidation walk in the debug log.
    ///
    /// Default: false
    pub debug_invalidation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // Call-site cache
            call_cache_size: 4096,

            // Widening
            max_unspecialized_conflicts: 32,
            default_max_varargs: None,
            leafcache_min_entries: 8,

            // Specialization
            specialization_inline_threshold: 8,
            max_inference_depth: 3,
            compile: CompileMode::On,

            // Diagnostics
            warn_overwrite: false,
            trace_compile: false,
            trace_dispatch: false,
            debug_invalidation: false,
        }
    }
}

impl EngineConfig {
    /// Configuration that never compiles.
    pub fn interpreter_only() -> Self {
        Self {
            compile: CompileMode::Off,
            ..Default::default()
        }
    }

    /// Small caches and every diagnostic enabled.
    pub fn testing() -> Self {
        Self {
            call_cache_size: 64,
            warn_overwrite: true,
            trace_compile: true,
            trace_dispatch: true,
            debug_invalidation: true,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_cache_size < 4 || !self.call_cache_size.is_power_of_two() {
            return Err(ConfigError::InvalidCallCacheSize(self.call_cache_size));
        }
        if self.max_inference_depth == 0 {
            return Err(ConfigError::ZeroInferenceDepth);
        }
        if self.leafcache_min_entries > MAX_CACHE_ENTRY_COUNT {
            return Err(ConfigError::LeafcacheThresholdTooLarge(
                self.leafcache_min_entries,
            ));
        }
        Ok(())
    }
}

/// Saturation point of the per-type-name cache entry counter.
pub(crate) const MAX_CACHE_ENTRY_COUNT: u8 = 31;

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Call-site cache size must be a power of two, minimum 4.
    #[error("call cache size must be a power of two of at least 4, got {0}")]
    InvalidCallCacheSize(usize),
    /// Inference depth must allow at least one level.
    #[error("max inference depth must be at least 1")]
    ZeroInferenceDepth,
    /// The leafcache threshold can never be reached.
    #[error("leafcache threshold {0} exceeds the saturating entry count")]
    LeafcacheThresholdTooLarge(u8),
}
