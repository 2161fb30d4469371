//! JIT configuration
//!
//! Everything the core reads from its environment lives in [`JitConfig`].
//! Components receive the config (or the pieces they need) by reference, so
//! tests build configs directly instead of touching process state.

use crate::error::{Error, Result};
use bitflags::bitflags;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default directory for persisted artifacts
pub const DEFAULT_SERIALIZE_PREFIX: &str = ".";

/// Default number of slots in a version table, baseline included
pub const DEFAULT_TABLE_CAPACITY: usize = 20;

/// Inner closures with fewer baseline invocations are not compiled eagerly
pub const DEFAULT_MIN_INVOCATIONS_FOR_INNER: u64 = 2;

/// Deopts tolerated before a variant is disabled
pub const DEFAULT_MAX_DEOPTS: u32 = 5;

bitflags! {
    /// Optimizer trace and behaviour switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        const PRINT_INTERMEDIATE = 1 << 0;
        const PRINT_OPTIMIZED = 1 << 1;
        const PRINT_PASSES = 1 << 2;
        const PRINT_DEOPTS = 1 << 3;
        const PRINT_DISPATCH = 1 << 4;
        const PRINT_SERIALIZER = 1 << 5;
        /// Report compilation failures through the failure callback's log
        const SHOW_WARNINGS = 1 << 6;
        /// Stop after optimization: no native code, no table insertion
        const DRY_RUN = 1 << 7;
    }
}

const FLAG_NAMES: &[(&str, DebugFlags)] = &[
    ("PrintIntermediate", DebugFlags::PRINT_INTERMEDIATE),
    ("PrintOptimized", DebugFlags::PRINT_OPTIMIZED),
    ("PrintPasses", DebugFlags::PRINT_PASSES),
    ("PrintDeopts", DebugFlags::PRINT_DEOPTS),
    ("PrintDispatch", DebugFlags::PRINT_DISPATCH),
    ("PrintSerializer", DebugFlags::PRINT_SERIALIZER),
    ("ShowWarnings", DebugFlags::SHOW_WARNINGS),
    ("DryRun", DebugFlags::DRY_RUN),
];

impl DebugFlags {
    /// Parse a comma separated list of flag names, e.g. `"DryRun,ShowWarnings"`.
    pub fn parse_list(list: &str) -> Result<DebugFlags> {
        let mut flags = DebugFlags::empty();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let flag = FLAG_NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, f)| *f)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown debug flag '{}'", name)))?;
            flags |= flag;
        }
        Ok(flags)
    }

    pub fn names(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(n, _)| *n)
            .collect()
    }
}

/// How traces are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugStyle {
    #[default]
    Standard,
    GraphViz,
    GraphVizBB,
}

impl FromStr for DebugStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Standard" => Ok(DebugStyle::Standard),
            "GraphViz" => Ok(DebugStyle::GraphViz),
            "GraphVizBB" => Ok(DebugStyle::GraphVizBB),
            other => Err(Error::InvalidConfig(format!("unknown debug style '{}'", other))),
        }
    }
}

impl fmt::Display for DebugStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugStyle::Standard => write!(f, "Standard"),
            DebugStyle::GraphViz => write!(f, "GraphViz"),
            DebugStyle::GraphVizBB => write!(f, "GraphVizBB"),
        }
    }
}

/// Debug switches plus the filters restricting which units and passes are traced
#[derive(Debug, Clone, Default)]
pub struct DebugOptions {
    pub flags: DebugFlags,
    pub pass_filter: Option<Regex>,
    pub function_filter: Option<Regex>,
    pub style: DebugStyle,
}

impl DebugOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(mut self, flags: DebugFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_function_filter(mut self, pattern: &str) -> Result<Self> {
        self.function_filter = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_pass_filter(mut self, pattern: &str) -> Result<Self> {
        self.pass_filter = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn includes(&self, flag: DebugFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Whether pipeline events for `name` should be traced
    pub fn traces_function(&self, name: &str) -> bool {
        !self.flags.is_empty()
            && self
                .function_filter
                .as_ref()
                .map_or(true, |re| re.is_match(name))
    }

    pub fn traces_pass(&self, pass: &str) -> bool {
        self.includes(DebugFlags::PRINT_PASSES)
            && self.pass_filter.as_ref().map_or(true, |re| re.is_match(pass))
    }
}

/// Optimizer admission ceilings and the serializer chaos knob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    pub max_input_size: usize,
    pub inliner_max_size: usize,
    /// Serialize every n-th compilation regardless of config (0 = off)
    pub serialize_chaos: u32,
    saved: Option<Box<Parameters>>,
}

impl Parameters {
    pub const WARMUP_MAX_INPUT_SIZE: usize = 3500;
    pub const WARMUP_INLINER_MAX_SIZE: usize = 4000;

    pub fn new() -> Self {
        Self {
            max_input_size: 12_000,
            inliner_max_size: 2_000,
            serialize_chaos: 0,
            saved: None,
        }
    }

    /// Install the warmup ceilings. The values in effect at the first
    /// unmatched call are saved; nested calls keep that saved copy.
    pub fn warmup_begin(&mut self) {
        if self.saved.is_none() {
            let mut current = self.clone();
            current.saved = None;
            self.saved = Some(Box::new(current));
        }
        self.max_input_size = Self::WARMUP_MAX_INPUT_SIZE;
        self.inliner_max_size = Self::WARMUP_INLINER_MAX_SIZE;
        self.serialize_chaos = 0;
    }

    /// Restore the values saved by [`warmup_begin`](Self::warmup_begin).
    /// Without a matching begin this is a no-op.
    pub fn warmup_end(&mut self) {
        if let Some(saved) = self.saved.take() {
            *self = *saved;
        }
    }

    pub fn in_warmup(&self) -> bool {
        self.saved.is_some()
    }

    /// Whether the optimizer accepts a unit of `size`
    pub fn admits(&self, size: usize) -> bool {
        size <= self.max_input_size
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistent artifact store switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializerConfig {
    pub enabled: bool,
    pub prefix: PathBuf,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefix: PathBuf::from(DEFAULT_SERIALIZE_PREFIX),
        }
    }
}

/// Complete configuration of the JIT core
#[derive(Debug, Clone)]
pub struct JitConfig {
    pub debug: DebugOptions,
    /// Cache speculative gate decisions between structural changes
    pub fast_case_dispatch: bool,
    pub serializer: SerializerConfig,
    pub parameters: Parameters,
    /// Seed for slot eviction; `None` seeds from entropy
    pub eviction_seed: Option<u64>,
    pub table_capacity: usize,
    pub min_invocations_for_inner: u64,
    pub max_deopts: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            debug: DebugOptions::default(),
            fast_case_dispatch: true,
            serializer: SerializerConfig::default(),
            parameters: Parameters::default(),
            eviction_seed: None,
            table_capacity: DEFAULT_TABLE_CAPACITY,
            min_invocations_for_inner: DEFAULT_MIN_INVOCATIONS_FOR_INNER,
            max_deopts: DEFAULT_MAX_DEOPTS,
        }
    }
}

impl JitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from the `TIERJIT_*` process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(list) = lookup("TIERJIT_DEBUG") {
            config.debug.flags = DebugFlags::parse_list(&list)?;
        }
        if let Some(pattern) = lookup("TIERJIT_DEBUG_PASS_FILTER") {
            config.debug.pass_filter = Some(Regex::new(&pattern)?);
        }
        if let Some(pattern) = lookup("TIERJIT_DEBUG_FUNCTION_FILTER") {
            config.debug.function_filter = Some(Regex::new(&pattern)?);
        }
        if let Some(style) = lookup("TIERJIT_DEBUG_STYLE") {
            config.debug.style = style.parse()?;
        }
        if let Some(value) = lookup("TIERJIT_FASTCASE") {
            config.fast_case_dispatch = value == "1";
        }
        if let Some(value) = lookup("TIERJIT_SERIALIZE") {
            config.serializer.enabled = value == "1";
        }
        if let Some(prefix) = lookup("TIERJIT_SERIALIZE_PREFIX") {
            config.serializer.prefix = PathBuf::from(prefix);
        }

        Ok(config)
    }

    pub fn with_serializer(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.serializer = SerializerConfig {
            enabled: true,
            prefix: prefix.into(),
        };
        self
    }

    pub fn with_eviction_seed(mut self, seed: u64) -> Self {
        self.eviction_seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap as HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert!(config.fast_case_dispatch);
        assert!(!config.serializer.enabled);
        assert_eq!(config.serializer.prefix, PathBuf::from("."));
        assert_eq!(config.table_capacity, 20);
        assert_eq!(config.min_invocations_for_inner, 2);
    }

    #[test]
    fn test_from_lookup() {
        let config = JitConfig::from_lookup(lookup_from(&[
            ("TIERJIT_DEBUG", "DryRun, ShowWarnings"),
            ("TIERJIT_DEBUG_FUNCTION_FILTER", "^fib"),
            ("TIERJIT_DEBUG_STYLE", "GraphViz"),
            ("TIERJIT_FASTCASE", "0"),
            ("TIERJIT_SERIALIZE", "1"),
            ("TIERJIT_SERIALIZE_PREFIX", "/tmp/artifacts"),
        ]))
        .unwrap();
        assert!(config.debug.includes(DebugFlags::DRY_RUN));
        assert!(config.debug.includes(DebugFlags::SHOW_WARNINGS));
        assert!(config.debug.traces_function("fib2"));
        assert!(!config.debug.traces_function("loop"));
        assert_eq!(config.debug.style, DebugStyle::GraphViz);
        assert!(!config.fast_case_dispatch);
        assert!(config.serializer.enabled);
        assert_eq!(config.serializer.prefix, PathBuf::from("/tmp/artifacts"));
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        let err = JitConfig::from_lookup(lookup_from(&[("TIERJIT_DEBUG", "Verbose")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        let err =
            JitConfig::from_lookup(lookup_from(&[("TIERJIT_DEBUG_PASS_FILTER", "[")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_pass_filter() {
        let config = JitConfig::from_lookup(lookup_from(&[
            ("TIERJIT_DEBUG", "PrintPasses"),
            ("TIERJIT_DEBUG_PASS_FILTER", "^low"),
        ]))
        .unwrap();
        assert!(config.debug.traces_pass("lower"));
        assert!(!config.debug.traces_pass("optimize"));
        assert!(!DebugOptions::default().traces_pass("lower"));
    }

    #[test]
    fn test_flag_names_roundtrip() {
        let flags = DebugFlags::parse_list("PrintDeopts,DryRun").unwrap();
        assert_eq!(flags.names(), vec!["PrintDeopts", "DryRun"]);
    }

    #[test]
    fn test_warmup_save_restore() {
        let mut params = Parameters::new();
        params.max_input_size = 100;
        params.serialize_chaos = 3;

        params.warmup_begin();
        assert_eq!(params.max_input_size, 3500);
        assert_eq!(params.inliner_max_size, 4000);
        assert_eq!(params.serialize_chaos, 0);

        // nested begin keeps the first saved copy
        params.max_input_size = 7;
        params.warmup_begin();
        params.warmup_end();

        assert_eq!(params.max_input_size, 100);
        assert_eq!(params.serialize_chaos, 3);
        assert!(!params.in_warmup());
    }

    #[test]
    fn test_warmup_end_without_begin() {
        let mut params = Parameters::new();
        params.warmup_end();
        assert_eq!(params, Parameters::new());
    }

    #[test]
    fn test_admission() {
        let params = Parameters::new();
        assert!(params.admits(params.max_input_size));
        assert!(!params.admits(params.max_input_size + 1));
    }
}
