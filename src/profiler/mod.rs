//! Contextual profiler
//!
//! Counts, per function and per calling context, how often the context was
//! seen at a call, how often compiling for it succeeded or failed, and which
//! variant contexts the calls were dispatched to. The summary is rendered as
//! CSV:
//!
//! ```text
//! ID,NAME,CONTEXT,N_CALL,CMP_SUCCESS,CMP_FAIL,DISPATCHED FUNCTIONS
//! 0,"f","[arg0:eager]",12,1,0,"[arg0:eager]:11 []:1"
//! ```

use crate::context::ContextFingerprint;
use crate::dispatch::FunctionId;
use crate::error::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

pub const CSV_HEADER: &str = "ID,NAME,CONTEXT,N_CALL,CMP_SUCCESS,CMP_FAIL,DISPATCHED FUNCTIONS";

/// Counters for one (function, calling context) pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextProfile {
    pub calls: u64,
    pub compile_success: u64,
    pub compile_fail: u64,
    /// Dispatched variant context bits to call count
    pub dispatched: BTreeMap<u64, u64>,
}

#[derive(Debug, Clone, Default)]
struct FunctionProfile {
    name: String,
    contexts: BTreeMap<u64, ContextProfile>,
}

#[derive(Debug, Clone)]
pub struct ContextualProfiler {
    functions: BTreeMap<FunctionId, FunctionProfile>,
    enabled: bool,
}

impl ContextualProfiler {
    pub fn new() -> Self {
        Self {
            functions: BTreeMap::new(),
            enabled: true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn entry(&mut self, function: FunctionId, name: &str, context: ContextFingerprint) -> &mut ContextProfile {
        let profile = self.functions.entry(function).or_insert_with(|| FunctionProfile {
            name: name.to_string(),
            contexts: BTreeMap::new(),
        });
        profile.contexts.entry(context.bits()).or_default()
    }

    /// A call presenting `context` ran the variant compiled for `dispatched`.
    pub fn record_call(
        &mut self,
        function: FunctionId,
        name: &str,
        context: ContextFingerprint,
        dispatched: ContextFingerprint,
    ) {
        if !self.enabled {
            return;
        }
        let entry = self.entry(function, name, context);
        entry.calls += 1;
        *entry.dispatched.entry(dispatched.bits()).or_default() += 1;
    }

    pub fn record_compilation(
        &mut self,
        function: FunctionId,
        name: &str,
        context: ContextFingerprint,
        success: bool,
    ) {
        if !self.enabled {
            return;
        }
        let entry = self.entry(function, name, context);
        if success {
            entry.compile_success += 1;
        } else {
            entry.compile_fail += 1;
        }
    }

    pub fn get(&self, function: FunctionId, context: ContextFingerprint) -> Option<&ContextProfile> {
        self.functions
            .get(&function)
            .and_then(|f| f.contexts.get(&context.bits()))
    }

    pub fn total_calls(&self) -> u64 {
        self.functions
            .values()
            .flat_map(|f| f.contexts.values())
            .map(|c| c.calls)
            .sum()
    }

    pub fn reset(&mut self) {
        self.functions.clear();
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from(CSV_HEADER);
        out.push('\n');
        for (id, profile) in &self.functions {
            for (bits, ctx) in &profile.contexts {
                let dispatched: Vec<String> = ctx
                    .dispatched
                    .iter()
                    .map(|(d, n)| format!("{}:{}", render(*d), n))
                    .collect();
                out.push_str(&format!(
                    "{},\"{}\",\"{}\",{},{},{},\"{}\"\n",
                    id.0,
                    profile.name,
                    render(*bits),
                    ctx.calls,
                    ctx.compile_success,
                    ctx.compile_fail,
                    dispatched.join(" ")
                ));
            }
        }
        out
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_csv())?;
        Ok(())
    }
}

impl Default for ContextualProfiler {
    fn default() -> Self {
        Self::new()
    }
}

fn render(bits: u64) -> String {
    match ContextFingerprint::from_bits(bits) {
        Some(ctx) => ctx.to_string(),
        None => format!("{:#x}", bits),
    }
}

impl fmt::Display for ContextualProfiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_csv())
    }
}
