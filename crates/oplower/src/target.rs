//! Compilation targets and scoped target activation.
//!
//! Schedule templates are specialised per target, so every schedule lowering runs inside a
//! [`TargetScope`]. Scopes form a per-thread stack: entering pushes, dropping the guard pops, which
//! keeps nesting correct under recursion and releases the target on early returns and unwinding.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{LoweringError, LoweringResult};

/// Target kinds accepted by [`Target::parse`] and the dispatch keys each implies.
const TARGET_KINDS: &[(&str, &[&str])] = &[
    ("llvm", &["cpu"]),
    ("c", &["cpu"]),
    ("stackvm", &["cpu"]),
    ("cuda", &["cuda", "gpu"]),
    ("nvptx", &["cuda", "gpu"]),
    ("rocm", &["rocm", "gpu"]),
    ("opencl", &["opencl", "gpu"]),
    ("metal", &["metal", "gpu"]),
    ("vulkan", &["vulkan", "gpu"]),
    ("opengl", &["opengl"]),
    ("sdaccel", &["sdaccel", "hls"]),
    ("aocl", &["aocl", "hls"]),
    ("ext_dev", &["ext_dev"]),
];

/// A parsed target description such as `llvm -mcpu=skylake-avx512`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    kind: String,
    keys: Vec<String>,
    options: BTreeMap<String, Option<String>>,
    libs: Vec<String>,
}

impl Target {
    /// Parses `"<kind> [-opt[=value]]..."`.
    pub fn parse(raw: &str) -> LoweringResult<Self> {
        let mut tokens = raw.split_whitespace();
        let kind = tokens
            .next()
            .ok_or_else(|| LoweringError::invalid_target(raw, "empty target string"))?;
        let default_keys = TARGET_KINDS
            .iter()
            .find(|(name, _)| *name == kind)
            .map(|(_, keys)| *keys)
            .ok_or_else(|| {
                LoweringError::invalid_target(raw, format!("unknown target kind `{kind}`"))
            })?;

        let mut options = BTreeMap::new();
        for token in tokens {
            let option = token.strip_prefix('-').ok_or_else(|| {
                LoweringError::invalid_target(raw, format!("expected `-option`, got `{token}`"))
            })?;
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (option, None),
            };
            if name.is_empty() {
                return Err(LoweringError::invalid_target(raw, "empty option name"));
            }
            options.insert(name.to_string(), value);
        }

        let mut keys = Vec::with_capacity(default_keys.len() + 1);
        if let Some(Some(device)) = options.get("device") {
            keys.push(device.clone());
        }
        for key in default_keys {
            if !keys.iter().any(|existing| existing == key) {
                keys.push((*key).to_string());
            }
        }

        let libs = match options.get("libs") {
            Some(Some(list)) => list
                .split(',')
                .map(str::trim)
                .filter(|lib| !lib.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            kind: kind.to_string(),
            keys,
            options,
            libs,
        })
    }

    /// Target kind, e.g. `llvm` or `cuda`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Dispatch keys, most specific first. Template lookup falls back through these.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.iter().any(|candidate| candidate == key)
    }

    /// Value of `-name=value`; `Some(None)` for a bare flag.
    pub fn option(&self, name: &str) -> Option<Option<&str>> {
        self.options.get(name).map(|value| value.as_deref())
    }

    /// External libraries requested with `-libs=`.
    pub fn libs(&self) -> &[String] {
        &self.libs
    }

    /// Innermost active target on the current thread.
    pub fn current() -> Option<Arc<Target>> {
        ACTIVE_TARGETS.with(|stack| stack.borrow().last().cloned())
    }

    /// Number of nested target scopes active on the current thread.
    pub fn scope_depth() -> usize {
        ACTIVE_TARGETS.with(|stack| stack.borrow().len())
    }
}

impl FromStr for Target {
    type Err = LoweringError;

    fn from_str(raw: &str) -> LoweringResult<Self> {
        Target::parse(raw)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for (name, value) in &self.options {
            match value {
                Some(value) => write!(f, " -{name}={value}")?,
                None => write!(f, " -{name}")?,
            }
        }
        Ok(())
    }
}

thread_local! {
    static ACTIVE_TARGETS: RefCell<Vec<Arc<Target>>> = const { RefCell::new(Vec::new()) };
}

/// RAII activation of a [`Target`] on the current thread.
///
/// The guard is `!Send`: it must be dropped on the thread whose stack it pushed.
pub struct TargetScope {
    target: Arc<Target>,
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl TargetScope {
    pub fn enter(target: Target) -> Self {
        Self::enter_shared(Arc::new(target))
    }

    pub fn enter_shared(target: Arc<Target>) -> Self {
        let depth = ACTIVE_TARGETS.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Arc::clone(&target));
            stack.len()
        });
        tracing::trace!(active = %target, depth, "enter target scope");
        Self {
            target,
            depth,
            _not_send: PhantomData,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Nesting depth of this scope (1 for the outermost).
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for TargetScope {
    fn drop(&mut self) {
        ACTIVE_TARGETS.with(|stack| {
            stack.borrow_mut().truncate(self.depth.saturating_sub(1));
        });
        tracing::trace!(active = %self.target, depth = self.depth, "exit target scope");
    }
}
