//! Shared build-graph fixture: files, packages, environment variables, configurations and
//! targets over an in-memory file system.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use evalgraph::metadata::{Metadata, MetadataBuilder};
use evalgraph::{
    ComputeError, Environment, EvalError, Evaluator, EventKind, ExecutionResult, FunctionError,
    Key, StoredEvents, Tracer,
};
use parking_lot::{Mutex, RwLock};

// =============================================================================
// Keys and values
// =============================================================================

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum BuildKey {
    /// Contents of a file.
    File(String),
    /// A package, parsed from `{name}/BUILD`.
    Package(String),
    /// The client environment, injected.
    ClientEnv,
    /// One variable of the client environment.
    EnvVar(String),
    /// A build configuration: `PATH` plus `{name}.toolchain`.
    Config(String),
    /// A target `package:name`.
    Target(String),
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Kind {
    File,
    Package,
    ClientEnv,
    EnvVar,
    Config,
    Target,
}

impl Key for BuildKey {
    type Kind = Kind;

    fn kind(&self) -> Kind {
        match self {
            BuildKey::File(_) => Kind::File,
            BuildKey::Package(_) => Kind::Package,
            BuildKey::ClientEnv => Kind::ClientEnv,
            BuildKey::EnvVar(_) => Kind::EnvVar,
            BuildKey::Config(_) => Kind::Config,
            BuildKey::Target(_) => Kind::Target,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDecl {
    pub name: String,
    pub deps: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum BuildValue {
    File(Option<String>),
    Package {
        name: String,
        targets: Vec<TargetDecl>,
    },
    ClientEnv(BTreeMap<String, String>),
    EnvVar(Option<String>),
    Config {
        path: Option<String>,
        toolchain: Option<String>,
    },
    Target {
        label: String,
        libraries: Metadata<String>,
    },
}

pub fn file(path: &str) -> BuildKey {
    BuildKey::File(path.to_string())
}

pub fn package(name: &str) -> BuildKey {
    BuildKey::Package(name.to_string())
}

pub fn env_var(name: &str) -> BuildKey {
    BuildKey::EnvVar(name.to_string())
}

pub fn config(name: &str) -> BuildKey {
    BuildKey::Config(name.to_string())
}

pub fn target(label: &str) -> BuildKey {
    BuildKey::Target(label.to_string())
}

pub fn client_env(vars: &[(&str, &str)]) -> BuildValue {
    BuildValue::ClientEnv(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("no such package '{name}'")]
pub struct NoSuchPackage {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("no such target '{label}': {reason}")]
pub struct NoSuchTarget {
    pub label: String,
    pub reason: String,
}

// =============================================================================
// In-memory file system
// =============================================================================

#[derive(Default)]
pub struct FakeFs {
    files: RwLock<HashMap<String, String>>,
    flaky: RwLock<HashSet<String>>,
}

impl FakeFs {
    pub fn write(&self, path: &str, content: &str) {
        self.files
            .write()
            .insert(path.to_string(), content.to_string());
    }

    pub fn delete(&self, path: &str) {
        self.files.write().remove(path);
    }

    /// Make reads of `path` fail transiently until `heal`.
    pub fn break_path(&self, path: &str) {
        self.flaky.write().insert(path.to_string());
    }

    pub fn heal(&self, path: &str) {
        self.flaky.write().remove(path);
    }

    fn read(&self, path: &str) -> Result<Option<String>, FunctionError> {
        if self.flaky.read().contains(path) {
            let error = std::io::Error::new(std::io::ErrorKind::Interrupted, "read interrupted");
            return Err(FunctionError::transient(error));
        }
        Ok(self.files.read().get(path).cloned())
    }
}

// =============================================================================
// Call counting tracer
// =============================================================================

#[derive(Default)]
pub struct CallCounter {
    computes: Mutex<HashMap<BuildKey, usize>>,
    restarts: Mutex<HashMap<BuildKey, usize>>,
    results: Mutex<Vec<(BuildKey, ExecutionResult)>>,
    cycles: Mutex<Vec<Vec<BuildKey>>>,
}

impl CallCounter {
    /// Number of function invocations for `key`, restarts included.
    pub fn computes(&self, key: &BuildKey) -> usize {
        self.computes.lock().get(key).copied().unwrap_or(0)
    }

    pub fn restarts(&self, key: &BuildKey) -> usize {
        self.restarts.lock().get(key).copied().unwrap_or(0)
    }

    /// The most recent way `key` left a round.
    pub fn last_result(&self, key: &BuildKey) -> Option<ExecutionResult> {
        self.results
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, r)| r.clone())
    }

    pub fn cycles(&self) -> Vec<Vec<BuildKey>> {
        self.cycles.lock().clone()
    }
}

impl Tracer<BuildKey> for CallCounter {
    fn on_compute(&self, key: &BuildKey, _attempt: usize) {
        *self.computes.lock().entry(key.clone()).or_default() += 1;
    }

    fn on_restart(&self, key: &BuildKey, _missing: &[BuildKey]) {
        *self.restarts.lock().entry(key.clone()).or_default() += 1;
    }

    fn on_node_end(&self, key: &BuildKey, result: ExecutionResult) {
        self.results.lock().push((key.clone(), result));
    }

    fn on_cycle_detected(&self, cycle: &[BuildKey]) {
        self.cycles.lock().push(cycle.to_vec());
    }
}

// =============================================================================
// Functions
// =============================================================================

type Env<'a> = Environment<'a, BuildKey, BuildValue>;

fn compute_file(fs: &FakeFs, key: &BuildKey) -> Result<BuildValue, ComputeError> {
    let BuildKey::File(path) = key else {
        unreachable!("file function called for {:?}", key)
    };
    Ok(BuildValue::File(fs.read(path)?))
}

/// `BUILD` syntax: one `target NAME [DEP_LABEL...]` per line; `#` starts a comment.
fn parse_build(content: &str) -> Result<Vec<TargetDecl>, ComputeError> {
    let mut targets = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("target"), Some(name)) => targets.push(TargetDecl {
                name: name.to_string(),
                deps: words.map(str::to_string).collect(),
            }),
            _ => return Err(anyhow::anyhow!("cannot parse line '{}'", line).into()),
        }
    }
    Ok(targets)
}

fn compute_package(key: &BuildKey, env: &mut Env<'_>) -> Result<BuildValue, ComputeError> {
    let BuildKey::Package(name) = key else {
        unreachable!("package function called for {:?}", key)
    };
    env.report(EventKind::Progress, format!("loading package {}", name));
    let build_file = env.get_value(&file(&format!("{}/BUILD", name)));
    env.check_missing()?;

    match build_file.as_deref() {
        Some(BuildValue::File(Some(content))) => Ok(BuildValue::Package {
            name: name.clone(),
            targets: parse_build(content)?,
        }),
        Some(BuildValue::File(None)) => Err(NoSuchPackage { name: name.clone() }.into()),
        other => unreachable!("unexpected BUILD file value {:?}", other),
    }
}

fn compute_env_var(key: &BuildKey, env: &mut Env<'_>) -> Result<BuildValue, ComputeError> {
    let BuildKey::EnvVar(name) = key else {
        unreachable!("env var function called for {:?}", key)
    };
    let client = env.get_value(&BuildKey::ClientEnv);
    env.check_missing()?;
    match client.as_deref() {
        Some(BuildValue::ClientEnv(vars)) => Ok(BuildValue::EnvVar(vars.get(name).cloned())),
        other => unreachable!("unexpected client env value {:?}", other),
    }
}

fn compute_config(key: &BuildKey, env: &mut Env<'_>) -> Result<BuildValue, ComputeError> {
    let BuildKey::Config(name) = key else {
        unreachable!("config function called for {:?}", key)
    };
    let values = env.get_values([env_var("PATH"), file(&format!("{}.toolchain", name))]);
    env.check_missing()?;

    let path = match values[0].as_deref() {
        Some(BuildValue::EnvVar(path)) => path.clone(),
        other => unreachable!("unexpected PATH value {:?}", other),
    };
    let toolchain = match values[1].as_deref() {
        Some(BuildValue::File(content)) => content.clone(),
        other => unreachable!("unexpected toolchain value {:?}", other),
    };
    Ok(BuildValue::Config { path, toolchain })
}

fn compute_target(key: &BuildKey, env: &mut Env<'_>) -> Result<BuildValue, ComputeError> {
    let BuildKey::Target(label) = key else {
        unreachable!("target function called for {:?}", key)
    };
    let Some((pkg, name)) = label.split_once(':') else {
        return Err(anyhow::anyhow!("malformed label '{}'", label).into());
    };

    let package_value = match env.get_value_or_throw::<NoSuchPackage>(&package(pkg)) {
        Ok(Some(value)) => value,
        Ok(None) => return Err(ComputeError::Incomplete),
        Err(e) => {
            return Err(FunctionError::new(NoSuchTarget {
                label: label.clone(),
                reason: e.to_string(),
            })
            .into())
        }
    };
    let BuildValue::Package { targets, .. } = &*package_value else {
        unreachable!("unexpected package value {:?}", package_value)
    };
    let Some(decl) = targets.iter().find(|t| t.name == name) else {
        return Err(FunctionError::new(NoSuchTarget {
            label: label.clone(),
            reason: format!("package '{}' has no target '{}'", pkg, name),
        })
        .into());
    };

    let deps = env.get_values(decl.deps.iter().map(|dep| target(dep)));
    env.check_missing()?;

    let mut libraries = MetadataBuilder::new().add(format!("lib{}.a", name));
    for dep in deps.iter().flatten() {
        if let BuildValue::Target { libraries: dep_libraries, .. } = &**dep {
            libraries = libraries.add_transitive_and_propagate(dep_libraries);
        }
    }
    Ok(BuildValue::Target {
        label: label.clone(),
        libraries: libraries.build(),
    })
}

// =============================================================================
// Fixture
// =============================================================================

pub struct Fixture {
    pub evaluator: Evaluator<BuildKey, BuildValue>,
    pub fs: Arc<FakeFs>,
    pub calls: Arc<CallCounter>,
    pub events: Arc<StoredEvents<BuildKey>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_parallelism(4)
    }

    pub fn with_parallelism(parallelism: usize) -> Self {
        let fs = Arc::new(FakeFs::default());
        let calls = Arc::new(CallCounter::default());
        let events = Arc::new(StoredEvents::new());

        let fs_for_files = fs.clone();
        let evaluator = Evaluator::<BuildKey, BuildValue>::builder()
            .parallelism(parallelism)
            .function_fn(Kind::File, move |key, _env| compute_file(&fs_for_files, key))
            .function_fn(Kind::Package, compute_package)
            .function_fn(Kind::EnvVar, compute_env_var)
            .function_fn(Kind::Config, compute_config)
            .function_fn(Kind::Target, compute_target)
            .inject(
                BuildKey::ClientEnv,
                client_env(&[("PATH", "/usr/bin"), ("HOME", "/home/dev")]),
            )
            .tracer(calls.clone())
            .event_sink(events.clone())
            .build()
            .expect("worker pool");

        Self {
            evaluator,
            fs,
            calls,
            events,
        }
    }

    /// Evaluate a single key.
    pub fn eval(&mut self, key: &BuildKey) -> Result<Arc<BuildValue>, EvalError<BuildKey>> {
        let result = self
            .evaluator
            .evaluate([key.clone()])
            .expect("evaluation round");
        result.get(key).cloned().expect("root result")
    }

    /// Change a file and tell the evaluator about it.
    pub fn edit(&mut self, path: &str, content: &str) {
        self.fs.write(path, content);
        self.evaluator.invalidate([file(path)]);
    }

    pub fn assert_consistent(&self) {
        if let Err(problems) = self.evaluator.graph().check_consistency() {
            panic!("graph inconsistent: {:?}", problems);
        }
    }
}

pub fn libraries(value: &BuildValue) -> Vec<String> {
    match value {
        BuildValue::Target { libraries, .. } => libraries.items(),
        other => panic!("not a target: {:?}", other),
    }
}
