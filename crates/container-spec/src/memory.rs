//! `memory` implements an [`Engine`] that evaluates plans in process.
//!
//! Cache volumes live in memory for as long as the engine does, temp mounts
//! and the container root filesystem are recreated for every evaluation.
//! Commands are not run; they are recorded in an execution log. Steps with
//! file system effects (`NewFile`, `RemovePaths`, `WaitForFile`, `CopyFile`,
//! `Substitute`, `WithFile`) are carried out against the in-memory trees.
//!
//! This makes it possible to check what a plan does to its cache volumes
//! without a container runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_recursion::async_recursion;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, instrument, trace};

use crate::errors::EngineError;
use crate::{CacheVolume, Container, Engine, File, Reference, Service, ServiceHandle, Step};

type Tree = BTreeMap<String, Vec<u8>>;

/// A command recorded by the [`MemoryEngine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Execution {
    /// The image the command ran in
    pub image: Reference,
    /// The user the command ran as, `None` for the image default
    pub user: Option<String>,
    /// The environment at the time of the command
    pub env: BTreeMap<String, String>,
    /// The command line
    pub args: Vec<String>,
}

#[derive(Default)]
struct Inner {
    volumes: Mutex<HashMap<String, Tree>>,
    executed: Mutex<Vec<Execution>>,
    services: Mutex<BTreeMap<String, Service>>,
    next_id: AtomicUsize,
}

/// An [`Engine`] backed by in-memory cache volumes.
///
/// Cloning is cheap and clones share the same volumes.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

// A poisoned lock only means another evaluation panicked; the trees are still
// consistent because every mutation is a single map operation.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn relative(path: &str) -> String {
    normalize(path).trim_start_matches('/').to_string()
}

fn is_within(path: &str, dir: &str) -> bool {
    dir == "/" || path == dir || path.starts_with(&format!("{}/", dir))
}

fn remove_recursive(tree: &mut Tree, rel: &str) {
    if rel.is_empty() {
        tree.clear();
    } else {
        let prefix = format!("{}/", rel);
        tree.retain(|k, _| k != rel && !k.starts_with(&prefix));
    }
}

enum Target {
    Cache(String),
    Temp(Tree),
}

// The file system of one evaluation.
struct Rootfs {
    image: Reference,
    root: Tree,
    mounts: Vec<(String, Target)>,
    env: BTreeMap<String, String>,
    user: Option<String>,
}

impl Rootfs {
    fn new(image: Reference) -> Self {
        Rootfs {
            image,
            root: Tree::new(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            user: None,
        }
    }

    // Index of the mount serving `path`: the longest mount point wins and a
    // later mount shadows an earlier one at the same point.
    fn mount_for(&self, path: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, (point, _)) in self.mounts.iter().enumerate() {
            if is_within(path, point) {
                let longer = best
                    .map(|b| point.len() >= self.mounts[b].0.len())
                    .unwrap_or(true);
                if longer {
                    best = Some(i);
                }
            }
        }
        best
    }

    fn with_tree<R>(
        &mut self,
        volumes: &mut HashMap<String, Tree>,
        path: &str,
        f: impl FnOnce(&mut Tree, &str) -> R,
    ) -> R {
        let path = normalize(path);
        match self.mount_for(&path) {
            Some(i) => {
                let (point, target) = &mut self.mounts[i];
                let rel = path[point.len()..].trim_start_matches('/').to_string();
                match target {
                    Target::Cache(key) => f(volumes.entry(key.clone()).or_default(), &rel),
                    Target::Temp(tree) => f(tree, &rel),
                }
            }
            None => f(&mut self.root, path.trim_start_matches('/')),
        }
    }

    fn read(&mut self, volumes: &mut HashMap<String, Tree>, path: &str) -> Option<Vec<u8>> {
        self.with_tree(volumes, path, |tree, rel| tree.get(rel).cloned())
    }

    fn write(&mut self, volumes: &mut HashMap<String, Tree>, path: &str, data: Vec<u8>) {
        self.with_tree(volumes, path, |tree, rel| {
            tree.insert(rel.to_string(), data);
        })
    }

    fn remove(&mut self, volumes: &mut HashMap<String, Tree>, path: &str) {
        let path = normalize(path);
        self.with_tree(volumes, &path, |tree, rel| remove_recursive(tree, rel));
        // Mounts below the removed directory lose their contents too.
        for (point, target) in self.mounts.iter_mut() {
            if point.as_str() != path && is_within(point, &path) {
                match target {
                    Target::Cache(key) => {
                        if let Some(tree) = volumes.get_mut(key) {
                            tree.clear()
                        }
                    }
                    Target::Temp(tree) => tree.clear(),
                }
            }
        }
    }
}

impl MemoryEngine {
    /// Creates an engine with no volumes.
    pub fn new() -> Self {
        MemoryEngine::default()
    }

    /// Writes a file into a cache volume. `path` is relative to the volume root.
    pub fn write_file(&self, volume: &CacheVolume, path: &str, contents: impl Into<Vec<u8>>) {
        lock(&self.inner.volumes)
            .entry(volume.key().to_string())
            .or_default()
            .insert(relative(path), contents.into());
    }

    /// Reads a file from a cache volume. `path` is relative to the volume root.
    pub fn read_file(&self, volume: &CacheVolume, path: &str) -> Option<Vec<u8>> {
        lock(&self.inner.volumes)
            .get(volume.key())
            .and_then(|tree| tree.get(&relative(path)).cloned())
    }

    /// Every file stored in a volume, relative to its root, sorted.
    pub fn volume_paths(&self, volume: &CacheVolume) -> Vec<String> {
        lock(&self.inner.volumes)
            .get(volume.key())
            .map(|tree| tree.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys of every volume the engine has seen.
    pub fn volumes(&self) -> Vec<String> {
        let mut keys: Vec<_> = lock(&self.inner.volumes).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Commands recorded so far, oldest first.
    pub fn executed(&self) -> Vec<Execution> {
        lock(&self.inner.executed).clone()
    }

    /// Services that were started and not stopped.
    pub fn services(&self) -> Vec<Service> {
        lock(&self.inner.services).values().cloned().collect()
    }

    #[async_recursion]
    async fn evaluate(&self, container: &Container) -> Result<Rootfs, EngineError> {
        let mut fs: Option<Rootfs> = None;
        for step in container.steps() {
            trace!(?step, "Evaluating step");
            if let Step::From { image } = step {
                fs = Some(Rootfs::new(image.clone()));
                continue;
            }
            let fs = fs.as_mut().ok_or(EngineError::NoImage)?;
            match step {
                Step::WaitForFile { path, wait } => {
                    let start = Instant::now();
                    loop {
                        let ready = {
                            let mut volumes = lock(&self.inner.volumes);
                            fs.read(&mut volumes, path).is_some()
                        };
                        if ready {
                            break;
                        }
                        let waited = start.elapsed();
                        if let Some(deadline) = wait.deadline {
                            if waited >= deadline {
                                return Err(EngineError::Timeout {
                                    path: path.clone(),
                                    waited,
                                });
                            }
                        }
                        debug!(%path, ?waited, "File not ready, waiting");
                        tokio::time::sleep(wait.interval).await;
                    }
                }
                Step::WithFile { path, source, .. } => {
                    let data = self.read_from(source).await?;
                    let mut volumes = lock(&self.inner.volumes);
                    fs.write(&mut volumes, path, data);
                }
                step => self.apply(fs, step)?,
            }
        }
        fs.ok_or(EngineError::NoImage)
    }

    // Steps that complete without waiting.
    fn apply(&self, fs: &mut Rootfs, step: &Step) -> Result<(), EngineError> {
        let mut volumes = lock(&self.inner.volumes);
        match step {
            Step::NewFile { path, contents, .. } => {
                fs.write(&mut volumes, path, contents.clone().into_bytes())
            }
            Step::MountCache { path, volume } => {
                volumes.entry(volume.key().to_string()).or_default();
                fs.mounts
                    .push((normalize(path), Target::Cache(volume.key().to_string())));
            }
            Step::MountTemp { path } => fs.mounts.push((normalize(path), Target::Temp(Tree::new()))),
            Step::Env { name, value } => {
                fs.env.insert(name.clone(), value.clone());
            }
            Step::User { name } => fs.user = Some(name.clone()),
            Step::Exec { args } => lock(&self.inner.executed).push(Execution {
                image: fs.image.clone(),
                user: fs.user.clone(),
                env: fs.env.clone(),
                args: args.clone(),
            }),
            Step::RemovePaths { paths } => {
                for path in paths {
                    fs.remove(&mut volumes, path);
                }
            }
            Step::CopyFile { from, to } => {
                let data = fs
                    .read(&mut volumes, from)
                    .ok_or_else(|| EngineError::NotFound { path: from.clone() })?;
                fs.write(&mut volumes, to, data);
            }
            Step::Substitute {
                path,
                pattern,
                replacement,
            } => {
                let regex = Regex::new(pattern).map_err(|source| EngineError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
                let data = fs
                    .read(&mut volumes, path)
                    .ok_or_else(|| EngineError::NotFound { path: path.clone() })?;
                let text = String::from_utf8_lossy(&data);
                let replaced = regex.replace_all(&text, replacement.as_str()).into_owned();
                fs.write(&mut volumes, path, replaced.into_bytes());
            }
            Step::Entrypoint { .. }
            | Step::WithoutEntrypoint
            | Step::ExposePort { .. }
            | Step::DefaultTerminalCmd { .. } => {}
            Step::From { .. } | Step::WaitForFile { .. } | Step::WithFile { .. } => {
                unreachable!("handled by evaluate")
            }
        }
        Ok(())
    }

    async fn read_from(&self, file: &File) -> Result<Vec<u8>, EngineError> {
        let mut fs = self.evaluate(file.container()).await?;
        let mut volumes = lock(&self.inner.volumes);
        fs.read(&mut volumes, file.path())
            .ok_or_else(|| EngineError::NotFound {
                path: file.path().to_string(),
            })
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    #[instrument(level = "debug", skip(self, container), fields(steps = container.steps().len()))]
    async fn sync(&self, container: &Container) -> Result<(), EngineError> {
        self.evaluate(container).await.map(|_| ())
    }

    #[instrument(level = "debug", skip(self, file), fields(path = file.path()))]
    async fn contents(&self, file: &File) -> Result<Vec<u8>, EngineError> {
        self.read_from(file).await
    }

    async fn start(&self, service: &Service) -> Result<ServiceHandle, EngineError> {
        self.evaluate(service.container()).await?;
        let id = format!(
            "service-{}",
            self.inner.next_id.fetch_add(1, Ordering::SeqCst)
        );
        info!(%id, ports = ?service.ports(), command = ?service.command(), "Started service");
        lock(&self.inner.services).insert(id.clone(), service.clone());
        Ok(ServiceHandle::new(id, service.ports()))
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), EngineError> {
        match lock(&self.inner.services).remove(handle.id()) {
            Some(_) => {
                info!(id = handle.id(), "Stopped service");
                Ok(())
            }
            None => Err(anyhow::anyhow!("no running service with id {}", handle.id()).into()),
        }
    }
}
