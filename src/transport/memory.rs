use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{RemoteDir, Transport, TransportError};

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<(RemoteDir, String), Vec<u8>>,
    failing: BTreeSet<String>,
    calls: Vec<String>,
}

/// In-memory remote used by tests and local dry runs.
///
/// Clones share the same files, so a test can keep a handle while the
/// transfer client owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the files from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, dir: RemoteDir, name: &str, bytes: impl Into<Vec<u8>>) {
        self.lock().files.insert((dir, name.to_string()), bytes.into());
    }

    pub fn get(&self, dir: RemoteDir, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&(dir, name.to_string())).cloned()
    }

    pub fn names(&self, dir: RemoteDir) -> Vec<String> {
        self.lock()
            .files
            .keys()
            .filter(|(d, _)| *d == dir)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Every operation touching `name` fails from now on.
    pub fn fail_on(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    /// Operations performed so far, as `op:dir/name` strings.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn check(
        state: &mut State,
        op: &'static str,
        dir: RemoteDir,
        name: &str,
    ) -> Result<(), TransportError> {
        state.calls.push(format!("{op}:{dir}/{name}"));
        if state.failing.contains(name) {
            return Err(TransportError::Remote {
                op,
                path: format!("{dir}/{name}"),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::check(&mut state, "put", RemoteDir::Deposit, name)?;
        state
            .files
            .insert((RemoteDir::Deposit, name.to_string()), bytes.to_vec());
        Ok(())
    }

    async fn list(&self, dir: RemoteDir) -> Result<Vec<String>, TransportError> {
        let mut state = self.lock();
        state.calls.push(format!("list:{dir}"));
        Ok(state
            .files
            .keys()
            .filter(|(d, _)| *d == dir)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn download(&self, dir: RemoteDir, name: &str) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        Self::check(&mut state, "get", dir, name)?;
        state
            .files
            .get(&(dir, name.to_string()))
            .cloned()
            .ok_or_else(|| TransportError::Remote {
                op: "get",
                path: format!("{dir}/{name}"),
                reason: "no such file".into(),
            })
    }

    async fn delete(&self, dir: RemoteDir, name: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::check(&mut state, "delete", dir, name)?;
        state.files.remove(&(dir, name.to_string()));
        Ok(())
    }
}
