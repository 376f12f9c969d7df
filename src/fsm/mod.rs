use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Span};

use crate::config::KvResponse;
use crate::datafile::{self, DataFile, KvMap};
use crate::KvError;

/// Mutation kind carried by a [`Command`]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Set,
    Delete,
}

/// One client write, serialized as the payload of a log entry
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub action: Action,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            action: Action::Set,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            action: Action::Delete,
            key: key.into(),
            value: String::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, KvError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        serde_json::from_slice(bytes).map_err(KvError::CommandDecode)
    }
}

/// Replicated state machine: turns committed entries into data file mutations
#[derive(Debug)]
pub struct StateMachine {
    data: DataFile,
    span: Span,
}

/// Encoded image of the map taken at one point in time.
///
/// Consumed by [`FsmSnapshot::persist`]; anything it holds is released when
/// it is dropped, whichever way the caller exits.
#[derive(Debug)]
pub struct FsmSnapshot {
    image: Vec<u8>,
    span: Span,
}

impl StateMachine {
    pub fn new(data: DataFile, span: Span) -> Self {
        Self { data, span }
    }

    pub fn data_file(&self) -> &DataFile {
        &self.data
    }

    /// Apply one committed entry.
    ///
    /// Undecodable entries are logged and ignored, storage failures fail only
    /// this command; neither stops later entries from being applied. Lock
    /// contention is never a failure: the entry waits for the lock.
    pub fn apply(&self, entry: &[u8]) -> KvResponse {
        let cmd = match Command::decode(entry) {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(parent: &self.span, error = %e, "failed to decode command, skipping entry");
                return KvResponse::Ignored;
            }
        };

        debug!(parent: &self.span, action = ?cmd.action, key = %cmd.key, "applying command");

        let result = self.with_data(|data| match cmd.action {
            Action::Set => data.update(|map| {
                map.insert(cmd.key.clone(), cmd.value.clone());
            }),
            Action::Delete => data.update(|map| {
                map.remove(&cmd.key);
            }),
        });

        match result {
            Ok(()) => KvResponse::Applied,
            Err(e) => {
                error!(parent: &self.span, key = %cmd.key, error = %e, "failed to apply command");
                KvResponse::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Value for `key` in local storage
    pub fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.data.load()?.remove(key))
    }

    /// Full local map
    pub fn dump(&self) -> Result<KvMap, KvError> {
        self.data.load()
    }

    /// Take a consistent image of the whole map
    pub fn snapshot(&self) -> Result<FsmSnapshot, KvError> {
        info!(parent: &self.span, "building state machine snapshot");
        let map = self.with_data(DataFile::load)?;

        Ok(FsmSnapshot {
            image: datafile::encode(&map)?,
            span: self.span.clone(),
        })
    }

    /// Replace local state with the contents of an encoded image
    pub fn restore<R: Read>(&self, mut stream: R) -> Result<(), KvError> {
        info!(parent: &self.span, "restoring state machine from snapshot");
        let mut image = Vec::new();
        stream.read_to_end(&mut image)?;

        let map = datafile::decode(&image)?;
        self.with_data(|data| data.save(&map))
    }

    /// Run `op` against the data file, retrying for as long as the lock is
    /// busy. Any other error is returned as is.
    fn with_data<T>(
        &self,
        mut op: impl FnMut(&DataFile) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        let mut attempts: u64 = 0;
        loop {
            match op(&self.data) {
                Err(KvError::LockTimeout(path)) => {
                    attempts += 1;
                    if attempts % 100 == 0 {
                        warn!(parent: &self.span, path = %path.display(), attempts, "still waiting for data file lock");
                    }
                }
                other => return other,
            }
        }
    }
}

impl FsmSnapshot {
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Stream the image into `sink`, consuming the snapshot.
    pub fn persist<W: Write>(self, mut sink: W) -> Result<(), KvError> {
        sink.write_all(&self.image)?;
        sink.flush()?;
        Ok(())
    }
}

impl Drop for FsmSnapshot {
    fn drop(&mut self) {
        debug!(parent: &self.span, bytes = self.image.len(), "snapshot released");
    }
}
