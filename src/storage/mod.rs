use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::{
    storage::{Adaptor, LogState, RaftLogReader, RaftSnapshotBuilder, RaftStorage, Snapshot},
    Entry, EntryPayload, LogId, OptionalSend, SnapshotMeta, StorageError, StorageIOError,
    StoredMembership, Vote,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tracing::info;

use crate::config::{KvResponse, Node, NodeId, TypeConfig};
use crate::fsm::{FsmSnapshot, StateMachine};
use crate::KvError;

const CF_LOG: &str = "log";
const CF_STATE: &str = "state";

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged_log_id";
const KEY_APPLIED: &[u8] = b"applied";
const KEY_SNAPSHOT: &[u8] = b"snapshot";
const KEY_SNAPSHOT_DATA: &[u8] = b"snapshot_data";

/// Raft bookkeeping for the state machine; the data itself lives in the FSM's file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppliedState {
    pub last_applied_log_id: Option<LogId<NodeId>>,
    pub last_membership: StoredMembership<NodeId, Node>,
}

/// Raft log in RocksDB plus the file-backed state machine
#[derive(Debug, Clone)]
pub struct KvStorage {
    db: Arc<DB>,
    fsm: Arc<StateMachine>,
    applied: AppliedState,
}

// Helper functions for key conversion
fn id_to_bin(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn bin_to_id(buf: &[u8]) -> Result<u64, StorageError<NodeId>> {
    use byteorder::{BigEndian, ReadBytesExt};
    let mut buf = buf;
    buf.read_u64::<BigEndian>()
        .map_err(|e| StorageIOError::<NodeId>::read_logs(&e).into())
}

impl KvStorage {
    pub async fn new<P: AsRef<Path>>(
        db_path: P,
        fsm: Arc<StateMachine>,
    ) -> Result<Self, StorageError<NodeId>> {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let log_cf = ColumnFamilyDescriptor::new(CF_LOG, Options::default());
        let state_cf = ColumnFamilyDescriptor::new(CF_STATE, Options::default());

        let db = DB::open_cf_descriptors(&db_opts, db_path, vec![log_cf, state_cf])
            .map_err(|e| StorageIOError::<NodeId>::write(&e))?;

        let mut storage = Self {
            db: Arc::new(db),
            fsm,
            applied: AppliedState::default(),
        };

        storage.applied = storage.get_json(KEY_APPLIED)?.unwrap_or_default();

        // A node whose data file is gone recovers from its last snapshot;
        // without one, openraft replays the log from the beginning.
        if !storage.fsm.data_file().exists() {
            match storage.get_current_snapshot().await? {
                Some(snapshot) => {
                    info!("data file missing, restoring from snapshot {:?}", snapshot.meta);
                    let signature = snapshot.meta.signature();
                    let image = snapshot.snapshot.get_ref().clone();
                    storage
                        .blocking(move |fsm| fsm.restore(image.as_slice()))
                        .await
                        .map_err(|e| {
                            StorageIOError::<NodeId>::read_snapshot(Some(signature.clone()), &e)
                        })?
                        .map_err(|e| StorageIOError::<NodeId>::read_snapshot(Some(signature), &e))?;
                    storage.applied = AppliedState {
                        last_applied_log_id: snapshot.meta.last_log_id,
                        last_membership: snapshot.meta.last_membership.clone(),
                    };
                }
                None => storage.applied = AppliedState::default(),
            }
            storage.save_applied()?;
        }

        Ok(storage)
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.fsm
    }

    /// Run data file work on the blocking pool; it may sleep on the file lock
    async fn blocking<T, F>(&self, op: F) -> Result<T, JoinError>
    where
        T: Send + 'static,
        F: FnOnce(&StateMachine) -> T + Send + 'static,
    {
        let fsm = self.fsm.clone();
        tokio::task::spawn_blocking(move || op(&fsm)).await
    }

    fn logs(&self) -> Result<&ColumnFamily, StorageError<NodeId>> {
        self.db.cf_handle(CF_LOG).ok_or_else(|| missing_cf(CF_LOG))
    }

    fn state(&self) -> Result<&ColumnFamily, StorageError<NodeId>> {
        self.db.cf_handle(CF_STATE).ok_or_else(|| missing_cf(CF_STATE))
    }

    #[allow(clippy::result_large_err)]
    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        key: &[u8],
    ) -> Result<Option<T>, StorageError<NodeId>> {
        self.db
            .get_cf(self.state()?, key)
            .map_err(|e| StorageIOError::<NodeId>::read(&e))?
            .map(|v| {
                serde_json::from_slice(&v)
                    .map_err(|e| StorageError::from(StorageIOError::<NodeId>::read(&e)))
            })
            .transpose()
    }

    #[allow(clippy::result_large_err)]
    fn put_json<T: Serialize>(&self, key: &[u8], value: &T) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(value).map_err(|e| StorageIOError::<NodeId>::write(&e))?;
        self.db
            .put_cf(self.state()?, key, bytes)
            .map_err(|e| StorageIOError::<NodeId>::write(&e).into())
    }

    #[allow(clippy::result_large_err)]
    fn save_applied(&self) -> Result<(), StorageError<NodeId>> {
        self.put_json(KEY_APPLIED, &self.applied)
    }

    /// Metadata is stored as JSON and the image as raw bytes, in one batch
    #[allow(clippy::result_large_err)]
    fn save_snapshot(
        &self,
        meta: &SnapshotMeta<NodeId, Node>,
        data: &[u8],
    ) -> Result<(), StorageError<NodeId>> {
        let meta_json =
            serde_json::to_vec(meta).map_err(|e| StorageIOError::<NodeId>::write(&e))?;
        let cf = self.state()?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, KEY_SNAPSHOT, meta_json);
        batch.put_cf(cf, KEY_SNAPSHOT_DATA, data);
        self.db
            .write(batch)
            .map_err(|e| StorageIOError::<NodeId>::write(&e).into())
    }

    #[allow(clippy::result_large_err)]
    fn load_snapshot(
        &self,
    ) -> Result<Option<(SnapshotMeta<NodeId, Node>, Vec<u8>)>, StorageError<NodeId>> {
        let Some(meta) = self.get_json::<SnapshotMeta<NodeId, Node>>(KEY_SNAPSHOT)? else {
            return Ok(None);
        };
        let data = self
            .db
            .get_cf(self.state()?, KEY_SNAPSHOT_DATA)
            .map_err(|e| StorageIOError::<NodeId>::read(&e))?
            .unwrap_or_default();
        Ok(Some((meta, data)))
    }
}

fn missing_cf(name: &str) -> StorageError<NodeId> {
    let err = std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("column family {name} not found"),
    );
    StorageIOError::<NodeId>::read(&err).into()
}

impl RaftLogReader<TypeConfig> for KvStorage {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(x) => id_to_bin(*x),
            std::ops::Bound::Excluded(x) => id_to_bin(*x + 1),
            std::ops::Bound::Unbounded => id_to_bin(0),
        };

        let mut entries = Vec::new();
        for res in self.db.iterator_cf(
            self.logs()?,
            rocksdb::IteratorMode::From(&start, Direction::Forward),
        ) {
            let (id, val) = res.map_err(|e| StorageIOError::<NodeId>::read_logs(&e))?;
            let id = bin_to_id(&id)?;
            if !range.contains(&id) {
                break;
            }

            let entry: Entry<TypeConfig> =
                serde_json::from_slice(&val).map_err(|e| StorageIOError::<NodeId>::read_logs(&e))?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

/// Builds a snapshot from an image taken when the builder was requested,
/// so the image and its metadata describe the same log position.
pub struct KvSnapshotBuilder {
    storage: KvStorage,
    image: Result<FsmSnapshot, KvError>,
}

impl RaftSnapshotBuilder<TypeConfig> for KvSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let image = std::mem::replace(
            &mut self.image,
            Err(KvError::Raft("snapshot already built".to_string())),
        )
        .map_err(|e| StorageIOError::<NodeId>::read_state_machine(&e))?;

        let mut data = Vec::with_capacity(image.len());
        image
            .persist(&mut data)
            .map_err(|e| StorageIOError::<NodeId>::read_state_machine(&e))?;

        let last_applied_log = self.storage.applied.last_applied_log_id;
        let snapshot_id = if let Some(last) = last_applied_log {
            format!("{}-{}", last.leader_id, last.index)
        } else {
            "empty".to_string()
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            last_membership: self.storage.applied.last_membership.clone(),
            snapshot_id,
        };

        self.storage.save_snapshot(&meta, &data)?;

        info!(bytes = data.len(), "built snapshot {}", meta.snapshot_id);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for KvStorage {
    type LogReader = Self;
    type SnapshotBuilder = KvSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(vote).map_err(|e| StorageIOError::<NodeId>::write_vote(&e))?;
        self.db
            .put_cf(self.state()?, KEY_VOTE, bytes)
            .map_err(|e| StorageIOError::<NodeId>::write_vote(&e).into())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.db
            .get_cf(self.state()?, KEY_VOTE)
            .map_err(|e| StorageIOError::<NodeId>::read_vote(&e))?
            .map(|v| {
                serde_json::from_slice(&v)
                    .map_err(|e| StorageError::from(StorageIOError::<NodeId>::read_vote(&e)))
            })
            .transpose()
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = match self
            .db
            .iterator_cf(self.logs()?, rocksdb::IteratorMode::End)
            .next()
        {
            Some(res) => {
                let (_, ent) = res.map_err(|e| StorageIOError::<NodeId>::read_logs(&e))?;
                let entry: Entry<TypeConfig> = serde_json::from_slice(&ent)
                    .map_err(|e| StorageIOError::<NodeId>::read_logs(&e))?;
                Some(entry.log_id)
            }
            None => None,
        };

        let last_purged_log_id = self.get_json::<LogId<NodeId>>(KEY_LAST_PURGED)?;

        Ok(LogState {
            last_purged_log_id,
            last_log_id: last.or(last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        for entry in entries {
            let id = id_to_bin(entry.log_id.index);
            let bytes =
                serde_json::to_vec(&entry).map_err(|e| StorageIOError::<NodeId>::write_logs(&e))?;
            self.db
                .put_cf(self.logs()?, id, bytes)
                .map_err(|e| StorageIOError::<NodeId>::write_logs(&e))?;
        }

        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        tracing::debug!("delete_conflict_logs_since: [{:?}, +oo)", log_id);

        let from = id_to_bin(log_id.index);
        let to = id_to_bin(u64::MAX);
        self.db
            .delete_range_cf(self.logs()?, &from, &to)
            .map_err(|e| StorageIOError::<NodeId>::write_logs(&e).into())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        tracing::debug!("purge_logs_upto: [0, {:?}]", log_id);

        self.put_json(KEY_LAST_PURGED, &log_id)?;
        let from = id_to_bin(0);
        let to = id_to_bin(log_id.index + 1);
        self.db
            .delete_range_cf(self.logs()?, &from, &to)
            .map_err(|e| StorageIOError::<NodeId>::write_logs(&e).into())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
        Ok((
            self.applied.last_applied_log_id,
            self.applied.last_membership.clone(),
        ))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<KvResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.applied.last_applied_log_id = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => responses.push(KvResponse::Applied),
                EntryPayload::Normal(proposal) => {
                    let payload = proposal.0.clone();
                    let response = self
                        .blocking(move |fsm| fsm.apply(&payload))
                        .await
                        .map_err(|e| StorageIOError::<NodeId>::write_state_machine(&e))?;
                    responses.push(response);
                }
                EntryPayload::Membership(mem) => {
                    self.applied.last_membership =
                        StoredMembership::new(Some(entry.log_id), mem.clone());
                    responses.push(KvResponse::Applied);
                }
            }
        }

        // Written after the data: replaying a set/delete suffix is idempotent
        self.save_applied()?;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let image = self
            .blocking(|fsm| fsm.snapshot())
            .await
            .unwrap_or_else(|e| Err(KvError::Raft(format!("snapshot task failed: {e}"))));
        KvSnapshotBuilder {
            storage: self.clone(),
            image,
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        info!("Installing snapshot: {:?}", meta);

        let data = snapshot.into_inner();
        let image = data.clone();
        self.blocking(move |fsm| fsm.restore(image.as_slice()))
            .await
            .map_err(|e| StorageIOError::<NodeId>::read_snapshot(Some(meta.signature()), &e))?
            .map_err(|e| StorageIOError::<NodeId>::read_snapshot(Some(meta.signature()), &e))?;

        self.applied = AppliedState {
            last_applied_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
        };
        self.save_applied()?;

        self.save_snapshot(meta, &data)?;

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.load_snapshot()?.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

/// Create the log store and state machine halves using the Adaptor pattern
pub async fn new_storage<P: AsRef<Path>>(
    db_path: P,
    fsm: Arc<StateMachine>,
) -> Result<(LogStore, StateMachineStore), StorageError<NodeId>> {
    let storage = KvStorage::new(db_path, fsm).await?;
    Ok(Adaptor::new(storage))
}

pub type LogStore = Adaptor<TypeConfig, KvStorage>;
pub type StateMachineStore = Adaptor<TypeConfig, KvStorage>;
