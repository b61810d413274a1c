//! A module representing the logic behind consuming the data.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Formatter;
use std::sync::Arc;

use async_trait::async_trait;
use num_enum::TryFromPrimitive;
use scylla::response::query_result::ColumnSpecs;
use scylla::value::CqlValue::Set;
use scylla::value::{CqlTimeuuid, CqlValue, Row};

use crate::cdc_types::{ChangeId, StreamID};

/// Trait used to represent a user-defined callback processing read changes.
/// One consumer is created per task when a generation is configured and
/// lives until that task is superseded. Returning `Ok` from
/// [`consume_cdc`](Consumer::consume_cdc) is the commit signal: once it
/// returns, the change counts as delivered and will not be replayed after
/// a clean resume.
#[async_trait]
pub trait Consumer: Send {
    async fn consume_cdc(&mut self, change: RawChange) -> anyhow::Result<()>;
}

/// Trait used to represent a factory of [`Consumer`] instances.
#[async_trait]
pub trait ConsumerFactory: Sync + Send {
    async fn new_consumer(&self) -> Box<dyn Consumer>;
}

/// Represents different types of CDC operations.
/// For more information, see [the CDC documentation](<https://docs.scylladb.com/using-scylla/cdc/cdc-log-table/#operation-column>).
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(i8)]
pub enum OperationType {
    PreImage,
    RowUpdate,
    RowInsert,
    RowDelete,
    PartitionDelete,
    RowRangeDelInclLeft,
    RowRangeDelExclLeft,
    RowRangeDelInclRight,
    RowRangeDelExclRight,
    PostImage,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            OperationType::PreImage => write!(f, "PreImage"),
            OperationType::RowUpdate => write!(f, "RowUpdate"),
            OperationType::RowInsert => write!(f, "RowInsert"),
            OperationType::RowDelete => write!(f, "RowDelete"),
            OperationType::PartitionDelete => write!(f, "PartitionDelete"),
            OperationType::RowRangeDelInclLeft => write!(f, "RowRangeDelInclLeft"),
            OperationType::RowRangeDelExclLeft => write!(f, "RowRangeDelExclLeft"),
            OperationType::RowRangeDelInclRight => write!(f, "RowRangeDelInclRight"),
            OperationType::RowRangeDelExclRight => write!(f, "RowRangeDelExclRight"),
            OperationType::PostImage => write!(f, "PostImage"),
        }
    }
}

// Prefixes under which the log stores per-column deletion markers. The
// `cdc$` column names and these prefixes are fixed by the CDC log format.
const DELETED_PREFIX: &str = "cdc$deleted_";
const DELETED_ELEMENTS_PREFIX: &str = "cdc$deleted_elements_";

// What a column of the window query turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ColumnKind {
    StreamId,
    Time,
    BatchSeqNo,
    EndOfBatch,
    Operation,
    Ttl,
    // Everything below lands in the data vector of a RawChange; the
    // carried string is the base-table column name.
    Data(String),
    Deleted(String),
    DeletedElements(String),
}

impl ColumnKind {
    fn of(column_name: &str) -> ColumnKind {
        match column_name {
            "cdc$stream_id" => ColumnKind::StreamId,
            "cdc$time" => ColumnKind::Time,
            "cdc$batch_seq_no" => ColumnKind::BatchSeqNo,
            "cdc$end_of_batch" => ColumnKind::EndOfBatch,
            "cdc$operation" => ColumnKind::Operation,
            "cdc$ttl" => ColumnKind::Ttl,
            other => {
                // The order matters: the elements prefix contains the
                // plain deletion prefix.
                if let Some(base) = other.strip_prefix(DELETED_ELEMENTS_PREFIX) {
                    ColumnKind::DeletedElements(base.to_string())
                } else if let Some(base) = other.strip_prefix(DELETED_PREFIX) {
                    ColumnKind::Deleted(base.to_string())
                } else {
                    ColumnKind::Data(other.to_string())
                }
            }
        }
    }

    fn carries_data(&self) -> bool {
        matches!(
            self,
            ColumnKind::Data(_) | ColumnKind::Deleted(_) | ColumnKind::DeletedElements(_)
        )
    }
}

/// Describes the columns of one window query.
///
/// Captured once per window query, so a schema change on the base table is
/// picked up the next time a reader is created.
pub struct RawChangeSchema {
    // Kind of every query column, in query order.
    kinds: Vec<ColumnKind>,
    // Base-table column name to its position in the data vector.
    mapping: HashMap<String, usize>,
    // Same, for the deletion marker of the named column.
    deleted_mapping: HashMap<String, usize>,
    // Same, for the deleted elements of the named collection.
    deleted_el_mapping: HashMap<String, usize>,
}

impl RawChangeSchema {
    pub fn new(specs: ColumnSpecs) -> RawChangeSchema {
        Self::from_column_names(specs.iter().map(|spec| spec.name()))
    }

    fn from_column_names<'a>(names: impl Iterator<Item = &'a str>) -> RawChangeSchema {
        let kinds: Vec<ColumnKind> = names.map(ColumnKind::of).collect();

        let mut mapping = HashMap::new();
        let mut deleted_mapping = HashMap::new();
        let mut deleted_el_mapping = HashMap::new();
        // Data positions count only the data-carrying columns, since the
        // metadata columns never reach the data vector.
        let data_kinds = kinds.iter().filter(|kind| kind.carries_data());
        for (position, kind) in data_kinds.enumerate() {
            match kind {
                ColumnKind::Data(name) => mapping.insert(name.clone(), position),
                ColumnKind::Deleted(name) => deleted_mapping.insert(name.clone(), position),
                ColumnKind::DeletedElements(name) => {
                    deleted_el_mapping.insert(name.clone(), position)
                }
                _ => None,
            };
        }

        RawChangeSchema {
            kinds,
            mapping,
            deleted_mapping,
            deleted_el_mapping,
        }
    }

    fn data_column_count(&self) -> usize {
        self.mapping.len() + self.deleted_mapping.len() + self.deleted_el_mapping.len()
    }
}

/// A single decoded row of the CDC log.
///
/// The metadata columns are plain fields; columns of the observed table are
/// reached through the accessor methods. Rows own their data and share the
/// schema of the window query they came from.
pub struct RawChange {
    pub stream_id: StreamID,
    pub time: CqlTimeuuid,
    pub batch_seq_no: i32,
    pub end_of_batch: bool,
    pub operation: OperationType,
    // Can be NULL in the database.
    pub ttl: Option<i64>,
    data: Vec<Option<CqlValue>>,
    schema: Arc<RawChangeSchema>,
}

impl RawChange {
    pub fn from_row(row: Row, schema: &Arc<RawChangeSchema>) -> RawChange {
        // A successful window read fills every metadata field below; the
        // placeholders never survive the loop.
        let mut change = RawChange {
            stream_id: StreamID::new(vec![]),
            time: CqlTimeuuid::from(uuid::Uuid::default()),
            batch_seq_no: i32::MAX,
            end_of_batch: false,
            operation: OperationType::PreImage,
            ttl: None,
            data: Vec::with_capacity(schema.data_column_count()),
            schema: Arc::clone(schema),
        };

        for (kind, value) in schema.kinds.iter().zip(row.columns) {
            match kind {
                ColumnKind::StreamId => {
                    change.stream_id = StreamID::new(value.unwrap().into_blob().unwrap())
                }
                ColumnKind::Time => change.time = value.unwrap().as_timeuuid().unwrap(),
                ColumnKind::BatchSeqNo => change.batch_seq_no = value.unwrap().as_int().unwrap(),
                ColumnKind::EndOfBatch => {
                    change.end_of_batch =
                        matches!(value.map(|v| v.as_boolean()), Some(Some(true)))
                }
                ColumnKind::Operation => {
                    change.operation =
                        OperationType::try_from(value.unwrap().as_tinyint().unwrap()).unwrap()
                }
                ColumnKind::Ttl => change.ttl = value.map(|v| v.as_bigint().unwrap()),
                _ => change.data.push(value),
            }
        }

        change
    }

    /// The identity of this change, used as the resume cursor.
    pub fn change_id(&self) -> ChangeId {
        ChangeId::new(self.stream_id.clone(), self.time)
    }

    /// Allows to get a value from the column that corresponds to the logged table.
    /// Returns `None` if the value is `null`.
    /// Panics if the column does not exist in this table.
    /// To check if such column exists, use [`column_exists`](RawChange::column_exists).
    pub fn get_value(&self, name: &str) -> &Option<CqlValue> {
        self.schema
            .mapping
            .get(name)
            .map(|id| &self.data[*id])
            .unwrap()
    }

    /// Allows to take a value from the column that corresponds to the logged table.
    /// Leaves `None` in the corresponding column data.
    /// Returns `None` if the value is `null` or such column doesn't exist.
    pub fn take_value(&mut self, name: &str) -> Option<CqlValue> {
        self.schema
            .mapping
            .get(name)
            .and_then(|id| self.data[*id].take())
    }

    /// Allows to get info if a value was deleted in this operation.
    /// Panics if the column does not exist in this table
    /// or the column is a part of the primary key.
    pub fn is_value_deleted(&self, name: &str) -> bool {
        self.schema
            .deleted_mapping
            .get(name)
            .map(|id| self.data[*id].is_some())
            .unwrap()
    }

    /// Allows to take deleted elements from a collection.
    /// Returns a new empty vector if the value is `null` or such column doesn't exist.
    /// Leaves `None` in place of taken data.
    pub fn take_deleted_elements(&mut self, name: &str) -> Vec<CqlValue> {
        self.schema
            .deleted_el_mapping
            .get(name)
            .and_then(|id| self.data[*id].take())
            .and_then(|x| match x {
                Set(x) => Some(x),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn column_exists(&self, name: &str) -> bool {
        self.schema.mapping.contains_key(name)
    }

    pub fn column_deletable(&self, name: &str) -> bool {
        self.schema.deleted_mapping.contains_key(name)
    }

    pub fn collection_exists(&self, name: &str) -> bool {
        self.schema.deleted_el_mapping.contains_key(name)
    }

    pub fn get_non_cdc_column_names(&self) -> impl Iterator<Item = &str> {
        self.schema.mapping.keys().map(|column| column.as_str())
    }
}

impl fmt::Debug for RawChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChange")
            .field("stream_id", &self.stream_id)
            .field("time", &self.time)
            .field("operation", &self.operation)
            .finish()
    }
}
