//! Database layouts: partitions, key paths and secondary indexes.

/// Secondary index over one top-level field of a partition's records.
#[derive(Debug)]
pub struct IndexSpec {
  pub name: &'static str,
  pub key_path: &'static str,
}

#[derive(Debug)]
pub struct PartitionSpec {
  pub name: &'static str,
  /// Field holding the record's key
  pub key_path: &'static str,
  pub auto_increment: bool,
  /// Schema version that introduced this partition
  pub since: u32,
  pub indexes: &'static [IndexSpec],
}

impl PartitionSpec {
  pub fn index(&self, name: &str) -> Option<&IndexSpec> {
    self.indexes.iter().find(|i| i.name == name)
  }
}

/// A named database with its schema version.
///
/// Bumping `version` is the only way to add partitions. Partitions whose
/// `since` is above `version` are not part of the database yet.
#[derive(Debug)]
pub struct DatabaseSpec {
  pub name: &'static str,
  pub version: u32,
  pub partitions: &'static [PartitionSpec],
}

impl DatabaseSpec {
  pub fn partition(&self, name: &str) -> Option<&PartitionSpec> {
    self
      .partitions
      .iter()
      .find(|p| p.name == name && p.since <= self.version)
  }

  /// Partitions that exist at this version.
  pub fn active_partitions(&self) -> impl Iterator<Item = &PartitionSpec> {
    self.partitions.iter().filter(|p| p.since <= self.version)
  }

  pub fn file_name(&self) -> String {
    format!("{}.db", self.name)
  }
}

pub const MUTATIONS: &str = "mutations";
pub const DEAD_LETTERS: &str = "dead_letters";
pub const PROFILE: &str = "profile";
pub const LOCATIONS: &str = "locations";
pub const SCANS: &str = "scans";

const SYNCED_INDEX: &[IndexSpec] = &[IndexSpec {
  name: "synced",
  key_path: "synced",
}];

const PENDING_SYNC_INDEX: &[IndexSpec] = &[IndexSpec {
  name: "pendingSync",
  key_path: "pendingSync",
}];

pub(crate) const OFFLINE_PARTITIONS: &[PartitionSpec] = &[
  PartitionSpec {
    name: MUTATIONS,
    key_path: "id",
    auto_increment: true,
    since: 1,
    indexes: SYNCED_INDEX,
  },
  PartitionSpec {
    name: DEAD_LETTERS,
    key_path: "id",
    auto_increment: false,
    since: 2,
    indexes: &[],
  },
];

/// Write-ahead buffer for mutations made while offline.
pub static OFFLINE_DB: DatabaseSpec = DatabaseSpec {
  name: "offline",
  version: 2,
  partitions: OFFLINE_PARTITIONS,
};

/// Profile snapshots, keyed by `user_id`.
pub static USER_DB: DatabaseSpec = DatabaseSpec {
  name: "user",
  version: 1,
  partitions: &[PartitionSpec {
    name: PROFILE,
    key_path: "entityId",
    auto_increment: false,
    since: 1,
    indexes: PENDING_SYNC_INDEX,
  }],
};

/// Location and QR scan history.
pub static HISTORY_DB: DatabaseSpec = DatabaseSpec {
  name: "history",
  version: 1,
  partitions: &[
    PartitionSpec {
      name: LOCATIONS,
      key_path: "entityId",
      auto_increment: false,
      since: 1,
      indexes: PENDING_SYNC_INDEX,
    },
    PartitionSpec {
      name: SCANS,
      key_path: "id",
      auto_increment: true,
      since: 1,
      indexes: SYNCED_INDEX,
    },
  ],
};
