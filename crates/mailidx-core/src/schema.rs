//! Persisted layout of the search index database
//!
//! Six object stores under one versioned database. `SearchIndexMeta` carries
//! the only secondary index: a unique lookup by the `word` field.

/// Schema version expected by this build.
///
/// Opening a database stored with any other (non-zero) version wipes and
/// recreates every store.
pub const DB_VERSION: u32 = 3;

/// Encrypted search index rows, keyed by a generated row id.
pub const SEARCH_INDEX_OS: &str = "SearchIndex";
/// Per-word metadata pointing at search index rows.
pub const SEARCH_INDEX_META_OS: &str = "SearchIndexMeta";
/// Per-element metadata (list id, encrypted word set).
pub const ELEMENT_DATA_OS: &str = "ElementData";
/// Global index metadata (user encryption key, excluded list ids).
pub const META_DATA_OS: &str = "MetaData";
/// Per-group indexing progress.
pub const GROUP_DATA_OS: &str = "GroupMetaData";
/// Search term suggestions per type.
pub const SEARCH_TERM_SUGGESTIONS_OS: &str = "SearchTermSuggestions";

/// Unique index on `SearchIndexMeta.word`.
pub const SEARCH_INDEX_WORDS_INDEX: &str = "SearchIndexWords";

/// Description of a secondary index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: &'static str,
    pub key_path: &'static str,
    pub unique: bool,
}

/// Description of an object store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSchema {
    pub name: &'static str,
    /// In-line key path; `None` means keys are supplied out of line.
    pub key_path: Option<&'static str>,
    /// Whether the store owns a key generator.
    pub auto_increment: bool,
    pub indexes: &'static [IndexSchema],
}

impl StoreSchema {
    const fn plain(name: &'static str) -> Self {
        Self {
            name,
            key_path: None,
            auto_increment: false,
            indexes: &[],
        }
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }
}

/// Every store the search index uses, in creation order.
pub const STORES: &[StoreSchema] = &[
    StoreSchema {
        name: SEARCH_INDEX_OS,
        key_path: None,
        auto_increment: true,
        indexes: &[],
    },
    StoreSchema {
        name: SEARCH_INDEX_META_OS,
        key_path: Some("id"),
        auto_increment: true,
        indexes: &[IndexSchema {
            name: SEARCH_INDEX_WORDS_INDEX,
            key_path: "word",
            unique: true,
        }],
    },
    StoreSchema::plain(ELEMENT_DATA_OS),
    StoreSchema::plain(META_DATA_OS),
    StoreSchema::plain(GROUP_DATA_OS),
    StoreSchema::plain(SEARCH_TERM_SUGGESTIONS_OS),
];

/// Look up the schema of a known store.
pub fn store(name: &str) -> Option<&'static StoreSchema> {
    STORES.iter().find(|schema| schema.name == name)
}
