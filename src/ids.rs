//! Identifier newtypes shared by the watermark store and the content cache

use serde::{Deserialize, Serialize};

/// Sentinel persisted in place of an item id for aggregate watermarks.
pub const ALL_ITEMS: &str = "all";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a South (source) or North (target) connector
    ConnectorId
);

string_id!(
    /// Identifier of a scan mode, the schedule shared by one or more items
    ScanModeId
);

string_id!(
    /// Identifier of an item, the smallest extraction unit of a South connector
    ItemId
);

impl ItemId {
    /// True if this id collides with the aggregate sentinel
    pub fn is_reserved(&self) -> bool {
        self.0 == ALL_ITEMS
    }
}

/// Which cursor a watermark row tracks: the whole scan mode or one item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemScope {
    All,
    Item(ItemId),
}

impl ItemScope {
    /// Build a scope from an optional item: `None` means aggregate.
    pub fn from_item(item: Option<&ItemId>) -> Self {
        match item {
            Some(id) => Self::Item(id.clone()),
            None => Self::All,
        }
    }

    /// Decode the persisted column value.
    pub fn from_column(value: String) -> Self {
        if value == ALL_ITEMS {
            Self::All
        } else {
            Self::Item(ItemId(value))
        }
    }

    /// Value persisted in the `item_id` column
    pub fn as_column(&self) -> &str {
        match self {
            Self::All => ALL_ITEMS,
            Self::Item(id) => id.as_str(),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl std::fmt::Display for ItemScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_column())
    }
}
