use serde::{Deserialize, Serialize};

/// Catalog metadata for one tradeable item, as served by the mapping endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub examine: String,
    #[serde(default)]
    pub members: bool,
    /// Grand Exchange buy limit per four hours
    #[serde(rename = "limit", default)]
    pub buy_limit: i64,
    #[serde(default)]
    pub value: i64,
    #[serde(rename = "highalch", default)]
    pub high_alch: i64,
    #[serde(rename = "lowalch", default)]
    pub low_alch: i64,
    #[serde(default)]
    pub icon: String,
}

impl CatalogItem {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            examine: String::new(),
            members: false,
            buy_limit: 0,
            value: 0,
            high_alch: 0,
            low_alch: 0,
            icon: String::new(),
        }
    }

    /// Zero means the feed had no value; stored as NULL
    pub fn buy_limit_opt(&self) -> Option<i64> {
        positive(self.buy_limit)
    }

    pub fn value_opt(&self) -> Option<i64> {
        positive(self.value)
    }

    pub fn high_alch_opt(&self) -> Option<i64> {
        positive(self.high_alch)
    }

    pub fn low_alch_opt(&self) -> Option<i64> {
        positive(self.low_alch)
    }
}

fn positive(v: i64) -> Option<i64> {
    (v > 0).then_some(v)
}
