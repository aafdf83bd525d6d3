use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document delivered by the remote store: a store-assigned id plus a
/// field map. Identity is the id, never the position in a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    ArrayContains,
}

impl FilterOp {
    /// Stable token used in the canonical signature encoding.
    pub(crate) fn token(self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::In => "in",
            FilterOp::ArrayContains => "array-contains",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

/// A live query against one collection of the remote store. Equal specs
/// produce equal signatures and share one underlying subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Caller-supplied dependency tuple folded into the signature, for
    /// consumers whose query identity depends on values outside the
    /// filter set (e.g. the selected school year).
    #[serde(default)]
    pub deps: Vec<String>,
}

impl QuerySpec {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            deps: Vec::new(),
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: Value) -> Self {
        self.filters.push(QueryFilter {
            field: field.to_string(),
            op,
            value,
        });
        self
    }

    pub fn order_by(mut self, field: &str, direction: OrderDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn dep(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }
}

/// Store-side failure surfaced to subscribers (permission denied,
/// unavailable, ...). Cloneable so one failure can fan out to every
/// attached consumer.
#[derive(Debug, Clone, Serialize)]
pub struct StoreError {
    pub code: String,
    pub message: String,
}

impl StoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StoreError {}

/// Callback handed to [`DocumentStore::open`]. The store invokes it with
/// the full ordered result set on every change, or with an error when
/// delivery breaks. Pushes must happen outside the `open` call itself.
pub type StorePush = Arc<dyn Fn(Result<Vec<Document>, StoreError>) + Send + Sync>;

/// An open store-side subscription. Closing (or dropping the box) stops
/// the push stream; further pushes from a closed subscription are
/// ignored by the cache. `close` runs under the cache's coordination
/// lock and must not call back into the cache.
pub trait StoreSubscription: Send {
    fn close(&mut self);
}

/// The remote document store collaborator. The crate depends only on
/// this shape and assumes nothing about the wire protocol. `open` runs
/// under the cache's coordination lock: it must return promptly and
/// must not call back into the cache.
pub trait DocumentStore: Send + Sync {
    fn open(
        &self,
        query: &QuerySpec,
        push: StorePush,
    ) -> Result<Box<dyn StoreSubscription>, StoreError>;
}
