//! Fluent queries over paginated collection endpoints.
//!
//! A [`QueryBuilder`] accumulates filters and options; [`QueryBuilder::build`]
//! consumes it and freezes everything into a [`Query`]. Running a query
//! consumes it as well, so re-running means building again (clone the builder
//! to reuse a configuration).
//!
//! ```rust,ignore
//! let releases = conn
//!     .api::<ReleaseApi>()
//!     .query_releases()
//!     .application_name("WebGoat")
//!     .fields(["releaseId", "releaseName"])
//!     .use_cache(true)
//!     .build()
//!     .get_all()
//!     .await?;
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::ControlFlow,
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    error::{Error, Result},
    fod::connection::Connection,
    json::{self, JsonList, JsonMap},
};

/// Largest page the API hands out.
pub const MAX_PAGE_SIZE: usize = 50;
/// Page size used unless the caller picks one.
pub const DEFAULT_PAGE_SIZE: usize = MAX_PAGE_SIZE;

/// Cache key of a query: SHA-256 over the canonical form of everything that
/// affects the merged result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuerySignature(String);

impl QuerySignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frozen description of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub endpoint: String,
    pub filters: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub fields: BTreeSet<String>,
    pub order_by: Option<String>,
    pub page_size: usize,
    pub max_results: Option<usize>,
    pub use_cache: bool,
    pub on_demand: BTreeMap<String, String>,
}

impl QuerySpec {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            filters: BTreeMap::new(),
            params: BTreeMap::new(),
            fields: BTreeSet::new(),
            order_by: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_results: None,
            use_cache: false,
            on_demand: BTreeMap::new(),
        }
    }

    /// Order-independent signature. Page size and the cache flag are left out
    /// because they do not change the merged result.
    pub fn signature(&self) -> QuerySignature {
        let mut canonical = format!("endpoint={}\n", self.endpoint.trim_matches('/'));
        for (key, value) in &self.filters {
            canonical.push_str(&format!("filter:{key}={value}\n"));
        }
        for (key, value) in &self.params {
            canonical.push_str(&format!("param:{key}={value}\n"));
        }
        for field in &self.fields {
            canonical.push_str(&format!("field:{field}\n"));
        }
        if let Some(order_by) = &self.order_by {
            canonical.push_str(&format!("orderBy={order_by}\n"));
        }
        if let Some(max) = self.max_results {
            canonical.push_str(&format!("maxResults={max}\n"));
        }
        for (name, template) in &self.on_demand {
            canonical.push_str(&format!("onDemand:{name}={template}\n"));
        }

        let hash = Sha256::digest(canonical.as_bytes());
        QuerySignature(URL_SAFE_NO_PAD.encode(hash))
    }

    /// Query string of the page starting at `offset`.
    pub fn page_params(&self, offset: usize, limit: usize) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if !self.filters.is_empty() {
            let filters = self
                .filters
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join("+");
            params.push(("filters".into(), filters));
        }
        if !self.fields.is_empty() {
            let fields = self.fields.iter().cloned().collect::<Vec<_>>().join(",");
            params.push(("fields".into(), fields));
        }
        if let Some(order_by) = &self.order_by {
            params.push(("orderBy".into(), order_by.clone()));
        }
        params.push(("offset".into(), offset.to_string()));
        params.push(("limit".into(), limit.to_string()));
        params
    }
}

/// Accumulates a query. Setting the same logical key twice keeps the last value.
#[derive(Clone)]
pub struct QueryBuilder {
    conn: Connection,
    spec: QuerySpec,
}

impl QueryBuilder {
    pub fn new(conn: Connection, endpoint: impl Into<String>) -> Self {
        let mut spec = QuerySpec::new(endpoint.into());
        spec.page_size = conn.page_size();
        Self { conn, spec }
    }

    /// Adds a server-side filter (`filters=key:value`).
    pub fn filter(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.spec.filters.insert(key.into(), value.to_string());
        self
    }

    /// Adds a plain query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.spec.params.insert(key.into(), value.to_string());
        self
    }

    /// Restricts the returned properties.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.spec.order_by = Some(field.into());
        self
    }

    /// Page size, clamped to `1..=MAX_PAGE_SIZE`.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.spec.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// Stops after `max_results` documents instead of reading every page.
    pub fn max_results(mut self, max_results: usize) -> Self {
        self.spec.max_results = Some(max_results);
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.spec.use_cache = use_cache;
        self
    }

    /// Loads a sub-resource for every document and stores it under `name`.
    ///
    /// `{field}` placeholders in `path_template` are filled from the document,
    /// e.g. `vulnerabilities/{vulnId}/summary`.
    pub fn on_demand(mut self, name: impl Into<String>, path_template: impl Into<String>) -> Self {
        self.spec.on_demand.insert(name.into(), path_template.into());
        self
    }

    pub fn build(self) -> Query {
        Query {
            conn: self.conn,
            spec: self.spec,
        }
    }
}

/// What [`Query::process_all`] went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessSummary {
    pub items: usize,
    pub pages: usize,
    pub stopped: bool,
}

struct Page {
    items: JsonList,
    total: Option<usize>,
}

impl Page {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(mut envelope) => {
                let total = envelope
                    .get("totalCount")
                    .and_then(Value::as_u64)
                    .map(|t| t as usize);
                let items = json::list_from_value(
                    "items",
                    envelope.remove("items").unwrap_or(Value::Null),
                )?;
                Ok(Self { items, total })
            }
            array @ Value::Array(_) => Ok(Self {
                items: json::list_from_value("$", array)?,
                total: None,
            }),
            _ => Err(Error::TypeMismatch {
                key: "$".into(),
                expected: "a page of results",
            }),
        }
    }
}

/// A frozen, executable query.
pub struct Query {
    conn: Connection,
    spec: QuerySpec,
}

impl Query {
    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn signature(&self) -> QuerySignature {
        self.spec.signature()
    }

    /// Every matching document (bounded by `max_results`), merged in order.
    ///
    /// With `use_cache` the merged result is served from, or stored into, the
    /// connection's response cache.
    ///
    /// # Errors
    ///
    /// Transport, authentication and rate-limit errors of any page request.
    pub async fn get_all(self) -> Result<JsonList> {
        if !self.spec.use_cache {
            return self.fetch_all().await;
        }

        let signature = self.spec.signature();
        let documents = self
            .conn
            .cache()
            .get_or_compute(&signature, || self.fetch_all())
            .await?;
        Ok(documents.as_ref().clone())
    }

    /// The single matching document.
    ///
    /// # Errors
    ///
    /// [`Error::NotUnique`] when nothing matched, [`Error::MultipleResults`]
    /// when more than one document did.
    pub async fn get_unique(self) -> Result<JsonMap> {
        let mut documents = self.get_all().await?;
        match documents.len() {
            0 => Err(Error::NotUnique),
            1 => Ok(documents.remove(0)),
            count => Err(Error::MultipleResults { count }),
        }
    }

    /// The first matching document, fetching at most one.
    pub async fn get_first(mut self) -> Result<Option<JsonMap>> {
        self.spec.max_results = Some(1);
        Ok(self.get_all().await?.into_iter().next())
    }

    /// Streams documents to `handler` page by page.
    ///
    /// The next page is requested only after every document of the current
    /// page went through `handler`; returning [`ControlFlow::Break`] stops
    /// without requesting further pages. This mode always reads from the
    /// server and never touches the response cache.
    pub async fn process_all<F>(self, handler: F) -> Result<ProcessSummary>
    where
        F: FnMut(JsonMap) -> ControlFlow<()>,
    {
        self.run(handler).await
    }

    async fn fetch_all(&self) -> Result<JsonList> {
        let mut documents = Vec::new();
        self.run(|doc| {
            documents.push(doc);
            ControlFlow::Continue(())
        })
        .await?;
        Ok(documents)
    }

    async fn run<F>(&self, mut handler: F) -> Result<ProcessSummary>
    where
        F: FnMut(JsonMap) -> ControlFlow<()>,
    {
        let page_size = self.spec.page_size;
        let mut summary = ProcessSummary::default();
        let mut offset = 0;

        loop {
            let remaining = self
                .spec
                .max_results
                .map(|max| max.saturating_sub(summary.items));
            if remaining == Some(0) {
                break;
            }
            let limit = remaining.map_or(page_size, |r| r.min(page_size));

            let page = self.fetch_page(offset, limit).await?;
            summary.pages += 1;
            let received = page.items.len();
            debug!(
                endpoint = %self.spec.endpoint,
                offset,
                received,
                total = ?page.total,
                "fetched page"
            );

            for item in page.items.into_iter().take(limit) {
                let item = self.load_on_demand(item).await?;
                summary.items += 1;
                if handler(item).is_break() {
                    summary.stopped = true;
                    return Ok(summary);
                }
            }

            offset += received;
            let done = match page.total {
                Some(total) => received == 0 || offset >= total,
                None => received < limit,
            };
            if done {
                break;
            }
        }

        Ok(summary)
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Page> {
        let params = self.spec.page_params(offset, limit);
        let value = self.conn.get_json(&self.spec.endpoint, &params).await?;
        Page::from_value(value)
    }

    async fn load_on_demand(&self, mut item: JsonMap) -> Result<JsonMap> {
        for (name, template) in &self.spec.on_demand {
            let path = expand_template(template, &item)?;
            let value = self.conn.get_json(&path, &[]).await?;
            item.insert(name.clone(), value);
        }
        Ok(item)
    }
}

/// Replaces `{field}` placeholders with scalar values from `doc`.
pub fn expand_template(template: &str, doc: &JsonMap) -> Result<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let end = rest[start..].find('}').map(|e| start + e).ok_or_else(|| {
            Error::Configuration(format!("unterminated placeholder in '{template}'"))
        })?;
        let key = &rest[start + 1..end];
        let value = doc.get_string_lossy(key).ok_or_else(|| {
            Error::Configuration(format!(
                "'{template}' needs field '{key}', which the document does not have"
            ))
        })?;
        expanded.push_str(&rest[..start]);
        expanded.push_str(&value);
        rest = &rest[end + 1..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}

/// Declares a domain-specific wrapper around [`QueryBuilder`] that forwards
/// the generic options, so endpoint groups only add their own filters.
macro_rules! typed_query_builder {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name($crate::fod::query::QueryBuilder);

        #[allow(dead_code)]
        impl $name {
            pub fn filter(self, key: impl Into<String>, value: impl std::fmt::Display) -> Self {
                Self(self.0.filter(key, value))
            }

            pub fn param(self, key: impl Into<String>, value: impl std::fmt::Display) -> Self {
                Self(self.0.param(key, value))
            }

            pub fn fields<I, S>(self, fields: I) -> Self
            where
                I: IntoIterator<Item = S>,
                S: Into<String>,
            {
                Self(self.0.fields(fields))
            }

            pub fn order_by(self, field: impl Into<String>) -> Self {
                Self(self.0.order_by(field))
            }

            pub fn page_size(self, page_size: usize) -> Self {
                Self(self.0.page_size(page_size))
            }

            pub fn max_results(self, max_results: usize) -> Self {
                Self(self.0.max_results(max_results))
            }

            pub fn use_cache(self, use_cache: bool) -> Self {
                Self(self.0.use_cache(use_cache))
            }

            pub fn on_demand(
                self,
                name: impl Into<String>,
                path_template: impl Into<String>,
            ) -> Self {
                Self(self.0.on_demand(name, path_template))
            }

            pub fn into_inner(self) -> $crate::fod::query::QueryBuilder {
                self.0
            }

            pub fn build(self) -> $crate::fod::query::Query {
                self.0.build()
            }
        }

        impl From<$crate::fod::query::QueryBuilder> for $name {
            fn from(builder: $crate::fod::query::QueryBuilder) -> Self {
                Self(builder)
            }
        }
    };
}

pub(crate) use typed_query_builder;
