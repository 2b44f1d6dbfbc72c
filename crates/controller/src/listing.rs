//! Paginated, searchable deployment listing
//!
//! Every statement is built with `sqlx::QueryBuilder` so that the owner and the
//! search term only ever travel as bound parameters. The set of searchable
//! columns is closed: [`SearchField`].

use sqlx::{Postgres, QueryBuilder};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

const DEPLOYMENT_COLUMNS: &str =
    "id, name, url, container_image, user_email, min_instances, max_instances, created_at, updated_at";

/// Page selection after defaults have been applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    page: i64,
    limit: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl Pagination {
    /// Parse raw query-string values, falling back to defaults on anything unusable
    pub fn from_raw(page: Option<&str>, limit: Option<&str>) -> Self {
        let page = page
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|page| *page >= 1)
            .unwrap_or(DEFAULT_PAGE);

        let limit = limit
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|limit| (1..=MAX_LIMIT).contains(limit))
            .unwrap_or(DEFAULT_LIMIT);

        Self { page, limit }
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    /// Number of pages needed for `count` rows
    pub fn total_pages(&self, count: i64) -> i64 {
        if count <= 0 {
            return 0;
        }
        (count + self.limit - 1) / self.limit
    }
}

/// Columns a search term is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Name,
    Address,
    Image,
}

impl SearchField {
    pub const ALL: [SearchField; 3] = [SearchField::Name, SearchField::Address, SearchField::Image];

    pub fn column(&self) -> &'static str {
        match self {
            SearchField::Name => "name",
            SearchField::Address => "url",
            SearchField::Image => "container_image",
        }
    }
}

/// A listing request scoped to one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    owner: String,
    /// Lower-cased, escaped `LIKE` pattern
    pattern: Option<String>,
    pagination: Pagination,
}

impl ListingQuery {
    pub fn new(owner: impl Into<String>, search: Option<&str>, pagination: Pagination) -> Self {
        let pattern = search
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(like_pattern);

        Self {
            owner: owner.into(),
            pattern,
            pagination,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    /// Substring the rows must contain, if any
    pub fn search_term(&self) -> Option<String> {
        self.pattern.as_deref().map(unescape_pattern)
    }

    /// `SELECT COUNT(*)` over every matching row
    pub fn count_query(&self) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM deployments");
        self.push_filter(&mut builder);
        builder
    }

    /// One page of matching rows in stable order
    pub fn page_query(&self) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new(format!("SELECT {} FROM deployments", DEPLOYMENT_COLUMNS));
        self.push_filter(&mut builder);
        builder
            .push(" ORDER BY name ASC, id ASC LIMIT ")
            .push_bind(self.pagination.limit())
            .push(" OFFSET ")
            .push_bind(self.pagination.offset());
        builder
    }

    fn push_filter(&self, builder: &mut QueryBuilder<'static, Postgres>) {
        builder.push(" WHERE user_email = ").push_bind(self.owner.clone());

        if let Some(pattern) = &self.pattern {
            builder.push(" AND (");
            for (i, field) in SearchField::ALL.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder
                    .push(format!("LOWER({}) LIKE ", field.column()))
                    .push_bind(pattern.clone());
            }
            builder.push(")");
        }
    }
}

/// Build a case-insensitive substring pattern with `LIKE` metacharacters escaped
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.to_lowercase().chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn unescape_pattern(pattern: &str) -> String {
    let inner = &pattern[1..pattern.len() - 1];
    let mut term = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if c == '\\' && !escaped {
            escaped = true;
            continue;
        }
        escaped = false;
        term.push(c);
    }
    term
}
