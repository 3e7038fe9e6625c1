//! List queries over mapped rows: filter, order, paginate, relay connection.
//!
//! Rows are matched on their JSON form, so any serializable mapped type with
//! a string `id` field can be queried.

use std::cmp::Ordering;
use std::collections::HashSet;

use hubkit_core::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ITEMS_PER_PAGE: usize = 10;

/// `where` argument: `field`, `field_contains`, `field_in`, `field_gt`,
/// `field_lt`, `field_eq`, and `_or: [filter, ...]`.
pub type Filter = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl Pagination {
    pub fn page(page: usize) -> Self {
        Self { page: Some(page), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self == &Pagination::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default, rename = "where", skip_serializing_if = "Map::is_empty")]
    pub filter: Filter,
    /// `{field: "asc" | "desc"}`; only the first key is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub pagination: Pagination,
}

impl ListQuery {
    /// Build from a `where` object literal; non-objects give an empty filter.
    pub fn filter(filter: Value) -> Self {
        match filter {
            Value::Object(filter) => Self { filter, ..Default::default() },
            _ => Self::default(),
        }
    }

    pub fn order_by(mut self, field: &str, direction: &str) -> Self {
        let mut order = Map::new();
        order.insert(field.to_string(), Value::String(direction.to_string()));
        self.order_by = Some(order);
        self
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

impl Order {
    pub fn parse(order: &Map<String, Value>) -> HubResult<Option<Self>> {
        let Some((field, value)) = order.iter().next() else {
            return Ok(None);
        };
        let direction = match value.as_str() {
            Some("asc") => Direction::Asc,
            Some("desc") => Direction::Desc,
            _ => {
                let shown = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                return Err(HubError::Invalid(format!("order value ({shown}) not valid. Should be 'asc' or 'desc'")));
            }
        };
        Ok(Some(Order { field: field.clone(), direction }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum PageInfo {
    Numbered {
        total_page: usize,
        current_page: usize,
    },
    Cursor {
        has_next_page: bool,
        has_previous_page: bool,
        start_cursor: Option<String>,
        end_cursor: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

struct Row<T> {
    id: String,
    json: Value,
    item: T,
}

fn rows<T: Serialize>(items: Vec<T>) -> HubResult<Vec<Row<T>>> {
    items
        .into_iter()
        .map(|item| {
            let json = serde_json::to_value(&item)?;
            let id = json.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            Ok(Row { id, json, item })
        })
        .collect()
}

/// Non-null, non-false, non-zero, non-empty-string.
fn truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(true, |f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(h), n) => h.contains(n),
        _ => false,
    }
}

enum Op<'a> {
    Is(&'a str),
    Eq(&'a str),
    Contains(&'a str),
    In(&'a str),
    Gt(&'a str),
    Lt(&'a str),
}

fn op(key: &str) -> Op<'_> {
    if let Some(f) = key.strip_suffix("_contains") {
        Op::Contains(f)
    } else if let Some(f) = key.strip_suffix("_in") {
        Op::In(f)
    } else if let Some(f) = key.strip_suffix("_gt") {
        Op::Gt(f)
    } else if let Some(f) = key.strip_suffix("_lt") {
        Op::Lt(f)
    } else if let Some(f) = key.strip_suffix("_eq") {
        Op::Eq(f)
    } else {
        Op::Is(key)
    }
}

/// Operators other than plain equality only match fields that are set.
fn matches(row: &Value, key: &str, want: &Value) -> bool {
    let field = |f: &str| row.get(f).filter(|v| truthy(Some(v)));
    match op(key) {
        Op::Is(f) => row.get(f) == Some(want),
        Op::Eq(f) => field(f) == Some(want),
        Op::Contains(f) => field(f).is_some_and(|v| contains(v, want)),
        Op::In(f) => field(f).is_some_and(|v| want.as_array().is_some_and(|list| list.contains(v))),
        Op::Gt(f) => field(f).and_then(|v| compare(v, want)) == Some(Ordering::Greater),
        Op::Lt(f) => field(f).and_then(|v| compare(v, want)) == Some(Ordering::Less),
    }
}

fn branches(want: &Value) -> HubResult<Vec<&Filter>> {
    want.as_array()
        .and_then(|list| list.iter().map(Value::as_object).collect::<Option<Vec<_>>>())
        .ok_or_else(|| HubError::Invalid("_or expects a list of filters".into()))
}

fn validate(filter: &Filter) -> HubResult<()> {
    match filter.get("_or") {
        Some(want) => branches(want)?.into_iter().try_for_each(validate),
        None => Ok(()),
    }
}

fn row_matches(row: &Value, filter: &Filter) -> bool {
    filter.iter().all(|(key, want)| match key.as_str() {
        "_or" => branches(want).is_ok_and(|list| list.into_iter().any(|b| row_matches(row, b))),
        _ => matches(row, key, want),
    })
}

/// Every clause must hold; `_or` branches are unioned and a row id is kept
/// once.
fn filter_rows<T>(mut rows: Vec<Row<T>>, filter: &Filter) -> HubResult<Vec<Row<T>>> {
    validate(filter)?;
    rows.retain(|row| row_matches(&row.json, filter));
    if filter.contains_key("_or") {
        let mut seen = HashSet::new();
        rows.retain(|row| seen.insert(row.id.clone()));
    }
    Ok(rows)
}

/// Missing and null values sort before everything else.
fn sort_rows<T>(rows: &mut [Row<T>], order: &Order) {
    rows.sort_by(|a, b| {
        let (x, y) = (a.json.get(&order.field), b.json.get(&order.field));
        let ord = match (x.filter(|v| !v.is_null()), y.filter(|v| !v.is_null())) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
        };
        match order.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    });
}

fn select<T>(rows: Vec<Row<T>>, query: &ListQuery) -> HubResult<Vec<Row<T>>> {
    let mut rows = filter_rows(rows, &query.filter)?;
    if let Some(order) = query.order_by.as_ref().map(Order::parse).transpose()?.flatten() {
        sort_rows(&mut rows, &order);
    }
    Ok(rows)
}

struct Page<T> {
    total_page: usize,
    current_page: usize,
    rows: Vec<Row<T>>,
}

fn numbered<T>(rows: Vec<Row<T>>, page: usize) -> HubResult<Page<T>> {
    if page == 0 {
        return Err(HubError::Invalid("page starts at 1".into()));
    }
    if rows.is_empty() {
        return Ok(Page { total_page: 1, current_page: 1, rows });
    }
    let total_page = rows.len().div_ceil(ITEMS_PER_PAGE);
    let rows = rows.into_iter().skip((page - 1).saturating_mul(ITEMS_PER_PAGE)).take(ITEMS_PER_PAGE).collect();
    Ok(Page { total_page, current_page: page, rows })
}

fn cursor<T>(mut rows: Vec<Row<T>>, p: &Pagination) -> Vec<Row<T>> {
    if let Some(before) = &p.before {
        let end = rows.iter().position(|r| &r.id == before).unwrap_or(rows.len());
        rows.truncate(end);
    }
    if let Some(after) = &p.after {
        let start = rows.iter().rposition(|r| &r.id == after).map_or(0, |i| i + 1);
        rows.drain(..start);
    }
    if let Some(first) = p.first {
        rows.truncate(first);
    }
    if let Some(last) = p.last {
        let skip = rows.len().saturating_sub(last);
        rows.drain(..skip);
    }
    rows
}

/// Filter, order and paginate: numbered when `page` is set, cursor-based
/// otherwise.
pub fn run<T: Serialize>(items: Vec<T>, query: &ListQuery) -> HubResult<Vec<T>> {
    let rows = select(rows(items)?, query)?;
    let out = match query.pagination.page {
        Some(page) => numbered(rows, page)?.rows,
        None => cursor(rows, &query.pagination),
    };
    Ok(out.into_iter().map(|r| r.item).collect())
}

/// Same selection as [`run`], in edges/pageInfo form.
pub fn connection<T: Serialize>(items: Vec<T>, query: &ListQuery) -> HubResult<Connection<T>> {
    let rows = select(rows(items)?, query)?;
    let edges = |rows: Vec<Row<T>>| rows.into_iter().map(|r| Edge { cursor: r.id, node: r.item }).collect();

    if let Some(page) = query.pagination.page {
        let page = numbered(rows, page)?;
        return Ok(Connection {
            page_info: PageInfo::Numbered { total_page: page.total_page, current_page: page.current_page },
            edges: edges(page.rows),
        });
    }

    let (first_id, last_id) = (rows.first().map(|r| r.id.clone()), rows.last().map(|r| r.id.clone()));
    if query.pagination.is_empty() {
        return Ok(Connection {
            page_info: PageInfo::Cursor {
                has_next_page: false,
                has_previous_page: false,
                start_cursor: first_id,
                end_cursor: last_id,
            },
            edges: edges(rows),
        });
    }

    let paged = cursor(rows, &query.pagination);
    let start_cursor = paged.first().map(|r| r.id.clone());
    let end_cursor = paged.last().map(|r| r.id.clone());
    Ok(Connection {
        page_info: PageInfo::Cursor {
            has_next_page: end_cursor.is_some() && end_cursor != last_id,
            has_previous_page: start_cursor.is_some() && start_cursor != first_id,
            start_cursor,
            end_cursor,
        },
        edges: edges(paged),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows_of(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": format!("r{i:02}"), "n": i})).collect()
    }

    fn ids(v: &[Value]) -> Vec<&str> {
        v.iter().map(|r| r["id"].as_str().unwrap_or_default()).collect()
    }

    fn sample() -> Vec<Value> {
        vec![
            json!({"id": "a", "name": "gpu-small", "cpu": 2, "tags": ["gpu"], "owner": "ops"}),
            json!({"id": "b", "name": "cpu-large", "cpu": 16, "tags": [], "owner": null}),
            json!({"id": "c", "name": "gpu-large", "cpu": 8, "tags": ["gpu", "big"], "owner": "ml"}),
        ]
    }

    #[test]
    fn field_operators() {
        let q = |f: Value| run(sample(), &ListQuery::filter(f)).expect("run");
        assert_eq!(ids(&q(json!({"id": "b"}))), ["b"]);
        assert_eq!(ids(&q(json!({"name_contains": "gpu"}))), ["a", "c"]);
        assert_eq!(ids(&q(json!({"tags_contains": "big"}))), ["c"]);
        assert_eq!(ids(&q(json!({"owner_in": ["ops", "ml"]}))), ["a", "c"]);
        assert_eq!(ids(&q(json!({"cpu_gt": 4}))), ["b", "c"]);
        assert_eq!(ids(&q(json!({"cpu_lt": 8}))), ["a"]);
        assert_eq!(ids(&q(json!({"owner_eq": "ml"}))), ["c"]);
        assert_eq!(ids(&q(json!({"name_contains": "gpu", "cpu_gt": 4}))), ["c"]);
        assert!(q(json!({"owner_eq": null})).is_empty());
    }

    #[test]
    fn or_unions_branches_once_per_id() {
        let f = json!({"_or": [{"cpu_gt": 10}, {"owner": "ops"}, {"id": "b"}]});
        let out = run(sample(), &ListQuery::filter(f)).expect("run");
        assert_eq!(ids(&out), ["a", "b"]);

        let bad = run(sample(), &ListQuery::filter(json!({"_or": {"id": "a"}}))).unwrap_err();
        assert_eq!(bad.code(), "BAD_USER_INPUT");
    }

    #[test]
    fn ordering_and_invalid_direction() {
        let out = run(sample(), &ListQuery::default().order_by("cpu", "desc")).expect("run");
        assert_eq!(ids(&out), ["b", "c", "a"]);
        let out = run(sample(), &ListQuery::default().order_by("owner", "asc")).expect("run");
        assert_eq!(ids(&out), ["b", "c", "a"]);

        let err = run(sample(), &ListQuery::default().order_by("cpu", "up")).unwrap_err();
        assert_eq!(err.to_string(), "invalid input: order value (up) not valid. Should be 'asc' or 'desc'");
    }

    #[test]
    fn numbered_pages() {
        let q = |p| ListQuery::default().paginate(Pagination::page(p));
        assert_eq!(run(rows_of(25), &q(3)).expect("run").len(), 5);
        let conn = connection(rows_of(25), &q(2)).expect("conn");
        assert_eq!(conn.page_info, PageInfo::Numbered { total_page: 3, current_page: 2 });
        assert_eq!(conn.edges[0].cursor, "r10");

        let empty = connection(Vec::<Value>::new(), &q(4)).expect("conn");
        assert_eq!(empty.page_info, PageInfo::Numbered { total_page: 1, current_page: 1 });
        assert!(run(rows_of(3), &q(0)).is_err());
    }

    #[test]
    fn page_far_past_the_end_is_empty() {
        let q = ListQuery::default().paginate(Pagination::page(usize::MAX));
        assert!(run(rows_of(3), &q).expect("run").is_empty());
        let conn = connection(rows_of(3), &q).expect("conn");
        assert_eq!(conn.page_info, PageInfo::Numbered { total_page: 1, current_page: usize::MAX });
    }

    #[test]
    fn cursor_windows() {
        let p = |f: fn(&mut Pagination)| {
            let mut p = Pagination::default();
            f(&mut p);
            ListQuery::default().paginate(p)
        };
        let out = run(rows_of(6), &p(|p| p.after = Some("r01".into()))).expect("run");
        assert_eq!(ids(&out), ["r02", "r03", "r04", "r05"]);
        let out = run(rows_of(6), &p(|p| p.before = Some("r03".into()))).expect("run");
        assert_eq!(ids(&out), ["r00", "r01", "r02"]);
        let out = run(rows_of(6), &p(|p| {
            p.after = Some("r00".into());
            p.first = Some(2);
        }))
        .expect("run");
        assert_eq!(ids(&out), ["r01", "r02"]);
        let out = run(rows_of(6), &p(|p| p.last = Some(2))).expect("run");
        assert_eq!(ids(&out), ["r04", "r05"]);
    }

    #[test]
    fn connection_page_info() {
        let all = connection(rows_of(4), &ListQuery::default()).expect("conn");
        assert_eq!(
            all.page_info,
            PageInfo::Cursor {
                has_next_page: false,
                has_previous_page: false,
                start_cursor: Some("r00".into()),
                end_cursor: Some("r03".into()),
            }
        );

        let q = ListQuery::default().paginate(Pagination { after: Some("r00".into()), first: Some(2), ..Default::default() });
        let mid = connection(rows_of(4), &q).expect("conn");
        assert_eq!(
            mid.page_info,
            PageInfo::Cursor {
                has_next_page: true,
                has_previous_page: true,
                start_cursor: Some("r01".into()),
                end_cursor: Some("r02".into()),
            }
        );
        let json = serde_json::to_value(&mid).expect("json");
        assert_eq!(json["pageInfo"]["hasNextPage"], true);
        assert_eq!(json["edges"][0]["node"]["n"], 1);
    }

    #[test]
    fn list_query_reads_graphql_style_args() {
        let q: ListQuery = serde_json::from_value(json!({
            "where": {"name_contains": "x"},
            "orderBy": {"name": "asc"},
            "page": 2,
        }))
        .expect("args");
        assert_eq!(q.pagination.page, Some(2));
        assert_eq!(q.filter["name_contains"], "x");
        assert!(q.order_by.is_some());
    }
}
