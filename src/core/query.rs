use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::error::{invalid_argument, ReplicaResult};
use crate::model::{Document, DocumentKey, FieldPath, IntoFieldPath, ResourcePath};
use crate::value::{compare_values, ArrayValue, Value, ValueKind};

/// Orders two documents the way a query sorts its results.
pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::NotEqual
                | FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotIn
        )
    }

    fn requires_array_operand(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContainsAny | FilterOperator::In | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: Value,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: Value) -> ReplicaResult<Self> {
        if operator.requires_array_operand() {
            match value.kind() {
                ValueKind::Array(array) if !array.values().is_empty() => {}
                _ => {
                    return Err(invalid_argument(format!(
                        "Filter '{}' on '{field}' requires a non-empty array",
                        operator.as_str()
                    )))
                }
            }
        }
        if field.is_key_path() {
            if operator.requires_array_operand() || operator == FilterOperator::ArrayContains {
                return Err(invalid_argument(format!(
                    "Filter '{}' is not supported on the document key",
                    operator.as_str()
                )));
            }
            if !matches!(value.kind(), ValueKind::Reference(_)) {
                return Err(invalid_argument("Document key filters require a reference"));
            }
        }
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn matches(&self, document: &Document) -> bool {
        match field_value(document, &self.field) {
            Some(value) => evaluate_filter(self, &value),
            None => false,
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            self.value.canonical_id()
        )
    }
}

fn evaluate_filter(filter: &FieldFilter, value: &Value) -> bool {
    let operand = filter.value();
    match filter.operator() {
        FilterOperator::Equal => value.equals(operand),
        FilterOperator::NotEqual => !value.is_null() && !value.equals(operand),
        FilterOperator::LessThan => compare_same_type(value, operand) == Some(Ordering::Less),
        FilterOperator::LessThanOrEqual => matches!(
            compare_same_type(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::GreaterThan => {
            compare_same_type(value, operand) == Some(Ordering::Greater)
        }
        FilterOperator::GreaterThanOrEqual => matches!(
            compare_same_type(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::ArrayContains => match value.kind() {
            ValueKind::Array(array) => array.contains(operand),
            _ => false,
        },
        FilterOperator::ArrayContainsAny => match (value.kind(), operand.kind()) {
            (ValueKind::Array(array), ValueKind::Array(needles)) => {
                array_contains_any(array, needles)
            }
            _ => false,
        },
        FilterOperator::In => match operand.kind() {
            ValueKind::Array(values) => values.contains(value),
            _ => false,
        },
        FilterOperator::NotIn => match operand.kind() {
            ValueKind::Array(values) => !value.is_null() && !values.contains(value),
            _ => false,
        },
    }
}

/// Range filters only match values of the operand's type class.
fn compare_same_type(value: &Value, operand: &Value) -> Option<Ordering> {
    let same_class = match (value.kind(), operand.kind()) {
        (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => true,
        _ => value.is_number() && operand.is_number(),
    };
    if !same_class || value.is_nan() || operand.is_nan() {
        return None;
    }
    Some(compare_values(value, operand))
}

fn array_contains_any(array: &ArrayValue, needles: &ArrayValue) -> bool {
    needles.values().iter().any(|needle| array.contains(needle))
}

/// Reads a filter or ordering field; the key path resolves to a reference.
fn field_value(document: &Document, field: &FieldPath) -> Option<Value> {
    if field.is_key_path() {
        return Some(Value::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_path() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LimitType {
    #[default]
    First,
    Last,
}

/// A path plus filters, ordering and an optional limit.
///
/// Queries with equal [`Query::canonical_id`] share one view and one target.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
}

impl Query {
    /// Query over the documents directly under the collection at `path`.
    pub fn collection(path: &str) -> ReplicaResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Collection paths must have an odd number of segments, got '{path}'"
            )));
        }
        Ok(Self::at_path(path))
    }

    /// Query matching the single document `key`.
    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
        }
    }

    pub fn filter(
        mut self,
        field: impl IntoFieldPath,
        operator: FilterOperator,
        value: Value,
    ) -> ReplicaResult<Self> {
        if self.is_document_query() {
            return Err(invalid_argument("Single-document queries cannot be filtered"));
        }
        let filter = FieldFilter::new(field.into_field_path()?, operator, value)?;
        self.filters.push(filter);
        Ok(self)
    }

    pub fn order_by(mut self, field: impl IntoFieldPath, direction: Direction) -> ReplicaResult<Self> {
        if self.is_document_query() {
            return Err(invalid_argument("Single-document queries cannot be ordered"));
        }
        self.explicit_order_by
            .push(OrderBy::new(field.into_field_path()?, direction));
        Ok(self)
    }

    pub fn limit(self, limit: u32) -> ReplicaResult<Self> {
        self.with_limit(limit, LimitType::First)
    }

    pub fn limit_to_last(self, limit: u32) -> ReplicaResult<Self> {
        if self.explicit_order_by.is_empty() {
            return Err(invalid_argument(
                "limit_to_last requires at least one explicit order_by",
            ));
        }
        self.with_limit(limit, LimitType::Last)
    }

    fn with_limit(mut self, limit: u32, limit_type: LimitType) -> ReplicaResult<Self> {
        if limit == 0 {
            return Err(invalid_argument("Query limits must be positive"));
        }
        self.limit = Some(limit);
        self.limit_type = limit_type;
        Ok(self)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit_value(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.filters.is_empty()
    }

    /// The explicit ordering, preceded by the first inequality field when
    /// no explicit ordering exists, and always ending on the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(filter) = self
                .filters
                .iter()
                .find(|filter| filter.operator().is_inequality() && !filter.field().is_key_path())
            {
                order_by.push(OrderBy::new(filter.field().clone(), Direction::Ascending));
            }
        }
        if !order_by.iter().any(|order| order.field().is_key_path()) {
            let direction = order_by
                .last()
                .map(OrderBy::direction)
                .unwrap_or_default();
            order_by.push(OrderBy::new(FieldPath::key_path(), direction));
        }
        order_by
    }

    /// Equality filter on `field`, used to pick a client-side index.
    pub fn equality_filter_on(&self, field: &FieldPath) -> Option<&Value> {
        self.filters
            .iter()
            .find(|filter| filter.operator() == FilterOperator::Equal && filter.field() == field)
            .map(FieldFilter::value)
    }

    /// Whether `key` lives where this query looks, ignoring filters.
    pub fn matches_path(&self, key: &DocumentKey) -> bool {
        if DocumentKey::is_document_key(&self.path) {
            key.path() == &self.path
        } else {
            self.path.is_immediate_parent_of(key.path())
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.is_found()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_key_path() || document.field(order.field()).is_some())
    }

    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if !self.filters.is_empty() {
            let filters: Vec<String> = self.filters.iter().map(FieldFilter::canonical_id).collect();
            id.push_str(&format!("|f:{}", filters.join(",")));
        }
        let order_by: Vec<String> = self
            .normalized_order_by()
            .iter()
            .map(|order| {
                let direction = match order.direction() {
                    Direction::Ascending => "asc",
                    Direction::Descending => "desc",
                };
                format!("{}{direction}", order.field().canonical_string())
            })
            .collect();
        id.push_str(&format!("|ob:{}", order_by.join(",")));
        if let Some(limit) = self.limit {
            let kind = match self.limit_type {
                LimitType::First => "f",
                LimitType::Last => "l",
            };
            id.push_str(&format!("|l:{limit}|lt:{kind}"));
        }
        id
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}
