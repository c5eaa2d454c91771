use std::fmt::{Display, Formatter};

use crate::error::{invalid_argument, ReplicaResult};

const KEY_FIELD_NAME: &str = "__name__";

/// Dot-separated path into a document's nested maps.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new<S, I>(segments: I) -> ReplicaResult<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(invalid_argument("FieldPath must contain at least one segment"));
        }
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid_argument("FieldPath segments cannot be empty"));
        }
        Ok(Self { segments })
    }

    pub fn from_dot_separated(path: &str) -> ReplicaResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("FieldPath string cannot be empty"));
        }
        FieldPath::new(path.split('.'))
    }

    /// The pseudo-field addressing the document key in filters and orderings.
    pub fn key_path() -> Self {
        Self {
            segments: vec![KEY_FIELD_NAME.to_string()],
        }
    }

    pub fn is_key_path(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == KEY_FIELD_NAME
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(other.segments.iter()).all(|(l, r)| l == r)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// Converts common user inputs into a validated [`FieldPath`].
pub trait IntoFieldPath {
    fn into_field_path(self) -> ReplicaResult<FieldPath>;
}

impl IntoFieldPath for FieldPath {
    fn into_field_path(self) -> ReplicaResult<FieldPath> {
        Ok(self)
    }
}

impl<'a> IntoFieldPath for &'a FieldPath {
    fn into_field_path(self) -> ReplicaResult<FieldPath> {
        Ok(self.clone())
    }
}

impl IntoFieldPath for String {
    fn into_field_path(self) -> ReplicaResult<FieldPath> {
        FieldPath::from_dot_separated(&self)
    }
}

impl<'a> IntoFieldPath for &'a str {
    fn into_field_path(self) -> ReplicaResult<FieldPath> {
        FieldPath::from_dot_separated(self)
    }
}
