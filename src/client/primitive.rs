use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// The kinds of primitive the service hosts. Used as the scope part of a
/// primitive's identity on the server.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum PrimitiveType {
    Election,
    Lock,
    Map,
}

impl PrimitiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimitiveType::Election => "election",
            PrimitiveType::Lock => "lock",
            PrimitiveType::Map => "map",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a primitive instance: `(namespace, scope, name)`.
///
/// Only `name` takes part in partition routing, so the same name in two
/// scopes lands on the same partition. The full tuple is what the server uses
/// to look the instance up.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub struct Name {
    pub namespace: String,
    pub scope: String,
    pub name: String,
}

impl Name {
    pub fn new(
        namespace: impl Into<String>,
        scope: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.scope, self.name)
    }
}
