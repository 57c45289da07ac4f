use std::any::Any;
use std::fmt;

use serde_json::Value as Json;

use crate::core::Hardpoint;
use crate::error::UsageError;
use crate::refs::Ref;

/// Kinds of server-side objects that can be named by a short symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Revision,
    File,
    Paste,
    User,
}

impl ObjectKind {
    /// Monogram prefix, as in `D123`.
    pub fn prefix(self) -> Option<char> {
        match self {
            ObjectKind::Revision => Some('D'),
            ObjectKind::File => Some('F'),
            ObjectKind::Paste => Some('P'),
            ObjectKind::User => None,
        }
    }

    pub fn search_method(self) -> &'static str {
        match self {
            ObjectKind::Revision => "differential.revision.search",
            ObjectKind::File => "file.search",
            ObjectKind::Paste => "paste.search",
            ObjectKind::User => "user.search",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Revision => "revision",
            ObjectKind::File => "file",
            ObjectKind::Paste => "paste",
            ObjectKind::User => "user",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a symbol names its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolType {
    Id,
    Phid,
    Username,
    /// `viewer()`, the user the conduit client is authenticated as.
    Function,
}

/// A symbol naming a server-side object, like `D123`, `PHID-FILE-...` or
/// `@alice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSymbolRef {
    kind: ObjectKind,
    symbol_type: SymbolType,
    symbol: String,
}

impl ObjectSymbolRef {
    pub const OBJECT: &'static str = "object";

    const HARDPOINTS: &'static [Hardpoint] = &[Hardpoint::single(Self::OBJECT)];

    /// Parses a symbol. Malformed symbols are usage errors.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use hardpoint::refs::{ObjectKind, ObjectSymbolRef, SymbolType};
    /// let symbol = ObjectSymbolRef::parse(ObjectKind::Revision, "D42").unwrap();
    /// assert_eq!(symbol.symbol(), "42");
    /// assert_eq!(symbol.symbol_type(), SymbolType::Id);
    /// ```
    pub fn parse(kind: ObjectKind, symbol: &str) -> Result<Self, UsageError> {
        let trimmed = symbol.trim();
        if trimmed.is_empty() {
            return Err(UsageError::EmptySymbol);
        }

        let bad = || UsageError::BadSymbol {
            kind: kind.name(),
            symbol: symbol.to_string(),
        };

        if trimmed.starts_with("PHID-") {
            if trimmed.contains(char::is_whitespace) {
                return Err(bad());
            }
            return Ok(Self::from_phid(kind, trimmed));
        }

        if kind == ObjectKind::User {
            if trimmed == "viewer()" {
                return Ok(Self {
                    kind,
                    symbol_type: SymbolType::Function,
                    symbol: trimmed.to_string(),
                });
            }
            let name = trimmed.strip_prefix('@').unwrap_or(trimmed);
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(bad());
            }
            return Ok(Self {
                kind,
                symbol_type: SymbolType::Username,
                symbol: name.to_string(),
            });
        }

        let digits = match kind.prefix() {
            Some(prefix) => trimmed
                .strip_prefix(prefix)
                .or_else(|| trimmed.strip_prefix(prefix.to_ascii_lowercase()))
                .unwrap_or(trimmed),
            None => trimmed,
        };

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let id: u64 = digits.parse().map_err(|_| bad())?;

        Ok(Self {
            kind,
            symbol_type: SymbolType::Id,
            symbol: id.to_string(),
        })
    }

    pub fn from_phid(kind: ObjectKind, phid: &str) -> Self {
        Self {
            kind,
            symbol_type: SymbolType::Phid,
            symbol: phid.to_string(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn symbol_type(&self) -> SymbolType {
        self.symbol_type
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl Ref for ObjectSymbolRef {
    fn ref_type(&self) -> &'static str {
        "object symbol"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        Self::HARDPOINTS
    }

    fn identity(&self) -> Option<String> {
        Some(format!("{}:{:?}:{}", self.kind.name(), self.symbol_type, self.symbol))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A server-side object loaded over conduit: a file, a paste or a user.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRef {
    kind: ObjectKind,
    id: Option<u64>,
    phid: String,
    fields: Json,
}

impl ObjectRef {
    /// Builds a ref from one entry of a `*.search` result. Entries without a
    /// PHID are rejected.
    pub fn from_conduit(kind: ObjectKind, data: &Json) -> Option<Self> {
        let phid = data.get("phid")?.as_str()?.to_string();
        Some(Self {
            kind,
            id: data.get("id").and_then(Json::as_u64),
            phid,
            fields: data.get("fields").cloned().unwrap_or(Json::Null),
        })
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn phid(&self) -> &str {
        &self.phid
    }

    /// Display name: the object's name or username, falling back to its
    /// monogram.
    pub fn name(&self) -> String {
        ["name", "username", "title"]
            .iter()
            .find_map(|key| self.fields.get(key).and_then(Json::as_str))
            .map(str::to_string)
            .or_else(|| self.monogram())
            .unwrap_or_else(|| self.phid.clone())
    }

    pub fn monogram(&self) -> Option<String> {
        Some(format!("{}{}", self.kind.prefix()?, self.id?))
    }

    pub fn uri(&self) -> Option<&str> {
        self.fields.get("uri").and_then(Json::as_str)
    }

    pub fn fields(&self) -> &Json {
        &self.fields
    }
}

impl Ref for ObjectRef {
    fn ref_type(&self) -> &'static str {
        "object"
    }

    fn hardpoints(&self) -> &'static [Hardpoint] {
        &[]
    }

    fn identity(&self) -> Option<String> {
        Some(self.phid.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
