//! Symbol lookups on top of the engine.
//!
//! Every `load_*` method takes the symbols a user typed, creates one symbol
//! ref per distinct symbol and resolves their `object` hardpoint in a single
//! batch. Symbols that name nothing map to `None`.

use std::collections::BTreeMap;

use crate::core::RefId;
use crate::engine::Engine;
use crate::error::{SymbolError, UsageError};
use crate::refs::{CommitSymbolRef, ObjectKind, ObjectSymbolRef, Ref};

pub type SymbolMap = BTreeMap<String, Option<RefId>>;

pub struct SymbolEngine<'a> {
    engine: &'a mut Engine,
}

impl<'a> SymbolEngine<'a> {
    pub fn new(engine: &'a mut Engine) -> Self {
        Self { engine }
    }

    /// Resolves commit symbols such as `HEAD`, a branch or a hash prefix to
    /// [`crate::refs::CommitRef`]s.
    pub fn load_commits_for_symbols<I, S>(&mut self, symbols: I) -> Result<SymbolMap, SymbolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.load(symbols, CommitSymbolRef::OBJECT, |symbol: &str| {
            CommitSymbolRef::new(symbol)
        })
    }

    /// Resolves `D123` style symbols to [`crate::refs::RevisionRef`]s.
    pub fn load_revisions_for_symbols<I, S>(&mut self, symbols: I) -> Result<SymbolMap, SymbolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.load_objects(ObjectKind::Revision, symbols)
    }

    pub fn load_users_for_symbols<I, S>(&mut self, symbols: I) -> Result<SymbolMap, SymbolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.load_objects(ObjectKind::User, symbols)
    }

    pub fn load_files_for_symbols<I, S>(&mut self, symbols: I) -> Result<SymbolMap, SymbolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.load_objects(ObjectKind::File, symbols)
    }

    pub fn load_pastes_for_symbols<I, S>(&mut self, symbols: I) -> Result<SymbolMap, SymbolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.load_objects(ObjectKind::Paste, symbols)
    }

    fn load_objects<I, S>(&mut self, kind: ObjectKind, symbols: I) -> Result<SymbolMap, SymbolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.load(symbols, ObjectSymbolRef::OBJECT, |symbol: &str| {
            ObjectSymbolRef::parse(kind, symbol)
        })
    }

    /// Parses every symbol before anything runs, so a typo fails fast.
    fn load<I, S, R, F>(&mut self, symbols: I, key: &str, parse: F) -> Result<SymbolMap, SymbolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        R: Ref,
        F: Fn(&str) -> Result<R, UsageError>,
    {
        let parsed = symbols
            .into_iter()
            .map(|symbol| {
                let symbol = symbol.as_ref().to_string();
                let object = parse(&symbol)?;
                Ok((symbol, object))
            })
            .collect::<Result<Vec<_>, UsageError>>()?;

        let mut ids = Vec::with_capacity(parsed.len());
        let mut named = Vec::with_capacity(parsed.len());
        for (symbol, object) in parsed {
            let id = self.engine.insert(object);
            ids.push(id);
            named.push((symbol, id));
        }

        self.engine.resolve(&ids, &[key])?;

        named
            .into_iter()
            .map(|(symbol, id)| {
                let value = self.engine.hardpoint(id, key)?;
                Ok((symbol, value.as_ref_id()))
            })
            .collect()
    }
}
