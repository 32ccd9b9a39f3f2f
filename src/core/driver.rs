// src/core/driver.rs

//! A registry of named query templates and constants.
//!
//! Template grammar: `$N` (1-based) is replaced by argument N rendered as a quoted SQL
//! literal, and `#NAME` is replaced verbatim by the constant NAME. All failures happen
//! here, before a request is ever handed to the pool.

use crate::core::DriverError;
use crate::core::cluster::Cluster;
use crate::core::connection::SessionId;
use crate::core::cursor::Cursor;
use crate::core::request::{Pending, QueryOptions};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use tracing::debug;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([0-9]+)|#([A-Za-z_][A-Za-z0-9_]*)").expect("placeholder pattern is valid")
});

/// Renders `value` as a single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[derive(Debug, Clone, Default)]
pub struct Driver {
    templates: HashMap<String, String>,
    constants: HashMap<String, String>,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a driver from the `[queries]` and `[constants]` tables of the config file.
    pub fn from_tables(
        queries: &BTreeMap<String, String>,
        constants: &BTreeMap<String, String>,
    ) -> Self {
        let mut driver = Self::new();
        for (name, template) in queries {
            driver.register(name, template);
        }
        for (name, value) in constants {
            driver.define(name, value);
        }
        driver
    }

    /// Registers a template, replacing and returning any previous one with that name.
    pub fn register(&mut self, name: &str, template: &str) -> Option<String> {
        self.templates.insert(name.to_string(), template.to_string())
    }

    pub fn define(&mut self, name: &str, value: &str) -> Option<String> {
        self.constants.insert(name.to_string(), value.to_string())
    }

    pub fn template(&self, name: &str) -> Option<&str> {
        self.templates.get(name).map(String::as_str)
    }

    /// Registered template names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Produces the command text for template `name` with `args` substituted.
    pub fn materialize<S: AsRef<str>>(&self, name: &str, args: &[S]) -> Result<String, DriverError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| DriverError::UnknownTemplate(name.to_string()))?;

        let mut failure = None;
        let text = PLACEHOLDER.replace_all(template, |caps: &Captures| {
            match self.substitute(name, caps, args) {
                Ok(value) => value,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
        debug!("Materialized template '{}' with {} argument(s)", name, args.len());
        Ok(text.into_owned())
    }

    fn substitute<S: AsRef<str>>(
        &self,
        template: &str,
        caps: &Captures,
        args: &[S],
    ) -> Result<String, DriverError> {
        if let Some(index) = caps.get(1) {
            let missing = || DriverError::MissingArgument {
                template: template.to_string(),
                index: index.as_str().parse().unwrap_or(usize::MAX),
                supplied: args.len(),
            };
            let n: usize = index.as_str().parse().map_err(|_| missing())?;
            let arg = n.checked_sub(1).and_then(|i| args.get(i)).ok_or_else(missing)?;
            return Ok(quote_literal(arg.as_ref()));
        }
        let constant = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        self.constants
            .get(constant)
            .cloned()
            .ok_or_else(|| DriverError::UnknownConstant(constant.to_string()))
    }

    /// Materializes template `name` and submits it. Driver errors are returned before
    /// anything reaches the pool.
    pub fn query<S: AsRef<str>>(
        &self,
        cluster: &Cluster,
        name: &str,
        args: &[S],
        options: QueryOptions,
        session: Option<SessionId>,
    ) -> Result<Pending<Cursor>, DriverError> {
        let command = self.materialize(name, args)?;
        Ok(cluster.query(command, options, session))
    }
}
