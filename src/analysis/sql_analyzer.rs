use serde::{Deserialize, Serialize};
use sqlparser::ast::{ObjectName, ObjectNamePart, Query, Statement, TableObject, Visit, Visitor};
use sqlparser::dialect::HiveDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use std::ops::ControlFlow;

use crate::error::LineageError;

/// Primary operation of an analyzed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlOperation {
    Query,
    Insert,
    Load,
    CreateTableAs,
    Unknown,
}

impl SqlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Query => "QUERY",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Load => "LOAD",
            SqlOperation::CreateTableAs => "CREATE_TABLE_AS",
            SqlOperation::Unknown => "UNKNOWN",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            SqlOperation::Insert | SqlOperation::Load | SqlOperation::CreateTableAs
        )
    }
}

/// Tables read and written by a statement, in order of first appearance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlAnalysisResult {
    pub operation: SqlOperation,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
}

impl SqlAnalysisResult {
    pub fn unknown() -> Self {
        Self {
            operation: SqlOperation::Unknown,
            sources: Vec::new(),
            destinations: Vec::new(),
        }
    }
}

/// Ordered table names, de-duplicated case-insensitively
#[derive(Debug, Default)]
struct TableSet {
    names: Vec<String>,
    seen: HashSet<String>,
}

impl TableSet {
    fn insert(&mut self, name: String) {
        if self.seen.insert(name.to_lowercase()) {
            self.names.push(name);
        }
    }
}

/// Collects every physical relation referenced by a query, skipping CTE names
struct RelationCollector<'a> {
    ctes: HashSet<String>,
    tables: &'a mut TableSet,
}

impl Visitor for RelationCollector<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let [ObjectNamePart::Identifier(ident)] = relation.0.as_slice() {
            if self.ctes.contains(&ident.value.to_lowercase()) {
                return ControlFlow::Continue(());
            }
        }
        self.tables.insert(relation.to_string());
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Default)]
struct Analysis {
    operation: Option<SqlOperation>,
    sources: TableSet,
    destinations: TableSet,
}

impl Analysis {
    /// The first write operation wins over any read
    fn classify(&mut self, operation: SqlOperation) {
        if self.operation.map_or(true, |current| !current.is_write()) {
            self.operation = Some(operation);
        }
    }

    fn collect_sources(&mut self, query: &Query) {
        let mut collector = RelationCollector {
            ctes: HashSet::new(),
            tables: &mut self.sources,
        };
        let _ = query.visit(&mut collector);
    }
}

/// Table-level lineage analysis of Hive SQL
pub struct SqlLineageAnalyzer;

impl SqlLineageAnalyzer {
    /// Analyze SQL text; anything that cannot be classified comes back as UNKNOWN
    pub fn analyze(sql: &str) -> SqlAnalysisResult {
        match Self::try_analyze(sql) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("{}", e);
                SqlAnalysisResult::unknown()
            }
        }
    }

    /// Analyze SQL text, reporting why classification was not possible
    pub fn try_analyze(sql: &str) -> Result<SqlAnalysisResult, LineageError> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(LineageError::SqlAnalysisDegraded("Empty SQL text".to_string()));
        }

        let dialect = HiveDialect {};
        let statements = match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                let load = || {
                    Self::load_target(sql).map(|target| SqlAnalysisResult {
                        operation: SqlOperation::Load,
                        sources: Vec::new(),
                        destinations: vec![target],
                    })
                };
                return load()
                    .or_else(|| Self::scan_insert(sql))
                    .ok_or_else(|| {
                        LineageError::SqlAnalysisDegraded(format!("SQL parsing error: {}", e))
                    });
            }
        };

        let mut analysis = Analysis::default();
        for stmt in &statements {
            Self::analyze_statement(stmt, &mut analysis);
        }

        match analysis.operation {
            Some(operation) => Ok(SqlAnalysisResult {
                operation,
                sources: analysis.sources.names,
                destinations: analysis.destinations.names,
            }),
            None => Err(LineageError::SqlAnalysisDegraded(format!(
                "No statement with table lineage in: {}",
                sql
            ))),
        }
    }

    fn analyze_statement(stmt: &Statement, analysis: &mut Analysis) {
        match stmt {
            Statement::Query(query) => {
                analysis.classify(SqlOperation::Query);
                analysis.collect_sources(query);
            }
            Statement::Insert(insert) => {
                analysis.classify(SqlOperation::Insert);
                if let TableObject::TableName(name) = &insert.table {
                    analysis.destinations.insert(name.to_string());
                }
                if let Some(source) = &insert.source {
                    analysis.collect_sources(source);
                }
            }
            Statement::Directory { path, source, .. } => {
                analysis.classify(SqlOperation::Insert);
                analysis.destinations.insert(path.clone());
                analysis.collect_sources(source);
            }
            Statement::CreateView(view) => {
                analysis.classify(SqlOperation::CreateTableAs);
                analysis.destinations.insert(view.name.to_string());
                analysis.collect_sources(&view.query);
            }
            Statement::CreateTable(create) => {
                // Plain DDL carries no lineage
                if let Some(query) = &create.query {
                    analysis.classify(SqlOperation::CreateTableAs);
                    analysis.destinations.insert(create.name.to_string());
                    analysis.collect_sources(query);
                }
            }
            Statement::Set(_) | Statement::Use(_) => {}
            other => match Self::load_target(&other.to_string()) {
                Some(target) => {
                    analysis.classify(SqlOperation::Load);
                    analysis.destinations.insert(target);
                }
                None => tracing::debug!("Skipping statement without table lineage: {}", other),
            },
        }
    }

    /// Target table of `LOAD DATA [LOCAL] INPATH '...' [OVERWRITE] INTO TABLE name`
    fn load_target(sql: &str) -> Option<String> {
        let tokens = Tokens::new(sql)?;
        if !(tokens.keyword_at(0, "LOAD") && tokens.keyword_at(1, "DATA")) {
            return None;
        }
        let mut pos = 2;
        if tokens.keyword_at(pos, "LOCAL") {
            pos += 1;
        }
        if !tokens.keyword_at(pos, "INPATH") {
            return None;
        }
        tokens.quoted_at(pos + 1)?;
        pos += 2;

        if tokens.keyword_at(pos, "OVERWRITE") {
            pos += 1;
        }
        if !(tokens.keyword_at(pos, "INTO") && tokens.keyword_at(pos + 1, "TABLE")) {
            return None;
        }
        tokens.table_name_at(pos + 2).map(|(name, _)| name)
    }

    /// Insert forms the parser rejects, such as the multi-insert
    /// `FROM src INSERT OVERWRITE TABLE t SELECT ..` or a directory export with `ROW FORMAT`.
    /// Tables after FROM or JOIN are sources; each INSERT target is a destination.
    fn scan_insert(sql: &str) -> Option<SqlAnalysisResult> {
        let tokens = Tokens::new(sql)?;
        if !(tokens.keyword_at(0, "FROM") || tokens.keyword_at(0, "INSERT")) {
            return None;
        }

        let mut sources = TableSet::default();
        let mut destinations = TableSet::default();
        let mut pos = 0;
        while pos < tokens.len() {
            if tokens.keyword_at(pos, "FROM") || tokens.keyword_at(pos, "JOIN") {
                if let Some((name, next)) = tokens.table_name_at(pos + 1) {
                    sources.insert(name);
                    pos = next;
                    continue;
                }
            } else if tokens.keyword_at(pos, "INSERT") {
                let mut at = pos + 1;
                while tokens.keyword_at(at, "OVERWRITE")
                    || tokens.keyword_at(at, "INTO")
                    || tokens.keyword_at(at, "LOCAL")
                {
                    at += 1;
                }
                if tokens.keyword_at(at, "TABLE") {
                    if let Some((name, next)) = tokens.table_name_at(at + 1) {
                        destinations.insert(name);
                        pos = next;
                        continue;
                    }
                } else if tokens.keyword_at(at, "DIRECTORY") {
                    if let Some(path) = tokens.quoted_at(at + 1) {
                        destinations.insert(path);
                        pos = at + 2;
                        continue;
                    }
                }
            }
            pos += 1;
        }

        if destinations.names.is_empty() {
            return None;
        }
        Some(SqlAnalysisResult {
            operation: SqlOperation::Insert,
            sources: sources.names,
            destinations: destinations.names,
        })
    }
}

/// Significant tokens of a statement that the parser could not handle
struct Tokens(Vec<Token>);

impl Tokens {
    fn new(sql: &str) -> Option<Self> {
        let dialect = HiveDialect {};
        let tokens = Tokenizer::new(&dialect, sql)
            .tokenize()
            .ok()?
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .collect();
        Some(Self(tokens))
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn keyword_at(&self, pos: usize, keyword: &str) -> bool {
        matches!(self.0.get(pos), Some(Token::Word(w))
            if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
    }

    /// Literal path; Hive tokenizes a double-quoted path as a quoted word
    fn quoted_at(&self, pos: usize) -> Option<String> {
        match self.0.get(pos) {
            Some(Token::SingleQuotedString(s)) | Some(Token::DoubleQuotedString(s)) => Some(s.clone()),
            Some(Token::Word(w)) if w.quote_style.is_some() => Some(w.value.clone()),
            _ => None,
        }
    }

    /// Dotted table name starting at `pos`, with the position after it
    fn table_name_at(&self, pos: usize) -> Option<(String, usize)> {
        let mut parts = Vec::new();
        let mut pos = pos;
        while let Some(Token::Word(w)) = self.0.get(pos) {
            parts.push(w.to_string());
            pos += 1;
            if matches!(self.0.get(pos), Some(Token::Period)) {
                pos += 1;
            } else {
                break;
            }
        }

        if parts.is_empty() {
            None
        } else {
            Some((parts.join("."), pos))
        }
    }
}
