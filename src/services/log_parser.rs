use roxmltree::{Document, Node};
use std::path::Path;

use crate::error::LineageError;

pub const DEST_PATH_FIELD: &str = "extProperties/entry/destFilePath";
pub const SQL_FIELD: &str = "extProperties/entry/filterSQL";
pub const RUN_DATE_FIELD: &str = "curRunDate";

/// Fields of one execution log needed to build lineage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLogFields {
    pub dest_path: String,
    pub sql: String,
    /// Raw run date; callers requiring a number parse it themselves
    pub run_date: Option<String>,
}

/// Reads the XML execution logs written by the workflow engine
pub struct XmlLogParser;

impl XmlLogParser {
    pub fn parse_file(path: &Path) -> Result<ParsedLogFields, LineageError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LineageError::LogUnavailable(format!("Cannot read log {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content).map_err(|e| match e {
            LineageError::LogParse(msg) => {
                LineageError::LogParse(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    pub fn parse_str(xml: &str) -> Result<ParsedLogFields, LineageError> {
        let doc = Document::parse(xml)
            .map_err(|e| LineageError::LogParse(format!("Malformed log document: {}", e)))?;

        let dest_path = Self::required(&doc, DEST_PATH_FIELD)?;
        let sql = Self::required(&doc, SQL_FIELD)?;
        let run_date = Self::field(&doc, RUN_DATE_FIELD);

        Ok(ParsedLogFields {
            dest_path,
            sql,
            run_date,
        })
    }

    fn required(doc: &Document, path: &str) -> Result<String, LineageError> {
        Self::field(doc, path)
            .ok_or_else(|| LineageError::LogParse(format!("Missing required field {}", path)))
    }

    /// Text of the first element under the root matching `path` that is not blank.
    /// A leading segment naming the root element itself is accepted.
    pub fn field(doc: &Document, path: &str) -> Option<String> {
        let root = doc.root_element();
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() > 1 && segments[0] == root.tag_name().name() {
            segments.remove(0);
        }

        let mut current: Vec<Node> = vec![root];
        for segment in segments {
            current = current
                .iter()
                .flat_map(|node| node.children())
                .filter(|child| child.is_element() && child.tag_name().name() == segment)
                .collect();
            if current.is_empty() {
                return None;
            }
        }

        current.iter().find_map(|node| {
            let text: String = node
                .descendants()
                .filter(|n| n.is_text())
                .filter_map(|n| n.text())
                .collect();
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        })
    }
}
