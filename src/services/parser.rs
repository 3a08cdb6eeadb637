// src/services/parser.rs

//! Content parsers.
//!
//! A parser turns the raw bytes of a fetched document into text. Sources name
//! their parser by id; the registry resolves it at fetch time.

use std::collections::HashMap;
use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};

use crate::error::{AppError, FetchError, Result};
use crate::models::ParserDefinition;
use crate::utils::text;

/// Elements whose text is never part of the document content.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Elements that start a new line of text.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "footer",
    "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol", "p", "pre",
    "section", "table", "td", "th", "tr", "ul",
];

/// Converts a raw payload into text.
pub trait Parser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> std::result::Result<String, FetchError>;
}

/// Decodes the payload as UTF-8 text.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextParser;

impl Parser for TextParser {
    fn parse(&self, raw: &[u8]) -> std::result::Result<String, FetchError> {
        Ok(text::decode(raw))
    }
}

/// Extracts the visible text of an HTML document.
///
/// Without a selector the whole `<body>` is used; with one, the text of
/// every matching element is concatenated in document order.
#[derive(Debug, Clone)]
pub struct HtmlParser {
    selector: Option<Selector>,
}

impl HtmlParser {
    /// Parser for the document body.
    pub fn body() -> Self {
        Self { selector: None }
    }

    /// Parser restricted to elements matching `selector`.
    pub fn with_selector(selector: &str) -> Result<Self> {
        let parsed =
            Selector::parse(selector).map_err(|e| AppError::selector(selector, format!("{e:?}")))?;
        Ok(Self {
            selector: Some(parsed),
        })
    }

    fn element_text(element: ElementRef<'_>, out: &mut String) {
        for node in element.descendants() {
            if let Some(el) = node.value().as_element() {
                if BLOCK_ELEMENTS.contains(&el.name()) {
                    out.push('\n');
                }
                continue;
            }
            let Some(fragment) = node.value().as_text() else {
                continue;
            };
            let skipped = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()))
            });
            if !skipped {
                out.push_str(fragment);
            }
        }
    }
}

impl Parser for HtmlParser {
    fn parse(&self, raw: &[u8]) -> std::result::Result<String, FetchError> {
        let source = text::decode(raw);
        let document = Html::parse_document(&source);
        let mut out = String::new();

        match &self.selector {
            Some(selector) => {
                let mut matched = false;
                for element in document.select(selector) {
                    matched = true;
                    Self::element_text(element, &mut out);
                    out.push('\n');
                }
                if !matched {
                    return Err(FetchError::Parse(
                        "selector matched no elements".to_string(),
                    ));
                }
            }
            None => {
                let body = Selector::parse("body")
                    .map_err(|e| FetchError::Parse(format!("{e:?}")))?;
                match document.select(&body).next() {
                    Some(element) => Self::element_text(element, &mut out),
                    None => Self::element_text(document.root_element(), &mut out),
                }
            }
        }
        Ok(out)
    }
}

/// Parsers keyed by id.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn Parser>>,
}

impl ParserRegistry {
    /// Registry with the built-in `text` and `html` parsers.
    pub fn new() -> Self {
        let mut parsers: HashMap<String, Arc<dyn Parser>> = HashMap::new();
        parsers.insert("text".to_string(), Arc::new(TextParser));
        parsers.insert("html".to_string(), Arc::new(HtmlParser::body()));
        Self { parsers }
    }

    /// Built-ins plus the selector parsers declared in configuration.
    pub fn from_definitions(definitions: &[ParserDefinition]) -> Result<Self> {
        let mut registry = Self::new();
        for def in definitions {
            registry.register(&def.id, HtmlParser::with_selector(&def.selector)?);
        }
        Ok(registry)
    }

    /// Add or replace a parser.
    pub fn register(&mut self, id: &str, parser: impl Parser + 'static) {
        self.parsers.insert(id.to_string(), Arc::new(parser));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Parser>> {
        self.parsers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parsers.contains_key(id)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
