//! Parsing of the rsync.net usage report feed.
//!
//! The feed is an RSS 2.0 document. Account rows are `<item>` elements below
//! `<rss><channel>` whose child elements carry the usage fields:
//!
//! ```xml
//! <rss version="2.0">
//!   <channel>
//!     <item>
//!       <title>tr3289</title>
//!       <uid>tr3289</uid>
//!       <quota_gb>120</quota_gb>
//!     </item>
//!   </channel>
//! </rss>
//! ```
//!
//! Only the direct children of each item are captured. Everything else in the
//! document is read and checked for well-formedness, then discarded.

use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;

/// Expected name of the document element.
pub const ROOT_ELEMENT: &str = "rss";

const CHANNEL_ELEMENT: &str = "channel";
const ITEM_ELEMENT: &str = "item";

/// Errors raised while reading a feed document.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed XML: {0}")]
    Syntax(#[from] quick_xml::Error),

    #[error("malformed XML: invalid UTF-8 in element name: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("malformed XML: document has no root element")]
    MissingRoot,

    #[error("malformed XML: content after the root element <{0}>")]
    TrailingElement(String),

    #[error("malformed XML: text outside the root element")]
    TextOutsideRoot,

    #[error("malformed XML: document ended inside <{0}>")]
    Truncated(String),

    #[error("Got XML but with unexpected root element {0:?}")]
    UnexpectedRoot(String),
}

/// One `<item>` of the feed: its child elements by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedItem {
    fields: Vec<(String, String)>,
}

impl FeedItem {
    /// Text of the child element `name`.
    ///
    /// Returns `None` when the element is absent and `Some("")` when it is
    /// present but empty; callers decide how each case maps to a metric.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    /// Text of the child element `name`, treating an empty element as absent.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.text(name).filter(|value| !value.is_empty())
    }

    /// Record a child element. The first occurrence of a name wins.
    fn insert(&mut self, name: String, value: String) {
        if self.text(&name).is_none() {
            self.fields.push((name, value));
        }
    }
}

/// A parsed usage report feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    items: Vec<FeedItem>,
}

impl Feed {
    /// Parse a feed document.
    pub fn parse(xml: &str) -> Result<Self, FeedError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut path: Vec<String> = Vec::new();
        let mut seen_root = false;
        let mut items = Vec::new();
        let mut item: Option<FeedItem> = None;
        let mut field: Option<(String, String)> = None;
        // Set once a field has a child element; later text is tail text.
        let mut field_sealed = false;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = element_name(e.name().as_ref())?;
                    if path.is_empty() {
                        check_root(&name, &mut seen_root)?;
                    } else if is_item(&path, &name) {
                        item = Some(FeedItem::default());
                    } else if path.len() == 3 && item.is_some() {
                        field = Some((name.clone(), String::new()));
                        field_sealed = false;
                    } else if path.len() == 4 {
                        field_sealed = true;
                    }
                    path.push(name);
                }
                Event::Empty(e) => {
                    let name = element_name(e.name().as_ref())?;
                    if path.is_empty() {
                        check_root(&name, &mut seen_root)?;
                    } else if is_item(&path, &name) {
                        items.push(FeedItem::default());
                    } else if path.len() == 3
                        && let Some(item) = item.as_mut()
                    {
                        item.insert(name, String::new());
                    } else if path.len() == 4 {
                        field_sealed = true;
                    }
                }
                Event::Text(e) => {
                    if path.is_empty() && !e.iter().all(u8::is_ascii_whitespace) {
                        return Err(FeedError::TextOutsideRoot);
                    }
                    if path.len() == 4
                        && !field_sealed
                        && let Some((_, value)) = field.as_mut()
                    {
                        value.push_str(&e.unescape()?);
                    }
                }
                Event::CData(e) => {
                    if path.is_empty() {
                        return Err(FeedError::TextOutsideRoot);
                    }
                    if path.len() == 4
                        && !field_sealed
                        && let Some((_, value)) = field.as_mut()
                    {
                        value.push_str(std::str::from_utf8(&e)?);
                    }
                }
                Event::End(_) => {
                    match path.len() {
                        4 => {
                            if let (Some(item), Some((name, value))) = (item.as_mut(), field.take())
                            {
                                item.insert(name, value.trim().to_string());
                            }
                        }
                        3 => {
                            if let Some(done) = item.take() {
                                items.push(done);
                            }
                        }
                        _ => {}
                    }
                    path.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(FeedError::MissingRoot);
        }
        if let Some(open) = path.pop() {
            return Err(FeedError::Truncated(open));
        }

        Ok(Self { items })
    }

    /// All items of the feed, in document order.
    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }
}

fn element_name(raw: &[u8]) -> Result<String, FeedError> {
    Ok(std::str::from_utf8(raw)?.to_string())
}

fn check_root(name: &str, seen_root: &mut bool) -> Result<(), FeedError> {
    if *seen_root {
        return Err(FeedError::TrailingElement(name.to_string()));
    }
    *seen_root = true;
    if name != ROOT_ELEMENT {
        return Err(FeedError::UnexpectedRoot(name.to_string()));
    }
    Ok(())
}

/// Whether `name`, opened below `path`, is an `rss/channel/item` element.
fn is_item(path: &[String], name: &str) -> bool {
    path.len() == 2 && path[1] == CHANNEL_ELEMENT && name == ITEM_ELEMENT
}
