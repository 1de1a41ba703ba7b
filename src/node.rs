// Tree node capability
// The normalizer only needs child lookup, attributes and text; XmlElement is the
// per-record tree the stream processor builds and drops after each record.

/// Minimal read-only view of a hierarchical source node
pub trait RecordNode {
    /// Local element name (namespace prefix stripped)
    fn name(&self) -> &str;

    /// First child with the given local name
    fn child(&self, name: &str) -> Option<&Self>;

    /// All children with the given local name, in document order
    fn children<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a Self> + 'a>;

    fn attribute(&self, name: &str) -> Option<&str>;

    /// Direct text content; `None` when the element has no text
    fn text(&self) -> Option<&str>;

    /// Text of the first child named `name`
    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.text())
    }
}

/// Owned element tree for one record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder: add an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// Builder: set text content
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Builder: append a child element
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Append decoded character data (text may arrive in several events)
    ///
    /// Only text before the first child element counts; anything after a
    /// child is tail text and is dropped.
    pub fn push_text(&mut self, fragment: &str) {
        if fragment.is_empty() || !self.children.is_empty() {
            return;
        }
        match self.text {
            Some(ref mut text) => text.push_str(fragment),
            None => self.text = Some(fragment.to_string()),
        }
    }
}

impl RecordNode for XmlElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a Self> + 'a> {
        Box::new(self.children.iter().filter(move |c| c.name == name))
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}
