use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Generic protocol node. Encoding it onto the wire is the connection's job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stanza {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub content: Content,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    #[default]
    None,
    Children(Vec<Stanza>),
    Bytes(#[serde(with = "crate::codec::b64")] Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StanzaError {
    pub code: u16,
    pub text: String,
}

impl Stanza {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            content: Content::None,
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn children(mut self, children: Vec<Stanza>) -> Self {
        self.content = Content::Children(children);
        self
    }

    pub fn bytes(mut self, bytes: Vec<u8>) -> Self {
        self.content = Content::Bytes(bytes);
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Appends a child, converting empty or byte content into a child list.
    pub fn push_child(&mut self, child: Stanza) {
        match &mut self.content {
            Content::Children(children) => children.push(child),
            _ => self.content = Content::Children(vec![child]),
        }
    }

    pub fn all_children(&self) -> &[Stanza] {
        match &self.content {
            Content::Children(children) => children,
            _ => &[],
        }
    }

    pub fn child(&self, tag: &str) -> Option<&Stanza> {
        self.all_children().iter().find(|c| c.tag == tag)
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Stanza> + 'a {
        self.all_children().iter().filter(move |c| c.tag == tag)
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            Content::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Reads the `error` child a server attaches to a failed response.
    pub fn error(&self) -> Option<StanzaError> {
        let node = self.child("error")?;
        let code = node
            .get_attr("code")
            .and_then(|c| c.parse::<u16>().ok())
            .unwrap_or(500);
        Some(StanzaError {
            code,
            text: node.get_attr("text").unwrap_or_default().to_string(),
        })
    }
}
