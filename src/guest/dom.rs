//! Minimal DOM model of the guest document, enough for render output
//! and for the capture pipeline (clone, redact, serialize as XHTML).
use quick_xml::escape::escape;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl From<Element> for Node {
    fn from(element: Element) -> Self {
        Node::Element(element)
    }
}

impl From<&str> for Node {
    fn from(text: &str) -> Self {
        Node::Text(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag.eq_ignore_ascii_case(tag)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attrs.push((name.to_ascii_lowercase(), value.to_string())),
        }
    }

    /// Replaces all children with a single text node.
    pub fn set_text_content(&mut self, text: &str) {
        self.children = vec![Node::Text(text.to_string())];
    }

    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }

    pub fn find_by_id_mut(&mut self, id: &str) -> Option<&mut Element> {
        if self.attr("id") == Some(id) {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| match child {
            Node::Element(e) => e.find_by_id_mut(id),
            Node::Text(_) => None,
        })
    }

    /// Descendants (excluding `self`) with the given tag, in document order.
    pub fn descendants_by_tag(&self, tag: &str) -> Vec<&Element> {
        let mut out = Vec::new();
        self.walk_tag(tag, &mut out);
        out
    }

    fn walk_tag<'a>(&'a self, tag: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if let Node::Element(e) = child {
                if e.is(tag) {
                    out.push(e);
                }
                e.walk_tag(tag, out);
            }
        }
    }

    /// Visits every text node whose ancestors (up to and including
    /// `self`) pass `keep`.
    pub fn for_each_text_mut(&mut self, keep: &dyn Fn(&Element) -> bool, f: &mut dyn FnMut(&mut String)) {
        if !keep(self) {
            return;
        }
        for child in &mut self.children {
            match child {
                Node::Text(t) => f(t),
                Node::Element(e) => e.for_each_text_mut(keep, f),
            }
        }
    }

    /// Replaces the n-th descendant `tag` element (document order) by
    /// `replacement`. Returns false if there is no such element.
    pub fn replace_nth_descendant(&mut self, tag: &str, n: usize, replacement: Element) -> bool {
        let mut seen = 0;
        self.replace_nth_inner(tag, n, &mut seen, &mut Some(replacement))
    }

    fn replace_nth_inner(
        &mut self,
        tag: &str,
        n: usize,
        seen: &mut usize,
        replacement: &mut Option<Element>,
    ) -> bool {
        for child in &mut self.children {
            if let Node::Element(e) = child {
                if e.is(tag) {
                    if *seen == n {
                        if let Some(r) = replacement.take() {
                            *e = r;
                            return true;
                        }
                        return false;
                    }
                    *seen += 1;
                }
                if e.replace_nth_inner(tag, n, seen, replacement) {
                    return true;
                }
            }
        }
        false
    }

    /// Serializes as XHTML, suitable for an SVG `foreignObject`.
    pub fn to_xhtml(&self) -> String {
        let mut out = String::new();
        self.write_xhtml(&mut out);
        out
    }

    fn write_xhtml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Text(t) => out.push_str(&escape(t.as_str())),
                Node::Element(e) => e.write_xhtml(out),
            }
        }
        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }
}
