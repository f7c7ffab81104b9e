//! Minimal XML writing helpers for fixed-schema documents.

/// Escape text for use in element content and attribute values.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // XML 1.0 forbids most C0 controls even when escaped
            c if (c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r') => {}
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`] for the five predefined entities.
pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Appends namespaced elements to a buffer, one per line.
pub(crate) struct XmlWriter {
    prefix: &'static str,
    buf: String,
}

impl XmlWriter {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            buf: String::with_capacity(2048),
        }
    }

    pub fn raw(&mut self, text: &str) -> &mut Self {
        self.buf.push_str(text);
        self
    }

    pub fn open(&mut self, name: &str) -> &mut Self {
        self.buf.push('<');
        self.buf.push_str(self.prefix);
        self.buf.push(':');
        self.buf.push_str(name);
        self.buf.push_str(">\n");
        self
    }

    pub fn close(&mut self, name: &str) -> &mut Self {
        self.buf.push_str("</");
        self.buf.push_str(self.prefix);
        self.buf.push(':');
        self.buf.push_str(name);
        self.buf.push_str(">\n");
        self
    }

    /// Leaf element with escaped text content.
    pub fn text(&mut self, name: &str, value: &str) -> &mut Self {
        let value = escape(value);
        self.buf.push_str(&format!(
            "<{p}:{name}>{value}</{p}:{name}>\n",
            p = self.prefix
        ));
        self
    }

    /// The document, without the trailing newline.
    pub fn finish(mut self) -> String {
        while self.buf.ends_with('\n') {
            self.buf.pop();
        }
        self.buf
    }
}
