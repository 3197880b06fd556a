//! Text STOMP 1.2 frames, just enough for the presence broker.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value wins, as STOMP requires for repeated headers.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = !matches!(self.command.as_str(), "CONNECT" | "CONNECTED");
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parses one frame. Returns `Ok(None)` for a heart-beat (bare EOLs).
    pub fn decode(raw: &str) -> Result<Option<Self>> {
        let raw = raw
            .trim_start_matches(['\r', '\n'])
            .trim_end_matches(['\r', '\n']);
        if raw.is_empty() || raw == "\0" {
            return Ok(None);
        }
        let raw = raw.strip_suffix('\0').unwrap_or(raw);

        let (head, body) = match raw.find("\n\n") {
            Some(pos) => (&raw[..pos], &raw[pos + 2..]),
            None => match raw.find("\r\n\r\n") {
                Some(pos) => (&raw[..pos], &raw[pos + 4..]),
                None => (raw, ""),
            },
        };

        let mut lines = head.lines();
        let command = lines
            .next()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::MalformedMessage("STOMP frame without command".to_string()))?
            .to_string();
        let escape = command != "CONNECTED";

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line.split_once(':').ok_or_else(|| {
                Error::MalformedMessage(format!("bad STOMP header line {:?}", line))
            })?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: body.to_string(),
        };
        if let Some(len) = frame.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
            if len <= frame.body.len() && frame.body.is_char_boundary(len) {
                frame.body.truncate(len);
            }
        }
        Ok(Some(frame))
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(Error::MalformedMessage(format!(
                    "invalid STOMP escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
