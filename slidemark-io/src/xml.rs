//! ASAP 标注文件用到的 XML 子集：元素、属性、文本、注释、处理指令。
//! 不支持命名空间与 DTD 实体声明。

use std::borrow::Cow;
use std::fmt;

/// 单个属性值允许的最大字节数，超出视为损坏文件。
pub(crate) const MAX_ATTRIBUTE_LENGTH: usize = 4096;

#[derive(Debug)]
pub(crate) struct XmlError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "第 {} 行: {}", self.line, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
}

impl XmlElement {
    pub(crate) fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum XmlEvent {
    Start(XmlElement),
    /// 自闭合元素 `<x/>`，不会再产生对应的 `End`。
    Empty(XmlElement),
    End(String),
    Text(String),
}

/// 按顺序吐出事件的流式读取器，同时校验标签配对。
pub(crate) struct XmlReader<'a> {
    source: &'a str,
    position: usize,
    line: usize,
    open: Vec<String>,
    root_seen: bool,
}

impl<'a> XmlReader<'a> {
    pub(crate) fn new(source: &'a str) -> Self {
        let source = source.strip_prefix('\u{feff}').unwrap_or(source);
        Self {
            source,
            position: 0,
            line: 1,
            open: Vec::new(),
            root_seen: false,
        }
    }

    #[inline]
    pub(crate) fn line(&self) -> usize {
        self.line
    }

    /// 读到文件末尾返回 `Ok(None)`；仍有未闭合元素时报错。
    pub(crate) fn next_event(&mut self) -> Result<Option<XmlEvent>, XmlError> {
        loop {
            let source = self.source;
            let rest = &source[self.position..];
            if rest.is_empty() {
                if let Some(name) = self.open.last() {
                    return Err(self.error(format!("文件在 <{name}> 闭合之前结束")));
                }
                return Ok(None);
            }

            if rest.starts_with("<?") {
                self.skip_past("?>", "处理指令")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->", "注释")?;
            } else if let Some(body) = rest.strip_prefix("<![CDATA[") {
                let end = body
                    .find("]]>")
                    .ok_or_else(|| self.error("CDATA 段未闭合"))?;
                self.require_open("CDATA")?;
                let text = body[..end].to_string();
                self.advance("<![CDATA[".len() + end + "]]>".len());
                return Ok(Some(XmlEvent::Text(text)));
            } else if rest.starts_with("<!") {
                self.skip_past(">", "声明")?;
            } else if rest.starts_with("</") {
                return self.read_end_tag().map(Some);
            } else if rest.starts_with('<') {
                return self.read_start_tag().map(Some);
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                let trimmed = rest[..end].trim();
                if trimmed.is_empty() {
                    self.advance(end);
                    continue;
                }
                self.require_open("文本")?;
                let text = decode_entities(trimmed).map_err(|message| self.error(message))?;
                self.advance(end);
                return Ok(Some(XmlEvent::Text(text)));
            }
        }
    }

    fn read_end_tag(&mut self) -> Result<XmlEvent, XmlError> {
        let source = self.source;
        let rest = &source[self.position..];
        let close = rest
            .find('>')
            .ok_or_else(|| self.error("结束标签未闭合"))?;
        let name = rest[2..close].trim();
        match self.open.last() {
            Some(open) if open == name => {}
            Some(open) => {
                return Err(self.error(format!("结束标签 </{name}> 与 <{open}> 不匹配")));
            }
            None => return Err(self.error(format!("多余的结束标签 </{name}>"))),
        }
        self.open.pop();
        self.advance(close + 1);
        Ok(XmlEvent::End(name.to_string()))
    }

    fn read_start_tag(&mut self) -> Result<XmlEvent, XmlError> {
        if self.open.is_empty() && self.root_seen {
            return Err(self.error("存在多个根元素"));
        }
        let source = self.source;
        let rest = &source[self.position..];
        let bytes = rest.as_bytes();

        let name_end = scan_name(rest, 1);
        let name = &rest[1..name_end];
        if name.is_empty() {
            return Err(self.error("标签缺少元素名"));
        }

        let mut cursor = name_end;
        let mut attributes: Vec<(String, String)> = Vec::new();
        let self_closing = loop {
            cursor = skip_whitespace(rest, cursor);
            match bytes.get(cursor) {
                None => return Err(self.error(format!("<{name}> 标签未闭合"))),
                Some(b'>') => {
                    cursor += 1;
                    break false;
                }
                Some(b'/') => {
                    if bytes.get(cursor + 1) != Some(&b'>') {
                        return Err(self.error(format!("<{name}> 中出现意外的 '/'")));
                    }
                    cursor += 2;
                    break true;
                }
                Some(_) => {
                    let key_end = scan_name(rest, cursor);
                    if key_end == cursor {
                        return Err(self.error(format!("<{name}> 中的属性名无效")));
                    }
                    let key = &rest[cursor..key_end];
                    cursor = skip_whitespace(rest, key_end);
                    if bytes.get(cursor) != Some(&b'=') {
                        return Err(self.error(format!("属性 {key} 缺少 '='")));
                    }
                    cursor = skip_whitespace(rest, cursor + 1);
                    let quote = match bytes.get(cursor).copied() {
                        Some(q) if q == b'"' || q == b'\'' => q as char,
                        _ => return Err(self.error(format!("属性 {key} 的值缺少引号"))),
                    };
                    let value_start = cursor + 1;
                    let value_len = rest[value_start..]
                        .find(quote)
                        .ok_or_else(|| self.error(format!("属性 {key} 的值未闭合")))?;
                    if value_len > MAX_ATTRIBUTE_LENGTH {
                        return Err(self.error(format!(
                            "属性 {key} 的值超过 {MAX_ATTRIBUTE_LENGTH} 字节"
                        )));
                    }
                    let raw = &rest[value_start..value_start + value_len];
                    if raw.contains('<') {
                        return Err(self.error(format!("属性 {key} 的值中出现 '<'")));
                    }
                    if attributes.iter().any(|(existing, _)| existing == key) {
                        return Err(self.error(format!("<{name}> 中属性 {key} 重复")));
                    }
                    let value = decode_entities(raw).map_err(|message| self.error(message))?;
                    attributes.push((key.to_string(), value));
                    cursor = value_start + value_len + 1;
                }
            }
        };

        let element = XmlElement {
            name: name.to_string(),
            attributes,
        };
        self.root_seen = true;
        self.advance(cursor);
        if self_closing {
            Ok(XmlEvent::Empty(element))
        } else {
            self.open.push(element.name.clone());
            Ok(XmlEvent::Start(element))
        }
    }

    fn skip_past(&mut self, marker: &str, what: &str) -> Result<(), XmlError> {
        let source = self.source;
        match source[self.position..].find(marker) {
            Some(index) => {
                self.advance(index + marker.len());
                Ok(())
            }
            None => Err(self.error(format!("{what}未闭合"))),
        }
    }

    fn require_open(&self, what: &str) -> Result<(), XmlError> {
        if self.open.is_empty() {
            return Err(self.error(format!("根元素之外出现{what}")));
        }
        Ok(())
    }

    fn advance(&mut self, len: usize) {
        let end = self.position + len;
        self.line += self.source[self.position..end]
            .bytes()
            .filter(|byte| *byte == b'\n')
            .count();
        self.position = end;
    }

    fn error(&self, message: impl Into<String>) -> XmlError {
        XmlError {
            line: self.line,
            message: message.into(),
        }
    }
}

fn scan_name(text: &str, start: usize) -> usize {
    text[start..]
        .char_indices()
        .find(|(_, ch)| ch.is_whitespace() || matches!(ch, '=' | '/' | '>' | '<' | '"' | '\''))
        .map_or(text.len(), |(offset, _)| start + offset)
}

fn skip_whitespace(text: &str, start: usize) -> usize {
    text[start..]
        .char_indices()
        .find(|(_, ch)| !ch.is_whitespace())
        .map_or(text.len(), |(offset, _)| start + offset)
}

fn decode_entities(raw: &str) -> Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut decoded = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        decoded.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let semi = tail
            .find(';')
            .ok_or_else(|| format!("实体引用缺少 ';'（值：\"{raw}\"）"))?;
        let entity = &tail[..semi];
        let ch = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => decode_char_reference(entity)
                .ok_or_else(|| format!("无法识别的实体 &{entity};"))?,
        };
        decoded.push(ch);
        rest = &tail[semi + 1..];
    }
    decoded.push_str(rest);
    Ok(decoded)
}

fn decode_char_reference(entity: &str) -> Option<char> {
    let digits = entity.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u32>().ok()?,
    };
    char::from_u32(code)
}

/// 转义属性值中的特殊字符。
pub(crate) fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'', '\n', '\t']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\n' => escaped.push_str("&#10;"),
            '\t' => escaped.push_str("&#9;"),
            other => escaped.push(other),
        }
    }
    Cow::Owned(escaped)
}

/// 带缩进的顺序写出器。
pub(crate) struct XmlWriter {
    out: String,
    open: Vec<&'static str>,
}

impl XmlWriter {
    pub(crate) fn new() -> Self {
        Self {
            out: String::from("<?xml version=\"1.0\"?>\n"),
            open: Vec::new(),
        }
    }

    pub(crate) fn start(&mut self, name: &'static str, attributes: &[(&str, &str)]) {
        self.open_tag(name, attributes);
        self.out.push_str(">\n");
        self.open.push(name);
    }

    pub(crate) fn empty(&mut self, name: &'static str, attributes: &[(&str, &str)]) {
        self.open_tag(name, attributes);
        self.out.push_str(" />\n");
    }

    pub(crate) fn end(&mut self) {
        if let Some(name) = self.open.pop() {
            self.indent();
            self.out.push_str("</");
            self.out.push_str(name);
            self.out.push_str(">\n");
        }
    }

    pub(crate) fn finish(mut self) -> String {
        while !self.open.is_empty() {
            self.end();
        }
        self.out
    }

    fn open_tag(&mut self, name: &str, attributes: &[(&str, &str)]) {
        self.indent();
        self.out.push('<');
        self.out.push_str(name);
        for (key, value) in attributes {
            self.out.push(' ');
            self.out.push_str(key);
            self.out.push_str("=\"");
            self.out.push_str(&escape(value));
            self.out.push('"');
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.open.len() {
            self.out.push('\t');
        }
    }
}
