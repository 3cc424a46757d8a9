//! Flat-tag and key/value extraction for vendor payloads
//!
//! Cameras reply with small XML fragments, `key=value` lines or
//! `var name="value";` scripts. None of them need a real parser.

/// Text of the first `<tag>...</tag>`, namespace-agnostic (`<tt:tag>` matches)
pub fn extract_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = find_open(xml, tag)?;
    let after = &xml[open..];
    let gt = after.find('>')?;
    if after[..gt].ends_with('/') {
        return None;
    }
    let content = &after[gt + 1..];
    let end = content.find("</")?;
    Some(content[..end].trim())
}

/// Every `<tag>...</tag>` block, including nested markup
pub fn extract_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let mut blocks = Vec::new();
    let close = format!("{}>", tag);
    let mut rest = xml;
    while let Some(open) = find_open(rest, tag) {
        let after_open = &rest[open..];
        let Some(gt) = after_open.find('>') else {
            break;
        };
        let inner = &after_open[gt + 1..];
        let Some((end, resume)) = find_close(inner, &close) else {
            break;
        };
        blocks.push(&inner[..end]);
        rest = &inner[resume..];
    }
    blocks
}

fn find_open(xml: &str, tag: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = xml[from..].find(tag) {
        let idx = from + rel;
        let before = &xml[..idx];
        let after = &xml[idx + tag.len()..];
        let boundary = after.starts_with(['>', '/']) || after.starts_with(char::is_whitespace);
        let opens = before.ends_with('<')
            || (before.ends_with(':')
                && before
                    .rfind('<')
                    .map(|lt| !before[lt..].contains(|c: char| c.is_whitespace() || c == '/'))
                    .unwrap_or(false));
        if opens && boundary {
            return Some(before.rfind('<').unwrap_or(idx));
        }
        from = idx + tag.len();
    }
    None
}

/// Start of the closing tag and the offset just past it
fn find_close(xml: &str, close: &str) -> Option<(usize, usize)> {
    let mut from = 0;
    while let Some(rel) = xml[from..].find(close) {
        let idx = from + rel;
        let before = &xml[..idx];
        if let Some(lt) = before.rfind("</") {
            if !before[lt..].contains('>') {
                return Some((lt, idx + close.len()));
            }
        }
        from = idx + close.len();
    }
    None
}

/// Attribute value inside the first `<tag ...>` start tag
pub fn extract_attribute<'a>(xml: &'a str, tag: &str, attr: &str) -> Option<&'a str> {
    let open = find_open(xml, tag)?;
    let start_tag = &xml[open..open + xml[open..].find('>')?];
    attribute_in(start_tag, attr)
}

/// Attribute value within one start-tag text such as `<tt:SimpleItem Name="x">`
pub fn attribute_in<'a>(start_tag: &'a str, attr: &str) -> Option<&'a str> {
    let pattern = format!("{}=", attr);
    let mut from = 0;
    while let Some(rel) = start_tag[from..].find(&pattern) {
        let idx = from + rel;
        from = idx + pattern.len();
        if idx > 0 && !start_tag[..idx].ends_with(char::is_whitespace) {
            continue;
        }
        let value = &start_tag[from..];
        let quote = value.chars().next()?;
        if quote != '"' && quote != '\'' {
            continue;
        }
        let value = &value[1..];
        let end = value.find(quote)?;
        return Some(&value[..end]);
    }
    None
}

/// Value of `key=` up to the end of its line or a `;`
pub fn extract_kv<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("{}=", key);
    let start = body.find(&pattern)? + pattern.len();
    let rest = &body[start..];
    let end = rest.find(['\r', '\n', ';', '&']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Instar style `var name="value";`
pub fn extract_var<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let pattern = format!("var {}=\"", name);
    let start = body.find(&pattern)? + pattern.len();
    let rest = &body[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Copy of `xml` with the first `<tag>` content replaced
pub fn replace_tag(xml: &str, tag: &str, value: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(format!("{}{}{}", &xml[..start], value, &xml[end..]))
}

/// "true"/"1"/"on"/"active" style flags
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" | "active" => Some(true),
        "false" | "0" | "off" | "no" | "inactive" => Some(false),
        _ => None,
    }
}
