//! RFC822-style header block codec.
//!
//! Headers cross the message bus as a single string: one `Name: value` line per
//! header, terminated by a blank line. Peers on the bus parse and emit this
//! exact layout, so the encoder must stay byte-compatible.

/// Encode headers into the bus header block.
///
/// Every header becomes `Name: value\n` and the block ends with a blank line.
/// An empty header set encodes to `"\n"`.
pub fn headers_to_string<'a, I>(headers: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut block = String::new();
    for (name, value) in headers {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(value);
        block.push('\n');
    }
    block.push('\n');
    block
}

/// Parse a bus header block back into ordered `(name, value)` pairs.
///
/// Accepts `\n` and `\r\n` line endings, stops at the first blank line, joins
/// folded continuation lines and skips lines without a colon. Duplicate names
/// are kept in arrival order.
pub fn parse_header_block(block: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();

    for raw_line in block.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() {
            break;
        }

        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                let folded = line.trim();
                if !folded.is_empty() {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(folded);
                }
            }
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            tracing::debug!("Skipping malformed header line: {line:?}");
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    headers
}

/// Case-insensitive lookup of the last value for `name`.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .rev()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
