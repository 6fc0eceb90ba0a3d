use std::io::BufRead;

use thiserror::Error;

/// Cap for a single request or header line, matching the connection read
/// buffer.
pub const MAX_LINE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    /// Peer closed before sending anything.
    #[error("connection closed")]
    ConnectionClosed,
    /// The request line does not match `METHOD TARGET HTTP/x.y`.
    #[error("not an http request line: {0:?}")]
    NotHttp(String),
    /// A header line without a `:` separator, or an unterminated one.
    #[error("malformed header line: {0:?}")]
    BadHeader(String),
    /// Request line exceeded the buffer size without a newline.
    #[error("request line too long")]
    UriTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// Method token, uppercased for dispatch.
    pub method: String,
    /// Request target, percent-decoded.
    pub target: String,
    pub version: (u32, u32),
}

/// Header map with lowercase names; duplicates keep their arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in arrival order.
    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.as_str() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }
}

/// Read and parse one request line.
pub fn read_request_line<R: BufRead>(r: &mut R) -> Result<RequestLine, ParseError> {
    match read_line(r, MAX_LINE)? {
        Line::Eof => Err(ParseError::ConnectionClosed),
        Line::Over => Err(ParseError::UriTooLong),
        Line::Text(line) => parse_request_line(&line),
    }
}

/// Read header lines until the terminating empty line.
pub fn read_headers<R: BufRead>(r: &mut R) -> Result<Headers, ParseError> {
    let mut headers = Vec::new();
    loop {
        let line = match read_line(r, MAX_LINE)? {
            Line::Eof => return Err(ParseError::ConnectionClosed),
            Line::Over => return Err(ParseError::BadHeader("<line too long>".to_string())),
            Line::Text(line) => line,
        };
        if line.trim().is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::BadHeader(line.clone()))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }
    Ok(Headers(headers))
}

enum Line {
    Text(String),
    Eof,
    Over,
}

/// Pull one `\n`-terminated line, consuming at most `max` bytes when no
/// newline shows up within them. The cap applies to the accumulated line,
/// not to any single refill, so the newline is only looked for inside the
/// remaining budget.
fn read_line<R: BufRead>(r: &mut R, max: usize) -> Result<Line, ParseError> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let chunk = r.fill_buf()?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Ok(Line::Eof);
            }
            break;
        }
        let budget = max - buf.len();
        let window = &chunk[..chunk.len().min(budget)];
        match window.iter().position(|&b| b == b'\n') {
            Some(i) => {
                buf.extend_from_slice(&window[..i]);
                r.consume(i + 1);
                break;
            }
            None => {
                let take = window.len();
                buf.extend_from_slice(window);
                r.consume(take);
                if buf.len() >= max {
                    return Ok(Line::Over);
                }
            }
        }
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Line::Text(String::from_utf8_lossy(&buf).into_owned()))
}

fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    let bad = || ParseError::NotHttp(line.to_string());
    let trimmed = line.trim();
    let (method, rest) = trimmed.split_once(char::is_whitespace).ok_or_else(bad)?;
    let (target, version) = rest
        .trim_start()
        .rsplit_once(char::is_whitespace)
        .ok_or_else(bad)?;
    let target = target.trim_end();
    if method.is_empty()
        || target.is_empty()
        || !method
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(bad());
    }
    let version = parse_version(version).ok_or_else(bad)?;
    Ok(RequestLine {
        method: method.to_ascii_uppercase(),
        target: percent_decode(target),
        version,
    })
}

fn parse_version(s: &str) -> Option<(u32, u32)> {
    if s.len() < 5 || !s.as_bytes()[..5].eq_ignore_ascii_case(b"HTTP/") {
        return None;
    }
    let (high, low) = s.get(5..)?.split_once('.')?;
    Some((high.parse().ok()?, low.parse().ok()?))
}

/// Lenient percent decoding: malformed escapes pass through unchanged.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (from_hex(bytes[i + 1]), from_hex(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn from_hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn request_line(input: &str) -> Result<RequestLine, ParseError> {
        read_request_line(&mut Cursor::new(input.as_bytes()))
    }

    #[test]
    fn test_request_line() {
        let line = request_line("GET http://example.com/a%20b HTTP/1.1\r\n").unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.target, "http://example.com/a b");
        assert_eq!(line.version, (1, 1));
    }

    #[test]
    fn test_method_case_insensitive() {
        let line = request_line("connect example.com:443 http/1.0\r\n").unwrap();
        assert_eq!(line.method, "CONNECT");
        assert_eq!(line.version, (1, 0));
    }

    #[test]
    fn test_not_http() {
        assert!(matches!(
            request_line("this is no request\r\n"),
            Err(ParseError::NotHttp(_))
        ));
        assert!(matches!(
            request_line("GET /\r\n"),
            Err(ParseError::NotHttp(_))
        ));
        assert!(matches!(
            request_line("GET / HTTP/one.one\r\n"),
            Err(ParseError::NotHttp(_))
        ));
    }

    #[test]
    fn test_closed_before_any_bytes() {
        assert!(matches!(
            request_line(""),
            Err(ParseError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_oversized_request_line() {
        let long = "a".repeat(MAX_LINE + 100);
        let mut cursor = Cursor::new(long.into_bytes());
        assert!(matches!(
            read_request_line(&mut cursor),
            Err(ParseError::UriTooLong)
        ));
        // Exactly the cap is consumed; the rest stays readable.
        assert_eq!(cursor.position(), MAX_LINE as u64);
    }

    #[test]
    fn test_oversized_line_split_across_refills() {
        // A newline past the cap must not rescue the line, even when it sits
        // in a later refill than the first accumulated bytes.
        let mut wire = vec![b'a'; MAX_LINE + 500];
        wire.push(b'\n');
        wire.extend_from_slice(b"GET / HTTP/1.1\r\n");
        let mut reader = std::io::BufReader::with_capacity(1024, Cursor::new(wire));
        assert!(matches!(
            read_request_line(&mut reader),
            Err(ParseError::UriTooLong)
        ));
    }

    #[test]
    fn test_headers_lowercase_and_duplicates() {
        let input = "Host: example.com\r\nX-Tag: one\r\nx-tag: two\r\n\r\nbody";
        let mut cursor = Cursor::new(input.as_bytes());
        let headers = read_headers(&mut cursor).unwrap();
        assert_eq!(headers.get("host"), Some("example.com"));
        assert_eq!(headers.all("x-tag").collect::<Vec<_>>(), vec!["one", "two"]);
        // The body after the empty line is untouched.
        let mut rest = String::new();
        use std::io::Read;
        cursor.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "body");
    }

    #[test]
    fn test_header_missing_colon() {
        let mut cursor = Cursor::new(b"no separator here\r\n\r\n".as_slice());
        assert!(matches!(
            read_headers(&mut cursor),
            Err(ParseError::BadHeader(_))
        ));
    }

    #[test]
    fn test_headers_closed_mid_request() {
        let mut cursor = Cursor::new(b"Host: example.com\r\n".as_slice());
        assert!(matches!(
            read_headers(&mut cursor),
            Err(ParseError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_content_length() {
        let mut cursor = Cursor::new(b"Content-Length: 42\r\n\r\n".as_slice());
        let headers = read_headers(&mut cursor).unwrap();
        assert_eq!(headers.content_length(), Some(42));
    }

    #[test]
    fn test_round_trip() {
        let method = "POST";
        let target = "http://example.com/form";
        let pairs = [
            ("host", "example.com"),
            ("x-tag", "one"),
            ("x-tag", "two"),
            ("content-length", "0"),
        ];
        let mut wire = format!("{method} {target} HTTP/1.1\r\n");
        for (k, v) in pairs {
            wire.push_str(&format!("{k}: {v}\r\n"));
        }
        wire.push_str("\r\n");

        let mut cursor = Cursor::new(wire.into_bytes());
        let line = read_request_line(&mut cursor).unwrap();
        let headers = read_headers(&mut cursor).unwrap();
        assert_eq!(line.method, method);
        assert_eq!(line.target, target);
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            pairs.iter().map(|&(k, v)| (k, v)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_percent_decode_lenient() {
        assert_eq!(percent_decode("/a%20b"), "/a b");
        assert_eq!(percent_decode("/%7Euser"), "/~user");
        assert_eq!(percent_decode("/100%"), "/100%");
        assert_eq!(percent_decode("/%ZZx"), "/%ZZx");
    }
}
