//! Canned web server response served to non-tunnel connections

/// Declared body length of [`DECOY_RESPONSE`]
pub const DECOY_CONTENT_LENGTH: usize = 612;

/// A stock nginx landing page.
///
/// Lines end in a bare LF and the body is exactly
/// [`DECOY_CONTENT_LENGTH`] bytes.
pub const DECOY_RESPONSE: &[u8] = br#"HTTP/1.1 200 OK
Server: nginx/1.18.0 (Ubuntu)
Content-Type: text/html
Content-Length: 612
Connection: keep-alive
Accept-Ranges: bytes

<!DOCTYPE html>
<html>
<head>
<title>Welcome to nginx!</title>
<style>
    body {
        width: 35em;
        margin: 0 auto;
        font-family: Tahoma, Verdana, Arial, sans-serif;
    }
</style>
</head>
<body>
<h1>Welcome to nginx!</h1>
<p>If you see this page, the nginx web server is successfully installed and
working. Further configuration is required.</p>

<p>For online documentation and support please refer to
<a href="http://nginx.org/">nginx.org</a>.<br/>
Commercial support is available at
<a href="http://nginx.com/">nginx.com</a>.</p>

<p><em>Thank you for using nginx.</em></p>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn split_response() -> (&'static [u8], &'static [u8]) {
        let pos = DECOY_RESPONSE
            .windows(2)
            .position(|w| w == b"\n\n")
            .unwrap();
        (&DECOY_RESPONSE[..pos], &DECOY_RESPONSE[pos + 2..])
    }

    #[test]
    fn test_body_matches_content_length() {
        let (head, body) = split_response();
        let head = std::str::from_utf8(head).unwrap();

        assert!(head.contains(&format!("Content-Length: {}", DECOY_CONTENT_LENGTH)));
        assert_eq!(body.len(), DECOY_CONTENT_LENGTH);
    }

    #[test]
    fn test_head_layout() {
        let (head, _) = split_response();
        let lines: Vec<&[u8]> = head.split(|b| *b == b'\n').collect();

        assert_eq!(lines[0], b"HTTP/1.1 200 OK");
        assert!(lines[1].starts_with(b"Server: "));
        assert_eq!(lines[2], b"Content-Type: text/html");
        assert_eq!(lines[3], b"Content-Length: 612");
        assert_eq!(lines[4], b"Connection: keep-alive");
        assert_eq!(lines[5], b"Accept-Ranges: bytes");
        assert_eq!(lines.len(), 6);
        assert!(!DECOY_RESPONSE.contains(&b'\r'));
    }

    #[test]
    fn test_body_is_landing_page() {
        let (_, body) = split_response();
        assert!(body.starts_with(b"<!DOCTYPE html>"));
        assert!(body.ends_with(b"</html>\n"));
    }
}
