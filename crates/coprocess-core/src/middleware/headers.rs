use std::collections::HashMap;

use coprocess_proto::Header;

/// Canonical MIME form of a header name: `content-type` becomes `Content-Type`.
/// Names containing bytes outside the token set are returned unchanged.
pub fn canonical_header_key(name: &str) -> String {
    if !name.bytes().all(is_token_byte) {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    out
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

/// Synchronizes multivalue headers with the univalue map returned by a
/// response hook.
///
/// Keys only present in `headers` are appended as single-value entries,
/// keys present in both get their first value replaced, and multivalue
/// entries whose key was removed from `headers` are dropped.
pub fn sync_headers_and_multivalue_headers(
    headers: &HashMap<String, String>,
    multivalue_headers: Vec<Header>,
) -> Vec<Header> {
    let mut multivalue_headers = multivalue_headers;
    let mut added = Vec::new();

    for (key, value) in headers {
        match multivalue_headers.iter_mut().find(|header| &header.key == key) {
            Some(header) => {
                if let Some(first) = header.values.first_mut() {
                    first.clone_from(value);
                }
            }
            None => added.push(Header {
                key: key.clone(),
                values: vec![value.clone()],
            }),
        }
    }

    added.extend(
        multivalue_headers
            .into_iter()
            .filter(|header| headers.contains_key(&header.key)),
    );
    added
}

/// Hides all but the last four characters of a key for logging.
pub fn obfuscate_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 4 {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{tail}")
    } else {
        "--".to_string()
    }
}
