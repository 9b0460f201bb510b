//! Download URL rewriting for the intercepted lookup
//!
//! Backend download links point at the backend's own host. Callers must fetch
//! through the proxy instead, so scheme and authority are swapped for the
//! proxy's external address and the proxy's download prefix is prepended to
//! the path. Non-ASCII characters are percent-encoded as UTF-8 first; anything
//! that still does not parse as a URI is returned untouched.

use std::borrow::Cow;

use http::Uri;
use http::uri::{Authority, InvalidUri, Scheme};

#[derive(Debug, Clone)]
pub struct UrlRewriter {
    scheme: Scheme,
    authority: Authority,
    prefix: String,
}

impl UrlRewriter {
    pub fn new(scheme: &str, external_address: &str, prefix: &str) -> Result<Self, InvalidUri> {
        Ok(Self {
            scheme: scheme.parse()?,
            authority: external_address.parse()?,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn rewrite(&self, raw: &str) -> String {
        let (base, fragment) = match raw.split_once('#') {
            Some((base, fragment)) => (base, Some(fragment)),
            None => (raw, None),
        };

        let Ok(uri) = encode_non_ascii(base).parse::<Uri>() else {
            return raw.to_string();
        };
        // Bare "host:port" authority-form is not a link
        if uri.scheme().is_none() && !base.starts_with('/') {
            return raw.to_string();
        }

        // Uri::path() is already the raw (percent-encoded) form
        let mut path_and_query = format!("{}{}", self.prefix, uri.path());
        if let Some(query) = uri.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let rewritten = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build();

        match rewritten {
            Ok(uri) => match fragment {
                Some(fragment) => format!("{}#{}", uri, fragment),
                None => uri.to_string(),
            },
            Err(e) => {
                tracing::debug!(url = raw, error = %e, "Leaving download URL unmodified");
                raw.to_string()
            }
        }
    }
}

/// Percent-encode every non-ASCII character, leaving ASCII (and any existing
/// escapes) as they are
fn encode_non_ascii(raw: &str) -> Cow<'_, str> {
    if raw.is_ascii() {
        return Cow::Borrowed(raw);
    }
    let mut encoded = String::with_capacity(raw.len() * 3);
    let mut buf = [0u8; 4];
    for ch in raw.chars() {
        if ch.is_ascii() {
            encoded.push(ch);
        } else {
            encoded.push_str(&urlencoding::encode(ch.encode_utf8(&mut buf)));
        }
    }
    Cow::Owned(encoded)
}
