use http::Uri;

use crate::models::SandboxId;

const PATH_PREFIXES: &[&str] = &["/clients/", "/sandbox/"];
const QUERY_KEYS: &[&str] = &["sandbox", "user"];

/// Sandbox named by a request and the path to request from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub sandbox: SandboxId,
    pub forward_path: String,
}

/// `?sandbox=<id>` (or `?user=<id>`) wins over the path form and forwards
/// the original path and query untouched. `/clients/<id>/rest` and
/// `/sandbox/<id>/rest` forward `/rest` plus the query string.
pub fn extract_identity(uri: &Uri) -> Option<Identity> {
    from_query(uri).or_else(|| from_path(uri))
}

fn from_query(uri: &Uri) -> Option<Identity> {
    let query = uri.query()?;
    let sandbox = QUERY_KEYS.iter().find_map(|wanted| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == *wanted)
            .and_then(|(_, value)| SandboxId::parse(&value))
    })?;
    let forward_path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    Some(Identity {
        sandbox,
        forward_path,
    })
}

fn from_path(uri: &Uri) -> Option<Identity> {
    let path = uri.path();
    let rest = PATH_PREFIXES
        .iter()
        .find_map(|prefix| path.strip_prefix(prefix))?;

    let (segment, remainder) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if segment.is_empty()
        || !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    let sandbox = SandboxId::parse(segment)?;

    let mut forward_path = if remainder.is_empty() {
        "/".to_string()
    } else {
        remainder.to_string()
    };
    if let Some(query) = uri.query() {
        forward_path.push('?');
        forward_path.push_str(query);
    }
    Some(Identity {
        sandbox,
        forward_path,
    })
}
