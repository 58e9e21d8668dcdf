//! Request descriptors and the wire-ready requests built from them.

use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Everything needed to issue one logical call.
///
/// Built once by the caller and only borrowed by the pipeline, so the retry
/// after a credential refresh replays exactly the same request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Body,
    retryable: bool,
    cache_tags: Option<Vec<String>>,
    invalidates: Vec<String>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: Body::Empty,
            retryable: true,
            cache_tags: None,
            invalidates: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).json(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Body::Json(body);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Body::Form(fields);
        self
    }

    /// Whether the pipeline may replay this request once after refreshing
    /// the access credential. Defaults to `true`: a 401 is returned before
    /// the backend acts on the request.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Serve this GET from the response cache when fresh, and store the
    /// result under the given tags.
    pub fn cached<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Drop cached entries carrying any of these tags once this call succeeds.
    pub fn invalidates<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalidates = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Tags to cache under; only GET requests are ever cached.
    pub fn cache_tags(&self) -> Option<&[String]> {
        match self.method {
            Method::Get => self.cache_tags.as_deref(),
            _ => None,
        }
    }

    pub fn invalidated_tags(&self) -> &[String] {
        &self.invalidates
    }

    /// Stable cache key: method, path and the query sorted by key.
    pub fn cache_key(&self) -> String {
        let mut query = self.query.clone();
        query.sort();
        let query = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if query.is_empty() {
            format!("{} {}", self.method, self.path)
        } else {
            format!("{} {}?{}", self.method, self.path, query)
        }
    }
}

/// A fully resolved outbound request, as handed to a `Transport`.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Complete `Authorization` header value, if a credential was attached.
    pub authorization: Option<String>,
    pub body: Body,
}

impl HttpRequest {
    pub fn from_descriptor(
        base_url: &str,
        descriptor: &RequestDescriptor,
        credential: Option<&str>,
    ) -> Self {
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            descriptor.path().trim_start_matches('/')
        );
        Self {
            method: descriptor.method(),
            url,
            query: descriptor.query_pairs().to_vec(),
            authorization: credential.map(|token| format!("Bearer {}", token)),
            body: descriptor.body().clone(),
        }
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|value| value.strip_prefix("Bearer "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_sorts_query() {
        let a = RequestDescriptor::get("/api/v1/jobs/")
            .query("skip", "0")
            .query("limit", "100");
        let b = RequestDescriptor::get("/api/v1/jobs/")
            .query("limit", "100")
            .query("skip", "0");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), "GET /api/v1/jobs/?limit=100&skip=0");
        assert_eq!(RequestDescriptor::get("/x").cache_key(), "GET /x");
    }

    #[test]
    fn test_only_get_is_cacheable() {
        let get = RequestDescriptor::get("/api/v1/templates/").cached(["Template"]);
        assert_eq!(get.cache_tags(), Some(&["Template".to_string()][..]));

        let post = RequestDescriptor::post("/api/v1/templates", json!({})).cached(["Template"]);
        assert_eq!(post.cache_tags(), None);
    }

    #[test]
    fn test_http_request_joins_url_and_attaches_bearer() {
        let desc = RequestDescriptor::get("/api/v1/auth/self");
        let req = HttpRequest::from_descriptor("http://localhost:8000/", &desc, Some("abc"));
        assert_eq!(req.url, "http://localhost:8000/api/v1/auth/self");
        assert_eq!(req.authorization.as_deref(), Some("Bearer abc"));
        assert_eq!(req.bearer_token(), Some("abc"));

        let anonymous = HttpRequest::from_descriptor("http://localhost:8000", &desc, None);
        assert_eq!(anonymous.authorization, None);
    }

    #[test]
    fn test_descriptors_are_retryable_by_default() {
        assert!(RequestDescriptor::delete("/api/v1/jobs/1").is_retryable());
        assert!(!RequestDescriptor::delete("/api/v1/jobs/1")
            .retryable(false)
            .is_retryable());
    }
}
