//! Cookie supply for the fetcher.
//!
//! The origin sits behind a bot-mitigation layer and an age-verification
//! interstitial, so every request needs cookies from somewhere: an in-memory
//! jar fed by an interactive browser session or captured Set-Cookie headers,
//! a literal cookie string, or a Netscape-format cookie file. The fetcher
//! itself never touches the jar; it asks a [`CookieProvider`] for a header
//! snapshot per request.

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use url::Url;

/// One cookie with enough attributes for domain and scheme matching.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub secure: bool,
    pub expires: DateTime<Utc>,
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        secure: bool,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            secure,
            expires,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// RFC 6265 style domain match: exact, or suffix on a dot boundary.
    fn matches(&self, host: &str, secure_request: bool) -> bool {
        if self.is_expired() || (self.secure && !secure_request) {
            return false;
        }
        if self.domain == host {
            return true;
        }
        let bare = self.domain.strip_prefix('.').unwrap_or(&self.domain);
        host == bare || host.ends_with(&format!(".{bare}"))
    }

    fn header_pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// Thread-safe in-memory cookie jar. Reads copy out a snapshot string.
#[derive(Default)]
pub struct CookieJar {
    cookies: Mutex<HashMap<String, Vec<Cookie>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a cookie (keyed by domain + name).
    pub fn add(&self, cookie: Cookie) {
        let mut cookies = self.cookies.lock().unwrap();
        let list = cookies.entry(cookie.domain.clone()).or_default();
        if let Some(existing) = list.iter_mut().find(|c| c.name == cookie.name) {
            *existing = cookie;
        } else {
            list.push(cookie);
        }
    }

    /// Fold a Set-Cookie header value into the jar.
    ///
    /// Handles the attributes that matter for replay (Domain, Secure,
    /// Max-Age); everything else is ignored. Cookies without an explicit
    /// lifetime default to 24 hours.
    pub fn add_set_cookie(&self, header: &str, default_domain: &str) {
        let mut segments = header.split(';');
        let Some(first) = segments.next() else { return };
        let Some((name, value)) = first.split_once('=') else {
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }

        let mut domain = default_domain.to_string();
        let mut secure = false;
        let mut expires = Utc::now() + chrono::Duration::hours(24);
        for segment in segments {
            let segment = segment.trim();
            let (attr, attr_value) = match segment.split_once('=') {
                Some((a, v)) => (a.trim().to_ascii_lowercase(), v.trim()),
                None => (segment.to_ascii_lowercase(), ""),
            };
            match attr.as_str() {
                "domain" if !attr_value.is_empty() => domain = attr_value.to_string(),
                "secure" => secure = true,
                "max-age" => {
                    if let Ok(seconds) = attr_value.parse::<i64>() {
                        expires = Utc::now() + chrono::Duration::seconds(seconds);
                    }
                }
                _ => {}
            }
        }

        self.add(Cookie::new(name, value.trim(), domain, secure, expires));
    }

    /// Fold a literal `name=value; name2=value2` string into the jar.
    /// Manually supplied cookies are assumed valid for 30 days.
    pub fn add_cookie_string(&self, cookie_string: &str, domain: &str) {
        let expires = Utc::now() + chrono::Duration::days(30);
        for pair in cookie_string.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    self.add(Cookie::new(name, value.trim(), domain, false, expires));
                }
            }
        }
    }

    /// Cookie header value for a request URL, or None when nothing matches.
    pub fn header_for(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        let secure = parsed.scheme() == "https";

        let cookies = self.cookies.lock().unwrap();
        let pairs: Vec<String> = cookies
            .values()
            .flatten()
            .filter(|c| c.matches(host, secure))
            .map(Cookie::header_pair)
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Drop expired cookies.
    pub fn sweep_expired(&self) {
        let mut cookies = self.cookies.lock().unwrap();
        let now = Utc::now();
        cookies.retain(|_, list| {
            list.retain(|c| c.expires >= now);
            !list.is_empty()
        });
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.lock().unwrap().is_empty()
    }
}

/// Parse a Netscape-format cookie file.
///
/// Seven tab-separated fields per line: domain, subdomain flag, path, secure
/// flag, unix expiry, name, value. Comment lines start with `#` except the
/// `#HttpOnly_` domain prefix some exporters emit.
pub fn parse_netscape_file(path: &Path) -> io::Result<Vec<Cookie>> {
    let file = std::fs::File::open(path)?;
    let mut cookies = Vec::new();
    for line in io::BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        let line = match line.strip_prefix("#HttpOnly_") {
            Some(rest) => rest,
            None if line.is_empty() || line.starts_with('#') => continue,
            None => line,
        };

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        let expires = fields[4]
            .parse::<i64>()
            .ok()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(30));
        cookies.push(Cookie::new(
            fields[5],
            fields[6],
            fields[0],
            fields[3].eq_ignore_ascii_case("TRUE"),
            expires,
        ));
    }
    Ok(cookies)
}

/// Per-request cookie selection with the fixed precedence: in-memory jar,
/// then literal string, then cookie file.
#[derive(Clone)]
pub struct CookieProvider {
    jar: Arc<CookieJar>,
    literal: Option<String>,
    file_jar: Arc<CookieJar>,
}

impl CookieProvider {
    pub fn new(jar: Arc<CookieJar>, literal: Option<String>) -> Self {
        Self {
            jar,
            literal,
            file_jar: Arc::new(CookieJar::new()),
        }
    }

    /// Load a Netscape cookie file as the lowest-precedence source.
    pub fn with_cookie_file(mut self, path: &Path) -> io::Result<Self> {
        let file_jar = CookieJar::new();
        for cookie in parse_netscape_file(path)? {
            file_jar.add(cookie);
        }
        self.file_jar = Arc::new(file_jar);
        Ok(self)
    }

    /// The shared jar, for folding captured Set-Cookie headers back in.
    pub fn jar(&self) -> &Arc<CookieJar> {
        &self.jar
    }

    /// Cookie header for one request.
    pub fn header_for(&self, url: &str) -> Option<String> {
        if let Some(header) = self.jar.header_for(url) {
            return Some(header);
        }
        if let Some(literal) = &self.literal {
            if !literal.is_empty() {
                return Some(literal.clone());
            }
        }
        self.file_jar.header_for(url)
    }
}
