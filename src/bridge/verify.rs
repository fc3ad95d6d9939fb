//! Request verification against an OpenAPI / Swagger document.
//!
//! Only the parts that decide whether a request is routable are checked:
//! server prefix, templated path, method, and presence of required query
//! parameters. Bodies and parameter types are not validated.

use super::server::TransportRequest;
use anyhow::{Context, Result};
use serde_yaml::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;

const HTTP_METHODS: &[&str] = &[
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// Why a request was not accepted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("`{url}` is not under any known server")]
    UnknownServer { url: String },
    #[error("no path matches `{path}`")]
    UnknownPath { path: String },
    #[error("method `{method}` is not allowed on `{path}`")]
    MethodNotAllowed { method: String, path: String },
    #[error("required query parameter `{name}` is missing")]
    MissingQueryParameter { name: String },
}

/// Decides whether an inbound request may be bridged.
pub trait RequestVerifier: Send + Sync {
    fn verify(&self, request: &TransportRequest) -> Result<(), VerifyError>;
}

/// Accepts every request. Used when no API document is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl RequestVerifier for AllowAll {
    fn verify(&self, _request: &TransportRequest) -> Result<(), VerifyError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
}

#[derive(Debug, Clone)]
struct Route {
    template: String,
    segments: Vec<Segment>,
    /// Lower-case method -> required query parameter names.
    operations: HashMap<String, BTreeSet<String>>,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        let parts = split_path(path);
        parts.len() == self.segments.len()
            && self
                .segments
                .iter()
                .zip(&parts)
                .all(|(segment, part)| match segment {
                    Segment::Literal(literal) => literal == part,
                    Segment::Param => !part.is_empty(),
                })
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Literal(_)))
            .count()
    }
}

/// Routing table derived from an OpenAPI 3 or Swagger 2 document.
#[derive(Debug, Clone)]
pub struct OpenApiSpec {
    servers: Vec<String>,
    routes: Vec<Route>,
}

impl OpenApiSpec {
    /// Load a YAML or JSON API document from `path`.
    ///
    /// `server_address` (the bridge's own base URL) is added to the known
    /// servers so requests addressed to the bridge itself resolve.
    pub fn from_path(path: &Path, server_address: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read API spec {}", path.display()))?;
        Self::parse(&raw, server_address)
            .with_context(|| format!("Failed to parse API spec {}", path.display()))
    }

    pub fn parse(raw: &str, server_address: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(raw).context("API spec is not valid YAML/JSON")?;
        if !document.is_mapping() {
            anyhow::bail!("API spec must be a mapping at the top level");
        }

        let mut servers = Vec::new();
        if let Some(base_path) = document.get("basePath").and_then(Value::as_str) {
            servers.push(base_path.to_string());
        }
        if let Some(listed) = document.get("servers").and_then(Value::as_sequence) {
            servers.extend(
                listed
                    .iter()
                    .filter_map(|server| server.get("url").and_then(Value::as_str))
                    .map(str::to_string),
            );
        }
        if servers.is_empty() {
            servers.push("/".to_string());
        }
        servers.push(server_address.to_string());

        let paths = document
            .get("paths")
            .and_then(Value::as_mapping)
            .context("API spec has no `paths` section")?;

        let mut routes = Vec::with_capacity(paths.len());
        for (template, item) in paths {
            let Some(template) = template.as_str() else {
                continue;
            };
            let shared = required_query(item.get("parameters"));
            let operations = HTTP_METHODS
                .iter()
                .filter_map(|method| {
                    let operation = item.get(*method)?;
                    let mut required = shared.clone();
                    required.extend(required_query(operation.get("parameters")));
                    Some(((*method).to_string(), required))
                })
                .collect();
            routes.push(Route {
                template: template.to_string(),
                segments: parse_template(template),
                operations,
            });
        }
        // Literal segments win over templated ones (`/pets/mine` before `/pets/{id}`).
        routes.sort_by_key(|route| std::cmp::Reverse(route.literal_count()));

        Ok(Self { servers, routes })
    }

    fn relative_path<'a>(&self, url: &'a str, path: &'a str) -> Option<&'a str> {
        let without_query = url.split(['?', '#']).next().unwrap_or(url);
        self.servers.iter().find_map(|server| {
            let server = server.trim_end_matches('/');
            if server.contains("://") {
                let rest = without_query.strip_prefix(server)?;
                (rest.is_empty() || rest.starts_with('/')).then_some(rest)
            } else {
                let rest = path.strip_prefix(server)?;
                (rest.is_empty() || rest.starts_with('/')).then_some(rest)
            }
        })
    }
}

impl RequestVerifier for OpenApiSpec {
    fn verify(&self, request: &TransportRequest) -> Result<(), VerifyError> {
        let relative = self
            .relative_path(&request.url, &request.path)
            .ok_or_else(|| VerifyError::UnknownServer {
                url: request.url.clone(),
            })?;
        let relative = if relative.is_empty() { "/" } else { relative };

        let route = self
            .routes
            .iter()
            .find(|route| route.matches(relative))
            .ok_or_else(|| VerifyError::UnknownPath {
                path: relative.to_string(),
            })?;

        let method = request.method.to_ascii_lowercase();
        let required = route
            .operations
            .get(&method)
            .ok_or_else(|| VerifyError::MethodNotAllowed {
                method: method.clone(),
                path: route.template.clone(),
            })?;

        let present = query_names(request.query.as_deref().unwrap_or_default());
        if let Some(missing) = required.iter().find(|name| !present.contains(*name)) {
            return Err(VerifyError::MissingQueryParameter {
                name: missing.clone(),
            });
        }
        Ok(())
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|part| !part.is_empty())
        .collect()
}

fn parse_template(template: &str) -> Vec<Segment> {
    split_path(template)
        .into_iter()
        .map(|part| {
            if part.starts_with('{') && part.ends_with('}') {
                Segment::Param
            } else {
                Segment::Literal(part.to_string())
            }
        })
        .collect()
}

fn required_query(parameters: Option<&Value>) -> BTreeSet<String> {
    parameters
        .and_then(Value::as_sequence)
        .into_iter()
        .flatten()
        .filter(|parameter| parameter.get("in").and_then(Value::as_str) == Some("query"))
        .filter(|parameter| parameter.get("required").and_then(Value::as_bool) == Some(true))
        .filter_map(|parameter| parameter.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn query_names(query: &str) -> BTreeSet<String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let name = pair.split('=').next().unwrap_or(pair);
            urlencoding::decode(name).map_or_else(|_| name.to_string(), |decoded| decoded.into_owned())
        })
        .collect()
}
