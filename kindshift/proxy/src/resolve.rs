//! Turns an inbound request line into an immutable decision record.

use std::str::FromStr;

use http::{Method, Uri};
use kindshift_rules::{Action, RuleTable};

/// Which direction this proxy instance translates, fixed at startup.
///
/// `ToRenamed` sits in front of a backend that serves the *renamed* schema:
/// requests are renamed on the way in, responses restored on the way out.
/// `ToOriginal` is the inverse deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    #[default]
    ToRenamed,
    ToOriginal,
}

impl ProxyMode {
    pub fn request_action(self) -> Action {
        match self {
            Self::ToRenamed => Action::Rename,
            Self::ToOriginal => Action::Restore,
        }
    }

    pub fn response_action(self) -> Action {
        match self {
            Self::ToRenamed => Action::Restore,
            Self::ToOriginal => Action::Rename,
        }
    }
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "to-renamed" => Ok(Self::ToRenamed),
            "to-original" => Ok(Self::ToOriginal),
            other => Err(format!(
                "unknown proxy mode `{other}`, expected `to-renamed` or `to-original`"
            )),
        }
    }
}

/// The per-exchange decision record: resolved resource coordinate, rewrite
/// flags, and the path/query to send downstream. Constructed once per inbound
/// request, never shared or mutated afterwards.
#[derive(Debug, Clone)]
pub struct TargetRequest {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub subresource: Option<String>,

    pub is_watch: bool,
    pub is_crd: bool,
    pub is_core: bool,
    pub is_webhook: bool,
    pub rewrite_request: bool,
    pub rewrite_response: bool,

    /// Action applied to the request body when `rewrite_request` is set.
    pub request_action: Action,
    /// Action applied to response bodies and watch events when
    /// `rewrite_response` is set.
    pub response_action: Action,

    path: String,
    raw_query: String,
}

impl TargetRequest {
    /// The path to send downstream.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query string to send downstream, forwarded verbatim.
    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    pub fn path_and_query(&self) -> String {
        if self.raw_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query)
        }
    }

    /// A decision that forwards the exchange untouched. Used for unmatched
    /// and unparseable paths: failing open keeps unrelated traffic working.
    fn passthrough(mode: ProxyMode, path: &str, raw_query: &str, is_watch: bool) -> Self {
        Self {
            group: String::new(),
            version: String::new(),
            resource: String::new(),
            namespace: None,
            name: None,
            subresource: None,
            is_watch,
            is_crd: false,
            is_core: false,
            is_webhook: false,
            rewrite_request: false,
            rewrite_response: false,
            request_action: mode.request_action(),
            response_action: mode.response_action(),
            path: path.to_string(),
            raw_query: raw_query.to_string(),
        }
    }
}

/// Resolves one inbound request against the rule table.
///
/// Never fails: anything that does not parse as a resource coordinate comes
/// back as a pass-through decision with rewriting disabled.
#[tracing::instrument(level = "trace", skip(rules), ret)]
pub fn resolve(rules: &RuleTable, mode: ProxyMode, method: &Method, uri: &Uri) -> TargetRequest {
    let path = uri.path();
    let raw_query = uri.query().unwrap_or("");
    let is_watch = has_watch_param(raw_query);

    if let Some(webhook) = rules.webhook_rule(path) {
        // Admission calls come from the backend's API server, so the body
        // directions are swapped relative to normal client traffic. The
        // response is an admission verdict and is never rewritten.
        return TargetRequest {
            group: webhook.group.clone(),
            version: String::new(),
            resource: webhook.resource.clone(),
            namespace: None,
            name: None,
            subresource: None,
            is_watch: false,
            is_crd: false,
            is_core: false,
            is_webhook: true,
            rewrite_request: true,
            rewrite_response: false,
            request_action: mode.response_action(),
            response_action: mode.request_action(),
            path: webhook.target_path.clone(),
            raw_query: raw_query.to_string(),
        };
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.split_first() {
        Some((&"apis", rest)) => resolve_apis(rules, mode, method, rest, raw_query, is_watch),
        Some((&"api", rest)) => resolve_core(mode, rest, path, raw_query, is_watch),
        _ => {
            tracing::debug!(path, "request path is not a resource coordinate, passing through");
            TargetRequest::passthrough(mode, path, raw_query, is_watch)
        }
    }
}

fn resolve_apis(
    rules: &RuleTable,
    mode: ProxyMode,
    method: &Method,
    rest: &[&str],
    raw_query: &str,
    is_watch: bool,
) -> TargetRequest {
    let original_path = || format!("/apis/{}", rest.join("/"));

    // `/apis` and `/apis/{group}[/{version}]` are discovery endpoints with no
    // resource coordinate.
    let [group, version, tail @ ..] = rest else {
        return TargetRequest::passthrough(mode, &original_path(), raw_query, is_watch);
    };
    let coordinate = match ResourceCoordinate::parse(tail) {
        Some(coordinate) => coordinate,
        None => return TargetRequest::passthrough(mode, &original_path(), raw_query, is_watch),
    };

    let action = mode.request_action();
    let Some((group_rule, resource_rule)) =
        rules.resource_by_type(action, group, coordinate.resource)
    else {
        // Not every resource under the proxied groups is renamed.
        return TargetRequest::passthrough(mode, &original_path(), raw_query, is_watch);
    };

    let (mapped_group, mapped_resource) = match action {
        Action::Rename => (
            group_rule.renamed.clone(),
            rules.renamed_type(&resource_rule.plural),
        ),
        Action::Restore => (group_rule.group.clone(), resource_rule.plural.clone()),
    };

    let path = coordinate.rebuild_path(&format!("/apis/{mapped_group}/{version}"), &mapped_resource);
    let is_crd = *group == "apiextensions.k8s.io" && coordinate.resource == "customresourcedefinitions";

    TargetRequest {
        group: group.to_string(),
        version: version.to_string(),
        resource: coordinate.resource.to_string(),
        namespace: coordinate.namespace.map(str::to_string),
        name: coordinate.name.map(str::to_string),
        subresource: coordinate.subresource.map(str::to_string),
        is_watch,
        is_crd,
        is_core: false,
        is_webhook: false,
        rewrite_request: body_carrying(method),
        rewrite_response: true,
        request_action: mode.request_action(),
        response_action: mode.response_action(),
        path,
        raw_query: raw_query.to_string(),
    }
}

/// Core (`/api/{version}/...`) resources are never renamed; the coordinate is
/// still resolved so logs, metrics and the JSON-forcing rules see it.
fn resolve_core(
    mode: ProxyMode,
    rest: &[&str],
    path: &str,
    raw_query: &str,
    is_watch: bool,
) -> TargetRequest {
    let [version, tail @ ..] = rest else {
        return TargetRequest::passthrough(mode, path, raw_query, is_watch);
    };
    let Some(coordinate) = ResourceCoordinate::parse(tail) else {
        let mut decision = TargetRequest::passthrough(mode, path, raw_query, is_watch);
        decision.is_core = true;
        return decision;
    };

    TargetRequest {
        group: String::new(),
        version: version.to_string(),
        resource: coordinate.resource.to_string(),
        namespace: coordinate.namespace.map(str::to_string),
        name: coordinate.name.map(str::to_string),
        subresource: coordinate.subresource.map(str::to_string),
        is_watch,
        is_crd: false,
        is_core: true,
        is_webhook: false,
        rewrite_request: false,
        rewrite_response: false,
        request_action: mode.request_action(),
        response_action: mode.response_action(),
        path: path.to_string(),
        raw_query: raw_query.to_string(),
    }
}

/// The `[namespaces/{ns}/]{resource}[/{name}[/{subresource}]]` part of a
/// resource path.
#[derive(Debug)]
struct ResourceCoordinate<'a> {
    namespace: Option<&'a str>,
    resource: &'a str,
    name: Option<&'a str>,
    subresource: Option<&'a str>,
}

impl<'a> ResourceCoordinate<'a> {
    fn parse(tail: &[&'a str]) -> Option<Self> {
        let (namespace, tail) = match tail {
            ["namespaces", namespace, tail @ ..] if !tail.is_empty() => (Some(*namespace), tail),
            _ => (None, tail),
        };

        let (resource, name, subresource) = match tail {
            [resource] => (*resource, None, None),
            [resource, name] => (*resource, Some(*name), None),
            [resource, name, subresource] => (*resource, Some(*name), Some(*subresource)),
            // Empty, and deeper paths (exec, port-forward trees), are left alone.
            _ => return None,
        };

        Some(Self {
            namespace,
            resource,
            name,
            subresource,
        })
    }

    /// Rebuilds the downstream path with the mapped resource segment,
    /// leaving namespace/name/subresource untouched.
    fn rebuild_path(&self, prefix: &str, resource: &str) -> String {
        let mut path = String::from(prefix);
        if let Some(namespace) = self.namespace {
            path.push_str("/namespaces/");
            path.push_str(namespace);
        }
        path.push('/');
        path.push_str(resource);
        if let Some(name) = self.name {
            path.push('/');
            path.push_str(name);
        }
        if let Some(subresource) = self.subresource {
            path.push('/');
            path.push_str(subresource);
        }
        path
    }
}

fn has_watch_param(raw_query: &str) -> bool {
    raw_query
        .split('&')
        .any(|pair| matches!(pair, "watch" | "watch=true" | "watch=1"))
}

fn body_carrying(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PUT" | "PATCH")
}
